use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DecodeError, EncodeError};
use crate::packet::{Packet, Publish};
use crate::types::{FixedHeader, ProtocolVersion};
use crate::utils::{decode_variable_length, var_int_len};

/// Streaming codec for any supported protocol revision.
///
/// Until a CONNECT has been decoded the codec has no version and falls back
/// to 3.1.1 framing; the first CONNECT fixes the version for the rest of the
/// connection.
#[derive(Debug, Clone)]
pub struct Codec {
    state: DecodeState,
    version: Option<ProtocolVersion>,
    max_inbound_size: u32,
    max_outbound_size: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DecodeState {
    FrameHeader,
    Frame(FixedHeader),
}

impl Codec {
    /// Create `Codec` instance. `max_packet_size` of `0` means unlimited.
    pub fn new(max_packet_size: u32) -> Self {
        Codec {
            state: DecodeState::FrameHeader,
            version: None,
            max_inbound_size: max_packet_size,
            max_outbound_size: 0,
        }
    }

    pub fn with_version(version: ProtocolVersion, max_packet_size: u32) -> Self {
        Codec { version: Some(version), ..Codec::new(max_packet_size) }
    }

    #[inline]
    pub fn version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    #[inline]
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = Some(version);
    }

    /// Set max inbound packet size.
    #[inline]
    pub fn set_max_size(&mut self, size: u32) {
        self.max_inbound_size = size;
    }

    /// Set the peer's maximum packet size, applied when encoding.
    #[inline]
    pub fn set_max_outbound_size(&mut self, size: u32) {
        self.max_outbound_size = size;
    }

    /// Whether `item` is larger than the peer's maximum packet size.
    pub fn exceeds_max_outbound(&self, item: &Packet) -> bool {
        self.max_outbound_size > 0 && self.over_max_outbound(item.encoded_size(self.version.unwrap_or_default()))
    }

    /// Same as [`exceeds_max_outbound`](Self::exceeds_max_outbound) for a
    /// publish not yet wrapped in a packet.
    pub fn publish_exceeds_max_outbound(&self, publish: &Publish) -> bool {
        self.max_outbound_size > 0 && self.over_max_outbound(publish.encoded_size(self.version.unwrap_or_default()))
    }

    #[inline]
    fn over_max_outbound(&self, remaining: usize) -> bool {
        1 + var_int_len(remaining) + remaining > self.max_outbound_size as usize
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Decoder for Codec {
    type Item = Packet;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, DecodeError> {
        loop {
            match self.state {
                DecodeState::FrameHeader => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let first_byte = src[0];
                    let (remaining_length, consumed) = match decode_variable_length(&src[1..])? {
                        Some(v) => v,
                        None => return Ok(None),
                    };
                    let total = 1 + consumed + remaining_length as usize;
                    if self.max_inbound_size != 0 && total > self.max_inbound_size as usize {
                        return Err(DecodeError::MaxSizeExceeded);
                    }
                    let header = FixedHeader::parse(first_byte, remaining_length)?;
                    src.advance(consumed + 1);
                    self.state = DecodeState::Frame(header);
                    let remaining_length = remaining_length as usize;
                    if src.len() < remaining_length {
                        src.reserve(remaining_length - src.len());
                        return Ok(None);
                    }
                }
                DecodeState::Frame(header) => {
                    if src.len() < header.remaining_length as usize {
                        return Ok(None);
                    }
                    let body = src.split_to(header.remaining_length as usize).freeze();
                    self.state = DecodeState::FrameHeader;
                    let packet = Packet::decode(header, body, self.version.unwrap_or_default())?;
                    if let (None, Packet::Connect(connect)) = (self.version, &packet) {
                        self.version = Some(connect.protocol);
                    }
                    return Ok(Some(packet));
                }
            }
        }
    }
}

impl Encoder<Packet> for Codec {
    type Error = EncodeError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        <Self as Encoder<&Packet>>::encode(self, &item, dst)
    }
}

impl Encoder<&Packet> for Codec {
    type Error = EncodeError;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        if self.exceeds_max_outbound(item) {
            return Err(EncodeError::OverMaxPacketSize);
        }
        item.encode(self.version.unwrap_or_default(), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use bytestring::ByteString;

    use super::*;
    use crate::packet::{Connect, Publish, PublishAck};
    use crate::properties::{Properties, Property};
    use crate::types::QoS;

    #[test]
    fn test_max_size() {
        let mut codec = Codec::default();
        codec.set_max_size(5);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\x30\x09");
        assert!(matches!(codec.decode(&mut buf), Err(DecodeError::MaxSizeExceeded)));
    }

    #[test]
    fn test_partial_frames() {
        let mut codec = Codec::with_version(ProtocolVersion::V311, 0);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\x40");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"\x02\x00");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"\x07\xc0");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Packet::PublishAck(PublishAck::new(std::num::NonZeroU16::new(7).unwrap())))
        );
        buf.extend_from_slice(b"\x00");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::PingRequest));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_large_packet() {
        let mut codec = Codec::with_version(ProtocolVersion::V311, 0);
        let mut buf = BytesMut::new();

        let pkt = Publish::new(
            ByteString::from_static("/test"),
            Bytes::from(Vec::from("a".repeat(260 * 1024))),
            QoS::AtMostOnce,
        );
        codec.encode(Packet::Publish(pkt.clone()), &mut buf).unwrap();

        let pkt2 = if let Some(Packet::Publish(v)) = codec.decode(&mut buf).unwrap() { v } else { panic!() };
        assert_eq!(pkt, pkt2);
    }

    #[test]
    fn test_version_detection() {
        let mut client = Codec::with_version(ProtocolVersion::V5, 0);
        let mut server = Codec::new(1024);
        let mut buf = BytesMut::new();

        let connect = Connect {
            protocol: ProtocolVersion::V5,
            client_id: ByteString::from_static("c1"),
            properties: Properties::new().with(Property::ReceiveMaximum(10)),
            ..Connect::default()
        };
        client.encode(Packet::from(connect.clone()), &mut buf).unwrap();
        assert_eq!(server.version(), None);
        assert_eq!(server.decode(&mut buf).unwrap(), Some(Packet::from(connect)));
        assert_eq!(server.version(), Some(ProtocolVersion::V5));

        // v5 short PUBACK form now decodes with its reason code
        buf.extend_from_slice(b"\x40\x03\x00\x01\x10");
        let ack = server.decode(&mut buf).unwrap();
        assert!(matches!(ack, Some(Packet::PublishAck(PublishAck { reason_code, .. })) if reason_code.value() == 0x10));
    }

    #[test]
    fn test_outbound_limit() {
        let mut codec = Codec::with_version(ProtocolVersion::V5, 0);
        codec.set_max_outbound_size(16);
        let mut buf = BytesMut::new();
        let pkt = Packet::Publish(Publish::new("topic", Bytes::from_static(b"0123456789"), QoS::AtMostOnce));
        assert!(codec.exceeds_max_outbound(&pkt));
        assert!(matches!(codec.encode(pkt, &mut buf), Err(EncodeError::OverMaxPacketSize)));
        assert!(buf.is_empty());
        // header 2, topic 7, properties 1, payload 3
        let pkt = Packet::Publish(Publish::new("topic", Bytes::from_static(b"012"), QoS::AtMostOnce));
        assert!(!codec.exceeds_max_outbound(&pkt));
        codec.encode(pkt, &mut buf).unwrap();
        assert_eq!(buf.len(), 13);

        // the packet id is counted before one is assigned, 16 bytes fit exactly
        let p = Publish::new("topic", Bytes::from_static(b"0123"), QoS::AtLeastOnce);
        assert!(!codec.publish_exceeds_max_outbound(&p));
        let p = Publish::new("topic", Bytes::from_static(b"01234"), QoS::AtLeastOnce);
        assert!(codec.publish_exceeds_max_outbound(&p));
    }
}
