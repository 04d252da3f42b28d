use std::fmt;
use std::num::NonZeroU16;

use bytes::{Buf, Bytes, BytesMut};
use bytestring::ByteString;

use crate::error::{DecodeError, EncodeError};
use crate::properties::{Properties, PropertyScope};
use crate::types::{ProtocolVersion, QoS, ReasonCode};
use crate::utils::{Decode, Encode};

/// PUBLISH packet
#[derive(PartialEq, Eq, Clone)]
pub struct Publish {
    /// this might be re-delivery of an earlier attempt to send the packet.
    pub dup: bool,
    pub retain: bool,
    pub qos: QoS,
    pub topic: ByteString,
    /// only present when the QoS level is 1 or 2.
    pub packet_id: Option<NonZeroU16>,
    pub payload: Bytes,
    pub properties: Properties,
}

impl fmt::Debug for Publish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publish")
            .field("packet_id", &self.packet_id)
            .field("topic", &self.topic)
            .field("dup", &self.dup)
            .field("retain", &self.retain)
            .field("qos", &self.qos)
            .field("payload", &"<REDACTED>")
            .field("properties", &self.properties)
            .finish()
    }
}

impl Publish {
    pub fn new(topic: impl Into<ByteString>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Publish {
            dup: false,
            retain: false,
            qos,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
            properties: Properties::default(),
        }
    }

    #[inline]
    pub(crate) fn flags(&self) -> u8 {
        (u8::from(self.dup) << 3) | (self.qos.value() << 1) | u8::from(self.retain)
    }

    pub(crate) fn decode(src: &mut Bytes, flags: u8, version: ProtocolVersion) -> Result<Self, DecodeError> {
        let qos = QoS::try_from((flags & 0b0110) >> 1)?;
        let topic = ByteString::decode(src)?;
        let packet_id = if qos == QoS::AtMostOnce { None } else { Some(NonZeroU16::decode(src)?) };
        let properties = if version.is_v5() {
            Properties::decode(src, PropertyScope::Publish)?
        } else {
            Properties::default()
        };
        let payload = src.split_to(src.remaining());
        Ok(Publish {
            dup: flags & 0b1000 != 0,
            retain: flags & 0b0001 != 0,
            qos,
            topic,
            packet_id,
            payload,
            properties,
        })
    }

    pub(crate) fn encoded_size(&self, version: ProtocolVersion) -> usize {
        let mut size = self.topic.encoded_size() + self.payload.len();
        if self.qos != QoS::AtMostOnce {
            size += 2;
        }
        if version.is_v5() {
            size += self.properties.block_size();
        }
        size
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), EncodeError> {
        self.topic.encode(buf)?;
        match (self.qos, self.packet_id) {
            (QoS::AtMostOnce, None) => {}
            (QoS::AtMostOnce, Some(_)) => return Err(EncodeError::MalformedPacket),
            (_, Some(packet_id)) => packet_id.encode(buf)?,
            (_, None) => return Err(EncodeError::PacketIdRequired),
        }
        if version.is_v5() {
            self.properties.encode(buf)?;
        }
        buf.extend_from_slice(&self.payload);
        Ok(())
    }
}

/// PUBACK, PUBREC, PUBREL and PUBCOMP share this body.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PublishAck {
    pub packet_id: NonZeroU16,
    /// always `SUCCESS` on 3.x
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl PublishAck {
    #[inline]
    pub fn new(packet_id: NonZeroU16) -> Self {
        PublishAck { packet_id, reason_code: ReasonCode::SUCCESS, properties: Properties::default() }
    }

    pub(crate) fn decode(src: &mut Bytes, version: ProtocolVersion) -> Result<Self, DecodeError> {
        let packet_id = NonZeroU16::decode(src)?;
        let (reason_code, properties) = if version.is_v5() {
            super::decode_reason_properties(src, PropertyScope::PublishAck)?
        } else {
            (ReasonCode::SUCCESS, Properties::default())
        };
        Ok(PublishAck { packet_id, reason_code, properties })
    }

    pub(crate) fn encoded_size(&self, version: ProtocolVersion) -> usize {
        2 + if version.is_v5() { super::reason_properties_size(self.reason_code, &self.properties) } else { 0 }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), EncodeError> {
        self.packet_id.encode(buf)?;
        if version.is_v5() {
            super::encode_reason_properties(self.reason_code, &self.properties, buf)?;
        }
        Ok(())
    }
}
