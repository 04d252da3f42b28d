#![deny(unsafe_code)]

//! MQTT packet codec for protocol revisions 3.1, 3.1.1 and 5.0.
//!
//! - [`Packet`] is a closed enum over the fifteen control packet types; v5
//!   properties are carried by every variant that supports them and are
//!   empty for older revisions.
//! - [`decode`] / [`encode`] work on single complete packets.
//! - [`Codec`] implements `tokio_util::codec::{Decoder, Encoder}` and picks
//!   up the protocol revision from the CONNECT packet.
//!
//! ```
//! use bytes::Bytes;
//! use mqttd_codec::{decode, encode, Packet, ProtocolVersion, Publish, QoS};
//!
//! let publish = Publish::new("sensors/room1/temp", Bytes::from_static(b"21.5"), QoS::AtMostOnce);
//! let bytes = encode(ProtocolVersion::V311, &Packet::Publish(publish.clone())).unwrap();
//! assert_eq!(decode(ProtocolVersion::V311, &bytes).unwrap(), Packet::Publish(publish));
//! ```

use bytes::{Bytes, BytesMut};

#[macro_use]
mod utils;

pub mod codec;
pub mod error;
pub mod packet;
pub mod properties;
pub mod types;

pub use self::codec::Codec;
pub use self::error::{DecodeError, EncodeError};
pub use self::packet::{
    Auth, Connect, ConnectAck, Disconnect, LastWill, Packet, Publish, PublishAck, RetainHandling, Subscribe,
    SubscribeAck, SubscriptionOptions, Unsubscribe, UnsubscribeAck,
};
pub use self::properties::{Properties, Property, PropertyId};
pub use self::types::{
    FixedHeader, PacketType, ProtocolVersion, QoS, ReasonCode, TimestampMillis, MAX_VARIABLE_LENGTH,
};

/// Decodes one complete packet. `src` must hold exactly one packet.
///
/// CONNECT describes its own revision and ignores `version`.
pub fn decode(version: ProtocolVersion, src: &[u8]) -> Result<Packet, DecodeError> {
    ensure!(src.len() >= 2, DecodeError::MalformedPacket);
    let (remaining_length, consumed) =
        utils::decode_variable_length(&src[1..])?.ok_or(DecodeError::MalformedPacket)?;
    let header = FixedHeader::parse(src[0], remaining_length)?;
    let body = Bytes::copy_from_slice(&src[1 + consumed..]);
    Packet::decode(header, body, version)
}

/// Encodes `packet` for `version`.
pub fn encode(version: ProtocolVersion, packet: &Packet) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::new();
    packet.encode(version, &mut buf)?;
    Ok(buf.freeze())
}
