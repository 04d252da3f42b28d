use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};
use crate::properties::{Properties, PropertyScope};
use crate::types::{FixedHeader, PacketType, ProtocolVersion, ReasonCode, MAX_VARIABLE_LENGTH};
use crate::utils::{var_int_len, write_variable_length, Decode};

mod connect;
mod disconnect;
mod publish;
mod subscribe;

pub use self::connect::{Connect, ConnectAck, LastWill};
pub use self::disconnect::{Auth, Disconnect};
pub use self::publish::{Publish, PublishAck};
pub use self::subscribe::{
    RetainHandling, Subscribe, SubscribeAck, SubscriptionOptions, Unsubscribe, UnsubscribeAck,
};

/// Every MQTT control packet across 3.1, 3.1.1 and 5.0.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnectAck(ConnectAck),
    Publish(Publish),
    PublishAck(PublishAck),
    PublishReceived(PublishAck),
    PublishRelease(PublishAck),
    PublishComplete(PublishAck),
    Subscribe(Subscribe),
    SubscribeAck(SubscribeAck),
    Unsubscribe(Unsubscribe),
    UnsubscribeAck(UnsubscribeAck),
    PingRequest,
    PingResponse,
    Disconnect(Disconnect),
    Auth(Auth),
}

impl From<Connect> for Packet {
    fn from(val: Connect) -> Packet {
        Packet::Connect(Box::new(val))
    }
}

impl From<Publish> for Packet {
    fn from(val: Publish) -> Packet {
        Packet::Publish(val)
    }
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnectAck(_) => PacketType::ConnectAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PublishAck(_) => PacketType::PublishAck,
            Packet::PublishReceived(_) => PacketType::PublishReceived,
            Packet::PublishRelease(_) => PacketType::PublishRelease,
            Packet::PublishComplete(_) => PacketType::PublishComplete,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubscribeAck(_) => PacketType::SubscribeAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubscribeAck(_) => PacketType::UnsubscribeAck,
            Packet::PingRequest => PacketType::PingRequest,
            Packet::PingResponse => PacketType::PingResponse,
            Packet::Disconnect(_) => PacketType::Disconnect,
            Packet::Auth(_) => PacketType::Auth,
        }
    }

    /// Size of the variable header plus payload when written for `version`.
    pub fn encoded_size(&self, version: ProtocolVersion) -> usize {
        match self {
            Packet::Connect(connect) => connect.encoded_size(),
            Packet::ConnectAck(ack) => ack.encoded_size(version),
            Packet::Publish(publish) => publish.encoded_size(version),
            Packet::PublishAck(ack)
            | Packet::PublishReceived(ack)
            | Packet::PublishRelease(ack)
            | Packet::PublishComplete(ack) => ack.encoded_size(version),
            Packet::Subscribe(sub) => sub.encoded_size(version),
            Packet::SubscribeAck(ack) => ack.encoded_size(version),
            Packet::Unsubscribe(unsub) => unsub.encoded_size(version),
            Packet::UnsubscribeAck(ack) => ack.encoded_size(version),
            Packet::PingRequest | Packet::PingResponse => 0,
            Packet::Disconnect(disconnect) => disconnect.encoded_size(version),
            Packet::Auth(auth) => auth.encoded_size(),
        }
    }

    pub fn fixed_header(&self, version: ProtocolVersion) -> Result<FixedHeader, EncodeError> {
        let packet_type = self.packet_type();
        let flags = match self {
            Packet::Publish(publish) => publish.flags(),
            _ => packet_type.required_flags(),
        };
        let remaining_length = self.encoded_size(version);
        ensure!(remaining_length <= MAX_VARIABLE_LENGTH as usize, EncodeError::InvalidLength);
        Ok(FixedHeader { packet_type, flags, remaining_length: remaining_length as u32 })
    }

    /// Writes the whole packet, fixed header included, and returns its total size.
    pub fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<usize, EncodeError> {
        let header = self.fixed_header(version)?;
        let total = 1 + var_int_len(header.remaining_length as usize) + header.remaining_length as usize;
        buf.reserve(total);
        buf.put_u8(header.first_byte());
        write_variable_length(header.remaining_length, buf)?;
        match self {
            Packet::Connect(connect) => connect.encode(buf)?,
            Packet::ConnectAck(ack) => ack.encode(buf, version)?,
            Packet::Publish(publish) => publish.encode(buf, version)?,
            Packet::PublishAck(ack)
            | Packet::PublishReceived(ack)
            | Packet::PublishRelease(ack)
            | Packet::PublishComplete(ack) => ack.encode(buf, version)?,
            Packet::Subscribe(sub) => sub.encode(buf, version)?,
            Packet::SubscribeAck(ack) => ack.encode(buf, version)?,
            Packet::Unsubscribe(unsub) => unsub.encode(buf, version)?,
            Packet::UnsubscribeAck(ack) => ack.encode(buf, version)?,
            Packet::PingRequest | Packet::PingResponse => {}
            Packet::Disconnect(disconnect) => disconnect.encode(buf, version)?,
            Packet::Auth(auth) => auth.encode(buf, version)?,
        }
        Ok(total)
    }

    /// Decodes the body that follows `header`. `src` must hold exactly
    /// `header.remaining_length` bytes.
    pub(crate) fn decode(
        header: FixedHeader,
        mut src: Bytes,
        version: ProtocolVersion,
    ) -> Result<Packet, DecodeError> {
        ensure!(src.len() == header.remaining_length as usize, DecodeError::InvalidLength);
        let src = &mut src;
        let packet = match header.packet_type {
            PacketType::Connect => Packet::Connect(Box::new(Connect::decode(src)?)),
            PacketType::ConnectAck => Packet::ConnectAck(ConnectAck::decode(src, version)?),
            PacketType::Publish => Packet::Publish(Publish::decode(src, header.flags, version)?),
            PacketType::PublishAck => Packet::PublishAck(PublishAck::decode(src, version)?),
            PacketType::PublishReceived => Packet::PublishReceived(PublishAck::decode(src, version)?),
            PacketType::PublishRelease => Packet::PublishRelease(PublishAck::decode(src, version)?),
            PacketType::PublishComplete => Packet::PublishComplete(PublishAck::decode(src, version)?),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::decode(src, version)?),
            PacketType::SubscribeAck => Packet::SubscribeAck(SubscribeAck::decode(src, version)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(Unsubscribe::decode(src, version)?),
            PacketType::UnsubscribeAck => Packet::UnsubscribeAck(UnsubscribeAck::decode(src, version)?),
            PacketType::PingRequest => Packet::PingRequest,
            PacketType::PingResponse => Packet::PingResponse,
            PacketType::Disconnect => Packet::Disconnect(Disconnect::decode(src, version)?),
            PacketType::Auth => Packet::Auth(Auth::decode(src, version)?),
        };
        // the declared length must be consumed exactly
        ensure!(!src.has_remaining(), DecodeError::InvalidLength);
        Ok(packet)
    }
}

/// Optional reason code followed by optional properties, as used by the v5
/// PUBACK family, DISCONNECT and AUTH.
pub(crate) fn decode_reason_properties(
    src: &mut Bytes,
    scope: PropertyScope,
) -> Result<(ReasonCode, Properties), DecodeError> {
    if !src.has_remaining() {
        return Ok((ReasonCode::SUCCESS, Properties::default()));
    }
    let reason_code = ReasonCode(u8::decode(src)?);
    let properties =
        if src.has_remaining() { Properties::decode(src, scope)? } else { Properties::default() };
    Ok((reason_code, properties))
}

pub(crate) fn reason_properties_size(reason_code: ReasonCode, properties: &Properties) -> usize {
    if !properties.is_empty() {
        1 + properties.block_size()
    } else if reason_code != ReasonCode::SUCCESS {
        1
    } else {
        0
    }
}

pub(crate) fn encode_reason_properties(
    reason_code: ReasonCode,
    properties: &Properties,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    if !properties.is_empty() {
        buf.put_u8(reason_code.value());
        properties.encode(buf)?;
    } else if reason_code != ReasonCode::SUCCESS {
        buf.put_u8(reason_code.value());
    }
    Ok(())
}
