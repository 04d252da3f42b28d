use bytes::{Bytes, BytesMut};
use bytestring::ByteString;

use crate::error::{DecodeError, EncodeError};
use crate::properties::{Properties, PropertyScope};
use crate::types::{
    ConnectAckFlags, ConnectFlags, ProtocolVersion, QoS, ReasonCode, MQISDP, MQTT, WILL_QOS_SHIFT,
};
use crate::utils::{Decode, Encode};

/// Will message published by the server when the connection ends abnormally.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LastWill {
    pub qos: QoS,
    pub retain: bool,
    pub topic: ByteString,
    pub message: Bytes,
    /// v5 will properties, e.g. the will delay interval.
    pub properties: Properties,
}

/// CONNECT packet. Its own `protocol` decides how it is written on the wire.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Connect {
    pub protocol: ProtocolVersion,
    /// `clean session` on 3.x, `clean start` on 5.0
    pub clean_start: bool,
    /// keep alive interval in seconds, 0 disables it
    pub keep_alive: u16,
    pub client_id: ByteString,
    pub last_will: Option<LastWill>,
    pub username: Option<ByteString>,
    pub password: Option<Bytes>,
    pub properties: Properties,
}

impl Default for Connect {
    fn default() -> Self {
        Connect {
            protocol: ProtocolVersion::default(),
            clean_start: true,
            keep_alive: 60,
            client_id: ByteString::default(),
            last_will: None,
            username: None,
            password: None,
            properties: Properties::default(),
        }
    }
}

impl Connect {
    #[inline]
    pub fn session_expiry_interval(&self) -> Option<u32> {
        self.properties.session_expiry_interval()
    }

    fn flags(&self) -> ConnectFlags {
        let mut flags = ConnectFlags::empty();
        if self.clean_start {
            flags |= ConnectFlags::CLEAN_START;
        }
        if let Some(will) = &self.last_will {
            flags |= ConnectFlags::WILL;
            if will.retain {
                flags |= ConnectFlags::WILL_RETAIN;
            }
            flags |= ConnectFlags::from_bits_truncate(will.qos.value() << WILL_QOS_SHIFT);
        }
        if self.username.is_some() {
            flags |= ConnectFlags::USERNAME;
        }
        if self.password.is_some() {
            flags |= ConnectFlags::PASSWORD;
        }
        flags
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let name = Bytes::decode(src)?;
        let level = u8::decode(src)?;
        let protocol = if name.as_ref() == MQTT {
            match level {
                4 => ProtocolVersion::V311,
                5 => ProtocolVersion::V5,
                _ => return Err(DecodeError::UnsupportedProtocolLevel),
            }
        } else if name.as_ref() == MQISDP {
            ensure!(level == 3, DecodeError::UnsupportedProtocolLevel);
            ProtocolVersion::V31
        } else {
            return Err(DecodeError::InvalidProtocol);
        };

        let flags = ConnectFlags::from_bits(u8::decode(src)?).ok_or(DecodeError::ConnectReservedFlagSet)?;
        let keep_alive = u16::decode(src)?;
        let properties = if protocol.is_v5() {
            Properties::decode(src, PropertyScope::Connect)?
        } else {
            Properties::default()
        };

        let client_id = ByteString::decode(src)?;
        let clean_start = flags.contains(ConnectFlags::CLEAN_START);
        if client_id.is_empty() {
            // 3.1 has no server assigned identifiers
            ensure!(protocol != ProtocolVersion::V31 && clean_start, DecodeError::InvalidClientId);
        }

        let last_will = if flags.contains(ConnectFlags::WILL) {
            let will_properties = if protocol.is_v5() {
                Properties::decode(src, PropertyScope::Will)?
            } else {
                Properties::default()
            };
            let topic = ByteString::decode(src)?;
            let message = Bytes::decode(src)?;
            Some(LastWill {
                qos: QoS::try_from((flags & ConnectFlags::WILL_QOS).bits() >> WILL_QOS_SHIFT)?,
                retain: flags.contains(ConnectFlags::WILL_RETAIN),
                topic,
                message,
                properties: will_properties,
            })
        } else {
            ensure!(
                !flags.intersects(ConnectFlags::WILL_QOS | ConnectFlags::WILL_RETAIN),
                DecodeError::MalformedPacket
            );
            None
        };

        let username =
            if flags.contains(ConnectFlags::USERNAME) { Some(ByteString::decode(src)?) } else { None };
        let password = if flags.contains(ConnectFlags::PASSWORD) { Some(Bytes::decode(src)?) } else { None };

        Ok(Connect { protocol, clean_start, keep_alive, client_id, last_will, username, password, properties })
    }

    pub(crate) fn encoded_size(&self) -> usize {
        let v5 = self.protocol.is_v5();
        let mut size = self.protocol.name().len() + 2 + 1 + 1 + 2 + self.client_id.encoded_size();
        if v5 {
            size += self.properties.block_size();
        }
        if let Some(will) = &self.last_will {
            if v5 {
                size += will.properties.block_size();
            }
            size += will.topic.encoded_size() + will.message.encoded_size();
        }
        size + self.username.encoded_size() + self.password.encoded_size()
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let v5 = self.protocol.is_v5();
        self.protocol.name().as_bytes().encode(buf)?;
        self.protocol.level().encode(buf)?;
        self.flags().bits().encode(buf)?;
        self.keep_alive.encode(buf)?;
        if v5 {
            self.properties.encode(buf)?;
        }
        self.client_id.encode(buf)?;
        if let Some(will) = &self.last_will {
            if v5 {
                will.properties.encode(buf)?;
            }
            will.topic.encode(buf)?;
            will.message.encode(buf)?;
        }
        self.username.encode(buf)?;
        self.password.encode(buf)
    }
}

/// CONNACK packet; `reason_code` holds the v3 return code on 3.x.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct ConnectAck {
    pub session_present: bool,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl ConnectAck {
    pub(crate) fn decode(src: &mut Bytes, version: ProtocolVersion) -> Result<Self, DecodeError> {
        let flags = ConnectAckFlags::from_bits(u8::decode(src)?).ok_or(DecodeError::ConnAckReservedFlagSet)?;
        let reason_code = ReasonCode(u8::decode(src)?);
        let properties = if version.is_v5() {
            Properties::decode(src, PropertyScope::ConnectAck)?
        } else {
            Properties::default()
        };
        Ok(ConnectAck { session_present: flags.contains(ConnectAckFlags::SESSION_PRESENT), reason_code, properties })
    }

    pub(crate) fn encoded_size(&self, version: ProtocolVersion) -> usize {
        2 + if version.is_v5() { self.properties.block_size() } else { 0 }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), EncodeError> {
        let flags = if self.session_present { ConnectAckFlags::SESSION_PRESENT } else { ConnectAckFlags::empty() };
        flags.bits().encode(buf)?;
        self.reason_code.value().encode(buf)?;
        if version.is_v5() {
            self.properties.encode(buf)?;
        }
        Ok(())
    }
}
