use std::num::NonZeroU16;

use bytes::{Buf, Bytes, BytesMut};
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, EncodeError};
use crate::properties::{Properties, PropertyScope};
use crate::types::{ProtocolVersion, QoS, ReasonCode};
use crate::utils::{Decode, Encode};

prim_enum! {
    #[derive(Serialize, Deserialize, Hash, Default)]
    pub enum RetainHandling {
        /// send retained messages at the time of the subscribe
        #[default]
        AtSubscribe = 0,
        /// send retained messages only if the subscription does not exist yet
        AtSubscribeNew = 1,
        /// do not send retained messages
        NoAtSubscribe = 2
    }
}

/// Per-filter options byte. 3.x only carries the QoS.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Default, Hash, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl SubscriptionOptions {
    #[inline]
    pub fn new(qos: QoS) -> Self {
        SubscriptionOptions { qos, ..Default::default() }
    }

    fn decode(src: &mut Bytes, version: ProtocolVersion) -> Result<Self, DecodeError> {
        let byte = u8::decode(src)?;
        if !version.is_v5() {
            ensure!(byte & 0b1111_1100 == 0, DecodeError::MalformedPacket);
            return Ok(SubscriptionOptions::new(QoS::try_from(byte)?));
        }
        ensure!(byte & 0b1100_0000 == 0, DecodeError::MalformedPacket);
        Ok(SubscriptionOptions {
            qos: QoS::try_from(byte & 0b0000_0011)?,
            no_local: byte & 0b0000_0100 != 0,
            retain_as_published: byte & 0b0000_1000 != 0,
            retain_handling: RetainHandling::try_from((byte >> 4) & 0b11)?,
        })
    }

    fn to_byte(self, version: ProtocolVersion) -> u8 {
        if !version.is_v5() {
            return self.qos.value();
        }
        self.qos.value()
            | (u8::from(self.no_local) << 2)
            | (u8::from(self.retain_as_published) << 3)
            | (u8::from(self.retain_handling) << 4)
    }
}

/// SUBSCRIBE packet
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Subscribe {
    pub packet_id: NonZeroU16,
    pub topic_filters: Vec<(ByteString, SubscriptionOptions)>,
    pub properties: Properties,
}

impl Subscribe {
    /// The v5 subscription identifier, if any.
    pub fn subscription_identifier(&self) -> Option<u32> {
        self.properties.subscription_identifiers().next()
    }

    pub(crate) fn decode(src: &mut Bytes, version: ProtocolVersion) -> Result<Self, DecodeError> {
        let packet_id = NonZeroU16::decode(src)?;
        let properties = if version.is_v5() {
            Properties::decode(src, PropertyScope::Subscribe)?
        } else {
            Properties::default()
        };
        let mut topic_filters = Vec::new();
        while src.has_remaining() {
            let topic = ByteString::decode(src)?;
            let opts = SubscriptionOptions::decode(src, version)?;
            topic_filters.push((topic, opts));
        }
        ensure!(!topic_filters.is_empty(), DecodeError::MalformedPacket);
        Ok(Subscribe { packet_id, topic_filters, properties })
    }

    pub(crate) fn encoded_size(&self, version: ProtocolVersion) -> usize {
        let filters: usize = self.topic_filters.iter().map(|(t, _)| t.encoded_size() + 1).sum();
        2 + filters + if version.is_v5() { self.properties.block_size() } else { 0 }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), EncodeError> {
        ensure!(!self.topic_filters.is_empty(), EncodeError::MalformedPacket);
        self.packet_id.encode(buf)?;
        if version.is_v5() {
            self.properties.encode(buf)?;
        }
        for (topic, opts) in self.topic_filters.iter() {
            topic.encode(buf)?;
            opts.to_byte(version).encode(buf)?;
        }
        Ok(())
    }
}

/// SUBACK packet
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SubscribeAck {
    pub packet_id: NonZeroU16,
    /// one per filter, in SUBSCRIBE order
    pub reason_codes: Vec<ReasonCode>,
    pub properties: Properties,
}

impl SubscribeAck {
    pub(crate) fn decode(src: &mut Bytes, version: ProtocolVersion) -> Result<Self, DecodeError> {
        let packet_id = NonZeroU16::decode(src)?;
        let properties = if version.is_v5() {
            Properties::decode(src, PropertyScope::SubscribeAck)?
        } else {
            Properties::default()
        };
        let mut reason_codes = Vec::with_capacity(src.remaining());
        while src.has_remaining() {
            let code = src.get_u8();
            if !version.is_v5() {
                ensure!(matches!(code, 0 | 1 | 2 | 0x80), DecodeError::MalformedPacket);
            }
            reason_codes.push(ReasonCode(code));
        }
        ensure!(!reason_codes.is_empty(), DecodeError::MalformedPacket);
        Ok(SubscribeAck { packet_id, reason_codes, properties })
    }

    pub(crate) fn encoded_size(&self, version: ProtocolVersion) -> usize {
        2 + self.reason_codes.len() + if version.is_v5() { self.properties.block_size() } else { 0 }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), EncodeError> {
        self.packet_id.encode(buf)?;
        if version.is_v5() {
            self.properties.encode(buf)?;
        }
        for code in self.reason_codes.iter() {
            let code = if !version.is_v5() && !code.is_success() {
                ReasonCode::V3_SUBSCRIBE_FAILURE
            } else {
                *code
            };
            code.value().encode(buf)?;
        }
        Ok(())
    }
}

/// UNSUBSCRIBE packet
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Unsubscribe {
    pub packet_id: NonZeroU16,
    pub topic_filters: Vec<ByteString>,
    pub properties: Properties,
}

impl Unsubscribe {
    pub(crate) fn decode(src: &mut Bytes, version: ProtocolVersion) -> Result<Self, DecodeError> {
        let packet_id = NonZeroU16::decode(src)?;
        let properties = if version.is_v5() {
            Properties::decode(src, PropertyScope::Unsubscribe)?
        } else {
            Properties::default()
        };
        let mut topic_filters = Vec::new();
        while src.has_remaining() {
            topic_filters.push(ByteString::decode(src)?);
        }
        ensure!(!topic_filters.is_empty(), DecodeError::MalformedPacket);
        Ok(Unsubscribe { packet_id, topic_filters, properties })
    }

    pub(crate) fn encoded_size(&self, version: ProtocolVersion) -> usize {
        let filters: usize = self.topic_filters.iter().map(|t| t.encoded_size()).sum();
        2 + filters + if version.is_v5() { self.properties.block_size() } else { 0 }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), EncodeError> {
        ensure!(!self.topic_filters.is_empty(), EncodeError::MalformedPacket);
        self.packet_id.encode(buf)?;
        if version.is_v5() {
            self.properties.encode(buf)?;
        }
        for topic in self.topic_filters.iter() {
            topic.encode(buf)?;
        }
        Ok(())
    }
}

/// UNSUBACK packet. 3.x carries neither reason codes nor properties.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct UnsubscribeAck {
    pub packet_id: NonZeroU16,
    pub reason_codes: Vec<ReasonCode>,
    pub properties: Properties,
}

impl UnsubscribeAck {
    pub(crate) fn decode(src: &mut Bytes, version: ProtocolVersion) -> Result<Self, DecodeError> {
        let packet_id = NonZeroU16::decode(src)?;
        if !version.is_v5() {
            return Ok(UnsubscribeAck { packet_id, reason_codes: Vec::new(), properties: Properties::default() });
        }
        let properties = Properties::decode(src, PropertyScope::UnsubscribeAck)?;
        let reason_codes = src.split_to(src.remaining()).iter().map(|c| ReasonCode(*c)).collect();
        Ok(UnsubscribeAck { packet_id, reason_codes, properties })
    }

    pub(crate) fn encoded_size(&self, version: ProtocolVersion) -> usize {
        if version.is_v5() {
            2 + self.properties.block_size() + self.reason_codes.len()
        } else {
            2
        }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), EncodeError> {
        self.packet_id.encode(buf)?;
        if version.is_v5() {
            self.properties.encode(buf)?;
            for code in self.reason_codes.iter() {
                code.value().encode(buf)?;
            }
        }
        Ok(())
    }
}
