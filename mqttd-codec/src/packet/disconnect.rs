use bytes::{Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};
use crate::properties::{Properties, PropertyScope};
use crate::types::{ProtocolVersion, ReasonCode};

/// DISCONNECT packet. Empty on 3.x, where it always means a normal disconnection.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Disconnect {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl Disconnect {
    #[inline]
    pub fn new(reason_code: ReasonCode) -> Self {
        Disconnect { reason_code, properties: Properties::default() }
    }

    pub(crate) fn decode(src: &mut Bytes, version: ProtocolVersion) -> Result<Self, DecodeError> {
        if !version.is_v5() {
            return Ok(Disconnect::default());
        }
        let (reason_code, properties) = super::decode_reason_properties(src, PropertyScope::Disconnect)?;
        Ok(Disconnect { reason_code, properties })
    }

    pub(crate) fn encoded_size(&self, version: ProtocolVersion) -> usize {
        if version.is_v5() {
            super::reason_properties_size(self.reason_code, &self.properties)
        } else {
            0
        }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), EncodeError> {
        if version.is_v5() {
            super::encode_reason_properties(self.reason_code, &self.properties, buf)?;
        }
        Ok(())
    }
}

/// AUTH packet, v5 only.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Auth {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl Auth {
    pub(crate) fn decode(src: &mut Bytes, version: ProtocolVersion) -> Result<Self, DecodeError> {
        ensure!(version.is_v5(), DecodeError::UnsupportedPacketType);
        let (reason_code, properties) = super::decode_reason_properties(src, PropertyScope::Auth)?;
        Ok(Auth { reason_code, properties })
    }

    pub(crate) fn encoded_size(&self) -> usize {
        super::reason_properties_size(self.reason_code, &self.properties)
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), EncodeError> {
        ensure!(version.is_v5(), EncodeError::UnsupportedVersion);
        super::encode_reason_properties(self.reason_code, &self.properties, buf)
    }
}
