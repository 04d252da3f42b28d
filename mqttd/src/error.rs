use std::time::Duration;

use thiserror::Error;

use crate::codec::{DecodeError, EncodeError, ReasonCode};
use crate::topic::TopicError;

#[derive(Error, Debug)]
pub enum MqttError {
    #[error("decode error, {0}")]
    Decode(#[from] DecodeError),
    #[error("encode error, {0}")]
    Encode(#[from] EncodeError),
    #[error("invalid topic, {0}")]
    InvalidTopic(String),
    #[error("invalid topic filter, {0}")]
    InvalidTopicFilter(String),
    #[error("protocol violation, {0}")]
    ProtocolViolation(String),
    #[error("packet identifier required")]
    PacketIdRequired,
    #[error("packet identifier space exhausted")]
    PacketIdExhausted,
    #[error("storage error, {0}")]
    Storage(#[from] sled::Error),
    #[error("corrupt record, {0}")]
    CorruptRecord(String),
    #[error("read/write timeout, {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Config(#[from] config::ConfigError),
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("{0}")]
    Msg(String),
}

impl From<TopicError> for MqttError {
    #[inline]
    fn from(e: TopicError) -> Self {
        match e {
            TopicError::InvalidTopic(s) => MqttError::InvalidTopic(s),
            TopicError::InvalidFilter(s) | TopicError::InvalidLevel(s) => MqttError::InvalidTopicFilter(s),
        }
    }
}

impl From<String> for MqttError {
    #[inline]
    fn from(e: String) -> Self {
        MqttError::Msg(e)
    }
}

impl From<&str> for MqttError {
    #[inline]
    fn from(e: &str) -> Self {
        MqttError::Msg(e.to_string())
    }
}

/// Maps an error onto the v5 reason code sent with DISCONNECT.
pub trait ToReasonCode {
    fn to_reason_code(&self) -> ReasonCode;
}

impl ToReasonCode for MqttError {
    fn to_reason_code(&self) -> ReasonCode {
        match self {
            MqttError::Decode(DecodeError::MaxSizeExceeded) => ReasonCode::PACKET_TOO_LARGE,
            MqttError::Decode(DecodeError::UnsupportedProtocolLevel) => ReasonCode::UNSUPPORTED_PROTOCOL_VERSION,
            MqttError::Decode(DecodeError::InvalidClientId) => ReasonCode::CLIENT_IDENTIFIER_NOT_VALID,
            MqttError::Decode(_) => ReasonCode::MALFORMED_PACKET,
            MqttError::Encode(EncodeError::OverMaxPacketSize) => ReasonCode::PACKET_TOO_LARGE,
            MqttError::InvalidTopic(_) => ReasonCode::TOPIC_NAME_INVALID,
            MqttError::InvalidTopicFilter(_) => ReasonCode::TOPIC_FILTER_INVALID,
            MqttError::ProtocolViolation(_) | MqttError::PacketIdRequired => ReasonCode::PROTOCOL_ERROR,
            MqttError::PacketIdExhausted => ReasonCode::QUOTA_EXCEEDED,
            MqttError::Timeout(_) => ReasonCode::KEEP_ALIVE_TIMEOUT,
            _ => ReasonCode::UNSPECIFIED_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(MqttError::from(DecodeError::MalformedPacket).to_reason_code(), ReasonCode::MALFORMED_PACKET);
        assert_eq!(MqttError::from(DecodeError::MaxSizeExceeded).to_reason_code(), ReasonCode::PACKET_TOO_LARGE);
        assert_eq!(
            MqttError::from(TopicError::InvalidTopic("a/+".into())).to_reason_code(),
            ReasonCode::TOPIC_NAME_INVALID
        );
        assert_eq!(
            MqttError::from(TopicError::InvalidFilter("a/#/b".into())).to_reason_code(),
            ReasonCode::TOPIC_FILTER_INVALID
        );
        assert_eq!(MqttError::PacketIdExhausted.to_reason_code(), ReasonCode::QUOTA_EXCEEDED);
        assert_eq!(MqttError::from("boom").to_reason_code(), ReasonCode::UNSPECIFIED_ERROR);
    }
}
