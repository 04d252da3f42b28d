//! MQTT v5 property lists.
//!
//! A property block is a variable byte integer length followed by
//! `(identifier, value)` pairs. The identifier fixes the wire type of the
//! value. Unknown identifiers, identifiers not permitted on the enclosing
//! packet and repeated single-valued properties all fail decoding.

use bytes::{Buf, Bytes, BytesMut};
use bytestring::ByteString;

use crate::error::{DecodeError, EncodeError};
use crate::utils::{self, var_int_len, write_variable_length, Decode, Encode};

prim_enum! {
    #[derive(Hash, PartialOrd, Ord)]
    pub enum PropertyId {
        PayloadFormatIndicator = 0x01,
        MessageExpiryInterval = 0x02,
        ContentType = 0x03,
        ResponseTopic = 0x08,
        CorrelationData = 0x09,
        SubscriptionIdentifier = 0x0B,
        SessionExpiryInterval = 0x11,
        AssignedClientIdentifier = 0x12,
        ServerKeepAlive = 0x13,
        AuthenticationMethod = 0x15,
        AuthenticationData = 0x16,
        RequestProblemInformation = 0x17,
        WillDelayInterval = 0x18,
        RequestResponseInformation = 0x19,
        ResponseInformation = 0x1A,
        ServerReference = 0x1C,
        ReasonString = 0x1F,
        ReceiveMaximum = 0x21,
        TopicAliasMaximum = 0x22,
        TopicAlias = 0x23,
        MaximumQoS = 0x24,
        RetainAvailable = 0x25,
        UserProperty = 0x26,
        MaximumPacketSize = 0x27,
        WildcardSubscriptionAvailable = 0x28,
        SubscriptionIdentifierAvailable = 0x29,
        SharedSubscriptionAvailable = 0x2A
    }
}

/// The packet (or CONNECT will section) a property block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PropertyScope {
    Connect,
    Will,
    ConnectAck,
    Publish,
    PublishAck,
    Subscribe,
    SubscribeAck,
    Unsubscribe,
    UnsubscribeAck,
    Disconnect,
    Auth,
}

impl PropertyId {
    fn allowed_in(self, scope: PropertyScope) -> bool {
        use PropertyId::*;
        use PropertyScope as S;
        match self {
            PayloadFormatIndicator | MessageExpiryInterval | ContentType | ResponseTopic
            | CorrelationData => matches!(scope, S::Publish | S::Will),
            SubscriptionIdentifier => matches!(scope, S::Publish | S::Subscribe),
            SessionExpiryInterval => matches!(scope, S::Connect | S::ConnectAck | S::Disconnect),
            AssignedClientIdentifier | ServerKeepAlive | ResponseInformation | MaximumQoS
            | RetainAvailable | WildcardSubscriptionAvailable | SubscriptionIdentifierAvailable
            | SharedSubscriptionAvailable => scope == S::ConnectAck,
            AuthenticationMethod | AuthenticationData => {
                matches!(scope, S::Connect | S::ConnectAck | S::Auth)
            }
            RequestProblemInformation | RequestResponseInformation => scope == S::Connect,
            WillDelayInterval => scope == S::Will,
            ServerReference => matches!(scope, S::ConnectAck | S::Disconnect),
            ReasonString => matches!(
                scope,
                S::ConnectAck
                    | S::PublishAck
                    | S::SubscribeAck
                    | S::UnsubscribeAck
                    | S::Disconnect
                    | S::Auth
            ),
            ReceiveMaximum | TopicAliasMaximum | MaximumPacketSize => {
                matches!(scope, S::Connect | S::ConnectAck)
            }
            TopicAlias => scope == S::Publish,
            UserProperty => true,
        }
    }

    #[inline]
    fn repeatable(self) -> bool {
        matches!(self, PropertyId::UserProperty | PropertyId::SubscriptionIdentifier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    PayloadFormatIndicator(u8),
    MessageExpiryInterval(u32),
    ContentType(ByteString),
    ResponseTopic(ByteString),
    CorrelationData(Bytes),
    SubscriptionIdentifier(u32),
    SessionExpiryInterval(u32),
    AssignedClientIdentifier(ByteString),
    ServerKeepAlive(u16),
    AuthenticationMethod(ByteString),
    AuthenticationData(Bytes),
    RequestProblemInformation(u8),
    WillDelayInterval(u32),
    RequestResponseInformation(u8),
    ResponseInformation(ByteString),
    ServerReference(ByteString),
    ReasonString(ByteString),
    ReceiveMaximum(u16),
    TopicAliasMaximum(u16),
    TopicAlias(u16),
    MaximumQoS(u8),
    RetainAvailable(u8),
    UserProperty(ByteString, ByteString),
    MaximumPacketSize(u32),
    WildcardSubscriptionAvailable(u8),
    SubscriptionIdentifierAvailable(u8),
    SharedSubscriptionAvailable(u8),
}

/// Reads a byte property restricted to 0 or 1.
fn flag(src: &mut Bytes) -> Result<u8, DecodeError> {
    let v = u8::decode(src)?;
    ensure!(v <= 1, DecodeError::MalformedPacket);
    Ok(v)
}

fn non_zero_u16(src: &mut Bytes) -> Result<u16, DecodeError> {
    let v = u16::decode(src)?;
    ensure!(v != 0, DecodeError::MalformedPacket);
    Ok(v)
}

impl Property {
    pub fn id(&self) -> PropertyId {
        use Property as P;
        match self {
            P::PayloadFormatIndicator(_) => PropertyId::PayloadFormatIndicator,
            P::MessageExpiryInterval(_) => PropertyId::MessageExpiryInterval,
            P::ContentType(_) => PropertyId::ContentType,
            P::ResponseTopic(_) => PropertyId::ResponseTopic,
            P::CorrelationData(_) => PropertyId::CorrelationData,
            P::SubscriptionIdentifier(_) => PropertyId::SubscriptionIdentifier,
            P::SessionExpiryInterval(_) => PropertyId::SessionExpiryInterval,
            P::AssignedClientIdentifier(_) => PropertyId::AssignedClientIdentifier,
            P::ServerKeepAlive(_) => PropertyId::ServerKeepAlive,
            P::AuthenticationMethod(_) => PropertyId::AuthenticationMethod,
            P::AuthenticationData(_) => PropertyId::AuthenticationData,
            P::RequestProblemInformation(_) => PropertyId::RequestProblemInformation,
            P::WillDelayInterval(_) => PropertyId::WillDelayInterval,
            P::RequestResponseInformation(_) => PropertyId::RequestResponseInformation,
            P::ResponseInformation(_) => PropertyId::ResponseInformation,
            P::ServerReference(_) => PropertyId::ServerReference,
            P::ReasonString(_) => PropertyId::ReasonString,
            P::ReceiveMaximum(_) => PropertyId::ReceiveMaximum,
            P::TopicAliasMaximum(_) => PropertyId::TopicAliasMaximum,
            P::TopicAlias(_) => PropertyId::TopicAlias,
            P::MaximumQoS(_) => PropertyId::MaximumQoS,
            P::RetainAvailable(_) => PropertyId::RetainAvailable,
            P::UserProperty(..) => PropertyId::UserProperty,
            P::MaximumPacketSize(_) => PropertyId::MaximumPacketSize,
            P::WildcardSubscriptionAvailable(_) => PropertyId::WildcardSubscriptionAvailable,
            P::SubscriptionIdentifierAvailable(_) => PropertyId::SubscriptionIdentifierAvailable,
            P::SharedSubscriptionAvailable(_) => PropertyId::SharedSubscriptionAvailable,
        }
    }

    fn decode_value(id: PropertyId, src: &mut Bytes) -> Result<Self, DecodeError> {
        use PropertyId as I;
        Ok(match id {
            I::PayloadFormatIndicator => Property::PayloadFormatIndicator(flag(src)?),
            I::MessageExpiryInterval => Property::MessageExpiryInterval(u32::decode(src)?),
            I::ContentType => Property::ContentType(ByteString::decode(src)?),
            I::ResponseTopic => Property::ResponseTopic(ByteString::decode(src)?),
            I::CorrelationData => Property::CorrelationData(Bytes::decode(src)?),
            I::SubscriptionIdentifier => {
                let v = utils::decode_variable_length_cursor(src)?;
                ensure!(v != 0, DecodeError::MalformedPacket);
                Property::SubscriptionIdentifier(v)
            }
            I::SessionExpiryInterval => Property::SessionExpiryInterval(u32::decode(src)?),
            I::AssignedClientIdentifier => Property::AssignedClientIdentifier(ByteString::decode(src)?),
            I::ServerKeepAlive => Property::ServerKeepAlive(u16::decode(src)?),
            I::AuthenticationMethod => Property::AuthenticationMethod(ByteString::decode(src)?),
            I::AuthenticationData => Property::AuthenticationData(Bytes::decode(src)?),
            I::RequestProblemInformation => Property::RequestProblemInformation(flag(src)?),
            I::WillDelayInterval => Property::WillDelayInterval(u32::decode(src)?),
            I::RequestResponseInformation => Property::RequestResponseInformation(flag(src)?),
            I::ResponseInformation => Property::ResponseInformation(ByteString::decode(src)?),
            I::ServerReference => Property::ServerReference(ByteString::decode(src)?),
            I::ReasonString => Property::ReasonString(ByteString::decode(src)?),
            I::ReceiveMaximum => Property::ReceiveMaximum(non_zero_u16(src)?),
            I::TopicAliasMaximum => Property::TopicAliasMaximum(u16::decode(src)?),
            I::TopicAlias => Property::TopicAlias(non_zero_u16(src)?),
            I::MaximumQoS => Property::MaximumQoS(flag(src)?),
            I::RetainAvailable => Property::RetainAvailable(flag(src)?),
            I::UserProperty => Property::UserProperty(ByteString::decode(src)?, ByteString::decode(src)?),
            I::MaximumPacketSize => {
                let v = u32::decode(src)?;
                ensure!(v != 0, DecodeError::MalformedPacket);
                Property::MaximumPacketSize(v)
            }
            I::WildcardSubscriptionAvailable => Property::WildcardSubscriptionAvailable(flag(src)?),
            I::SubscriptionIdentifierAvailable => Property::SubscriptionIdentifierAvailable(flag(src)?),
            I::SharedSubscriptionAvailable => Property::SharedSubscriptionAvailable(flag(src)?),
        })
    }

    fn value_size(&self) -> usize {
        use Property as P;
        match self {
            P::PayloadFormatIndicator(_)
            | P::RequestProblemInformation(_)
            | P::RequestResponseInformation(_)
            | P::MaximumQoS(_)
            | P::RetainAvailable(_)
            | P::WildcardSubscriptionAvailable(_)
            | P::SubscriptionIdentifierAvailable(_)
            | P::SharedSubscriptionAvailable(_) => 1,
            P::ServerKeepAlive(_) | P::ReceiveMaximum(_) | P::TopicAliasMaximum(_) | P::TopicAlias(_) => 2,
            P::MessageExpiryInterval(_)
            | P::SessionExpiryInterval(_)
            | P::WillDelayInterval(_)
            | P::MaximumPacketSize(_) => 4,
            P::SubscriptionIdentifier(v) => var_int_len(*v as usize),
            P::ContentType(s)
            | P::ResponseTopic(s)
            | P::AssignedClientIdentifier(s)
            | P::AuthenticationMethod(s)
            | P::ResponseInformation(s)
            | P::ServerReference(s)
            | P::ReasonString(s) => s.encoded_size(),
            P::CorrelationData(b) | P::AuthenticationData(b) => b.encoded_size(),
            P::UserProperty(k, v) => k.encoded_size() + v.encoded_size(),
        }
    }

    fn encode_value(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        use Property as P;
        match self {
            P::PayloadFormatIndicator(v)
            | P::RequestProblemInformation(v)
            | P::RequestResponseInformation(v)
            | P::MaximumQoS(v)
            | P::RetainAvailable(v)
            | P::WildcardSubscriptionAvailable(v)
            | P::SubscriptionIdentifierAvailable(v)
            | P::SharedSubscriptionAvailable(v) => v.encode(buf),
            P::ServerKeepAlive(v) | P::ReceiveMaximum(v) | P::TopicAliasMaximum(v) | P::TopicAlias(v) => {
                v.encode(buf)
            }
            P::MessageExpiryInterval(v)
            | P::SessionExpiryInterval(v)
            | P::WillDelayInterval(v)
            | P::MaximumPacketSize(v) => v.encode(buf),
            P::SubscriptionIdentifier(v) => write_variable_length(*v, buf),
            P::ContentType(s)
            | P::ResponseTopic(s)
            | P::AssignedClientIdentifier(s)
            | P::AuthenticationMethod(s)
            | P::ResponseInformation(s)
            | P::ServerReference(s)
            | P::ReasonString(s) => s.encode(buf),
            P::CorrelationData(b) | P::AuthenticationData(b) => b.encode(buf),
            P::UserProperty(k, v) => {
                k.encode(buf)?;
                v.encode(buf)
            }
        }
    }
}

/// Ordered property list of one packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Properties(Vec<Property>);

impl Properties {
    #[inline]
    pub fn new() -> Self {
        Properties(Vec::new())
    }

    #[inline]
    pub fn push(&mut self, prop: Property) {
        self.0.push(prop);
    }

    #[inline]
    pub fn with(mut self, prop: Property) -> Self {
        self.0.push(prop);
        self
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.0.iter()
    }

    /// Drops every property with the given identifier.
    pub fn remove(&mut self, id: PropertyId) {
        self.0.retain(|p| p.id() != id);
    }

    pub fn get(&self, id: PropertyId) -> Option<&Property> {
        self.0.iter().find(|p| p.id() == id)
    }

    pub fn user_properties(&self) -> impl Iterator<Item = (&ByteString, &ByteString)> {
        self.0.iter().filter_map(|p| match p {
            Property::UserProperty(k, v) => Some((k, v)),
            _ => None,
        })
    }

    pub fn subscription_identifiers(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().filter_map(|p| match p {
            Property::SubscriptionIdentifier(v) => Some(*v),
            _ => None,
        })
    }

    pub fn message_expiry_interval(&self) -> Option<u32> {
        self.0.iter().find_map(|p| match p {
            Property::MessageExpiryInterval(v) => Some(*v),
            _ => None,
        })
    }

    pub fn session_expiry_interval(&self) -> Option<u32> {
        self.0.iter().find_map(|p| match p {
            Property::SessionExpiryInterval(v) => Some(*v),
            _ => None,
        })
    }

    pub fn receive_maximum(&self) -> Option<u16> {
        self.0.iter().find_map(|p| match p {
            Property::ReceiveMaximum(v) => Some(*v),
            _ => None,
        })
    }

    pub fn maximum_packet_size(&self) -> Option<u32> {
        self.0.iter().find_map(|p| match p {
            Property::MaximumPacketSize(v) => Some(*v),
            _ => None,
        })
    }

    pub fn reason_string(&self) -> Option<&ByteString> {
        self.0.iter().find_map(|p| match p {
            Property::ReasonString(v) => Some(v),
            _ => None,
        })
    }

    /// Size of the properties without the length prefix.
    fn content_size(&self) -> usize {
        self.0.iter().map(|p| 1 + p.value_size()).sum()
    }

    /// Size of the whole block including the variable byte integer prefix.
    pub(crate) fn block_size(&self) -> usize {
        let size = self.content_size();
        var_int_len(size) + size
    }

    pub(crate) fn decode(src: &mut Bytes, scope: PropertyScope) -> Result<Self, DecodeError> {
        let mut block = utils::take_properties(src)?;
        let mut props = Vec::new();
        let mut seen: u64 = 0;
        while block.has_remaining() {
            let raw = block.get_u8();
            let id = PropertyId::try_from(raw).map_err(|_| DecodeError::UnknownProperty(raw))?;
            ensure!(id.allowed_in(scope), DecodeError::PropertyNotAllowed(raw));
            if !id.repeatable() {
                let bit = 1u64 << raw;
                ensure!(seen & bit == 0, DecodeError::MalformedPacket);
                seen |= bit;
            }
            props.push(Property::decode_value(id, &mut block)?);
        }
        Ok(Properties(props))
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_variable_length(self.content_size() as u32, buf)?;
        for prop in self.0.iter() {
            buf.extend_from_slice(&[u8::from(prop.id())]);
            prop.encode_value(buf)?;
        }
        Ok(())
    }
}

impl From<Vec<Property>> for Properties {
    fn from(props: Vec<Property>) -> Self {
        Properties(props)
    }
}

impl IntoIterator for Properties {
    type Item = Property;
    type IntoIter = std::vec::IntoIter<Property>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn roundtrip(props: &Properties, scope: PropertyScope) -> Properties {
        let mut buf = BytesMut::new();
        props.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), props.block_size());
        let mut src = buf.freeze();
        let decoded = Properties::decode(&mut src, scope).unwrap();
        assert!(src.is_empty());
        decoded
    }

    #[test]
    fn test_connect_properties() {
        let props = Properties::new()
            .with(Property::SessionExpiryInterval(3600))
            .with(Property::ReceiveMaximum(20))
            .with(Property::MaximumPacketSize(1024 * 1024))
            .with(Property::TopicAliasMaximum(10))
            .with(Property::UserProperty("region".into(), "eu".into()))
            .with(Property::UserProperty("region".into(), "us".into()));
        let decoded = roundtrip(&props, PropertyScope::Connect);
        assert_eq!(decoded, props);
        assert_eq!(decoded.session_expiry_interval(), Some(3600));
        assert_eq!(decoded.receive_maximum(), Some(20));
        assert_eq!(decoded.user_properties().count(), 2);
    }

    #[test]
    fn test_wire_layout() {
        let props = Properties::new().with(Property::SessionExpiryInterval(10));
        let mut buf = BytesMut::new();
        props.encode(&mut buf).unwrap();
        assert_eq!(buf.as_ref(), b"\x05\x11\x00\x00\x00\x0a");

        let props = Properties::new().with(Property::SubscriptionIdentifier(200));
        let mut buf = BytesMut::new();
        props.encode(&mut buf).unwrap();
        assert_eq!(buf.as_ref(), b"\x03\x0b\xc8\x01");
    }

    #[test_case(b"\x02\x05\x00"; "unknown identifier")]
    #[test_case(b"\x02\x7f\x00"; "identifier out of table")]
    fn test_unknown_property(src: &'static [u8]) {
        let mut src = Bytes::from_static(src);
        assert!(matches!(
            Properties::decode(&mut src, PropertyScope::Publish),
            Err(DecodeError::UnknownProperty(_))
        ));
    }

    #[test]
    fn test_duplicate_property() {
        let mut src = Bytes::from_static(b"\x0a\x11\x00\x00\x00\x01\x11\x00\x00\x00\x02");
        assert!(matches!(
            Properties::decode(&mut src, PropertyScope::Connect),
            Err(DecodeError::MalformedPacket)
        ));
    }

    #[test]
    fn test_property_not_allowed() {
        // session expiry interval on a PUBLISH
        let mut src = Bytes::from_static(b"\x05\x11\x00\x00\x00\x01");
        assert!(matches!(
            Properties::decode(&mut src, PropertyScope::Publish),
            Err(DecodeError::PropertyNotAllowed(0x11))
        ));
    }

    #[test]
    fn test_truncated_block() {
        let mut src = Bytes::from_static(b"\x09\x11\x00\x00");
        assert!(matches!(Properties::decode(&mut src, PropertyScope::Connect), Err(DecodeError::InvalidLength)));

        let mut src = Bytes::from_static(b"\x03\x11\x00\x00");
        assert!(matches!(Properties::decode(&mut src, PropertyScope::Connect), Err(DecodeError::InvalidLength)));
    }

    #[test]
    fn test_zero_subscription_identifier() {
        let mut src = Bytes::from_static(b"\x02\x0b\x00");
        assert!(matches!(
            Properties::decode(&mut src, PropertyScope::Subscribe),
            Err(DecodeError::MalformedPacket)
        ));
    }
}
