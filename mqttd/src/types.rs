use std::fmt;
use std::num::NonZeroU16;

use bytestring::ByteString;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::codec::{Packet, Publish, QoS, ReasonCode, RetainHandling, SubscriptionOptions};

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

pub type ClientId = ByteString;
pub type TopicName = ByteString;
pub type TopicFilter = ByteString;
pub type SharedGroup = ByteString;
pub type PacketId = NonZeroU16;
pub type ConnectionId = u64;
pub type TimestampMillis = i64;

/// A client's registration on one topic filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub client_id: ClientId,
    pub group: Option<SharedGroup>,
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
    pub subscription_id: Option<u32>,
}

impl Subscriber {
    pub fn new(client_id: ClientId, opts: &SubscriptionOptions) -> Self {
        Subscriber {
            client_id,
            group: None,
            qos: opts.qos,
            no_local: opts.no_local,
            retain_as_published: opts.retain_as_published,
            retain_handling: opts.retain_handling,
            subscription_id: None,
        }
    }

    #[inline]
    pub fn with_group(mut self, group: Option<SharedGroup>) -> Self {
        self.group = group;
        self
    }

    #[inline]
    pub fn with_subscription_id(mut self, id: Option<u32>) -> Self {
        self.subscription_id = id;
        self
    }
}

/// Commands queued to a connected session.
pub enum Message {
    /// A routed publish, not yet bound to a packet id.
    Deliver(Publish),
    /// Packets prepared by the delivery engine, sent as is. May be empty
    /// when expired records only freed inflight credit.
    Resend(Vec<Packet>),
    /// Close the session; the sender is notified once teardown is done.
    Kick(ReasonCode, Option<oneshot::Sender<()>>),
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Deliver(p) => write!(f, "Deliver({:?})", p),
            Message::Resend(p) => {
                write!(f, "Resend({:?})", p.iter().map(|p| p.packet_type()).collect::<Vec<_>>())
            }
            Message::Kick(r, _) => write!(f, "Kick({:?})", r),
        }
    }
}

pub type Tx = mpsc::UnboundedSender<Message>;
pub type Rx = mpsc::UnboundedReceiver<Message>;

/// The registry entry of an online session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub conn_id: ConnectionId,
    pub tx: Tx,
}

impl SessionHandle {
    #[inline]
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
