use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{Instant, MissedTickBehavior};

use mqttd_utils::Counter;

use crate::codec::{Property, PropertyId, ProtocolVersion, Publish, QoS};
use crate::delivery::DeliveryEngine;
use crate::logger::logger_init;
use crate::retain::RetainTree;
use crate::router::Router;
use crate::settings::Settings;
use crate::store::{init_store, Store};
use crate::topic::validate_topic_name;
use crate::types::{ClientId, ConnectionId, DashMap, HashMap, Message, SessionHandle, Subscriber};
use crate::Result;

/// Process-wide broker state, cheap to clone.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub settings: Settings,
    pub router: Router,
    pub retain: RetainTree,
    pub store: Arc<dyn Store>,
    /// Online sessions by client id.
    pub sessions: DashMap<ClientId, SessionHandle>,
    /// Engines of online and persisted offline sessions.
    engines: DashMap<ClientId, Arc<DeliveryEngine>>,
    /// Persistent sessions waiting for their expiry, with the connection
    /// that went offline.
    offlines: DashMap<ClientId, ConnectionId>,
    pub connections: Counter,
    pub inflights: Arc<Counter>,
    next_conn_id: AtomicU64,
    retain_sweeper: AtomicBool,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl ServerContext {
    /// Installs the configured logger and opens the storage backend
    /// configured in `settings`.
    pub fn new(settings: Settings) -> Result<Self> {
        match logger_init(&settings.log) {
            Ok(_) => settings.logs(),
            Err(e) => log::debug!("keeping the installed logger, {}", e),
        }
        let store = init_store(&settings.storage)?;
        Ok(Self::with_store(settings, store))
    }

    pub fn with_store(settings: Settings, store: Arc<dyn Store>) -> Self {
        let retain = RetainTree::new(settings.mqtt.message_expiry);
        ServerContext {
            inner: Arc::new(ServerContextInner {
                settings,
                router: Router::new(),
                retain,
                store,
                sessions: DashMap::default(),
                engines: DashMap::default(),
                offlines: DashMap::default(),
                connections: Counter::new(),
                inflights: Arc::new(Counter::new()),
                next_conn_id: AtomicU64::new(1),
                retain_sweeper: AtomicBool::new(false),
            }),
        }
    }

    /// Removes expired retained messages every `interval`. Only the first
    /// call spawns the task, which ends once the context is dropped.
    pub fn start_retain_sweeper(&self, interval: Duration) -> bool {
        if self.retain_sweeper.swap(true, Ordering::SeqCst) {
            return false;
        }
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let now = std::time::Instant::now();
                let removeds = inner.retain.remove_expired();
                if removeds > 0 {
                    log::debug!("expired retained messages removed: {}, cost time: {:?}", removeds, now.elapsed());
                }
            }
            log::debug!("retain sweeper exits");
        });
        true
    }

    #[inline]
    pub fn next_conn_id(&self) -> ConnectionId {
        self.next_conn_id.fetch_add(1, Ordering::SeqCst)
    }

    #[inline]
    pub fn is_online(&self, client_id: &str) -> bool {
        self.sessions.get(client_id).map(|h| !h.is_closed()).unwrap_or(false)
    }

    /// The engine of `client_id`, created and restored from the store on
    /// first use.
    pub fn engine(&self, client_id: &ClientId, protocol: ProtocolVersion) -> Result<Arc<DeliveryEngine>> {
        if let Some(engine) = self.engines.get(client_id) {
            engine.set_protocol(protocol);
            return Ok(engine.clone());
        }
        let engine = Arc::new(DeliveryEngine::new(
            client_id.clone(),
            protocol,
            self.store.clone(),
            &self.settings.mqtt,
            self.inflights.clone(),
        )?);
        Ok(self.engines.entry(client_id.clone()).or_insert(engine).clone())
    }

    #[inline]
    pub fn get_engine(&self, client_id: &str) -> Option<Arc<DeliveryEngine>> {
        self.engines.get(client_id).map(|e| e.clone())
    }

    /// Marks `client_id` offline after connection `conn_id` ended.
    #[inline]
    pub fn set_offline(&self, client_id: ClientId, conn_id: ConnectionId) {
        self.offlines.insert(client_id, conn_id);
    }

    /// Clears the offline mark, returns whether the client had one.
    #[inline]
    pub fn set_online(&self, client_id: &str) -> bool {
        self.offlines.remove(client_id).is_some()
    }

    /// Drops the subscriptions and pending records of `client_id`.
    ///
    /// With `conn_id` set, only when that connection is still the one that
    /// left the session offline; returns whether anything was removed.
    pub fn clean_session(&self, client_id: &str, conn_id: Option<ConnectionId>) -> Result<bool> {
        if let Some(conn_id) = conn_id {
            if self.offlines.remove_if(client_id, |_, c| *c == conn_id).is_none() {
                return Ok(false);
            }
        } else {
            self.offlines.remove(client_id);
        }
        let subs = self.router.remove_client(client_id);
        let records = match self.engines.remove(client_id) {
            Some((_, engine)) => engine.clear()?,
            None => self.store.remove_client(client_id)?,
        };
        log::debug!("{:?} session cleaned, subscriptions: {}, records: {}", client_id, subs, records);
        Ok(true)
    }

    /// Routes `publish` to every matching subscriber, storing it first when
    /// it is retained. Returns the number of sessions it was handed to.
    pub fn publish(&self, from: Option<&str>, publish: Publish) -> Result<usize> {
        validate_topic_name(&publish.topic)?;
        if publish.retain && self.settings.mqtt.retain_enable {
            self.retain.insert(publish.clone())?;
        }

        let subscribers = self.router.matches(&publish.topic, |cid| self.is_online(cid));
        let mut targets: HashMap<ClientId, (Subscriber, Vec<u32>)> = HashMap::default();
        for sub in subscribers {
            if sub.no_local && from == Some(&*sub.client_id) {
                continue;
            }
            let entry = targets.entry(sub.client_id.clone()).or_insert_with(|| (sub.clone(), Vec::new()));
            if let Some(id) = sub.subscription_id {
                entry.1.push(id);
            }
            if sub.qos > entry.0.qos {
                entry.0.qos = sub.qos;
            }
            entry.0.retain_as_published |= sub.retain_as_published;
        }

        let mut delivered = 0;
        for (client_id, (sub, ids)) in targets {
            let mut p = publish.clone();
            p.qos = publish.qos.less_value(sub.qos);
            p.retain = publish.retain && sub.retain_as_published;
            p.dup = false;
            p.packet_id = None;
            p.properties.remove(PropertyId::SubscriptionIdentifier);
            for id in ids {
                p.properties.push(Property::SubscriptionIdentifier(id));
            }
            if self.deliver_to(&client_id, p) {
                delivered += 1;
            }
        }
        log::trace!("{:?} publish to {:?} delivered to {} sessions", from, publish.topic, delivered);
        Ok(delivered)
    }

    /// Hands `publish` to the online session of `client_id`, or stores it in
    /// the engine of an offline persistent session when its QoS is above 0.
    pub fn deliver_to(&self, client_id: &ClientId, publish: Publish) -> bool {
        let publish = match self.sessions.get(client_id) {
            Some(handle) => match handle.tx.send(Message::Deliver(publish)) {
                Ok(()) => return true,
                Err(e) => match e.0 {
                    Message::Deliver(p) => p,
                    _ => return false,
                },
            },
            None => publish,
        };

        let engine = match self.get_engine(client_id) {
            Some(engine) if publish.qos > QoS::AtMostOnce => engine,
            _ => {
                log::debug!("{:?} offline, dropping publish on {:?}", client_id, publish.topic);
                return false;
            }
        };
        let qos = publish.qos;
        match engine.enqueue(publish, qos) {
            Ok(_) => true,
            Err(e) => {
                log::warn!("{:?} offline message not stored, {}", client_id, e);
                false
            }
        }
    }

    pub fn stats(&self) -> serde_json::Value {
        json!({
            "connections": self.connections.to_json(),
            "sessions": self.sessions.len(),
            "offlines": self.offlines.len(),
            "subscriptions": self.router.counter().to_json(),
            "retaineds": self.retain.counter().to_json(),
            "inflights": self.inflights.to_json(),
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::codec::SubscriptionOptions;
    use crate::store::RamStore;

    fn context() -> ServerContext {
        ServerContext::with_store(Settings::default(), Arc::new(RamStore::new()))
    }

    fn online(scx: &ServerContext, client_id: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        scx.sessions.insert(client_id.into(), SessionHandle { conn_id: scx.next_conn_id(), tx });
        rx
    }

    fn subscribe(scx: &ServerContext, client_id: &str, filter: &str, opts: SubscriptionOptions) {
        scx.router.subscribe(filter, Subscriber::new(client_id.into(), &opts)).unwrap();
    }

    fn publish(topic: &str, qos: QoS) -> Publish {
        Publish::new(topic, Bytes::from_static(b"21.5"), qos)
    }

    fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<Publish> {
        match rx.try_recv() {
            Ok(Message::Deliver(p)) => Some(p),
            _ => None,
        }
    }

    #[test]
    fn test_fan_out_qos_and_dedupe() {
        let scx = context();
        let mut a = online(&scx, "a");
        subscribe(&scx, "a", "sensors/+/temp", SubscriptionOptions::new(QoS::AtMostOnce));
        subscribe(&scx, "a", "sensors/#", SubscriptionOptions::new(QoS::AtLeastOnce));

        assert_eq!(scx.publish(Some("b"), publish("sensors/room1/temp", QoS::ExactlyOnce)).unwrap(), 1);
        let p = recv(&mut a).unwrap();
        assert_eq!(p.qos, QoS::AtLeastOnce);
        assert_eq!(p.packet_id, None);
        assert!(recv(&mut a).is_none());
    }

    #[test]
    fn test_no_local_and_retain_as_published() {
        let scx = context();
        let mut a = online(&scx, "a");
        let mut opts = SubscriptionOptions::new(QoS::AtMostOnce);
        opts.no_local = true;
        subscribe(&scx, "a", "t", opts);
        assert_eq!(scx.publish(Some("a"), publish("t", QoS::AtMostOnce)).unwrap(), 0);

        let mut b = online(&scx, "b");
        let mut opts = SubscriptionOptions::new(QoS::AtMostOnce);
        opts.retain_as_published = true;
        subscribe(&scx, "b", "t", opts);
        let mut p = publish("t", QoS::AtMostOnce);
        p.retain = true;
        scx.publish(Some("a"), p).unwrap();
        assert!(recv(&mut b).unwrap().retain);
        assert!(recv(&mut a).is_none());
        assert_eq!(scx.retain.get("t").unwrap().len(), 1);
    }

    #[test]
    fn test_subscription_identifiers() {
        let scx = context();
        let mut a = online(&scx, "a");
        let opts = SubscriptionOptions::new(QoS::AtMostOnce);
        scx.router.subscribe("x/+", Subscriber::new("a".into(), &opts).with_subscription_id(Some(7))).unwrap();
        scx.router.subscribe("x/#", Subscriber::new("a".into(), &opts).with_subscription_id(Some(9))).unwrap();
        scx.publish(None, publish("x/y", QoS::AtMostOnce)).unwrap();
        let mut ids: Vec<u32> = recv(&mut a).unwrap().properties.subscription_identifiers().collect();
        ids.sort();
        assert_eq!(ids, [7, 9]);
    }

    #[test]
    fn test_offline_storage() {
        let scx = context();
        subscribe(&scx, "a", "t", SubscriptionOptions::new(QoS::AtLeastOnce));
        // no engine, not a persistent session
        assert_eq!(scx.publish(None, publish("t", QoS::AtLeastOnce)).unwrap(), 0);

        let engine = scx.engine(&"a".into(), ProtocolVersion::V311).unwrap();
        scx.set_offline("a".into(), 1);
        assert_eq!(scx.publish(None, publish("t", QoS::AtMostOnce)).unwrap(), 0);
        assert_eq!(scx.publish(None, publish("t", QoS::AtLeastOnce)).unwrap(), 1);
        assert_eq!(engine.inflight_len(), 1);
        assert_eq!(scx.inflights.count(), 1);

        // a newer connection owns the session now
        assert!(!scx.clean_session("a", Some(2)).unwrap());
        assert!(scx.clean_session("a", Some(1)).unwrap());
        assert_eq!(scx.inflights.count(), 0);
        assert!(scx.get_engine("a").is_none());
        assert_eq!(scx.router.counter().count(), 0);
    }

    #[tokio::test]
    async fn test_retain_sweeper() {
        let scx = context();
        let mut p = publish("r/1", QoS::AtMostOnce);
        p.retain = true;
        p.properties.push(Property::MessageExpiryInterval(1));
        scx.publish(None, p).unwrap();
        assert_eq!(scx.retain.counter().count(), 1);

        assert!(scx.start_retain_sweeper(Duration::from_millis(50)));
        assert!(!scx.start_retain_sweeper(Duration::from_millis(50)));
        // gone without any lookup on the topic
        tokio::time::timeout(Duration::from_secs(3), async {
            while scx.retain.counter().count() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_invalid_topic() {
        let scx = context();
        assert!(scx.publish(None, publish("a/+", QoS::AtMostOnce)).is_err());
        assert_eq!(scx.stats()["subscriptions"]["count"], 0);
    }
}
