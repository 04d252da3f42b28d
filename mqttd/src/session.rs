//! One client connection, from CONNECT to teardown.
//!
//! [`serve`] reads packets off any `AsyncRead + AsyncWrite` stream, routes
//! publishes through the [`ServerContext`] and runs the QoS handshakes
//! against the client's [`DeliveryEngine`]. Messages for the client arrive
//! on an unbounded queue, which keeps per-subscriber order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::Framed;

use crate::codec::{
    Codec, Connect, ConnectAck, DecodeError, Disconnect, LastWill, Packet, Property, PropertyId, ProtocolVersion,
    Publish, PublishAck, QoS, ReasonCode, RetainHandling, Subscribe, SubscribeAck, Unsubscribe, UnsubscribeAck,
};
use crate::context::ServerContext;
use crate::delivery::{DeliveryEngine, Resender};
use crate::topic::{parse_shared, validate_topic_name};
use crate::types::{ClientId, ConnectionId, Message, Rx, SessionHandle, Subscriber, Tx};
use crate::{MqttError, Result, ToReasonCode};

const KICK_TIMEOUT: Duration = Duration::from_secs(5);
const RETAIN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Serves one client until the stream closes.
pub async fn serve<Io>(scx: ServerContext, io: Io) -> Result<()>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    if scx.settings.mqtt.retain_enable {
        scx.start_retain_sweeper(RETAIN_SWEEP_INTERVAL);
    }
    let max_packet_size = scx.settings.mqtt.max_packet_size.as_u32();
    let mut framed = Framed::new(io, Codec::new(max_packet_size));
    let handshake_timeout = scx.settings.mqtt.handshake_timeout;

    let connect = match timeout(handshake_timeout, framed.next()).await {
        Err(_) => return Err(MqttError::Timeout(handshake_timeout)),
        Ok(None) => return Ok(()),
        Ok(Some(Ok(Packet::Connect(connect)))) => *connect,
        Ok(Some(Ok(p))) => {
            return Err(MqttError::ProtocolViolation(format!("expected CONNECT, got {:?}", p.packet_type())))
        }
        Ok(Some(Err(e @ (DecodeError::UnsupportedProtocolLevel | DecodeError::InvalidClientId)))) => {
            let reason_code = match e {
                DecodeError::InvalidClientId => ReasonCode::V3_IDENTIFIER_REJECTED,
                _ => ReasonCode::V3_UNACCEPTABLE_PROTOCOL_VERSION,
            };
            framed.codec_mut().set_version(ProtocolVersion::V311);
            let _ = framed.send(Packet::ConnectAck(ConnectAck { reason_code, ..Default::default() })).await;
            return Err(e.into());
        }
        Ok(Some(Err(e))) => return Err(e.into()),
    };

    Session::handshake(scx, framed, connect).await?.serve().await
}

enum Exit {
    /// DISCONNECT received.
    Disconnect,
    /// The peer closed the stream.
    Closed,
    Kicked(ReasonCode, Option<oneshot::Sender<()>>),
}

struct Session<Io> {
    scx: ServerContext,
    framed: Framed<Io, Codec>,
    id: ClientId,
    conn_id: ConnectionId,
    protocol: ProtocolVersion,
    keep_alive: Option<Duration>,
    session_expiry: Duration,
    last_will: Option<LastWill>,
    engine: Arc<DeliveryEngine>,
    tx: Tx,
    rx: Rx,
    /// Publishes waiting for an inflight slot.
    pending: VecDeque<Publish>,
    inflight_limit: usize,
}

impl<Io> Session<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Registers the client and answers CONNECT.
    async fn handshake(scx: ServerContext, mut framed: Framed<Io, Codec>, connect: Connect) -> Result<Self> {
        let protocol = connect.protocol;
        framed.codec_mut().set_version(protocol);
        let mqtt = &scx.settings.mqtt;
        let mut ack_props = crate::codec::Properties::new();

        // the codec only lets an empty id through with clean start
        let (id, assigned) = if connect.client_id.is_empty() {
            (ClientId::from(uuid::Uuid::new_v4().simple().to_string()), true)
        } else {
            (connect.client_id.clone(), false)
        };
        if assigned && protocol.is_v5() {
            ack_props.push(Property::AssignedClientIdentifier(id.clone()));
        }

        let keep_alive = if connect.keep_alive > mqtt.max_keepalive {
            if protocol.is_v5() {
                ack_props.push(Property::ServerKeepAlive(mqtt.max_keepalive));
            }
            mqtt.max_keepalive
        } else {
            connect.keep_alive
        };

        let session_expiry = if protocol.is_v5() {
            let requested = Duration::from_secs(connect.session_expiry_interval().unwrap_or(0) as u64);
            if requested > mqtt.session_expiry {
                ack_props.push(Property::SessionExpiryInterval(mqtt.session_expiry.as_secs() as u32));
                mqtt.session_expiry
            } else {
                requested
            }
        } else if connect.clean_start {
            Duration::ZERO
        } else {
            mqtt.session_expiry
        };

        if let Some(size) = connect.properties.maximum_packet_size() {
            framed.codec_mut().set_max_outbound_size(size);
        }
        let inflight_limit =
            connect.properties.receive_maximum().unwrap_or(u16::MAX).min(mqtt.max_inflight).max(1) as usize;

        let conn_id = scx.next_conn_id();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(old) = scx.sessions.insert(id.clone(), SessionHandle { conn_id, tx: tx.clone() }) {
            let (done_tx, done_rx) = oneshot::channel();
            if old.send(Message::Kick(ReasonCode::SESSION_TAKEN_OVER, Some(done_tx))) {
                log::info!("{:?} session taken over by connection {}", id, conn_id);
                if timeout(KICK_TIMEOUT, done_rx).await.is_err() {
                    log::warn!("{:?} previous session did not stop within {:?}", id, KICK_TIMEOUT);
                }
            }
        }

        let session_present = if connect.clean_start {
            scx.clean_session(&id, None)?;
            false
        } else {
            let had_engine = scx.get_engine(&id).is_some();
            scx.set_online(&id);
            had_engine || !scx.router.subscriptions(&id).is_empty()
        };
        let engine = scx.engine(&id, protocol)?;
        let session_present = session_present || (!connect.clean_start && engine.inflight_len() > 0);

        if protocol.is_v5() {
            if mqtt.max_inflight < u16::MAX {
                ack_props.push(Property::ReceiveMaximum(mqtt.max_inflight));
            }
            if mqtt.max_packet_size.as_u32() > 0 {
                ack_props.push(Property::MaximumPacketSize(mqtt.max_packet_size.as_u32()));
            }
            if !mqtt.retain_enable {
                ack_props.push(Property::RetainAvailable(0));
            }
            if !mqtt.shared_subscription {
                ack_props.push(Property::SharedSubscriptionAvailable(0));
            }
        }
        let ack = ConnectAck { session_present, reason_code: ReasonCode::SUCCESS, properties: ack_props };
        framed.send(Packet::ConnectAck(ack)).await?;
        scx.connections.inc();
        log::debug!(
            "{:?} connected, protocol: {}, keep alive: {}, session present: {}, session expiry: {:?}",
            id,
            protocol,
            keep_alive,
            session_present,
            session_expiry
        );

        let mut session = Session {
            keep_alive: mqtt.keepalive_timeout(keep_alive),
            scx: scx.clone(),
            framed,
            id,
            conn_id,
            protocol,
            session_expiry,
            last_will: connect.last_will,
            engine,
            tx,
            rx,
            pending: VecDeque::new(),
            inflight_limit,
        };
        if session_present {
            let packets = session.engine.redeliver_all()?;
            session.send_prepared(packets).await?;
        }
        Ok(session)
    }

    async fn serve(mut self) -> Result<()> {
        let resender = Resender::spawn(self.engine.clone(), self.tx.clone());
        let exit = self.run().await;
        drop(resender);

        let (clean_disconnect, kicked, res) = match exit {
            Ok(Exit::Disconnect) => (true, None, Ok(())),
            Ok(Exit::Closed) => {
                log::debug!("{:?} connection closed by peer", self.id);
                (false, None, Ok(()))
            }
            Ok(Exit::Kicked(reason, done)) => {
                self.send_disconnect(reason).await;
                (false, Some(done), Ok(()))
            }
            Err(e) => {
                log::info!("{:?} connection closed, {}", self.id, e);
                self.send_disconnect(e.to_reason_code()).await;
                (false, None, Err(e))
            }
        };
        self.teardown(clean_disconnect, kicked.is_some()).await;
        if let Some(Some(done)) = kicked {
            let _ = done.send(());
        }
        res
    }

    async fn send_disconnect(&mut self, reason_code: ReasonCode) {
        if self.protocol.is_v5() {
            let _ = self.framed.send(Packet::Disconnect(Disconnect::new(reason_code))).await;
        }
    }

    async fn run(&mut self) -> Result<Exit> {
        let keep_alive = self.keep_alive.unwrap_or(Duration::from_secs(u32::MAX as u64));
        let keep_alive_delay = sleep(keep_alive);
        tokio::pin!(keep_alive_delay);

        loop {
            tokio::select! {
                _ = &mut keep_alive_delay => {
                    return Err(MqttError::Timeout(keep_alive));
                }

                msg = self.rx.recv() => {
                    match msg {
                        Some(Message::Deliver(p)) => self.deliver(p).await?,
                        Some(Message::Resend(packets)) => {
                            self.send_prepared(packets).await?;
                            self.flush_pending().await?;
                        }
                        Some(Message::Kick(reason, done)) => return Ok(Exit::Kicked(reason, done)),
                        None => return Err("session queue closed".into()),
                    }
                }

                pkt = self.framed.next() => {
                    keep_alive_delay.as_mut().reset(Instant::now() + keep_alive);
                    match pkt {
                        Some(pkt) => {
                            if let Some(exit) = self.handle(pkt?).await? {
                                return Ok(exit);
                            }
                        }
                        None => return Ok(Exit::Closed),
                    }
                }
            }
        }
    }

    #[inline]
    fn has_credit(&self) -> bool {
        self.engine.inflight_len() < self.inflight_limit
    }

    /// Sends `publish` now or queues it. Once something is queued every
    /// later publish queues behind it, QoS 0 included.
    async fn deliver(&mut self, publish: Publish) -> Result<()> {
        if !self.pending.is_empty() || (publish.qos != QoS::AtMostOnce && !self.has_credit()) {
            self.pending.push_back(publish);
            return Ok(());
        }
        self.send_publish(publish).await
    }

    async fn send_publish(&mut self, publish: Publish) -> Result<()> {
        if self.framed.codec().publish_exceeds_max_outbound(&publish) {
            log::warn!(
                "{:?} publish to {:?} exceeds the client's maximum packet size, dropped",
                self.id,
                publish.topic
            );
            return Ok(());
        }
        let qos = publish.qos;
        match self.engine.publish(publish, qos) {
            Ok(publish) => self.framed.send(Packet::Publish(publish)).await?,
            Err(e) => log::warn!("{:?} publish dropped, {}", self.id, e),
        }
        Ok(())
    }

    /// Sends queued publishes in order while inflight slots are free.
    async fn flush_pending(&mut self) -> Result<()> {
        while let Some(front) = self.pending.front() {
            if front.qos != QoS::AtMostOnce && !self.has_credit() {
                break;
            }
            if let Some(publish) = self.pending.pop_front() {
                self.send_publish(publish).await?;
            }
        }
        Ok(())
    }

    /// Writes packets prepared by the delivery engine. A publish the client
    /// cannot accept is dropped together with its record.
    async fn send_prepared(&mut self, packets: Vec<Packet>) -> Result<()> {
        for packet in packets {
            if self.framed.codec().exceeds_max_outbound(&packet) {
                if let Packet::Publish(Publish { packet_id: Some(packet_id), .. }) = &packet {
                    self.engine.discard(*packet_id)?;
                    log::warn!(
                        "{:?} stored publish {} exceeds the client's maximum packet size, dropped",
                        self.id,
                        packet_id
                    );
                    continue;
                }
            }
            self.framed.feed(packet).await?;
        }
        SinkExt::<Packet>::flush(&mut self.framed).await?;
        Ok(())
    }

    async fn handle(&mut self, packet: Packet) -> Result<Option<Exit>> {
        log::trace!("{:?} recv {:?}", self.id, packet.packet_type());
        match packet {
            Packet::Publish(publish) => self.process_publish(publish).await?,
            Packet::PublishAck(ack) => {
                self.engine.ack(ack.packet_id)?;
                self.flush_pending().await?;
            }
            Packet::PublishReceived(ack) => {
                if let Some(release) = self.engine.receive(ack.packet_id)? {
                    self.framed.send(release).await?;
                }
            }
            Packet::PublishRelease(ack) => {
                let known = self.engine.release(ack.packet_id)?;
                let mut comp = PublishAck::new(ack.packet_id);
                if !known {
                    comp.reason_code = ReasonCode::PACKET_IDENTIFIER_NOT_FOUND;
                }
                self.framed.send(Packet::PublishComplete(comp)).await?;
            }
            Packet::PublishComplete(ack) => {
                self.engine.complete(ack.packet_id)?;
                self.flush_pending().await?;
            }
            Packet::Subscribe(sub) => self.subscribe(sub).await?,
            Packet::Unsubscribe(unsub) => self.unsubscribe(unsub).await?,
            Packet::PingRequest => self.framed.send(Packet::PingResponse).await?,
            Packet::Disconnect(d) => {
                if d.reason_code != ReasonCode::DISCONNECT_WITH_WILL_MESSAGE {
                    self.last_will = None;
                }
                if let Some(secs) = d.properties.session_expiry_interval() {
                    self.session_expiry = Duration::from_secs(secs as u64).min(self.scx.settings.mqtt.session_expiry);
                }
                log::debug!("{:?} DISCONNECT, reason: {:?}", self.id, d.reason_code);
                return Ok(Some(Exit::Disconnect));
            }
            p => {
                return Err(MqttError::ProtocolViolation(format!("unexpected {:?} packet", p.packet_type())));
            }
        }
        Ok(None)
    }

    async fn process_publish(&mut self, publish: Publish) -> Result<()> {
        validate_topic_name(&publish.topic)?;
        match publish.qos {
            QoS::AtMostOnce => {
                self.route(publish)?;
            }
            QoS::AtLeastOnce => {
                let packet_id = publish.packet_id.ok_or(MqttError::PacketIdRequired)?;
                let delivered = self.route(publish)?;
                let mut ack = PublishAck::new(packet_id);
                if delivered == 0 {
                    ack.reason_code = ReasonCode::NO_MATCHING_SUBSCRIBERS;
                }
                self.framed.send(Packet::PublishAck(ack)).await?;
            }
            QoS::ExactlyOnce => {
                let packet_id = publish.packet_id.ok_or(MqttError::PacketIdRequired)?;
                let mut ack = PublishAck::new(packet_id);
                if self.engine.save_inbound(&publish)? {
                    if self.route(publish)? == 0 {
                        ack.reason_code = ReasonCode::NO_MATCHING_SUBSCRIBERS;
                    }
                } else {
                    log::debug!("{:?} duplicate QoS 2 publish {}, not routed again", self.id, packet_id);
                }
                self.framed.send(Packet::PublishReceived(ack)).await?;
            }
        }
        Ok(())
    }

    #[inline]
    fn route(&self, publish: Publish) -> Result<usize> {
        self.scx.publish(Some(&self.id), publish)
    }

    async fn subscribe(&mut self, sub: Subscribe) -> Result<()> {
        let subscription_id = sub.subscription_identifier();
        let mut reason_codes = Vec::with_capacity(sub.topic_filters.len());
        let mut retains = Vec::new();
        for (filter, opts) in sub.topic_filters.iter() {
            let group = match parse_shared(filter) {
                Ok((group, _)) => group.is_some(),
                Err(e) => {
                    reason_codes.push(MqttError::from(e).to_reason_code());
                    continue;
                }
            };
            if group && !self.scx.settings.mqtt.shared_subscription {
                reason_codes.push(ReasonCode::SHARED_SUBSCRIPTIONS_NOT_SUPPORTED);
                continue;
            }
            let subscriber = Subscriber::new(self.id.clone(), opts).with_subscription_id(subscription_id);
            match self.scx.router.subscribe(filter, subscriber) {
                Ok(prev) => {
                    reason_codes.push(ReasonCode::from(opts.qos));
                    let send_retained = match opts.retain_handling {
                        RetainHandling::AtSubscribe => true,
                        RetainHandling::AtSubscribeNew => prev.is_none(),
                        RetainHandling::NoAtSubscribe => false,
                    };
                    // shared subscriptions never get retained messages
                    if send_retained && !group && self.scx.settings.mqtt.retain_enable {
                        for mut p in self.scx.retain.get(filter)? {
                            p.qos = p.qos.less_value(opts.qos);
                            p.properties.remove(PropertyId::SubscriptionIdentifier);
                            if let Some(id) = subscription_id {
                                p.properties.push(Property::SubscriptionIdentifier(id));
                            }
                            retains.push(p);
                        }
                    }
                }
                Err(e) => {
                    log::debug!("{:?} subscribe {:?} failed, {}", self.id, filter, e);
                    reason_codes.push(e.to_reason_code());
                }
            }
        }

        let ack = SubscribeAck { packet_id: sub.packet_id, reason_codes, properties: Default::default() };
        self.framed.send(Packet::SubscribeAck(ack)).await?;
        for p in retains {
            self.deliver(p).await?;
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, unsub: Unsubscribe) -> Result<()> {
        let reason_codes = unsub
            .topic_filters
            .iter()
            .map(|filter| match self.scx.router.unsubscribe(filter, &self.id) {
                Some(_) => ReasonCode::SUCCESS,
                None => ReasonCode::NO_SUBSCRIPTION_EXISTED,
            })
            .collect();
        let ack = UnsubscribeAck { packet_id: unsub.packet_id, reason_codes, properties: Default::default() };
        self.framed.send(Packet::UnsubscribeAck(ack)).await?;
        Ok(())
    }

    async fn teardown(&mut self, clean_disconnect: bool, kicked: bool) {
        let scx = self.scx.clone();
        let conn_id = self.conn_id;
        scx.sessions.remove_if(&self.id, |_, h| h.conn_id == conn_id);
        scx.connections.dec();

        // whatever is still queued is kept for the next connection
        self.rx.close();
        let mut queued = 0;
        while let Ok(msg) = self.rx.try_recv() {
            if let Message::Deliver(p) = msg {
                if p.qos != QoS::AtMostOnce && !self.session_expiry.is_zero() {
                    let qos = p.qos;
                    if self.engine.enqueue(p, qos).is_ok() {
                        queued += 1;
                    }
                }
            }
        }
        for p in self.pending.drain(..) {
            if !self.session_expiry.is_zero() {
                let qos = p.qos;
                if self.engine.enqueue(p, qos).is_ok() {
                    queued += 1;
                }
            }
        }
        if queued > 0 {
            log::debug!("{:?} {} messages kept for the next connection", self.id, queued);
        }

        // the session now belongs to the connection that took it over
        if kicked {
            return;
        }
        if !clean_disconnect {
            if let Some(will) = self.last_will.take() {
                publish_will(scx.clone(), self.id.clone(), will);
            }
        }

        if self.session_expiry.is_zero() {
            if let Err(e) = scx.clean_session(&self.id, None) {
                log::warn!("{:?} clean session failed, {}", self.id, e);
            }
        } else {
            scx.set_offline(self.id.clone(), conn_id);
            let id = self.id.clone();
            let session_expiry = self.session_expiry;
            tokio::spawn(async move {
                sleep(session_expiry).await;
                match scx.clean_session(&id, Some(conn_id)) {
                    Ok(true) => log::debug!("{:?} session expired after {:?}", id, session_expiry),
                    Ok(false) => {}
                    Err(e) => log::warn!("{:?} session expiry failed, {}", id, e),
                }
            });
        }
    }
}

/// Publishes the last will, after its delay when it has one and the client
/// did not come back in the meantime.
fn publish_will(scx: ServerContext, id: ClientId, will: LastWill) {
    let delay = will
        .properties
        .get(PropertyId::WillDelayInterval)
        .and_then(|p| match p {
            Property::WillDelayInterval(secs) => Some(Duration::from_secs(*secs as u64)),
            _ => None,
        })
        .filter(|d| !d.is_zero());

    let mut publish = Publish::new(will.topic, will.message, will.qos);
    publish.retain = will.retain;
    publish.properties = will.properties;
    publish.properties.remove(PropertyId::WillDelayInterval);

    let send = move |scx: ServerContext, id: ClientId, publish: Publish| match scx.publish(Some(&id), publish) {
        Ok(n) => log::debug!("{:?} last will delivered to {} sessions", id, n),
        Err(e) => log::warn!("{:?} last will not published, {}", id, e),
    };
    match delay {
        Some(delay) => {
            tokio::spawn(async move {
                sleep(delay).await;
                if scx.is_online(&id) {
                    log::debug!("{:?} reconnected within the will delay", id);
                } else {
                    send(scx, id, publish);
                }
            });
        }
        None => send(scx, id, publish),
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use bytes::Bytes;
    use bytestring::ByteString;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::codec::{Properties, SubscriptionOptions};
    use crate::settings::Settings;
    use crate::store::RamStore;

    type Client = Framed<DuplexStream, Codec>;

    fn context() -> ServerContext {
        ServerContext::with_store(Settings::default(), Arc::new(RamStore::new()))
    }

    fn start(scx: &ServerContext, protocol: ProtocolVersion) -> Client {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let scx = scx.clone();
        tokio::spawn(async move {
            let _ = serve(scx, server).await;
        });
        Framed::new(client, Codec::with_version(protocol, 0))
    }

    async fn recv(client: &mut Client) -> Packet {
        timeout(Duration::from_secs(2), client.next()).await.unwrap().unwrap().unwrap()
    }

    async fn connect_with(scx: &ServerContext, connect: Connect) -> (Client, ConnectAck) {
        let mut client = start(scx, connect.protocol);
        client.send(Packet::from(connect)).await.unwrap();
        match recv(&mut client).await {
            Packet::ConnectAck(ack) => (client, ack),
            p => panic!("unexpected {:?}", p),
        }
    }

    async fn connect(scx: &ServerContext, id: &str, protocol: ProtocolVersion, clean_start: bool) -> (Client, ConnectAck) {
        connect_with(scx, Connect { protocol, clean_start, client_id: id.into(), ..Default::default() }).await
    }

    fn connect_v5(id: &str, clean_start: bool, properties: Properties) -> Connect {
        Connect { protocol: ProtocolVersion::V5, clean_start, client_id: id.into(), properties, ..Default::default() }
    }

    /// Receives publishes until `n` arrived, acknowledging QoS 1 ones.
    async fn recv_acked(client: &mut Client, n: usize) -> Vec<Bytes> {
        let mut payloads = Vec::new();
        while payloads.len() < n {
            match recv(client).await {
                Packet::Publish(p) => {
                    if let Some(id) = p.packet_id {
                        client.send(Packet::PublishAck(PublishAck::new(id))).await.unwrap();
                    }
                    payloads.push(p.payload);
                }
                p => panic!("unexpected {:?}", p),
            }
        }
        payloads
    }

    async fn subscribe(client: &mut Client, filter: &str, qos: QoS) {
        let sub = Subscribe {
            packet_id: NonZeroU16::new(1).unwrap(),
            topic_filters: vec![(ByteString::from(filter), SubscriptionOptions::new(qos))],
            properties: Properties::default(),
        };
        client.send(Packet::Subscribe(sub)).await.unwrap();
        match recv(client).await {
            Packet::SubscribeAck(ack) => assert_eq!(ack.reason_codes, [ReasonCode::from(qos)]),
            p => panic!("unexpected {:?}", p),
        }
    }

    fn publish(topic: &str, payload: &'static str, qos: QoS, id: u16) -> Packet {
        let mut p = Publish::new(topic, Bytes::from_static(payload.as_bytes()), qos);
        p.packet_id = NonZeroU16::new(id);
        Packet::Publish(p)
    }

    #[tokio::test]
    async fn test_end_to_end_qos1() {
        let scx = context();
        let (mut a, ack) = connect(&scx, "A", ProtocolVersion::V311, true).await;
        assert!(!ack.session_present);
        subscribe(&mut a, "sensors/+/temp", QoS::AtMostOnce).await;

        let (mut b, _) = connect(&scx, "B", ProtocolVersion::V5, true).await;
        b.send(publish("sensors/room1/temp", "21.5", QoS::AtLeastOnce, 1)).await.unwrap();
        match recv(&mut b).await {
            Packet::PublishAck(ack) => {
                assert_eq!(ack.packet_id.get(), 1);
                assert_eq!(ack.reason_code, ReasonCode::SUCCESS);
            }
            p => panic!("unexpected {:?}", p),
        }
        match recv(&mut a).await {
            Packet::Publish(p) => {
                assert_eq!(p.topic, "sensors/room1/temp");
                assert_eq!(p.payload, Bytes::from_static(b"21.5"));
                assert_eq!(p.qos, QoS::AtMostOnce);
                assert_eq!(p.packet_id, None);
            }
            p => panic!("unexpected {:?}", p),
        }
        assert_eq!(scx.get_engine("B").unwrap().inflight_len(), 0);
        assert_eq!(scx.inflights.count(), 0);
    }

    #[tokio::test]
    async fn test_qos2_both_sides() {
        let scx = context();
        let (mut a, _) = connect(&scx, "A", ProtocolVersion::V5, true).await;
        subscribe(&mut a, "t/#", QoS::ExactlyOnce).await;
        let (mut b, _) = connect(&scx, "B", ProtocolVersion::V5, true).await;

        b.send(publish("t/x", "once", QoS::ExactlyOnce, 7)).await.unwrap();
        assert!(matches!(recv(&mut b).await, Packet::PublishReceived(ack) if ack.packet_id.get() == 7));
        // a duplicate is acknowledged but not routed again
        b.send(publish("t/x", "once", QoS::ExactlyOnce, 7)).await.unwrap();
        assert!(matches!(recv(&mut b).await, Packet::PublishReceived(_)));
        b.send(Packet::PublishRelease(PublishAck::new(NonZeroU16::new(7).unwrap()))).await.unwrap();
        match recv(&mut b).await {
            Packet::PublishComplete(ack) => assert_eq!(ack.reason_code, ReasonCode::SUCCESS),
            p => panic!("unexpected {:?}", p),
        }

        let id = match recv(&mut a).await {
            Packet::Publish(p) => {
                assert_eq!(p.qos, QoS::ExactlyOnce);
                p.packet_id.unwrap()
            }
            p => panic!("unexpected {:?}", p),
        };
        a.send(Packet::PublishReceived(PublishAck::new(id))).await.unwrap();
        assert_eq!(recv(&mut a).await, Packet::PublishRelease(PublishAck::new(id)));
        a.send(Packet::PublishComplete(PublishAck::new(id))).await.unwrap();
        a.send(Packet::PingRequest).await.unwrap();
        // only one copy was delivered
        assert_eq!(recv(&mut a).await, Packet::PingResponse);
        assert_eq!(scx.get_engine("A").unwrap().inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_retained_on_subscribe() {
        let scx = context();
        let (mut b, _) = connect(&scx, "B", ProtocolVersion::V311, true).await;
        let mut p = Publish::new("r/1", Bytes::from_static(b"kept"), QoS::AtMostOnce);
        p.retain = true;
        b.send(Packet::Publish(p)).await.unwrap();
        b.send(Packet::PingRequest).await.unwrap();
        assert_eq!(recv(&mut b).await, Packet::PingResponse);

        let (mut a, _) = connect(&scx, "A", ProtocolVersion::V311, true).await;
        subscribe(&mut a, "r/+", QoS::AtLeastOnce).await;
        match recv(&mut a).await {
            Packet::Publish(p) => {
                assert!(p.retain);
                assert_eq!(p.qos, QoS::AtMostOnce);
                assert_eq!(p.payload, Bytes::from_static(b"kept"));
            }
            p => panic!("unexpected {:?}", p),
        }
    }

    #[tokio::test]
    async fn test_assigned_client_id_and_takeover() {
        let scx = context();
        let (_c, ack) = connect(&scx, "", ProtocolVersion::V5, true).await;
        assert!(matches!(ack.properties.get(PropertyId::AssignedClientIdentifier), Some(_)));

        let (_c, ack) = connect(&scx, "", ProtocolVersion::V311, false).await;
        assert_eq!(ack.reason_code, ReasonCode::V3_IDENTIFIER_REJECTED);

        let (mut first, _) = connect(&scx, "same", ProtocolVersion::V5, true).await;
        let (_second, ack) = connect(&scx, "same", ProtocolVersion::V5, true).await;
        assert_eq!(ack.reason_code, ReasonCode::SUCCESS);
        match recv(&mut first).await {
            Packet::Disconnect(d) => assert_eq!(d.reason_code, ReasonCode::SESSION_TAKEN_OVER),
            p => panic!("unexpected {:?}", p),
        }
        assert_eq!(scx.sessions.len(), 2);
    }

    #[tokio::test]
    async fn test_persistent_session_offline_messages() {
        let scx = context();
        let (mut a, _) = connect(&scx, "A", ProtocolVersion::V311, false).await;
        subscribe(&mut a, "q", QoS::AtLeastOnce).await;
        a.send(Packet::Disconnect(Disconnect::new(ReasonCode::NORMAL_DISCONNECTION))).await.unwrap();
        drop(a);
        while scx.is_online("A") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(scx.publish(None, Publish::new("q", Bytes::from_static(b"later"), QoS::AtLeastOnce)).unwrap(), 1);

        let (mut a, ack) = connect(&scx, "A", ProtocolVersion::V311, false).await;
        assert!(ack.session_present);
        let id = match recv(&mut a).await {
            Packet::Publish(p) => {
                assert!(!p.dup);
                assert_eq!(p.payload, Bytes::from_static(b"later"));
                p.packet_id.unwrap()
            }
            p => panic!("unexpected {:?}", p),
        };
        a.send(Packet::PublishAck(PublishAck::new(id))).await.unwrap();
        a.send(Packet::PingRequest).await.unwrap();
        assert_eq!(recv(&mut a).await, Packet::PingResponse);
        assert_eq!(scx.get_engine("A").unwrap().inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_last_will() {
        let scx = context();
        let (mut a, _) = connect(&scx, "A", ProtocolVersion::V311, true).await;
        subscribe(&mut a, "will/#", QoS::AtMostOnce).await;

        let mut b = start(&scx, ProtocolVersion::V311);
        let will = LastWill {
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "will/b".into(),
            message: Bytes::from_static(b"gone"),
            properties: Properties::default(),
        };
        let connect =
            Connect { client_id: "B".into(), last_will: Some(will), ..Default::default() };
        b.send(Packet::from(connect)).await.unwrap();
        assert!(matches!(recv(&mut b).await, Packet::ConnectAck(_)));
        // abnormal close
        drop(b);

        match recv(&mut a).await {
            Packet::Publish(p) => assert_eq!(p.payload, Bytes::from_static(b"gone")),
            p => panic!("unexpected {:?}", p),
        }
    }

    #[tokio::test]
    async fn test_invalid_topic_closes_v5() {
        let scx = context();
        let (mut b, _) = connect(&scx, "B", ProtocolVersion::V5, true).await;
        b.send(publish("a/+", "x", QoS::AtMostOnce, 0)).await.unwrap();
        match recv(&mut b).await {
            Packet::Disconnect(d) => assert_eq!(d.reason_code, ReasonCode::TOPIC_NAME_INVALID),
            p => panic!("unexpected {:?}", p),
        }
        assert!(timeout(Duration::from_secs(2), b.next()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_qos0_queued_behind_waiting_publishes() {
        let scx = context();
        let props = Properties::default().with(Property::ReceiveMaximum(1));
        let (mut a, _) = connect_with(&scx, connect_v5("A", true, props)).await;
        subscribe(&mut a, "t", QoS::AtLeastOnce).await;

        for (payload, qos) in [("1", QoS::AtLeastOnce), ("2", QoS::AtLeastOnce), ("3", QoS::AtMostOnce)] {
            scx.publish(None, Publish::new("t", Bytes::from_static(payload.as_bytes()), qos)).unwrap();
        }
        let payloads = recv_acked(&mut a, 3).await;
        assert_eq!(payloads, [Bytes::from_static(b"1"), Bytes::from_static(b"2"), Bytes::from_static(b"3")]);
    }

    #[tokio::test]
    async fn test_oversized_publish_dropped() {
        let scx = context();
        let props = Properties::default().with(Property::MaximumPacketSize(32));
        let (mut a, _) = connect_with(&scx, connect_v5("A", true, props)).await;
        subscribe(&mut a, "t", QoS::AtLeastOnce).await;

        scx.publish(None, Publish::new("t", Bytes::from(vec![b'x'; 100]), QoS::AtLeastOnce)).unwrap();
        scx.publish(None, Publish::new("t", Bytes::from_static(b"small"), QoS::AtLeastOnce)).unwrap();
        match recv(&mut a).await {
            Packet::Publish(p) => assert_eq!(p.payload, Bytes::from_static(b"small")),
            p => panic!("unexpected {:?}", p),
        }
        // nothing stored for the dropped one
        assert_eq!(scx.get_engine("A").unwrap().inflight_len(), 1);
        a.send(Packet::PingRequest).await.unwrap();
        assert_eq!(recv(&mut a).await, Packet::PingResponse);
    }

    #[tokio::test]
    async fn test_oversized_stored_publish_dropped_on_resume() {
        let scx = context();
        let expiry = || Properties::default().with(Property::SessionExpiryInterval(60));
        let (mut a, _) = connect_with(&scx, connect_v5("A", false, expiry())).await;
        subscribe(&mut a, "q", QoS::AtLeastOnce).await;
        a.send(Packet::Disconnect(Disconnect::new(ReasonCode::NORMAL_DISCONNECTION))).await.unwrap();
        drop(a);
        while scx.is_online("A") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        scx.publish(None, Publish::new("q", Bytes::from(vec![b'x'; 100]), QoS::AtLeastOnce)).unwrap();
        scx.publish(None, Publish::new("q", Bytes::from_static(b"small"), QoS::AtLeastOnce)).unwrap();
        assert_eq!(scx.get_engine("A").unwrap().inflight_len(), 2);

        let props = expiry().with(Property::MaximumPacketSize(32));
        let (mut a, ack) = connect_with(&scx, connect_v5("A", false, props)).await;
        assert!(ack.session_present);
        assert_eq!(recv_acked(&mut a, 1).await, [Bytes::from_static(b"small")]);
        a.send(Packet::PingRequest).await.unwrap();
        assert_eq!(recv(&mut a).await, Packet::PingResponse);
        assert_eq!(scx.get_engine("A").unwrap().inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_dropped_record_releases_queued_publish() {
        let settings = Settings::from_toml("[mqtt]\nretry_interval = \"50ms\"\nretry_max = 1").unwrap();
        let scx = ServerContext::with_store(settings, Arc::new(RamStore::new()));
        let props = Properties::default().with(Property::ReceiveMaximum(1));
        let (mut a, _) = connect_with(&scx, connect_v5("A", true, props)).await;
        subscribe(&mut a, "t", QoS::AtLeastOnce).await;

        scx.publish(None, Publish::new("t", Bytes::from_static(b"1"), QoS::AtLeastOnce)).unwrap();
        scx.publish(None, Publish::new("t", Bytes::from_static(b"2"), QoS::AtLeastOnce)).unwrap();
        // "1" is never acknowledged, "2" goes out once the resender gives up on it
        loop {
            match recv(&mut a).await {
                Packet::Publish(p) if p.payload == Bytes::from_static(b"2") => break,
                Packet::Publish(p) => assert_eq!(p.payload, Bytes::from_static(b"1")),
                p => panic!("unexpected {:?}", p),
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let settings = Settings::from_toml("[mqtt]\nhandshake_timeout = \"50ms\"").unwrap();
        let scx = ServerContext::with_store(settings, Arc::new(RamStore::new()));
        let (_client, server) = tokio::io::duplex(1024);
        let res = serve(scx, server).await;
        assert!(matches!(res, Err(MqttError::Timeout(_))));
    }
}
