//! Per-client QoS 1/2 bookkeeping.
//!
//! A [`DeliveryEngine`] owns the packet-id allocator of one client and
//! drives its pending records through a [`Store`]. One mutex guards both,
//! the allocator and the store never disagree about which ids are taken.
//! [`Resender`] periodically pushes due records back to the session.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use mqttd_utils::{timestamp_millis, Counter};

use crate::codec::{Packet, ProtocolVersion, Publish, QoS};
use crate::inflight::{Direction, PacketIdAllocator, PendingRecord};
use crate::settings::Mqtt;
use crate::store::{RecordKey, Store};
use crate::types::{ClientId, Message, PacketId, TimestampMillis, Tx};
use crate::Result;

struct State {
    ids: PacketIdAllocator,
    protocol: ProtocolVersion,
}

pub struct DeliveryEngine {
    client_id: ClientId,
    store: Arc<dyn Store>,
    state: Mutex<State>,
    retry_interval: Duration,
    retry_max: u64,
    message_expiry: Option<Duration>,
    max_inflight: u16,
    inflights: Arc<Counter>,
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeliveryEngine {{ client_id: {:?}, inflight: {} }}", self.client_id, self.inflight_len())
    }
}

impl DeliveryEngine {
    /// Restores the allocator from the records `store` already holds for
    /// `client_id`.
    pub fn new(
        client_id: ClientId,
        protocol: ProtocolVersion,
        store: Arc<dyn Store>,
        cfg: &Mqtt,
        inflights: Arc<Counter>,
    ) -> Result<Self> {
        let mut ids = PacketIdAllocator::new();
        let records = store.scan(&client_id, Direction::Outbound)?;
        for r in &records {
            ids.mark(r.packet_id);
        }
        if let Some(cursor) = store.load_next_id(&client_id)? {
            ids.set_cursor(cursor);
        }
        if !records.is_empty() {
            log::debug!("{:?} restored {} pending records, cursor: {}", client_id, records.len(), ids.cursor());
            inflights.incs(records.len() as isize);
        }
        Ok(Self {
            client_id,
            store,
            state: Mutex::new(State { ids, protocol }),
            retry_interval: cfg.retry_interval,
            retry_max: cfg.retry_max,
            message_expiry: cfg.message_expiry,
            max_inflight: cfg.max_inflight,
            inflights,
        })
    }

    #[inline]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    #[inline]
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Protocol revision used to encode records stored from now on.
    #[inline]
    pub fn set_protocol(&self, protocol: ProtocolVersion) {
        self.state.lock().protocol = protocol;
    }

    #[inline]
    pub fn inflight_len(&self) -> usize {
        self.state.lock().ids.len()
    }

    #[inline]
    pub fn has_credit(&self) -> bool {
        self.inflight_len() < self.max_inflight as usize
    }

    fn expiry_nanos(&self, publish: &Publish, now: TimestampMillis) -> i64 {
        publish
            .properties
            .message_expiry_interval()
            .map(|secs| Duration::from_secs(secs as u64))
            .or(self.message_expiry)
            .filter(|d| !d.is_zero())
            .map(|d| now.saturating_mul(1_000_000).saturating_add(d.as_nanos() as i64))
            .unwrap_or(0)
    }

    /// Binds `publish` to this client at `qos`.
    ///
    /// QoS 0 returns an untracked copy without packet id. QoS 1/2 allocate an
    /// id and store a Ready record; the returned publish carries the id.
    pub fn publish(&self, publish: Publish, qos: QoS) -> Result<Publish> {
        self.track(publish, qos, true)
    }

    /// Stores `publish` for a client that is offline. The record goes out
    /// without the dup flag on the next redelivery.
    pub fn enqueue(&self, publish: Publish, qos: QoS) -> Result<Publish> {
        self.track(publish, qos, false)
    }

    fn track(&self, mut publish: Publish, qos: QoS, sent: bool) -> Result<Publish> {
        publish.qos = qos;
        publish.dup = false;
        publish.packet_id = None;
        if qos == QoS::AtMostOnce {
            return Ok(publish);
        }

        let mut state = self.state.lock();
        let packet_id = state.ids.allocate()?;
        publish.packet_id = Some(packet_id);
        let now = timestamp_millis();
        let expiry_at = self.expiry_nanos(&publish, now);
        let mut record =
            PendingRecord::outbound(self.client_id.clone(), publish.clone(), state.protocol, now, expiry_at)?;
        if !sent {
            record.last_sent_at = 0;
        }
        if let Err(e) = self.store.publish(&record) {
            state.ids.release(packet_id);
            return Err(e);
        }
        self.store.save_next_id(&self.client_id, state.ids.cursor())?;
        self.inflights.inc();
        Ok(publish)
    }

    fn finish(&self, state: &mut State, packet_id: PacketId) {
        if state.ids.release(packet_id) {
            self.inflights.dec();
        }
    }

    /// PUBACK from the peer.
    pub fn ack(&self, packet_id: PacketId) -> Result<Option<PendingRecord>> {
        let mut state = self.state.lock();
        let record = self.store.ack(&self.client_id, packet_id)?;
        match &record {
            Some(_) => self.finish(&mut state, packet_id),
            None => log::debug!("{:?} PUBACK for unknown packet id {}", self.client_id, packet_id),
        }
        Ok(record)
    }

    /// PUBREC from the peer; returns the PUBREL to send, `None` when the id is
    /// unknown.
    pub fn receive(&self, packet_id: PacketId) -> Result<Option<Packet>> {
        let _state = self.state.lock();
        let record = self.store.receive(&self.client_id, packet_id)?;
        if record.is_none() {
            log::debug!("{:?} PUBREC for unknown packet id {}", self.client_id, packet_id);
        }
        Ok(record.map(|r| r.content))
    }

    /// PUBCOMP from the peer.
    pub fn complete(&self, packet_id: PacketId) -> Result<Option<PendingRecord>> {
        let mut state = self.state.lock();
        let record = self.store.complete(&self.client_id, packet_id)?;
        match &record {
            Some(_) => self.finish(&mut state, packet_id),
            None => log::debug!("{:?} PUBCOMP for unknown packet id {}", self.client_id, packet_id),
        }
        Ok(record)
    }

    /// Tracks a QoS 2 publish received from the peer until its PUBREL.
    /// Returns false for a duplicate, which must not be routed again.
    pub fn save_inbound(&self, publish: &Publish) -> Result<bool> {
        let state = self.state.lock();
        let now = timestamp_millis();
        let expiry_at = self.expiry_nanos(publish, now);
        let record = PendingRecord::inbound(self.client_id.clone(), publish.clone(), state.protocol, now, expiry_at)?;
        self.store.save_inbound(&record)
    }

    /// PUBREL from the peer, returns whether the inbound record was known.
    /// PUBCOMP is answered either way.
    pub fn release(&self, packet_id: PacketId) -> Result<bool> {
        let _state = self.state.lock();
        self.store.release(&self.client_id, packet_id)
    }

    /// Packets for every record not sent within the last resend interval.
    pub fn resend(&self, now: TimestampMillis) -> Result<Vec<Packet>> {
        self.retry(now, false)
    }

    /// Packets for every outbound record, used when a session resumes.
    pub fn redeliver_all(&self) -> Result<Vec<Packet>> {
        self.retry(timestamp_millis(), true)
    }

    fn retry(&self, now: TimestampMillis, all: bool) -> Result<Vec<Packet>> {
        let mut state = self.state.lock();
        let mut records = self.store.scan(&self.client_id, Direction::Outbound)?;
        records.sort_by_key(|r| (r.received_at, r.packet_id));

        let interval = self.retry_interval.as_millis() as i64;
        let mut packets = Vec::new();
        for mut record in records {
            if record.is_expired(now) {
                log::debug!("{:?} pending record {} expired", self.client_id, record.packet_id);
                self.drop_record(&mut state, &record)?;
                continue;
            }
            if !all && now - record.last_sent_at < interval {
                continue;
            }
            if self.retry_max > 0 && record.attempts >= self.retry_max {
                log::warn!(
                    "{:?} giving up on packet id {} after {} attempts",
                    self.client_id,
                    record.packet_id,
                    record.attempts
                );
                self.drop_record(&mut state, &record)?;
                continue;
            }
            let packet = record.resend_packet();
            record.attempts += 1;
            record.last_sent_at = now;
            self.store.put(&record)?;
            packets.push(packet);
        }

        // inbound QoS 2 records whose PUBREL never came
        for record in self.store.scan(&self.client_id, Direction::Inbound)? {
            if record.is_expired(now) {
                log::debug!("{:?} inbound record {} expired before PUBREL", self.client_id, record.packet_id);
                self.store.remove(&RecordKey::of(&record))?;
            }
        }
        Ok(packets)
    }

    /// Drops an outbound record the peer can never accept, whatever its
    /// state. Returns whether it existed.
    pub fn discard(&self, packet_id: PacketId) -> Result<bool> {
        let mut state = self.state.lock();
        let removed = self.store.remove(&RecordKey::outbound(&self.client_id, packet_id))?;
        if removed.is_some() {
            self.finish(&mut state, packet_id);
        }
        Ok(removed.is_some())
    }

    fn drop_record(&self, state: &mut State, record: &PendingRecord) -> Result<()> {
        self.store.remove(&RecordKey::of(record))?;
        self.finish(state, record.packet_id);
        Ok(())
    }

    /// Drops every record of the client, both directions.
    pub fn clear(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let removed = self.store.remove_client(&self.client_id)?;
        self.inflights.decs(state.ids.len() as isize);
        state.ids.clear();
        state.ids.set_cursor(0);
        Ok(removed)
    }
}

/// Periodic resend task of one connected session, stopped on drop.
pub struct Resender {
    token: CancellationToken,
}

impl Resender {
    pub fn spawn(engine: Arc<DeliveryEngine>, tx: Tx) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let interval = engine.retry_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let before = engine.inflight_len();
                        let packets = match engine.resend(timestamp_millis()) {
                            Ok(packets) => packets,
                            Err(e) => {
                                log::warn!("{:?} resend failed, {}", engine.client_id(), e);
                                continue;
                            }
                        };
                        // dropped records free credit for queued publishes as well
                        if packets.is_empty() && engine.inflight_len() >= before {
                            continue;
                        }
                        if tx.send(Message::Resend(packets)).is_err() {
                            log::debug!("{:?} session queue closed, resender exits", engine.client_id());
                            return;
                        }
                    }
                }
            }
            log::debug!("{:?} resender cancelled", engine.client_id());
        });
        Self { token }
    }

    #[inline]
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for Resender {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::codec::{Property, PublishAck};
    use crate::inflight::RecordState;
    use crate::store::{RamStore, SledStore};

    fn pid(v: u16) -> PacketId {
        NonZeroU16::new(v).unwrap()
    }

    fn cfg() -> Mqtt {
        Mqtt { message_expiry: None, ..Mqtt::default() }
    }

    fn engine_with(store: Arc<dyn Store>, cfg: &Mqtt) -> DeliveryEngine {
        DeliveryEngine::new("c1".into(), ProtocolVersion::V5, store, cfg, Arc::new(Counter::new())).unwrap()
    }

    fn engine() -> DeliveryEngine {
        engine_with(Arc::new(RamStore::new()), &cfg())
    }

    fn publish() -> Publish {
        Publish::new("sensors/room1/temp", Bytes::from_static(b"21.5"), QoS::ExactlyOnce)
    }

    #[test]
    fn test_qos0_untracked() {
        let e = engine();
        let p = e.publish(publish(), QoS::AtMostOnce).unwrap();
        assert_eq!(p.packet_id, None);
        assert_eq!(p.qos, QoS::AtMostOnce);
        assert_eq!(e.inflight_len(), 0);
    }

    #[test]
    fn test_qos1_new_id_after_ack() {
        let e = engine();
        let first = e.publish(publish(), QoS::AtLeastOnce).unwrap();
        assert_eq!(first.packet_id, Some(pid(1)));
        assert!(e.ack(pid(1)).unwrap().is_some());
        assert_eq!(e.inflight_len(), 0);
        assert!(e.ack(pid(1)).unwrap().is_none());

        let second = e.publish(publish(), QoS::AtLeastOnce).unwrap();
        assert_eq!(second.packet_id, Some(pid(2)));
    }

    #[test]
    fn test_qos2_handshake() {
        let e = engine();
        let p = e.publish(publish(), QoS::ExactlyOnce).unwrap();
        let id = p.packet_id.unwrap();

        let rel = e.receive(id).unwrap().unwrap();
        assert_eq!(rel, Packet::PublishRelease(PublishAck::new(id)));
        // duplicate PUBREC re-emits the PUBREL without changing anything
        assert_eq!(e.receive(id).unwrap(), Some(rel));
        assert_eq!(e.inflight_len(), 1);

        assert!(e.complete(id).unwrap().is_some());
        assert_eq!(e.inflight_len(), 0);
        assert!(e.receive(id).unwrap().is_none());
        assert!(e.complete(id).unwrap().is_none());
        assert!(e.store.scan("c1", Direction::Outbound).unwrap().is_empty());
    }

    #[test]
    fn test_inbound_duplicates() {
        let e = engine();
        let mut p = publish();
        p.packet_id = Some(pid(9));
        assert!(e.save_inbound(&p).unwrap());
        assert!(!e.save_inbound(&p).unwrap());
        assert!(e.release(pid(9)).unwrap());
        assert!(!e.release(pid(9)).unwrap());
        assert!(e.save_inbound(&p).unwrap());
    }

    #[test]
    fn test_resend() {
        let e = engine();
        let p = e.publish(publish(), QoS::AtLeastOnce).unwrap();
        let id = p.packet_id.unwrap();
        let now = timestamp_millis();

        assert!(e.resend(now).unwrap().is_empty());

        let later = now + 5_000;
        let packets = e.resend(later).unwrap();
        assert_eq!(packets.len(), 1);
        match &packets[0] {
            Packet::Publish(p) => {
                assert!(p.dup);
                assert_eq!(p.packet_id, Some(id));
            }
            other => panic!("unexpected {:?}", other),
        }
        // sent again just now
        assert!(e.resend(later + 1).unwrap().is_empty());
        let rec = e.store.get(&RecordKey::outbound("c1", id)).unwrap().unwrap();
        assert_eq!(rec.attempts, 1);

        e.ack(id).unwrap();
        assert!(e.resend(later + 60_000).unwrap().is_empty());
    }

    #[test]
    fn test_resend_qos2_before_pubrec() {
        let e = engine();
        let id = e.publish(publish(), QoS::ExactlyOnce).unwrap().packet_id.unwrap();
        let packets = e.resend(timestamp_millis() + 10_000).unwrap();
        match &packets[..] {
            [Packet::Publish(p)] => {
                assert!(p.dup);
                assert_eq!(p.qos, QoS::ExactlyOnce);
                assert_eq!(p.packet_id, Some(id));
            }
            other => panic!("unexpected {:?}", other),
        }
        let rec = e.store.get(&RecordKey::outbound("c1", id)).unwrap().unwrap();
        assert_eq!(rec.state(), RecordState::Ready);
        assert_eq!(rec.attempts, 1);
    }

    #[test]
    fn test_inbound_expires_without_pubrel() {
        let cfg = Mqtt { message_expiry: Some(Duration::from_secs(60)), ..cfg() };
        let e = engine_with(Arc::new(RamStore::new()), &cfg);
        let mut p = publish();
        p.packet_id = Some(pid(4));
        assert!(e.save_inbound(&p).unwrap());

        let now = timestamp_millis();
        assert!(e.resend(now + 10_000).unwrap().is_empty());
        assert!(e.store.get(&RecordKey::inbound("c1", pid(4))).unwrap().is_some());

        assert!(e.resend(now + 61_000).unwrap().is_empty());
        assert!(e.store.get(&RecordKey::inbound("c1", pid(4))).unwrap().is_none());
        // the id is free for a new message from the peer
        assert!(!e.release(pid(4)).unwrap());
        assert!(e.save_inbound(&p).unwrap());
    }

    #[test]
    fn test_inbound_without_expiry_kept_until_clear() {
        let e = engine();
        let mut p = publish();
        p.packet_id = Some(pid(5));
        assert!(e.save_inbound(&p).unwrap());
        assert!(e.resend(timestamp_millis() + 24 * 3_600_000).unwrap().is_empty());
        assert!(!e.save_inbound(&p).unwrap());
        assert_eq!(e.clear().unwrap(), 1);
        assert!(e.save_inbound(&p).unwrap());
    }

    #[test]
    fn test_discard() {
        let e = engine();
        let id = e.publish(publish(), QoS::ExactlyOnce).unwrap().packet_id.unwrap();
        e.receive(id).unwrap();
        assert!(e.discard(id).unwrap());
        assert_eq!(e.inflight_len(), 0);
        assert_eq!(e.inflights.count(), 0);
        assert!(!e.discard(id).unwrap());
    }

    #[test]
    fn test_resend_pubrel_after_pubrec() {
        let e = engine();
        let id = e.publish(publish(), QoS::ExactlyOnce).unwrap().packet_id.unwrap();
        e.receive(id).unwrap();
        let packets = e.resend(timestamp_millis() + 10_000).unwrap();
        assert_eq!(packets, [Packet::PublishRelease(PublishAck::new(id))]);
        let rec = e.store.get(&RecordKey::outbound("c1", id)).unwrap().unwrap();
        assert_eq!(rec.state(), RecordState::Received);
    }

    #[test]
    fn test_retry_max_and_expiry() {
        let e = engine_with(Arc::new(RamStore::new()), &Mqtt { retry_max: 2, ..cfg() });
        let id = e.publish(publish(), QoS::AtLeastOnce).unwrap().packet_id.unwrap();
        let now = timestamp_millis();
        assert_eq!(e.resend(now + 10_000).unwrap().len(), 1);
        assert_eq!(e.resend(now + 20_000).unwrap().len(), 1);
        assert!(e.resend(now + 30_000).unwrap().is_empty());
        assert_eq!(e.inflight_len(), 0);
        assert!(e.ack(id).unwrap().is_none());

        let mut p = publish();
        p.properties.push(Property::MessageExpiryInterval(1));
        e.publish(p, QoS::AtLeastOnce).unwrap();
        assert!(e.resend(now + 10_000).unwrap().is_empty());
        assert_eq!(e.inflight_len(), 0);
    }

    #[test]
    fn test_redeliver_all_and_restore() {
        let store: Arc<dyn Store> = Arc::new(SledStore::new(::sled::Config::new().temporary(true).open().unwrap()));
        let e = engine_with(store.clone(), &cfg());
        let a = e.publish(publish(), QoS::AtLeastOnce).unwrap().packet_id.unwrap();
        let b = e.publish(publish(), QoS::ExactlyOnce).unwrap().packet_id.unwrap();
        e.receive(b).unwrap();
        drop(e);

        let e = engine_with(store, &cfg());
        assert_eq!(e.inflight_len(), 2);
        let packets = e.redeliver_all().unwrap();
        assert!(matches!(&packets[0], Packet::Publish(p) if p.dup && p.packet_id == Some(a)));
        assert_eq!(packets[1], Packet::PublishRelease(PublishAck::new(b)));

        // ids in use survive the restart
        assert_eq!(e.publish(publish(), QoS::AtLeastOnce).unwrap().packet_id, Some(pid(3)));
        assert_eq!(e.clear().unwrap(), 3);
        assert_eq!(e.inflight_len(), 0);
        assert_eq!(e.publish(publish(), QoS::AtLeastOnce).unwrap().packet_id, Some(pid(1)));
    }

    #[test]
    fn test_enqueue_offline() {
        let e = engine();
        let id = e.enqueue(publish(), QoS::ExactlyOnce).unwrap().packet_id.unwrap();
        // first transmission, no dup flag
        let packets = e.redeliver_all().unwrap();
        assert!(matches!(&packets[0], Packet::Publish(p) if !p.dup && p.packet_id == Some(id)));
        let packets = e.redeliver_all().unwrap();
        assert!(matches!(&packets[0], Packet::Publish(p) if p.dup));
    }

    #[test]
    fn test_credit() {
        let e = engine_with(Arc::new(RamStore::new()), &Mqtt { max_inflight: 1, ..cfg() });
        assert!(e.has_credit());
        e.publish(publish(), QoS::AtLeastOnce).unwrap();
        assert!(!e.has_credit());
        e.ack(pid(1)).unwrap();
        assert!(e.has_credit());
    }

    #[tokio::test]
    async fn test_resender() {
        let cfg = Mqtt { retry_interval: Duration::from_millis(50), ..cfg() };
        let e = Arc::new(engine_with(Arc::new(RamStore::new()), &cfg));
        let id = e.publish(publish(), QoS::AtLeastOnce).unwrap().packet_id.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let resender = Resender::spawn(e.clone(), tx);

        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        match msg {
            Message::Resend(packets) => match &packets[..] {
                [Packet::Publish(p)] => {
                    assert!(p.dup);
                    assert_eq!(p.packet_id, Some(id));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }

        e.ack(id).unwrap();
        drop(resender);
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(msg) = rx.try_recv() {
            // at most resends queued before the ack
            assert!(matches!(msg, Message::Resend(_)));
        }
        assert!(rx.recv().await.is_none());
    }
}
