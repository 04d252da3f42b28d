//! Pending-record persistence.
//!
//! A [`Store`] backend only provides keyed primitives; the QoS transitions
//! are provided methods written once against them, so [`RamStore`] and
//! [`SledStore`] behave identically. Callers serialize access per client.

use std::sync::Arc;

use crate::codec::QoS;
use crate::inflight::{Direction, PendingRecord, RecordState};
use crate::settings::{Storage, StorageType};
use crate::types::PacketId;
use crate::Result;

pub use self::ram::RamStore;
pub use self::sled::SledStore;

mod ram;
mod sled;

/// Identifies one pending record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordKey<'a> {
    pub direction: Direction,
    pub client_id: &'a str,
    pub packet_id: PacketId,
}

impl<'a> RecordKey<'a> {
    #[inline]
    pub fn outbound(client_id: &'a str, packet_id: PacketId) -> Self {
        Self { direction: Direction::Outbound, client_id, packet_id }
    }

    #[inline]
    pub fn inbound(client_id: &'a str, packet_id: PacketId) -> Self {
        Self { direction: Direction::Inbound, client_id, packet_id }
    }

    #[inline]
    pub fn of(record: &'a PendingRecord) -> Self {
        Self { direction: record.direction, client_id: &record.client_id, packet_id: record.packet_id }
    }

    /// `record:{client_id}:{packet_id}` or `inbound:{client_id}:{packet_id}`.
    #[inline]
    pub fn to_key(&self) -> String {
        format!("{}{}", prefix(self.direction, self.client_id), self.packet_id)
    }
}

#[inline]
pub fn prefix(direction: Direction, client_id: &str) -> String {
    format!("{}:{}:", direction.prefix(), client_id)
}

/// Key of the allocation cursor, a big-endian `u16`.
#[inline]
pub fn next_id_key(client_id: &str) -> String {
    format!("packetid:{}", client_id)
}

pub trait Store: Send + Sync {
    fn get(&self, key: &RecordKey<'_>) -> Result<Option<PendingRecord>>;

    /// Inserts or overwrites the record under its own key.
    fn put(&self, record: &PendingRecord) -> Result<()>;

    fn remove(&self, key: &RecordKey<'_>) -> Result<Option<PendingRecord>>;

    /// Every record of `client_id` in `direction`, in no particular order.
    fn scan(&self, client_id: &str, direction: Direction) -> Result<Vec<PendingRecord>>;

    fn load_next_id(&self, client_id: &str) -> Result<Option<u16>>;

    fn save_next_id(&self, client_id: &str, cursor: u16) -> Result<()>;

    /// Drops all records and the cursor of `client_id`, returning how many
    /// records were removed.
    fn remove_client(&self, client_id: &str) -> Result<usize>;

    /// Tracks an outbound QoS 1/2 publish in state Ready.
    #[inline]
    fn publish(&self, record: &PendingRecord) -> Result<()> {
        self.put(record)
    }

    /// PUBACK. Removes the QoS 1 record, `None` when unknown.
    fn ack(&self, client_id: &str, packet_id: PacketId) -> Result<Option<PendingRecord>> {
        let key = RecordKey::outbound(client_id, packet_id);
        match self.get(&key)? {
            Some(r) if r.qos == QoS::AtLeastOnce => self.remove(&key),
            _ => Ok(None),
        }
    }

    /// PUBREC. Moves a QoS 2 record from Ready to Received, replacing its
    /// content with PUBREL. A duplicate returns the record unchanged.
    fn receive(&self, client_id: &str, packet_id: PacketId) -> Result<Option<PendingRecord>> {
        let key = RecordKey::outbound(client_id, packet_id);
        let mut record = match self.get(&key)? {
            Some(r) if r.qos == QoS::ExactlyOnce => r,
            _ => return Ok(None),
        };
        if record.state() == RecordState::Ready {
            record.to_release();
            self.put(&record)?;
        }
        Ok(Some(record))
    }

    /// PUBCOMP. Removes a QoS 2 record already in state Received.
    fn complete(&self, client_id: &str, packet_id: PacketId) -> Result<Option<PendingRecord>> {
        let key = RecordKey::outbound(client_id, packet_id);
        match self.get(&key)? {
            Some(r) if r.state() == RecordState::Received => self.remove(&key),
            _ => Ok(None),
        }
    }

    /// Tracks a QoS 2 publish received from the peer. Returns false when the
    /// packet id is already tracked, the publish is then a duplicate.
    fn save_inbound(&self, record: &PendingRecord) -> Result<bool> {
        if self.get(&RecordKey::of(record))?.is_some() {
            return Ok(false);
        }
        self.put(record)?;
        Ok(true)
    }

    /// PUBREL from the peer. The inbound record is released and dropped;
    /// returns whether it was known.
    fn release(&self, client_id: &str, packet_id: PacketId) -> Result<bool> {
        match self.remove(&RecordKey::inbound(client_id, packet_id))? {
            Some(mut record) => {
                record.to_complete();
                log::trace!("{:?} inbound {} {:?}", client_id, packet_id, record.state());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Opens the backend selected by `cfg`.
pub fn init_store(cfg: &Storage) -> Result<Arc<dyn Store>> {
    match cfg.storage_type {
        StorageType::Ram => Ok(Arc::new(RamStore::new())),
        StorageType::Sled => Ok(Arc::new(SledStore::open(&cfg.sled)?)),
    }
}
