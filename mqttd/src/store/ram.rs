use std::collections::BTreeMap;

use super::{RecordKey, Store};
use crate::inflight::{Direction, PendingRecord};
use crate::types::{ClientId, DashMap};
use crate::Result;

type Records = BTreeMap<u16, PendingRecord>;

/// In-process backend, lost on restart.
#[derive(Default)]
pub struct RamStore {
    records: DashMap<(Direction, ClientId), Records>,
    next_ids: DashMap<ClientId, u16>,
}

impl RamStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for RamStore {
    fn get(&self, key: &RecordKey<'_>) -> Result<Option<PendingRecord>> {
        Ok(self
            .records
            .get(&(key.direction, ClientId::from(key.client_id)))
            .and_then(|recs| recs.get(&key.packet_id.get()).cloned()))
    }

    fn put(&self, record: &PendingRecord) -> Result<()> {
        self.records
            .entry((record.direction, record.client_id.clone()))
            .or_default()
            .insert(record.packet_id.get(), record.clone());
        Ok(())
    }

    fn remove(&self, key: &RecordKey<'_>) -> Result<Option<PendingRecord>> {
        let map_key = (key.direction, ClientId::from(key.client_id));
        let mut removed = None;
        self.records.remove_if_mut(&map_key, |_, recs| {
            removed = recs.remove(&key.packet_id.get());
            recs.is_empty()
        });
        Ok(removed)
    }

    fn scan(&self, client_id: &str, direction: Direction) -> Result<Vec<PendingRecord>> {
        Ok(self
            .records
            .get(&(direction, ClientId::from(client_id)))
            .map(|recs| recs.values().cloned().collect())
            .unwrap_or_default())
    }

    fn load_next_id(&self, client_id: &str) -> Result<Option<u16>> {
        Ok(self.next_ids.get(client_id).map(|id| *id))
    }

    fn save_next_id(&self, client_id: &str, cursor: u16) -> Result<()> {
        self.next_ids.insert(ClientId::from(client_id), cursor);
        Ok(())
    }

    fn remove_client(&self, client_id: &str) -> Result<usize> {
        let mut count = 0;
        for direction in [Direction::Outbound, Direction::Inbound] {
            if let Some((_, recs)) = self.records.remove(&(direction, ClientId::from(client_id))) {
                count += recs.len();
            }
        }
        self.next_ids.remove(client_id);
        Ok(count)
    }
}
