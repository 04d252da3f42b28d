use super::{next_id_key, prefix, RecordKey, Store};
use crate::inflight::{Direction, PendingRecord};
use crate::settings::SledConfig;
use crate::{MqttError, Result};

/// Durable backend on a sled database.
#[derive(Clone)]
pub struct SledStore {
    db: ::sled::Db,
}

impl SledStore {
    pub fn open(cfg: &SledConfig) -> Result<Self> {
        let db = cfg.to_sled_config()?.open()?;
        log::info!("sled store opened at {:?}, recovered: {}", cfg.path, db.was_recovered());
        Ok(Self::new(db))
    }

    #[inline]
    pub fn new(db: ::sled::Db) -> Self {
        Self { db }
    }

    #[inline]
    pub fn flush(&self) -> Result<usize> {
        Ok(self.db.flush()?)
    }

    fn scan_prefix(&self, client_id: &str, direction: Direction) -> Result<Vec<(::sled::IVec, PendingRecord)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix(direction, client_id)) {
            let (key, val) = item.map_err(warn("scan"))?;
            match PendingRecord::from_bytes(direction, &val) {
                // "c1:" is a prefix of "c1:3:"
                Ok(record) if record.client_id == client_id => out.push((key, record)),
                Ok(_) => {}
                Err(e) => log::warn!("{:?} skipping record {:?}, {}", client_id, String::from_utf8_lossy(&key), e),
            }
        }
        Ok(out)
    }
}

fn warn(op: &'static str) -> impl Fn(::sled::Error) -> MqttError {
    move |e| {
        log::warn!("SledStore::{} error: {:?}", op, e);
        MqttError::Storage(e)
    }
}

impl Store for SledStore {
    fn get(&self, key: &RecordKey<'_>) -> Result<Option<PendingRecord>> {
        match self.db.get(key.to_key()).map_err(warn("get"))? {
            Some(val) => Ok(Some(PendingRecord::from_bytes(key.direction, &val)?)),
            None => Ok(None),
        }
    }

    fn put(&self, record: &PendingRecord) -> Result<()> {
        let val = record.to_bytes()?;
        self.db.insert(RecordKey::of(record).to_key(), val).map_err(warn("put"))?;
        Ok(())
    }

    fn remove(&self, key: &RecordKey<'_>) -> Result<Option<PendingRecord>> {
        match self.db.remove(key.to_key()).map_err(warn("remove"))? {
            Some(val) => Ok(Some(PendingRecord::from_bytes(key.direction, &val)?)),
            None => Ok(None),
        }
    }

    fn scan(&self, client_id: &str, direction: Direction) -> Result<Vec<PendingRecord>> {
        Ok(self.scan_prefix(client_id, direction)?.into_iter().map(|(_, r)| r).collect())
    }

    fn load_next_id(&self, client_id: &str) -> Result<Option<u16>> {
        let val = self.db.get(next_id_key(client_id)).map_err(warn("load_next_id"))?;
        match val {
            Some(v) if v.len() == 2 => Ok(Some(u16::from_be_bytes([v[0], v[1]]))),
            Some(v) => Err(MqttError::CorruptRecord(format!("packet id cursor of {} bytes", v.len()))),
            None => Ok(None),
        }
    }

    fn save_next_id(&self, client_id: &str, cursor: u16) -> Result<()> {
        self.db.insert(next_id_key(client_id), &cursor.to_be_bytes()[..]).map_err(warn("save_next_id"))?;
        Ok(())
    }

    fn remove_client(&self, client_id: &str) -> Result<usize> {
        let mut batch = ::sled::Batch::default();
        let mut count = 0;
        for direction in [Direction::Outbound, Direction::Inbound] {
            for (key, _) in self.scan_prefix(client_id, direction)? {
                batch.remove(key);
                count += 1;
            }
        }
        batch.remove(next_id_key(client_id).as_bytes());
        self.db.apply_batch(batch).map_err(warn("remove_client"))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{check_transitions, outbound, pid};
    use super::*;
    use crate::codec::QoS;

    fn temporary() -> SledStore {
        SledStore::new(::sled::Config::new().temporary(true).open().unwrap())
    }

    #[test]
    fn test_transitions() {
        check_transitions(&temporary());
    }

    #[test]
    fn test_raw_layout() {
        let store = temporary();
        let rec = outbound("c1", 42, QoS::ExactlyOnce);
        store.put(&rec).unwrap();
        let raw = store.db.get("record:c1:42").unwrap().unwrap();
        assert_eq!(raw.as_ref(), rec.to_bytes().unwrap().as_slice());

        store.save_next_id("c1", 0x0102).unwrap();
        assert_eq!(store.db.get("packetid:c1").unwrap().unwrap().as_ref(), &[1, 2]);
    }

    #[test]
    fn test_reopen() {
        let dir = std::env::temp_dir().join(format!("mqttd-sled-{}", uuid::Uuid::new_v4()));
        let cfg = SledConfig { path: dir.to_string_lossy().to_string(), ..Default::default() };
        {
            let store = SledStore::open(&cfg).unwrap();
            store.publish(&outbound("c1", 7, QoS::AtLeastOnce)).unwrap();
            store.save_next_id("c1", 7).unwrap();
            store.flush().unwrap();
        }
        let store = SledStore::open(&cfg).unwrap();
        let recs = store.scan("c1", Direction::Outbound).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].packet_id, pid(7));
        assert_eq!(store.load_next_id("c1").unwrap(), Some(7));
        drop(store);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_corrupt_record_skipped_on_scan() {
        let store = temporary();
        store.db.insert("record:c1:1", &[0u8, 1, 2][..]).unwrap();
        store.publish(&outbound("c1", 2, QoS::AtLeastOnce)).unwrap();
        assert_eq!(store.scan("c1", Direction::Outbound).unwrap().len(), 1);
        assert!(store.get(&RecordKey::outbound("c1", pid(1))).is_err());
    }
}
