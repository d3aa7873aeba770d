//! Storage collaborators: the per-shard append-only log and the placement
//! store, each with an in-memory twin for tests and a fjall-backed engine.
//!
//! Log keys are `[len u16][shard bytes][index u64]`, all big-endian, so one
//! partition holds every shard and range scans stay within a shard prefix.
//! Batches are atomic; index gaps are rejected.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use roost_replica::replica::Entry;

use crate::types::{ChannelPlacement, ChannelKey};

/// Append-only per-shard log consumed by the shard scheduler.
pub trait LogStorage: Send + Sync + 'static {
    /// Atomically append a dense batch.
    fn append_logs(&self, shard: &str, entries: &[Entry]) -> anyhow::Result<()>;
    /// Entries from `start_index`, bounded by `max_bytes` of payload (at
    /// least one entry is returned when available).
    fn get_logs(&self, shard: &str, start_index: u64, max_bytes: u64) -> anyhow::Result<Vec<Entry>>;
    fn first_index(&self, shard: &str) -> anyhow::Result<u64>;
    fn last_index(&self, shard: &str) -> anyhow::Result<u64>;
    fn last_entry(&self, shard: &str) -> anyhow::Result<Option<Entry>>;
    fn set_applied_index(&self, shard: &str, index: u64) -> anyhow::Result<()>;
    fn applied_index(&self, shard: &str) -> anyhow::Result<u64>;
    /// Last index plus the wall-clock microseconds of the latest append.
    fn last_index_and_append_time(&self, shard: &str) -> anyhow::Result<(u64, u64)>;
    /// Drop every entry above `index`.
    fn truncate_after(&self, shard: &str, index: u64) -> anyhow::Result<()>;
}

/// Placement records keyed by channel, over a sorted KV.
pub trait PlacementStore: Send + Sync + 'static {
    fn get(&self, key: &ChannelKey) -> anyhow::Result<Option<ChannelPlacement>>;
    fn save(&self, placement: &ChannelPlacement) -> anyhow::Result<()>;
    fn delete(&self, key: &ChannelKey) -> anyhow::Result<()>;
}

fn epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}

// ------------------------------------------------------------------- memory

#[derive(Default)]
struct MemoryShard {
    entries: Vec<Entry>,
    applied: u64,
    last_append_us: u64,
}

/// In-memory log, mirroring the shape tests drive the real engine with.
#[derive(Default)]
pub struct MemoryLogStorage {
    shards: Mutex<HashMap<String, MemoryShard>>,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStorage for MemoryLogStorage {
    fn append_logs(&self, shard: &str, entries: &[Entry]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut shards = self.shards.lock().expect("storage lock");
        let state = shards.entry(shard.to_string()).or_default();
        for entry in entries {
            let expected = state.entries.last().map(|e| e.index + 1).unwrap_or(1);
            if entry.index < expected {
                // Idempotent replay of an already-stored suffix.
                continue;
            }
            anyhow::ensure!(
                entry.index == expected,
                "log gap on {shard}: expected {expected}, got {}",
                entry.index
            );
            state.entries.push(entry.clone());
        }
        state.last_append_us = epoch_micros();
        Ok(())
    }

    fn get_logs(&self, shard: &str, start_index: u64, max_bytes: u64) -> anyhow::Result<Vec<Entry>> {
        let shards = self.shards.lock().expect("storage lock");
        let Some(state) = shards.get(shard) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        let mut size = 0u64;
        for entry in &state.entries {
            if entry.index < start_index {
                continue;
            }
            size += entry.encoded_size();
            if !out.is_empty() && size > max_bytes {
                break;
            }
            out.push(entry.clone());
        }
        Ok(out)
    }

    fn first_index(&self, shard: &str) -> anyhow::Result<u64> {
        let shards = self.shards.lock().expect("storage lock");
        Ok(shards
            .get(shard)
            .and_then(|s| s.entries.first())
            .map(|e| e.index)
            .unwrap_or(0))
    }

    fn last_index(&self, shard: &str) -> anyhow::Result<u64> {
        let shards = self.shards.lock().expect("storage lock");
        Ok(shards
            .get(shard)
            .and_then(|s| s.entries.last())
            .map(|e| e.index)
            .unwrap_or(0))
    }

    fn last_entry(&self, shard: &str) -> anyhow::Result<Option<Entry>> {
        let shards = self.shards.lock().expect("storage lock");
        Ok(shards.get(shard).and_then(|s| s.entries.last().cloned()))
    }

    fn set_applied_index(&self, shard: &str, index: u64) -> anyhow::Result<()> {
        let mut shards = self.shards.lock().expect("storage lock");
        shards.entry(shard.to_string()).or_default().applied = index;
        Ok(())
    }

    fn applied_index(&self, shard: &str) -> anyhow::Result<u64> {
        let shards = self.shards.lock().expect("storage lock");
        Ok(shards.get(shard).map(|s| s.applied).unwrap_or(0))
    }

    fn last_index_and_append_time(&self, shard: &str) -> anyhow::Result<(u64, u64)> {
        let shards = self.shards.lock().expect("storage lock");
        let Some(state) = shards.get(shard) else {
            return Ok((0, 0));
        };
        Ok((
            state.entries.last().map(|e| e.index).unwrap_or(0),
            state.last_append_us,
        ))
    }

    fn truncate_after(&self, shard: &str, index: u64) -> anyhow::Result<()> {
        let mut shards = self.shards.lock().expect("storage lock");
        if let Some(state) = shards.get_mut(shard) {
            state.entries.retain(|e| e.index <= index);
        }
        Ok(())
    }
}

/// In-memory placement store.
#[derive(Default)]
pub struct MemoryPlacementStore {
    records: Mutex<HashMap<String, ChannelPlacement>>,
}

impl MemoryPlacementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlacementStore for MemoryPlacementStore {
    fn get(&self, key: &ChannelKey) -> anyhow::Result<Option<ChannelPlacement>> {
        let records = self.records.lock().expect("placement lock");
        Ok(records.get(&key.shard()).cloned())
    }

    fn save(&self, placement: &ChannelPlacement) -> anyhow::Result<()> {
        let mut records = self.records.lock().expect("placement lock");
        records.insert(placement.key().shard(), placement.clone());
        Ok(())
    }

    fn delete(&self, key: &ChannelKey) -> anyhow::Result<()> {
        let mut records = self.records.lock().expect("placement lock");
        records.remove(&key.shard());
        Ok(())
    }
}

// -------------------------------------------------------------------- fjall

fn log_key(shard: &str, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + shard.len() + 8);
    key.extend_from_slice(&(shard.len() as u16).to_be_bytes());
    key.extend_from_slice(shard.as_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn shard_prefix(shard: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + shard.len());
    key.extend_from_slice(&(shard.len() as u16).to_be_bytes());
    key.extend_from_slice(shard.as_bytes());
    key
}

fn encode_log_value(entry: &Entry) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + entry.data.len());
    out.extend_from_slice(&entry.term.to_be_bytes());
    out.extend_from_slice(&entry.data);
    out
}

fn decode_log_value(index: u64, value: &[u8]) -> anyhow::Result<Entry> {
    anyhow::ensure!(value.len() >= 4, "short log value");
    let mut term = [0u8; 4];
    term.copy_from_slice(&value[..4]);
    Ok(Entry {
        index,
        term: u32::from_be_bytes(term),
        data: value[4..].to_vec(),
    })
}

fn index_from_key(key: &[u8]) -> anyhow::Result<u64> {
    anyhow::ensure!(key.len() >= 8, "short log key");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[key.len() - 8..]);
    Ok(u64::from_be_bytes(buf))
}

/// fjall-backed log engine. One `logs` partition holds every shard; a `meta`
/// partition tracks applied indexes and append times.
pub struct FjallLogStorage {
    keyspace: Keyspace,
    logs: PartitionHandle,
    meta: PartitionHandle,
}

impl FjallLogStorage {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open log keyspace")?;
        let logs = keyspace
            .open_partition("logs", PartitionCreateOptions::default())
            .context("open logs partition")?;
        let meta = keyspace
            .open_partition("log_meta", PartitionCreateOptions::default())
            .context("open log meta partition")?;
        Ok(Self {
            keyspace,
            logs,
            meta,
        })
    }

    fn meta_key(shard: &str, field: &str) -> Vec<u8> {
        format!("{shard}\u{0}{field}").into_bytes()
    }

    fn read_meta_u64(&self, shard: &str, field: &str) -> anyhow::Result<u64> {
        match self.meta.get(Self::meta_key(shard, field))? {
            Some(value) if value.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&value);
                Ok(u64::from_be_bytes(buf))
            }
            _ => Ok(0),
        }
    }

    fn write_meta_u64(&self, shard: &str, field: &str, value: u64) -> anyhow::Result<()> {
        self.meta
            .insert(Self::meta_key(shard, field), value.to_be_bytes().to_vec())?;
        Ok(())
    }
}

impl LogStorage for FjallLogStorage {
    fn append_logs(&self, shard: &str, entries: &[Entry]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let last = self.last_index(shard)?;
        let mut batch = self.keyspace.batch();
        let mut appended = false;
        for entry in entries {
            if entry.index <= last {
                continue;
            }
            anyhow::ensure!(
                appended || entry.index == last + 1,
                "log gap on {shard}: expected {}, got {}",
                last + 1,
                entry.index
            );
            batch.insert(&self.logs, log_key(shard, entry.index), encode_log_value(entry));
            appended = true;
        }
        batch.insert(
            &self.meta,
            Self::meta_key(shard, "append_us"),
            epoch_micros().to_be_bytes().to_vec(),
        );
        batch.commit().context("commit log batch")?;
        self.keyspace
            .persist(PersistMode::Buffer)
            .context("persist log batch")?;
        Ok(())
    }

    fn get_logs(&self, shard: &str, start_index: u64, max_bytes: u64) -> anyhow::Result<Vec<Entry>> {
        let mut out = Vec::new();
        let mut size = 0u64;
        let start = log_key(shard, start_index);
        let end = log_key(shard, u64::MAX);
        for item in self.logs.range(start..=end) {
            let (key, value) = item.context("scan logs")?;
            let index = index_from_key(&key)?;
            let entry = decode_log_value(index, &value)?;
            size += entry.encoded_size();
            if !out.is_empty() && size > max_bytes {
                break;
            }
            out.push(entry);
        }
        Ok(out)
    }

    fn first_index(&self, shard: &str) -> anyhow::Result<u64> {
        match self.logs.prefix(shard_prefix(shard)).next() {
            Some(item) => {
                let (key, _) = item.context("scan logs")?;
                index_from_key(&key)
            }
            None => Ok(0),
        }
    }

    fn last_index(&self, shard: &str) -> anyhow::Result<u64> {
        match self.logs.prefix(shard_prefix(shard)).next_back() {
            Some(item) => {
                let (key, _) = item.context("scan logs")?;
                index_from_key(&key)
            }
            None => Ok(0),
        }
    }

    fn last_entry(&self, shard: &str) -> anyhow::Result<Option<Entry>> {
        match self.logs.prefix(shard_prefix(shard)).next_back() {
            Some(item) => {
                let (key, value) = item.context("scan logs")?;
                let index = index_from_key(&key)?;
                Ok(Some(decode_log_value(index, &value)?))
            }
            None => Ok(None),
        }
    }

    fn set_applied_index(&self, shard: &str, index: u64) -> anyhow::Result<()> {
        self.write_meta_u64(shard, "applied", index)
    }

    fn applied_index(&self, shard: &str) -> anyhow::Result<u64> {
        self.read_meta_u64(shard, "applied")
    }

    fn last_index_and_append_time(&self, shard: &str) -> anyhow::Result<(u64, u64)> {
        Ok((
            self.last_index(shard)?,
            self.read_meta_u64(shard, "append_us")?,
        ))
    }

    fn truncate_after(&self, shard: &str, index: u64) -> anyhow::Result<()> {
        let last = self.last_index(shard)?;
        if last <= index {
            return Ok(());
        }
        let mut batch = self.keyspace.batch();
        for i in (index + 1)..=last {
            batch.remove(&self.logs, log_key(shard, i));
        }
        batch.commit().context("commit log truncate")?;
        Ok(())
    }
}

/// fjall-backed placement store; records are JSON values keyed by channel key.
pub struct FjallPlacementStore {
    keyspace: Keyspace,
    records: PartitionHandle,
}

impl FjallPlacementStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open placement keyspace")?;
        let records = keyspace
            .open_partition("placements", PartitionCreateOptions::default())
            .context("open placements partition")?;
        Ok(Self { keyspace, records })
    }
}

impl PlacementStore for FjallPlacementStore {
    fn get(&self, key: &ChannelKey) -> anyhow::Result<Option<ChannelPlacement>> {
        match self.records.get(key.shard().as_bytes())? {
            Some(value) => Ok(Some(
                serde_json::from_slice(&value).context("parse placement record")?,
            )),
            None => Ok(None),
        }
    }

    fn save(&self, placement: &ChannelPlacement) -> anyhow::Result<()> {
        let value = serde_json::to_vec(placement).context("serialize placement record")?;
        self.records.insert(placement.key().shard().as_bytes(), value)?;
        self.keyspace
            .persist(PersistMode::Buffer)
            .context("persist placement")?;
        Ok(())
    }

    fn delete(&self, key: &ChannelKey) -> anyhow::Result<()> {
        self.records.remove(key.shard().as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, data: &[u8]) -> Entry {
        Entry {
            index,
            term: 1,
            data: data.to_vec(),
        }
    }

    fn exercise_log(storage: &dyn LogStorage) {
        assert_eq!(storage.last_index("s1").unwrap(), 0);
        storage
            .append_logs("s1", &[entry(1, b"a"), entry(2, b"b")])
            .unwrap();
        storage.append_logs("s2", &[entry(1, b"z")]).unwrap();

        assert_eq!(storage.first_index("s1").unwrap(), 1);
        assert_eq!(storage.last_index("s1").unwrap(), 2);
        assert_eq!(storage.last_index("s2").unwrap(), 1);

        // Replaying an already-stored entry is idempotent.
        storage
            .append_logs("s1", &[entry(2, b"b"), entry(3, b"c")])
            .unwrap();
        assert_eq!(storage.last_index("s1").unwrap(), 3);

        // Gaps are rejected.
        assert!(storage.append_logs("s1", &[entry(9, b"x")]).is_err());

        let logs = storage.get_logs("s1", 2, u64::MAX).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].data, b"b");

        storage.set_applied_index("s1", 2).unwrap();
        assert_eq!(storage.applied_index("s1").unwrap(), 2);

        storage.truncate_after("s1", 1).unwrap();
        assert_eq!(storage.last_index("s1").unwrap(), 1);
        // Other shards untouched.
        assert_eq!(storage.last_index("s2").unwrap(), 1);
    }

    #[test]
    fn memory_log_contract() {
        exercise_log(&MemoryLogStorage::new());
    }

    #[test]
    fn fjall_log_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise_log(&FjallLogStorage::open(dir.path()).unwrap());
    }

    #[test]
    fn fjall_placement_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallPlacementStore::open(dir.path()).unwrap();
        let placement = ChannelPlacement {
            channel_id: "room".into(),
            channel_type: 2,
            leader_id: 1,
            replicas: vec![1, 2],
            replica_count: 2,
            term: 1,
        };
        let key = placement.key();
        assert!(store.get(&key).unwrap().is_none());
        store.save(&placement).unwrap();
        assert_eq!(store.get(&key).unwrap().unwrap(), placement);
        store.delete(&key).unwrap();
        assert!(store.get(&key).unwrap().is_none());
    }
}
