//! Disk tier: a persistent, size-bounded LRU over an ordered KV store.
//!
//! `sled` plays the role of the "ordered KV store supporting atomic batched
//! writes, prefix iteration, and durable put/get/delete" that spec.md treats
//! as an external collaborator. Two keyspaces live in one `sled::Db`: `e:`
//! holds the serialized [`CacheEntry`], `m:` holds `Metadata`. Mutations are
//! single-writer (§5): everything that changes state is enqueued onto a
//! bounded channel and applied by one task; `peek`/`get` read the KV store
//! directly, bypassing the queue.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::entry::CacheEntry;
use crate::error::Error;
use crate::ratelog::RateLimitedLogger;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Metadata {
    size: u64,
    last_access_unix: u64,
}

enum DiskOp {
    Put { key: String, entry: Box<CacheEntry> },
    Touch { key: String },
    Delete { key: String },
    Shutdown { ack: oneshot::Sender<()> },
}

struct IndexState {
    map: HashMap<String, Metadata>,
    total_bytes: u64,
}

pub struct DiskTier {
    db: sled::Db,
    index: Arc<Mutex<IndexState>>,
    tx: mpsc::Sender<DiskOp>,
    max_bytes: u64,
}

fn entry_key(key: &str) -> Vec<u8> {
    format!("e:{key}").into_bytes()
}

fn meta_key(key: &str) -> Vec<u8> {
    format!("m:{key}").into_bytes()
}

impl DiskTier {
    /// Opens (or creates) the KV directory at `path` and rebuilds the
    /// in-memory index from the `m:` keyspace. Partial/invalid metadata
    /// records are skipped; orphaned `e:` entries are left for the next
    /// rewrite of that key to clean up (§4.4).
    pub fn open(path: impl AsRef<Path>, max_bytes: u64, overflow_interval: Duration) -> Result<Self, Error> {
        let db = sled::open(path)?;

        let mut map = HashMap::new();
        let mut total_bytes = 0u64;
        for kv in db.scan_prefix(b"m:") {
            let (k, v) = match kv {
                Ok(kv) => kv,
                Err(_) => continue,
            };
            let Ok(key_str) = std::str::from_utf8(&k) else {
                continue;
            };
            let Some(key) = key_str.strip_prefix("m:") else {
                continue;
            };
            let Ok(meta) = bincode::deserialize::<Metadata>(&v) else {
                continue;
            };
            total_bytes += meta.size;
            map.insert(key.to_string(), meta);
        }

        let index = Arc::new(Mutex::new(IndexState { map, total_bytes }));
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let overflow_log = RateLimitedLogger::new(overflow_interval);

        let writer_db = db.clone();
        let writer_index = Arc::clone(&index);
        tokio::spawn(writer_task(writer_db, writer_index, rx, max_bytes, overflow_log));

        Ok(Self { db, index, tx, max_bytes })
    }

    /// Reads `e:<key>` directly; does not touch LRU metadata.
    pub async fn peek(&self, key: &str) -> Option<CacheEntry> {
        let raw = self.db.get(entry_key(key)).ok().flatten()?;
        bincode::deserialize(&raw).ok()
    }

    /// `peek` plus an async `touch(key)` enqueue. Inactive entries are
    /// suppressed here (treated as miss) for the request handler.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.peek(key).await?;
        if entry.inactive {
            return None;
        }
        self.touch(key).await;
        Some(entry)
    }

    pub async fn put_async(&self, key: String, entry: CacheEntry) {
        let _ = self
            .tx
            .send(DiskOp::Put { key, entry: Box::new(entry) })
            .await;
    }

    pub async fn touch(&self, key: &str) {
        let _ = self.tx.send(DiskOp::Touch { key: key.to_string() }).await;
    }

    pub async fn delete(&self, key: &str) {
        let _ = self.tx.send(DiskOp::Delete { key: key.to_string() }).await;
    }

    pub fn keys(&self) -> Vec<String> {
        self.index.lock().unwrap().map.keys().cloned().collect()
    }

    pub fn total_size(&self) -> u64 {
        self.index.lock().unwrap().total_bytes
    }

    pub fn key_count(&self) -> usize {
        self.index.lock().unwrap().map.len()
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Drains the writer's queue and flushes the KV store. Part of the
    /// graceful-shutdown path (§5 "Cancellation").
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(DiskOp::Shutdown { ack: ack_tx }).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn writer_task(
    db: sled::Db,
    index: Arc<Mutex<IndexState>>,
    mut rx: mpsc::Receiver<DiskOp>,
    max_bytes: u64,
    overflow_log: RateLimitedLogger,
) {
    while let Some(op) = rx.recv().await {
        match op {
            DiskOp::Put { key, entry } => {
                if let Err(e) = apply_put(&db, &index, &key, &entry, max_bytes) {
                    warn!(key = %key, error = %e, "disk write failed, entry not persisted");
                    continue;
                }
                maybe_evict(&db, &index, max_bytes, &overflow_log);
            }
            DiskOp::Touch { key } => {
                apply_touch(&db, &index, &key);
            }
            DiskOp::Delete { key } => {
                apply_delete(&db, &index, &key);
            }
            DiskOp::Shutdown { ack } => {
                let _ = db.flush();
                let _ = ack.send(());
                break;
            }
        }
    }
}

/// Rejects the write outright (invariant 3) when the entry alone is bigger
/// than `max_bytes` — `maybe_evict` only reclaims space by age, and a
/// just-written entry always has the newest `last_access`, so it would
/// otherwise never be evictable and would pin the tier over budget forever.
fn apply_put(db: &sled::Db, index: &Arc<Mutex<IndexState>>, key: &str, entry: &CacheEntry, max_bytes: u64) -> Result<(), Error> {
    let serialized = bincode::serialize(entry)?;
    let size = serialized.len() as u64;

    if size > max_bytes {
        return Err(Error::CacheOverflow(format!("entry for {key} ({size} bytes) exceeds disk.max ({max_bytes} bytes)")));
    }

    let meta = Metadata {
        size,
        last_access_unix: crate::entry::now_unix(),
    };
    let meta_bytes = bincode::serialize(&meta)?;

    let mut batch = sled::Batch::default();
    batch.insert(entry_key(key), serialized);
    batch.insert(meta_key(key), meta_bytes);
    db.apply_batch(batch)?;

    let mut guard = index.lock().unwrap();
    if let Some(old) = guard.map.insert(key.to_string(), meta) {
        guard.total_bytes = guard.total_bytes.saturating_sub(old.size);
    }
    guard.total_bytes += size;
    debug!(key = %key, size, "disk entry written");
    Ok(())
}

fn apply_touch(db: &sled::Db, index: &Arc<Mutex<IndexState>>, key: &str) {
    let mut guard = index.lock().unwrap();
    let Some(meta) = guard.map.get_mut(key) else {
        return;
    };
    meta.last_access_unix = crate::entry::now_unix();
    let meta = *meta;
    drop(guard);
    if let Ok(bytes) = bincode::serialize(&meta) {
        let _ = db.insert(meta_key(key), bytes);
    }
}

fn apply_delete(db: &sled::Db, index: &Arc<Mutex<IndexState>>, key: &str) {
    let mut batch = sled::Batch::default();
    batch.remove(entry_key(key));
    batch.remove(meta_key(key));
    let _ = db.apply_batch(batch);

    let mut guard = index.lock().unwrap();
    if let Some(old) = guard.map.remove(key) {
        guard.total_bytes = guard.total_bytes.saturating_sub(old.size);
    }
}

/// Deletes the oldest-accessed 10% (ceiling, ≥1) of entries when over
/// budget. Runs inline in the writer task, so it's still single-writer.
fn maybe_evict(db: &sled::Db, index: &Arc<Mutex<IndexState>>, max_bytes: u64, overflow_log: &RateLimitedLogger) {
    let over_budget = {
        let guard = index.lock().unwrap();
        guard.total_bytes > max_bytes
    };
    if !over_budget {
        return;
    }

    overflow_log.emit("disk tier overflow, evicting oldest entries");

    let mut pairs: Vec<(String, u64)> = {
        let guard = index.lock().unwrap();
        guard
            .map
            .iter()
            .map(|(k, m)| (k.clone(), m.last_access_unix))
            .collect()
    };
    pairs.sort_by_key(|(_, last_access)| *last_access);

    let count = pairs.len();
    if count == 0 {
        return;
    }
    let evict_count = ((count as f64) * 0.1).ceil().max(1.0) as usize;

    for (key, _) in pairs.into_iter().take(evict_count) {
        debug!(key = %key, "evicting disk entry");
        apply_delete(db, index, &key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{CacheEntry, DiscoveredBy, HeaderMultiMap};

    fn active(body: &str) -> CacheEntry {
        CacheEntry::new_active(200, HeaderMultiMap::new(), body.as_bytes().to_vec(), DiscoveredBy::User)
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskTier::open(dir.path(), u64::MAX, Duration::from_secs(60)).unwrap();
        disk.put_async("/a".to_string(), active("v1")).await;
        // give the writer task a moment to apply
        tokio::time::sleep(Duration::from_millis(50)).await;
        let got = disk.get("/a").await.unwrap();
        assert_eq!(got.body, b"v1");
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskTier::open(dir.path(), u64::MAX, Duration::from_secs(60)).unwrap();
        disk.put_async("/a".to_string(), active("v1")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        disk.delete("/a").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(disk.peek("/a").await.is_none());
    }

    #[tokio::test]
    async fn inactive_entries_suppressed_from_get() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskTier::open(dir.path(), u64::MAX, Duration::from_secs(60)).unwrap();
        disk.put_async("/seed".to_string(), CacheEntry::new_seed()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(disk.get("/seed").await.is_none());
        assert!(disk.peek("/seed").await.is_some());
    }

    #[tokio::test]
    async fn startup_rebuilds_index_from_metadata() {
        let dir = tempfile::tempdir().unwrap();
        {
            let disk = DiskTier::open(dir.path(), u64::MAX, Duration::from_secs(60)).unwrap();
            disk.put_async("/a".to_string(), active("v1")).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            disk.shutdown().await;
        }
        let reopened = DiskTier::open(dir.path(), u64::MAX, Duration::from_secs(60)).unwrap();
        assert_eq!(reopened.key_count(), 1);
        assert!(reopened.total_size() > 0);
    }

    #[tokio::test]
    async fn eviction_removes_oldest_tenth() {
        let dir = tempfile::tempdir().unwrap();
        let one_size = bincode::serialize(&active("0123456789")).unwrap().len() as u64;
        let disk = DiskTier::open(dir.path(), one_size * 3, Duration::from_secs(60)).unwrap();
        for i in 0..10 {
            disk.put_async(format!("/k{i}"), active("0123456789")).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(disk.peek("/k0").await.is_none(), "oldest key should have been evicted");
        assert!(disk.peek("/k9").await.is_some(), "newest key should remain");
    }

    #[tokio::test]
    async fn oversized_entry_is_rejected_outright() {
        let dir = tempfile::tempdir().unwrap();
        let one_size = bincode::serialize(&active("0123456789")).unwrap().len() as u64;
        let disk = DiskTier::open(dir.path(), one_size - 1, Duration::from_secs(60)).unwrap();
        disk.put_async("/a".to_string(), active("0123456789")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(disk.peek("/a").await.is_none(), "entry bigger than disk.max must never be admitted");
        assert_eq!(disk.total_size(), 0);
    }
}
