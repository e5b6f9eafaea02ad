//! RAM tier: a size-bounded LRU `key -> CacheEntry` map.
//!
//! The map, the LRU list, and `total_bytes` all live behind one mutex (§5);
//! the LRU list itself is an arena (`Vec<Node>`) addressed by index rather
//! than an intrusive pointer-linked list, per the Design Notes' guidance to
//! avoid cycles under strict ownership.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::disk::DiskTier;
use crate::entry::CacheEntry;
use crate::ratelog::RateLimitedLogger;

const NIL: usize = usize::MAX;

struct Node {
    key: String,
    entry: CacheEntry,
    size: u64,
    prev: usize,
    next: usize,
}

struct RamInner {
    nodes: Vec<Node>,
    /// Free-list of tombstoned slots in `nodes`, reused by future inserts.
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: usize,
    tail: usize,
    total_bytes: u64,
}

impl RamInner {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
            total_bytes: 0,
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn remove_slot(&mut self, idx: usize) -> Node {
        self.unlink(idx);
        self.index.remove(&self.nodes[idx].key);
        self.total_bytes -= self.nodes[idx].size;
        // Swap in a cheap placeholder and reclaim the slot for reuse.
        let placeholder = Node {
            key: String::new(),
            entry: CacheEntry {
                status: 0,
                header: crate::entry::HeaderMultiMap::new(),
                body: Vec::new(),
                stored_at: 0,
                hash32: 0,
                inactive: false,
                discovered_by: crate::entry::DiscoveredBy::User,
                revalidated_at: 0,
                revalidated_by: crate::entry::RevalidatedBy::User,
            },
            size: 0,
            prev: NIL,
            next: NIL,
        };
        let removed = std::mem::replace(&mut self.nodes[idx], placeholder);
        self.free.push(idx);
        removed
    }

    fn alloc_slot(&mut self, node: Node) -> usize {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = node;
            idx
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }
}

pub struct RamTier {
    inner: Mutex<RamInner>,
    max_bytes: u64,
    overflow_log: RateLimitedLogger,
}

impl RamTier {
    pub fn new(max_bytes: u64, overflow_log: RateLimitedLogger) -> Self {
        Self {
            inner: Mutex::new(RamInner::new()),
            max_bytes,
            overflow_log,
        }
    }

    /// On hit, advances LRU position. Inactive entries are treated as a miss
    /// (invariant 4) — the request path must never observe a seed.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().unwrap();
        let idx = *inner.index.get(key)?;
        if inner.nodes[idx].entry.inactive {
            return None;
        }
        inner.touch(idx);
        Some(inner.nodes[idx].entry.clone())
    }

    /// Like `get` but without LRU movement, and returns inactive entries too.
    /// Used by discovery/warmup.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        let inner = self.inner.lock().unwrap();
        let idx = *inner.index.get(key)?;
        Some(inner.nodes[idx].entry.clone())
    }

    /// Inserts or replaces `key`. If the entry is too large for RAM it is
    /// handed straight to disk instead. Eviction batches are handed off to
    /// disk asynchronously; no disk I/O happens under the RAM mutex.
    pub async fn put(&self, key: &str, entry: CacheEntry, disk: &DiskTier) {
        let size = entry.serialized_size();

        if size > self.max_bytes {
            disk.put_async(key.to_string(), entry).await;
            return;
        }

        let to_evict = {
            let mut inner = self.inner.lock().unwrap();

            if let Some(&idx) = inner.index.get(key) {
                let old_size = inner.nodes[idx].size;
                inner.nodes[idx].entry = entry;
                inner.nodes[idx].size = size;
                inner.total_bytes = inner.total_bytes - old_size + size;
                inner.touch(idx);
                Vec::new()
            } else {
                let mut evicted = Vec::new();
                while inner.total_bytes + size > self.max_bytes && !inner.index.is_empty() {
                    let batch = Self::select_tail_batch(&mut inner);
                    if batch.is_empty() {
                        break;
                    }
                    evicted.extend(batch);
                    if inner.total_bytes + size > self.max_bytes {
                        self.overflow_log.emit("ram tier overflow after eviction batch");
                    }
                }
                let node = Node {
                    key: key.to_string(),
                    entry,
                    size,
                    prev: NIL,
                    next: NIL,
                };
                let idx = inner.alloc_slot(node);
                inner.index.insert(key.to_string(), idx);
                inner.push_front(idx);
                inner.total_bytes += size;
                evicted
            }
        };

        for (evicted_key, evicted_entry) in to_evict {
            disk.put_async(evicted_key, evicted_entry).await;
        }
    }

    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&idx) = inner.index.get(key) {
            inner.remove_slot(idx);
        }
    }

    /// Snapshot of all live keys (used by warmup and stats).
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.index.keys().cloned().collect()
    }

    pub fn total_size(&self) -> u64 {
        self.inner.lock().unwrap().total_bytes
    }

    pub fn key_count(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    /// Selects and removes the tail ~10% (ceiling, at least 1) of entries,
    /// returning them for the caller to hand off to disk. Must be called
    /// with `inner` already locked.
    fn select_tail_batch(inner: &mut RamInner) -> Vec<(String, CacheEntry)> {
        let count = inner.index.len();
        if count == 0 {
            return Vec::new();
        }
        let batch_size = ((count as f64) * 0.1).ceil().max(1.0) as usize;
        let mut out = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let idx = inner.tail;
            if idx == NIL {
                break;
            }
            let node = inner.remove_slot(idx);
            debug!(key = %node.key, "evicting ram entry to disk");
            out.push((node.key, node.entry));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::DiscoveredBy;
    use std::time::Duration;

    fn test_disk() -> (DiskTier, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskTier::open(dir.path(), u64::MAX, Duration::from_secs(60)).unwrap();
        (disk, dir)
    }

    fn entry(body: &str) -> CacheEntry {
        CacheEntry::new_active(200, crate::entry::HeaderMultiMap::new(), body.as_bytes().to_vec(), DiscoveredBy::User)
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let ram = RamTier::new(1_000_000, RateLimitedLogger::new(Duration::from_secs(60)));
        let (disk, _dir) = test_disk();
        ram.put("/a", entry("v1"), &disk).await;
        let got = ram.get("/a").unwrap();
        assert_eq!(got.body, b"v1");
    }

    #[tokio::test]
    async fn inactive_entries_are_hidden_from_get_but_visible_to_peek() {
        let ram = RamTier::new(1_000_000, RateLimitedLogger::new(Duration::from_secs(60)));
        let (disk, _dir) = test_disk();
        let seed = crate::entry::CacheEntry::new_seed();
        ram.put("/seed", seed, &disk).await;
        assert!(ram.get("/seed").is_none());
        assert!(ram.peek("/seed").is_some());
    }

    #[tokio::test]
    async fn delete_removes_and_adjusts_total() {
        let ram = RamTier::new(1_000_000, RateLimitedLogger::new(Duration::from_secs(60)));
        let (disk, _dir) = test_disk();
        ram.put("/a", entry("v1"), &disk).await;
        assert!(ram.total_size() > 0);
        ram.delete("/a");
        assert_eq!(ram.total_size(), 0);
        assert!(ram.get("/a").is_none());
    }

    #[tokio::test]
    async fn oversized_entry_bypasses_ram_straight_to_disk() {
        let ram = RamTier::new(1, RateLimitedLogger::new(Duration::from_secs(60)));
        let (disk, _dir) = test_disk();
        ram.put("/a", entry("v1"), &disk).await;
        assert!(ram.get("/a").is_none());
        assert!(disk.peek("/a").await.is_some());
    }

    #[tokio::test]
    async fn eviction_batch_is_tail_ten_percent() {
        // Cap fits roughly 3 entries; insert 10 so evictions occur. The
        // earliest-inserted (least-recently-touched) keys must be the ones
        // handed off to disk first.
        let one_size = entry("0123456789").serialized_size();
        let ram = RamTier::new(one_size * 3, RateLimitedLogger::new(Duration::from_secs(60)));
        let (disk, _dir) = test_disk();
        for i in 0..10 {
            ram.put(&format!("/k{i}"), entry("0123456789"), &disk).await;
        }
        assert!(ram.key_count() <= 4);
        // The first keys inserted should have been evicted to disk.
        assert!(disk.peek("/k0").await.is_some());
        // The most recently inserted key must still be resident in RAM.
        assert!(ram.get("/k9").is_some());
    }
}
