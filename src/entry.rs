//! The cached response unit and its on-disk serialization.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Who originally caused a key to enter the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveredBy {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "sitemap")]
    Sitemap,
}

/// What triggered the most recent successful refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevalidatedBy {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "warmup")]
    Warmup,
}

/// Ordered, multi-valued, case-insensitive-by-construction header map.
///
/// Keys are stored lowercased; values preserve origin ordering for repeated
/// header names. `Content-Length` is never present (callers must strip it
/// before constructing an entry; see invariant 6).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMultiMap(pub HashMap<String, Vec<String>>);

impl HeaderMultiMap {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn push(&mut self, name: &str, value: String) {
        self.0.entry(name.to_ascii_lowercase()).or_default().push(value);
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn remove(&mut self, name: &str) {
        self.0.remove(&name.to_ascii_lowercase());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }
}

/// The cached unit: a full HTTP response plus cache-engine metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub header: HeaderMultiMap,
    pub body: Vec<u8>,
    /// Wall-clock second when admitted/updated; basis for staleness.
    pub stored_at: u64,
    /// CRC32 (IEEE) of `body`.
    pub hash32: u32,
    /// True for sitemap-discovered seeds that must never be served directly.
    pub inactive: bool,
    pub discovered_by: DiscoveredBy,
    pub revalidated_at: u128,
    pub revalidated_by: RevalidatedBy,
}

impl CacheEntry {
    /// Builds an active entry from a freshly-fetched origin response.
    ///
    /// `header` must already have `Content-Length` stripped (invariant 6).
    pub fn new_active(
        status: u16,
        mut header: HeaderMultiMap,
        body: Vec<u8>,
        discovered_by: DiscoveredBy,
    ) -> Self {
        header.remove("content-length");
        let hash32 = CRC32.checksum(&body);
        let now = now_unix();
        Self {
            status,
            header,
            body,
            stored_at: now,
            hash32,
            inactive: false,
            discovered_by,
            revalidated_at: now_unix_nanos(),
            revalidated_by: RevalidatedBy::User,
        }
    }

    /// Builds an inactive sitemap seed per §4.10: empty body, status 200.
    pub fn new_seed() -> Self {
        Self {
            status: 200,
            header: HeaderMultiMap::new(),
            body: Vec::new(),
            stored_at: now_unix(),
            hash32: 0,
            inactive: true,
            discovered_by: DiscoveredBy::Sitemap,
            revalidated_at: 0,
            revalidated_by: RevalidatedBy::Warmup,
        }
    }

    /// Marks the entry as freshly revalidated with unchanged content:
    /// per §4.8 step 5, this path must NOT touch `stored_at` or bump LRU.
    pub fn mark_unchanged_revalidation(&mut self, by: RevalidatedBy) {
        self.revalidated_at = now_unix_nanos();
        self.revalidated_by = by;
    }

    /// Replaces content after a changed-body revalidation (§4.8 step 6).
    pub fn apply_revalidated(&mut self, status: u16, mut header: HeaderMultiMap, body: Vec<u8>, by: RevalidatedBy) {
        header.remove("content-length");
        self.hash32 = CRC32.checksum(&body);
        self.status = status;
        self.header = header;
        self.body = body;
        self.stored_at = now_unix();
        self.revalidated_at = now_unix_nanos();
        self.revalidated_by = by;
        self.inactive = false;
    }

    pub fn serialized_size(&self) -> u64 {
        let header_bytes: usize = self
            .header
            .0
            .iter()
            .map(|(k, vs)| k.len() + vs.iter().map(|v| v.len()).sum::<usize>())
            .sum();
        (self.body.len() + header_bytes + 64) as u64
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

pub fn now_unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_nanos()
}

/// Checksums a body the same way a [`CacheEntry`] does, for comparing a
/// freshly-fetched body against a stored entry without building one.
pub fn crc32_of(body: &[u8]) -> u32 {
    CRC32.checksum(body)
}
