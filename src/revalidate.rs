//! Background revalidator (§4.8): bounded-concurrency SWR refresh shared by
//! hit-driven revalidation, warmup, and sitemap-driven discovery jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::disk::DiskTier;
use crate::entry::{crc32_of, RevalidatedBy};
use crate::origin::{is_cacheable, OriginFetcher, StatusKind};
use crate::ram::RamTier;

const MAX_IN_FLIGHT: usize = 32;
const TASK_DEADLINE: Duration = Duration::from_secs(30);

/// The outcome of one `revalidate_once` call, used by warmup to bucket its
/// summary line (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidationOutcome {
    Unchanged,
    Updated,
    IgnoredStatus,
    IgnoredCc,
    Error,
}

/// Owns the global semaphore capping background refetches at 32 in-flight.
/// Attempting to start beyond cap is dropped, not queued (§5 "Overflow
/// backpressure"): overload should degrade freshness, not grow queues.
pub struct Revalidator {
    semaphore: Arc<Semaphore>,
}

impl Revalidator {
    pub fn new() -> Self {
        Self { semaphore: Arc::new(Semaphore::new(MAX_IN_FLIGHT)) }
    }

    /// Non-blocking acquire of a global in-flight slot. Used by warmup to
    /// respect the same drop-not-queue cap that hit-driven revalidation
    /// uses, on top of warmup's own per-rule semaphore.
    pub fn try_acquire_permit(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    /// Attempts to spawn a background revalidation task for `key`. Returns
    /// `false` if the semaphore is saturated (caller does nothing further —
    /// the next user request or warmup tick will retry).
    pub fn try_spawn(
        &self,
        key: String,
        path: String,
        raw_query: String,
        by: RevalidatedBy,
        ram: Arc<RamTier>,
        disk: Arc<DiskTier>,
        origin: Arc<OriginFetcher>,
    ) -> bool {
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            debug!(key = %key, "revalidation dropped: semaphore saturated");
            return false;
        };

        tokio::spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(TASK_DEADLINE, revalidate_once(&key, &path, &raw_query, by, &ram, &disk, &origin)).await {
                Ok(_) => {}
                Err(_) => warn!(key = %key, "revalidation exceeded 30s deadline"),
            }
        });
        true
    }
}

impl Default for Revalidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Implements §4.8 steps 1-6.
pub async fn revalidate_once(
    key: &str,
    path: &str,
    raw_query: &str,
    by: RevalidatedBy,
    ram: &RamTier,
    disk: &DiskTier,
    origin: &OriginFetcher,
) -> RevalidationOutcome {
    let fetched = match origin.fetch(path, raw_query, &[]).await {
        Ok(f) => f,
        Err(e) => {
            // Transport failure: return silently, do not invalidate (§7).
            debug!(key = %key, error = %e, "revalidation transport failure, leaving entry untouched");
            return RevalidationOutcome::Error;
        }
    };

    if fetched.status_kind == StatusKind::IgnoreByStatus {
        ram.delete(key);
        disk.delete(key).await;
        debug!(key = %key, status = fetched.status, "revalidation saw non-2xx, deleted from both tiers");
        return RevalidationOutcome::IgnoredStatus;
    }

    if !is_cacheable(&fetched.header) {
        ram.delete(key);
        disk.delete(key).await;
        debug!(key = %key, "revalidation response no longer cacheable, deleted from both tiers");
        return RevalidationOutcome::IgnoredCc;
    }

    let new_hash = crc32_of(&fetched.body);
    let current = ram.peek(key).or(disk.peek(key).await);

    if let Some(mut current_entry) = current {
        // A seed has hash32 == 0 (its placeholder for an empty body), which
        // can collide with a genuinely empty fetched body. A seed must
        // always be activated by its first revalidation regardless, or it
        // is stuck serving as inactive forever (§6 warmup-activation).
        if current_entry.hash32 == new_hash && !current_entry.inactive {
            // No-op fast path: must not touch stored_at or LRU position, but
            // the revalidation stamp itself still needs to reach both tiers.
            current_entry.mark_unchanged_revalidation(by);
            ram.put(key, current_entry.clone(), disk).await;
            disk.put_async(key.to_string(), current_entry).await;
            return RevalidationOutcome::Unchanged;
        }
        current_entry.apply_revalidated(fetched.status, fetched.header, fetched.body, by);
        ram.put(key, current_entry.clone(), disk).await;
        disk.put_async(key.to_string(), current_entry).await;
        return RevalidationOutcome::Updated;
    }

    // No current entry at all (e.g. warming a never-seen key): treat as a
    // fresh write.
    let mut new_entry = crate::entry::CacheEntry::new_active(
        fetched.status,
        fetched.header,
        fetched.body,
        crate::entry::DiscoveredBy::User,
    );
    new_entry.revalidated_by = by;
    ram.put(key, new_entry.clone(), disk).await;
    disk.put_async(key.to_string(), new_entry).await;
    RevalidationOutcome::Updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{CacheEntry, DiscoveredBy, HeaderMultiMap};
    use crate::ratelog::RateLimitedLogger;

    async fn test_disk() -> (DiskTier, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskTier::open(dir.path(), u64::MAX, Duration::from_secs(60)).unwrap();
        (disk, dir)
    }

    #[tokio::test]
    async fn transport_failure_leaves_existing_entry_untouched() {
        let ram = RamTier::new(1_000_000, RateLimitedLogger::new(Duration::from_secs(60)));
        let (disk, _dir) = test_disk().await;
        let entry = CacheEntry::new_active(200, HeaderMultiMap::new(), b"v1".to_vec(), DiscoveredBy::User);
        ram.put("/x", entry, &disk).await;

        let origin = OriginFetcher::new("http://127.0.0.1:1".to_string(), Duration::from_millis(1)).unwrap();
        // Unreachable origin simulates transport failure -> must NOT delete.
        let outcome = revalidate_once("/x", "/x", "", RevalidatedBy::User, &ram, &disk, &origin).await;
        assert_eq!(outcome, RevalidationOutcome::Error);
        assert!(ram.peek("/x").is_some(), "transport failure must not invalidate existing entry");
    }

    #[tokio::test]
    async fn non_2xx_deletes_from_both_tiers() {
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/x"))
            .respond_with(wiremock::ResponseTemplate::new(500).insert_header("Cache-Control", "no-cache").set_body_string("boom"))
            .mount(&mock_server)
            .await;

        let ram = RamTier::new(1_000_000, RateLimitedLogger::new(Duration::from_secs(60)));
        let (disk, _dir) = test_disk().await;
        let entry = CacheEntry::new_active(200, HeaderMultiMap::new(), b"v1".to_vec(), DiscoveredBy::User);
        ram.put("/x", entry.clone(), &disk).await;
        disk.put_async("/x".to_string(), entry).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let origin = OriginFetcher::new(mock_server.uri(), Duration::from_secs(5)).unwrap();
        let outcome = revalidate_once("/x", "/x", "", RevalidatedBy::User, &ram, &disk, &origin).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(outcome, RevalidationOutcome::IgnoredStatus);
        assert!(ram.peek("/x").is_none(), "a real non-2xx must invalidate the ram entry");
        assert!(disk.peek("/x").await.is_none(), "a real non-2xx must invalidate the disk entry");
    }

    #[tokio::test]
    async fn seed_is_activated_even_when_fetched_body_is_also_empty() {
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/a"))
            .respond_with(wiremock::ResponseTemplate::new(200).insert_header("Cache-Control", "public"))
            .mount(&mock_server)
            .await;

        let ram = RamTier::new(1_000_000, RateLimitedLogger::new(Duration::from_secs(60)));
        let (disk, _dir) = test_disk().await;
        disk.put_async("/a".to_string(), CacheEntry::new_seed()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let origin = OriginFetcher::new(mock_server.uri(), Duration::from_secs(5)).unwrap();
        let outcome = revalidate_once("/a", "/a", "", RevalidatedBy::Warmup, &ram, &disk, &origin).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(outcome, RevalidationOutcome::Updated, "a seed's first revalidation must activate it, not no-op");
        let active = disk.peek("/a").await.expect("entry must still exist");
        assert!(!active.inactive, "seed must be flipped to active");
    }
}
