//! Request coalescing: prevents the "thundering herd" problem (§8
//! "At-most-one-concurrent-build per key"). When multiple misses arrive for
//! the same key, only one fetch reaches the origin tiers and all waiters
//! receive the same result.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::entry::HeaderMultiMap;

/// The shared result of a coalesced miss-path fetch.
#[derive(Debug, Clone)]
pub struct CoalescedResponse {
    pub status: u16,
    pub header: HeaderMultiMap,
    pub body: Vec<u8>,
    pub tag: &'static str,
}

struct CoalescerInner {
    in_flight: DashMap<String, broadcast::Sender<Result<CoalescedResponse, String>>>,
    max_waiters: usize,
}

/// Manages in-flight requests to prevent duplicate origin fetches.
#[derive(Clone)]
pub struct RequestCoalescer {
    inner: Arc<CoalescerInner>,
}

impl RequestCoalescer {
    pub fn new(max_waiters: usize) -> Self {
        Self { inner: Arc::new(CoalescerInner { in_flight: DashMap::new(), max_waiters }) }
    }

    /// Returns `Fetch` (this caller should fetch from origin) or `Wait`
    /// (another caller is already fetching; subscribe to its result).
    pub fn try_acquire(&self, cache_key: &str) -> AcquireResult {
        if let Some(sender) = self.inner.in_flight.get(cache_key) {
            let receiver = sender.subscribe();
            debug!(cache_key = %cache_key, "coalescing request with in-flight fetch");
            return AcquireResult::Wait(receiver);
        }

        let (tx, _) = broadcast::channel(self.inner.max_waiters);
        self.inner.in_flight.insert(cache_key.to_string(), tx);

        debug!(cache_key = %cache_key, "acquired origin fetch lock");
        AcquireResult::Fetch(FetchGuard { cache_key: cache_key.to_string(), inner: Arc::clone(&self.inner) })
    }
}

pub enum AcquireResult {
    Fetch(FetchGuard),
    Wait(broadcast::Receiver<Result<CoalescedResponse, String>>),
}

/// Guard that notifies waiters when the fetch completes (or is dropped
/// without completing, e.g. on panic or early return).
pub struct FetchGuard {
    cache_key: String,
    inner: Arc<CoalescerInner>,
}

impl FetchGuard {
    pub fn complete(self, response: CoalescedResponse) {
        self.complete_internal(Ok(response));
    }

    pub fn complete_error(self, error: String) {
        self.complete_internal(Err(error));
    }

    fn complete_internal(self, result: Result<CoalescedResponse, String>) {
        if let Some((_, sender)) = self.inner.in_flight.remove(&self.cache_key) {
            let waiter_count = sender.receiver_count();
            if waiter_count > 0 {
                info!(cache_key = %self.cache_key, waiters = waiter_count, "notifying coalesced request waiters");
            }
            let _ = sender.send(result);
        }
        std::mem::forget(self);
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        if let Some((_, sender)) = self.inner.in_flight.remove(&self.cache_key) {
            let _ = sender.send(Err("request was cancelled".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &str) -> CoalescedResponse {
        CoalescedResponse { status: 200, header: HeaderMultiMap::new(), body: body.as_bytes().to_vec(), tag: "miss" }
    }

    #[tokio::test]
    async fn single_request_acquires_and_releases() {
        let coalescer = RequestCoalescer::new(100);
        match coalescer.try_acquire("k") {
            AcquireResult::Fetch(guard) => guard.complete(response("v1")),
            AcquireResult::Wait(_) => panic!("should have acquired"),
        }
        match coalescer.try_acquire("k") {
            AcquireResult::Fetch(guard) => guard.complete(response("v2")),
            AcquireResult::Wait(_) => panic!("should have acquired a fresh lock"),
        }
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let coalescer = RequestCoalescer::new(100);
        let guard = match coalescer.try_acquire("k") {
            AcquireResult::Fetch(g) => g,
            AcquireResult::Wait(_) => panic!("should have acquired"),
        };
        let mut r1 = match coalescer.try_acquire("k") {
            AcquireResult::Wait(rx) => rx,
            AcquireResult::Fetch(_) => panic!("should have waited"),
        };
        let mut r2 = match coalescer.try_acquire("k") {
            AcquireResult::Wait(rx) => rx,
            AcquireResult::Fetch(_) => panic!("should have waited"),
        };

        guard.complete(response("shared"));

        let got1 = r1.recv().await.unwrap().unwrap();
        let got2 = r2.recv().await.unwrap().unwrap();
        assert_eq!(got1.body, b"shared");
        assert_eq!(got2.body, b"shared");
    }

    #[tokio::test]
    async fn error_propagates_to_waiters() {
        let coalescer = RequestCoalescer::new(100);
        let guard = match coalescer.try_acquire("k") {
            AcquireResult::Fetch(g) => g,
            AcquireResult::Wait(_) => panic!("should have acquired"),
        };
        let mut waiter = match coalescer.try_acquire("k") {
            AcquireResult::Wait(rx) => rx,
            AcquireResult::Fetch(_) => panic!("should have waited"),
        };
        guard.complete_error("origin error".to_string());
        let result = waiter.recv().await.unwrap();
        assert_eq!(result.unwrap_err(), "origin error");
    }
}
