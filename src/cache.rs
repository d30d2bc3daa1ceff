//! Response Cache (C3).
//!
//! Keys on a digest of everything that could change the answer — prompt,
//! provider, temperature, and the caller's desired response shape — not
//! on the prompt text alone. Concurrent callers asking the same question
//! before it is answered share one in-flight call (single-flight) rather
//! than each dispatching to the provider.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::{Notify, RwLock};

use crate::provider::ProviderResponse;

/// Opaque digest over `(prompt, provider, temperature, response_format)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn new(prompt: &str, provider: &str, temperature: f64, response_format: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        hasher.update([0u8]);
        hasher.update(provider.as_bytes());
        hasher.update([0u8]);
        hasher.update(temperature.to_bits().to_le_bytes());
        hasher.update([0u8]);
        hasher.update(response_format.as_bytes());
        CacheKey(hasher.finalize().into())
    }
}

#[derive(Clone)]
struct CacheEntry {
    response: ProviderResponse,
    inserted_at: Instant,
}

/// A single pending call: other callers asking for the same key wait on
/// `ready` instead of dispatching their own request. `error` carries the
/// leader's error when `fetch` fails, so followers woken by `ready` can
/// share that same failure instead of panicking on a cache miss.
struct InFlight<E> {
    ready: Arc<Notify>,
    error: Arc<std::sync::Mutex<Option<E>>>,
}

impl<E> Clone for InFlight<E> {
    fn clone(&self) -> Self {
        InFlight {
            ready: self.ready.clone(),
            error: self.error.clone(),
        }
    }
}

pub struct ResponseCache {
    ttl: Duration,
    capacity: usize,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    order: RwLock<VecDeque<CacheKey>>,
    /// Type-erased `InFlight<E>`, since each `get_or_fetch` call picks its
    /// own error type but the map is shared across every key.
    in_flight: tokio::sync::Mutex<HashMap<CacheKey, Arc<dyn Any + Send + Sync>>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        ResponseCache {
            ttl,
            capacity,
            entries: RwLock::new(HashMap::new()),
            order: RwLock::new(VecDeque::new()),
            in_flight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: CacheKey) -> Option<ProviderResponse> {
        let entries = self.entries.read().await;
        let entry = entries.get(&key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.response.clone())
    }

    /// Inserts a response, evicting the oldest 20% of entries when the
    /// cache is at capacity (insertion order, not access order — this
    /// crate does not track per-entry access recency).
    pub async fn put(&self, key: CacheKey, response: ProviderResponse) {
        let mut entries = self.entries.write().await;
        let mut order = self.order.write().await;

        if !entries.contains_key(&key) {
            order.push_back(key);
        }
        entries.insert(
            key,
            CacheEntry {
                response,
                inserted_at: Instant::now(),
            },
        );

        if entries.len() > self.capacity {
            let evict_count = (self.capacity / 5).max(1);
            for _ in 0..evict_count {
                if let Some(oldest) = order.pop_front() {
                    entries.remove(&oldest);
                } else {
                    break;
                }
            }
        }
    }

    /// Runs `fetch` at most once per key among concurrent callers: the
    /// first caller for a key dispatches `fetch` and broadcasts the
    /// result; any caller arriving while that call is in flight waits on
    /// the same `Notify` rather than issuing a second provider call. A
    /// follower sees whatever the leader saw, success or failure — it
    /// never manufactures its own error for a cache miss it didn't cause.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: CacheKey, fetch: F) -> Result<ProviderResponse, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<ProviderResponse, E>>,
        E: Clone + Send + Sync + 'static,
    {
        if let Some(cached) = self.get(key).await {
            return Ok(cached);
        }

        let (leader, slot) = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get(&key) {
                let slot = existing
                    .clone()
                    .downcast::<InFlight<E>>()
                    .expect("a given cache key is only ever fetched with one error type");
                (false, slot)
            } else {
                let slot = Arc::new(InFlight::<E> {
                    ready: Arc::new(Notify::new()),
                    error: Arc::new(std::sync::Mutex::new(None)),
                });
                in_flight.insert(key, slot.clone());
                (true, slot)
            }
        };

        if !leader {
            slot.ready.notified().await;
            if let Some(err) = slot.error.lock().unwrap().clone() {
                return Err(err);
            }
            return self
                .get(key)
                .await
                .ok_or_else(|| unreachable!("leader clears the slot only after populating the cache or the error"));
        }

        let result = fetch().await;
        match &result {
            Ok(response) => self.put(key, response.clone()).await,
            Err(e) => *slot.error.lock().unwrap() = Some(e.clone()),
        }
        self.in_flight.lock().await.remove(&key);
        slot.ready.notify_waiters();
        result
    }
}
