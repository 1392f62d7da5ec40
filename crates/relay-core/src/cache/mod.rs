//! TTL response cache with single-flight coalescing.
//!
//! The cache is keyed by `(method, canonical params)`. Methods with a
//! configured TTL are cached and coalesced: concurrent misses for the same
//! key elect one leader whose outbound call resolves every waiter. Methods
//! without a TTL bypass this module entirely - coalescing write-like or
//! fast-moving methods is unsafe.
//!
//! Leadership is an RAII guard. A leader that resolves via
//! [`FlightGuard::complete`] wakes its waiters with the outcome; a leader
//! that is dropped unresolved (panic, cancellation) fails them instead of
//! leaving them parked. Failures never install a cache entry.

use crate::types::{canonical_params, JsonRpcError};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::watch;

/// Cache key: method plus the canonical parameter encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: String,
    params: String,
}

impl CacheKey {
    #[must_use]
    pub fn new(method: &str, params: Option<&serde_json::Value>) -> Self {
        Self { method: method.to_string(), params: canonical_params(params) }
    }
}

/// What a single-flight leader produced, shared with every waiter.
#[derive(Debug, Clone)]
pub enum FlightOutcome {
    /// Upstream returned a result; waiters respond with it under their own id.
    Success(Arc<serde_json::Value>),
    /// Upstream returned a JSON-RPC error envelope, forwarded verbatim.
    RpcError(JsonRpcError),
    /// The leader's dispatch failed before producing an envelope.
    Failed(FlightFailure),
}

/// Why a flight failed without an upstream envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightFailure {
    /// No endpoint became selectable within the bounded wait.
    NoEndpoint,
    /// The outbound call failed on transport (after the retry).
    Upstream,
    /// The leader was dropped before resolving.
    Abandoned,
}

struct CacheEntry {
    value: Arc<serde_json::Value>,
    expires_at: Instant,
}

type InflightMap = HashMap<CacheKey, watch::Receiver<Option<FlightOutcome>>>;

/// Outcome of [`RelayCache::begin`].
pub enum Begin {
    /// Fresh cached value.
    Hit(Arc<serde_json::Value>),
    /// Another request is already fetching this key; await its outcome.
    Join(watch::Receiver<Option<FlightOutcome>>),
    /// The caller is the leader and must resolve the guard.
    Lead(FlightGuard),
}

/// TTL cache plus the in-flight token registry.
pub struct RelayCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    inflight: Arc<Mutex<InflightMap>>,
}

impl Default for RelayCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayCache {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()), inflight: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Returns the cached value if one exists and is fresh. Expired entries
    /// are evicted lazily here.
    pub fn lookup(&self, key: &CacheKey, now: Instant) -> Option<Arc<serde_json::Value>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if now < entry.expires_at => Some(Arc::clone(&entry.value)),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Atomically resolves a key into a hit, a waiter on an existing flight,
    /// or leadership of a new flight.
    pub fn begin(&self, key: &CacheKey, now: Instant) -> Begin {
        if let Some(value) = self.lookup(key, now) {
            return Begin::Hit(value);
        }

        let mut inflight = self.inflight.lock();

        // Re-check under the inflight lock: a leader may have filled the
        // cache between the lookup above and here.
        if let Some(value) = self.lookup(key, now) {
            return Begin::Hit(value);
        }

        if let Some(receiver) = inflight.get(key) {
            return Begin::Join(receiver.clone());
        }

        let (sender, receiver) = watch::channel(None);
        inflight.insert(key.clone(), receiver);
        Begin::Lead(FlightGuard {
            inflight: Arc::clone(&self.inflight),
            key: key.clone(),
            sender: Some(sender),
        })
    }

    /// Installs a cache entry. Called by the leader before resolving its
    /// guard with the same value.
    pub fn insert(&self, key: CacheKey, value: Arc<serde_json::Value>, ttl: Duration, now: Instant) {
        self.entries.lock().insert(key, CacheEntry { value, expires_at: now + ttl });
    }

    /// Drops every expired entry. Periodic housekeeping; correctness only
    /// needs the lazy eviction in [`Self::lookup`].
    pub fn purge_expired(&self, now: Instant) {
        self.entries.lock().retain(|_, entry| now < entry.expires_at);
    }

    /// Number of live entries (fresh or not yet purged).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// RAII leadership of one in-flight fetch.
///
/// Exactly one of [`complete`](Self::complete) or drop runs: completion
/// publishes the real outcome, drop publishes [`FlightFailure::Abandoned`].
/// Either way the token leaves the registry first, so a request arriving
/// after resolution starts a new flight instead of joining a dead one.
pub struct FlightGuard {
    inflight: Arc<Mutex<InflightMap>>,
    key: CacheKey,
    sender: Option<watch::Sender<Option<FlightOutcome>>>,
}

impl FlightGuard {
    /// Resolves every waiter with `outcome` and retires the token.
    pub fn complete(mut self, outcome: FlightOutcome) {
        self.resolve(outcome);
    }

    fn resolve(&mut self, outcome: FlightOutcome) {
        if let Some(sender) = self.sender.take() {
            self.inflight.lock().remove(&self.key);
            let _ = sender.send(Some(outcome));
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.resolve(FlightOutcome::Failed(FlightFailure::Abandoned));
    }
}
