//! Per-URL endpoint state: health, latency, and the rate window.
//!
//! An [`Endpoint`] is created when a config snapshot first mentions its URL
//! and lives for as long as some snapshot (or in-flight request) references
//! it. Identity data (tier, weight, rate caps) stays in the snapshot; this
//! type owns only the mutable state that must survive config reloads.

use crate::upstream::rate::RateWindow;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

/// How many consecutive outbound failures mark an endpoint unhealthy.
pub const UNHEALTHY_ERROR_THRESHOLD: u32 = 3;

/// How many consecutive in-threshold probe successes recover an unhealthy
/// endpoint.
pub const RECOVERY_PROBE_THRESHOLD: u32 = 2;

/// EWMA smoothing: `ewma = ALPHA * sample + (1 - ALPHA) * prev`.
const EWMA_ALPHA: f64 = 0.3;

/// Selection status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Healthy,
    Throttled,
    Unhealthy,
}

impl EndpointStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Throttled => "throttled",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable health state, guarded by a short critical section.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub status: EndpointStatus,
    pub last_latency_ms: Option<u64>,
    pub ewma_latency_ms: Option<f64>,
    pub last_block_height: Option<u64>,
    pub blocks_behind: Option<u64>,
    pub consecutive_errors: u32,
    /// Successful in-threshold probes since the last failure; drives
    /// unhealthy -> healthy recovery.
    pub consecutive_probe_oks: u32,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: EndpointStatus::Healthy,
            last_latency_ms: None,
            ewma_latency_ms: None,
            last_block_height: None,
            blocks_behind: None,
            consecutive_errors: 0,
            consecutive_probe_oks: 0,
        }
    }
}

/// One upstream endpoint. Shared between the registry snapshot, the health
/// monitor, and any in-flight requests via `Arc`.
pub struct Endpoint {
    url: Arc<str>,
    state: Mutex<HealthState>,
    rate: RateWindow,
    total_calls: AtomicU64,
    draining: AtomicBool,
}

impl Endpoint {
    #[must_use]
    pub fn new(url: &str) -> Self {
        Self {
            url: Arc::from(url),
            state: Mutex::new(HealthState::default()),
            rate: RateWindow::new(),
            total_calls: AtomicU64::new(0),
            draining: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn rate(&self) -> &RateWindow {
        &self.rate
    }

    /// Marks the endpoint as removed by a config reload. Draining endpoints
    /// finish their in-flight calls but are excluded from selection.
    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn status(&self) -> EndpointStatus {
        self.state.lock().status
    }

    /// Snapshot of the health state for metrics and selection filters.
    #[must_use]
    pub fn health(&self) -> HealthState {
        self.state.lock().clone()
    }

    /// Runs `f` under the state lock. The closure must not block.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut HealthState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn record_call(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Records a successful outbound request on the dispatch path.
    pub fn record_success(&self, latency_ms: u64) {
        let mut state = self.state.lock();
        update_latency(&mut state, latency_ms);
        state.consecutive_errors = 0;
    }

    /// Records an outbound transport failure. After
    /// [`UNHEALTHY_ERROR_THRESHOLD`] consecutive failures the endpoint is
    /// taken out of rotation. Returns the new consecutive error count.
    pub fn record_failure(&self) -> u32 {
        let mut state = self.state.lock();
        state.consecutive_errors += 1;
        state.consecutive_probe_oks = 0;

        if state.consecutive_errors >= UNHEALTHY_ERROR_THRESHOLD
            && state.status != EndpointStatus::Unhealthy
        {
            state.status = EndpointStatus::Unhealthy;
            tracing::warn!(
                url = %self.url,
                consecutive_errors = state.consecutive_errors,
                "endpoint marked unhealthy after consecutive errors"
            );
        }

        state.consecutive_errors
    }

    /// Records a successful health probe. `under_threshold` says whether the
    /// observed latency was below the recovery threshold; only those probes
    /// advance the recovery counter.
    pub fn probe_ok(&self, latency_ms: u64, block_height: u64, under_threshold: bool) {
        let mut state = self.state.lock();
        update_latency(&mut state, latency_ms);
        state.consecutive_errors = 0;
        state.last_block_height = Some(block_height);
        if under_threshold {
            state.consecutive_probe_oks += 1;
        } else {
            state.consecutive_probe_oks = 0;
        }
    }

    /// Records a failed health probe.
    pub fn probe_err(&self) {
        let mut state = self.state.lock();
        state.consecutive_errors += 1;
        state.consecutive_probe_oks = 0;
        state.blocks_behind = None;
    }

    /// Updates the lag of this endpoint behind the freshest block height
    /// observed across the pool this tick.
    pub fn set_blocks_behind(&self, behind: Option<u64>) {
        self.state.lock().blocks_behind = behind;
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url)
            .field("status", &self.status())
            .field("draining", &self.is_draining())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::cast_precision_loss)]
fn update_latency(state: &mut HealthState, latency_ms: u64) {
    state.last_latency_ms = Some(latency_ms);
    let sample = latency_ms as f64;
    state.ewma_latency_ms = Some(match state.ewma_latency_ms {
        Some(prev) => EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * prev,
        None => sample,
    });
}
