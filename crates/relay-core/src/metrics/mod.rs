//! Metrics: Prometheus export on the hot path plus an in-process snapshot
//! for the status endpoint.
//!
//! Counters and histograms go through the `metrics` facade backed by a
//! Prometheus recorder (installed once per process). The dashboard-facing
//! numbers - per-endpoint TPS/TPM windows, EWMA latency, status - are read
//! directly from the live endpoint state when a snapshot is requested, so
//! they are always current without a collection thread.

use crate::upstream::registry::RegistrySnapshot;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
    time::Instant,
};
use thiserror::Error;

static PROMETHEUS_HANDLE: OnceLock<Result<PrometheusHandle, String>> = OnceLock::new();

/// Installs the process-wide recorder exactly once; later callers share the
/// handle (or the original failure).
fn prometheus_handle() -> Result<PrometheusHandle, MetricsError> {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new().install_recorder().map_err(|e| e.to_string())
        })
        .clone()
        .map_err(MetricsError)
}

/// Error installing the metrics recorder.
#[derive(Error, Debug)]
#[error("failed to install metrics recorder: {0}")]
pub struct MetricsError(String);

/// Per-endpoint row of the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointMetrics {
    pub url: String,
    pub tier: String,
    pub status: String,
    pub draining: bool,
    pub block_height: Option<u64>,
    pub blocks_behind: Option<u64>,
    pub last_latency_ms: Option<u64>,
    pub ewma_latency_ms: Option<f64>,
    pub tps: usize,
    pub tpm: usize,
    pub consecutive_errors: u32,
    pub total_calls: u64,
}

/// Global relay totals plus the endpoint table, served at `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub total_calls: u64,
    pub cache_hits: u64,
    pub coalesced_calls: u64,
    pub hit_rate: f64,
    pub endpoints: Vec<EndpointMetrics>,
}

/// Relay-wide metrics collector.
pub struct MetricsCollector {
    handle: PrometheusHandle,
    total_calls: AtomicU64,
    cache_hits: AtomicU64,
    coalesced_calls: AtomicU64,
}

impl MetricsCollector {
    /// Creates the collector, installing the process-wide Prometheus
    /// recorder on first use.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the recorder cannot be installed.
    pub fn new() -> Result<Self, MetricsError> {
        Ok(Self {
            handle: prometheus_handle()?,
            total_calls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            coalesced_calls: AtomicU64::new(0),
        })
    }

    /// Records an accepted client request.
    pub fn record_request(&self, method: &str) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        counter!("relay_requests_total", "method" => method.to_string()).increment(1);
    }

    /// Records a response served from the TTL cache.
    pub fn record_cache_hit(&self, method: &str) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        counter!("relay_cache_hits_total", "method" => method.to_string()).increment(1);
    }

    /// Records a response served by joining another request's flight.
    pub fn record_coalesced(&self, method: &str) {
        self.coalesced_calls.fetch_add(1, Ordering::Relaxed);
        counter!("relay_coalesced_total", "method" => method.to_string()).increment(1);
    }

    /// Records a completed outbound call.
    pub fn record_upstream_call(&self, url: &str, method: &str, latency_ms: u64) {
        #[allow(clippy::cast_precision_loss)]
        histogram!(
            "relay_upstream_latency_ms",
            "upstream" => url.to_string(),
            "method" => method.to_string()
        )
        .record(latency_ms as f64);
    }

    /// Records an outbound transport failure.
    pub fn record_upstream_error(&self, url: &str) {
        counter!("relay_upstream_errors_total", "upstream" => url.to_string()).increment(1);
    }

    /// Exports one endpoint's gauges; called by the health monitor each tick.
    pub fn record_endpoint_gauges(&self, row: &EndpointMetrics) {
        let url = row.url.clone();
        #[allow(clippy::cast_precision_loss)]
        {
            gauge!("relay_endpoint_healthy", "upstream" => url.clone())
                .set(if row.status == "healthy" { 1.0 } else { 0.0 });
            gauge!("relay_endpoint_tps", "upstream" => url.clone()).set(row.tps as f64);
            gauge!("relay_endpoint_tpm", "upstream" => url.clone()).set(row.tpm as f64);
            if let Some(ewma) = row.ewma_latency_ms {
                gauge!("relay_endpoint_ewma_latency_ms", "upstream" => url.clone()).set(ewma);
            }
            if let Some(behind) = row.blocks_behind {
                gauge!("relay_endpoint_blocks_behind", "upstream" => url).set(behind as f64);
            }
        }
    }

    /// Builds the status payload from the live endpoint state.
    #[must_use]
    pub fn status(&self, snapshot: &RegistrySnapshot, now: Instant) -> RelayStatus {
        let endpoints = snapshot
            .members
            .iter()
            .map(|member| endpoint_row(member, now))
            .collect();

        let total_calls = self.total_calls.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if total_calls > 0 {
            cache_hits as f64 / total_calls as f64
        } else {
            0.0
        };

        RelayStatus {
            total_calls,
            cache_hits,
            coalesced_calls: self.coalesced_calls.load(Ordering::Relaxed),
            hit_rate,
            endpoints,
        }
    }

    /// Renders the Prometheus exposition text.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        self.handle.render()
    }
}

/// Builds one status row from a snapshot member.
#[must_use]
pub fn endpoint_row(
    member: &crate::upstream::registry::EndpointMember,
    now: Instant,
) -> EndpointMetrics {
    let health = member.endpoint.health();
    let (tps, tpm) = member.endpoint.rate().counts(now);

    EndpointMetrics {
        url: member.endpoint.url().to_string(),
        tier: member.tier.to_string(),
        status: health.status.as_str().to_string(),
        draining: member.endpoint.is_draining(),
        block_height: health.last_block_height,
        blocks_behind: health.blocks_behind,
        last_latency_ms: health.last_latency_ms,
        ewma_latency_ms: health.ewma_latency_ms,
        tps,
        tpm,
        consecutive_errors: health.consecutive_errors,
        total_calls: member.endpoint.total_calls(),
    }
}
