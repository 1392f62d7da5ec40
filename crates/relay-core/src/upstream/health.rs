//! Background health monitor.
//!
//! Probes every non-draining endpoint with `eth_blockNumber` once per
//! configured interval, feeding latency EWMAs, block lag, and the endpoint
//! state machine. Probes consume real rate budget; an endpoint already at
//! its TPS cap is skipped (it is obviously live) rather than pushed over.

use crate::{
    cache::RelayCache,
    config::RelayConfig,
    metrics::{endpoint_row, MetricsCollector},
    types::JsonRpcRequest,
    upstream::{
        endpoint::{EndpointStatus, RECOVERY_PROBE_THRESHOLD, UNHEALTHY_ERROR_THRESHOLD},
        errors::UpstreamError,
        http_client::HttpClient,
        registry::{EndpointMember, EndpointRegistry},
    },
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::broadcast;

/// Probe request timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Periodically probes upstream endpoints and owns their state transitions.
pub struct HealthMonitor {
    registry: Arc<EndpointRegistry>,
    http: Arc<HttpClient>,
    cache: Arc<RelayCache>,
    metrics: Arc<MetricsCollector>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(
        registry: Arc<EndpointRegistry>,
        http: Arc<HttpClient>,
        cache: Arc<RelayCache>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self { registry, http, cache, metrics }
    }

    /// Spawns the monitor worker. The probe cadence follows the current
    /// snapshot, so a reloaded `monitor_interval` takes effect on the next
    /// tick.
    #[must_use]
    pub fn start(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let period =
                    Duration::from_secs(self.registry.current().config.relay.monitor_interval);

                tokio::select! {
                    () = tokio::time::sleep(period) => self.tick().await,
                    _ = shutdown_rx.recv() => {
                        tracing::info!("health monitor shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// One monitor pass: probe, recompute block lag, apply transitions,
    /// export gauges, sweep the cache.
    pub async fn tick(&self) {
        let snapshot = self.registry.current();

        for member in &snapshot.members {
            if member.endpoint.is_draining() {
                continue;
            }

            // Probes consume real rate budget; an endpoint with no room is
            // at its cap and therefore obviously live - skip it.
            if !member.endpoint.rate().try_acquire(&member.limits(), Instant::now()) {
                tracing::debug!(url = %member.endpoint.url(), "probe skipped, endpoint at rate cap");
                continue;
            }

            match self.probe(member, &snapshot.config).await {
                Ok(latency_ms) => {
                    tracing::trace!(
                        url = %member.endpoint.url(),
                        latency_ms,
                        "health probe succeeded"
                    );
                }
                Err(e) => {
                    member.endpoint.probe_err();
                    tracing::warn!(url = %member.endpoint.url(), error = %e, "health probe failed");
                }
            }
        }

        let tick_done = Instant::now();
        recompute_block_lag(&snapshot.members);

        for member in &snapshot.members {
            apply_transitions(member, &snapshot.config, tick_done);
            self.metrics.record_endpoint_gauges(&endpoint_row(member, tick_done));
        }

        self.cache.purge_expired(tick_done);
    }

    /// Sends one `eth_blockNumber` probe and records its result on the
    /// endpoint. Returns the observed latency.
    async fn probe(&self, member: &EndpointMember, config: &RelayConfig) -> Result<u64, UpstreamError> {
        let request = JsonRpcRequest::new("eth_blockNumber", None, serde_json::json!(1));
        let body = serde_json::to_vec(&request)
            .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;

        let started = Instant::now();

        let bytes = self
            .http
            .post_json(member.endpoint.url(), bytes::Bytes::from(body), PROBE_TIMEOUT)
            .await?;

        #[allow(clippy::cast_possible_truncation)]
        let latency_ms = started.elapsed().as_millis() as u64;

        let reply: crate::types::JsonRpcResponse = serde_json::from_slice(&bytes)
            .map_err(|e| UpstreamError::InvalidResponse(format!("probe reply not JSON-RPC: {e}")))?;

        if let Some(error) = reply.error {
            return Err(UpstreamError::InvalidResponse(format!(
                "probe rejected: {} {}",
                error.code, error.message
            )));
        }

        let height = reply
            .result
            .as_ref()
            .and_then(serde_json::Value::as_str)
            .and_then(|hex| u64::from_str_radix(hex.trim_start_matches("0x"), 16).ok())
            .ok_or_else(|| {
                UpstreamError::InvalidResponse("probe reply carried no block number".to_string())
            })?;

        let threshold = member.spec.max_latency_ms.or(config.relay.latency_threshold_ms);
        let under_threshold = threshold.map_or(true, |max| latency_ms <= max);
        member.endpoint.probe_ok(latency_ms, height, under_threshold);

        Ok(latency_ms)
    }
}

/// Recomputes `blocks_behind` for every endpoint with a known height against
/// the freshest height in the pool.
fn recompute_block_lag(members: &[EndpointMember]) {
    let max_height = members
        .iter()
        .filter_map(|member| member.endpoint.health().last_block_height)
        .max();

    let Some(max_height) = max_height else {
        return;
    };

    for member in members {
        let behind = member
            .endpoint
            .health()
            .last_block_height
            .map(|height| max_height.saturating_sub(height));
        if behind.is_some() {
            member.endpoint.set_blocks_behind(behind);
        }
    }
}

/// Applies the per-tick state transitions for one endpoint.
///
/// Degradation (errors, lag, latency ceiling) wins over throttle
/// bookkeeping; recovery from unhealthy requires the probe streak.
fn apply_transitions(member: &EndpointMember, config: &RelayConfig, now: Instant) {
    let limits = member.limits();
    let (tps, _) = member.endpoint.rate().counts(now);
    let url = member.endpoint.url().to_string();

    member.endpoint.with_state(|state| {
        let over_errors = state.consecutive_errors >= UNHEALTHY_ERROR_THRESHOLD;
        let lagging = state
            .blocks_behind
            .is_some_and(|behind| behind > config.health_monitor.max_blocks_behind);
        #[allow(clippy::cast_precision_loss)]
        let over_latency = match (member.spec.max_latency_ms, state.ewma_latency_ms) {
            (Some(max), Some(ewma)) => ewma > max as f64,
            _ => false,
        };

        match state.status {
            EndpointStatus::Healthy | EndpointStatus::Throttled
                if over_errors || lagging || over_latency =>
            {
                state.status = EndpointStatus::Unhealthy;
                state.consecutive_probe_oks = 0;
                tracing::warn!(
                    url = %url,
                    consecutive_errors = state.consecutive_errors,
                    blocks_behind = ?state.blocks_behind,
                    ewma_latency_ms = ?state.ewma_latency_ms,
                    "endpoint marked unhealthy"
                );
            }
            EndpointStatus::Healthy => {
                if tps >= limits.max_tps as usize {
                    state.status = EndpointStatus::Throttled;
                    tracing::info!(url = %url, tps, max_tps = limits.max_tps, "endpoint throttled");
                }
            }
            EndpointStatus::Throttled => {
                if tps < limits.max_tps as usize {
                    state.status = EndpointStatus::Healthy;
                    tracing::info!(url = %url, "endpoint back under rate cap");
                }
            }
            EndpointStatus::Unhealthy => {
                if state.consecutive_probe_oks >= RECOVERY_PROBE_THRESHOLD {
                    state.status = EndpointStatus::Healthy;
                    state.consecutive_errors = 0;
                    tracing::info!(url = %url, "endpoint recovered");
                }
            }
        }
    });
}
