//! The dispatcher: orchestrates one client request through rewrite, cache,
//! single-flight, balancer selection, the outbound call, and metrics.
//!
//! Every request resolves the registry snapshot once at entry and uses it
//! for its whole lifetime; config reloads become visible to the *next*
//! request. Health state lives behind `Arc`s shared with the monitor, so a
//! held snapshot still sees endpoints sicken and recover.

use crate::{
    cache::{Begin, CacheKey, FlightFailure, FlightGuard, FlightOutcome, RelayCache},
    metrics::MetricsCollector,
    proxy::errors::RelayError,
    types::{JsonRpcRequest, JsonRpcResponse},
    upstream::{
        balancer::{LoadBalancer, Selection},
        http_client::HttpClient,
        registry::{EndpointRegistry, RegistrySnapshot},
    },
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::watch;

/// Upper bound on one sleep while waiting for rate budget or health
/// recovery, keeping the re-selection loop responsive.
const SELECT_POLL_GRANULARITY: Duration = Duration::from_millis(10);

/// The relay engine. One instance serves all client requests.
pub struct RelayEngine {
    registry: Arc<EndpointRegistry>,
    cache: Arc<RelayCache>,
    balancer: LoadBalancer,
    http: Arc<HttpClient>,
    metrics: Arc<MetricsCollector>,
}

impl RelayEngine {
    #[must_use]
    pub fn new(
        registry: Arc<EndpointRegistry>,
        cache: Arc<RelayCache>,
        http: Arc<HttpClient>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self { registry, cache, balancer: LoadBalancer::new(), http, metrics }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Relays one JSON-RPC request.
    ///
    /// Returns `Ok` both for upstream results and for upstream JSON-RPC
    /// error envelopes (forwarded verbatim). The response `id` always
    /// mirrors the client's.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] when the relay itself fails: no endpoint
    /// available within the bounded wait, or transport failure after the
    /// retry.
    pub async fn process_request(
        &self,
        mut request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, RelayError> {
        rewrite_pending_nonce(&mut request);

        let snapshot = self.registry.current();
        self.metrics.record_request(&request.method);

        let Some(ttl) = snapshot.config.ttl_for(&request.method) else {
            // Non-cacheable methods are never coalesced; every call runs
            // independently.
            let reply = self.fetch(&snapshot, &request).await?;
            return Ok(finish(reply, &request));
        };

        let key = CacheKey::new(&request.method, request.params.as_ref());
        match self.cache.begin(&key, Instant::now()) {
            Begin::Hit(value) => {
                self.metrics.record_cache_hit(&request.method);
                Ok(JsonRpcResponse::success((*value).clone(), Arc::clone(&request.id)))
            }
            Begin::Join(receiver) => {
                self.metrics.record_coalesced(&request.method);
                await_flight(receiver, &request).await
            }
            Begin::Lead(guard) => self.lead_flight(&snapshot, &request, key, ttl, guard).await,
        }
    }

    /// Runs the outbound call as single-flight leader and resolves the
    /// waiters with whatever it produced.
    async fn lead_flight(
        &self,
        snapshot: &RegistrySnapshot,
        request: &JsonRpcRequest,
        key: CacheKey,
        ttl: Duration,
        guard: FlightGuard,
    ) -> Result<JsonRpcResponse, RelayError> {
        match self.fetch(snapshot, request).await {
            Ok(reply) => {
                if let Some(error) = reply.error {
                    // Application-level error: forwarded, never cached.
                    guard.complete(FlightOutcome::RpcError(error.clone()));
                    return Ok(JsonRpcResponse::from_error(error, Arc::clone(&request.id)));
                }

                let value = Arc::new(reply.result.unwrap_or(serde_json::Value::Null));
                self.cache.insert(key, Arc::clone(&value), ttl, Instant::now());
                guard.complete(FlightOutcome::Success(Arc::clone(&value)));
                Ok(JsonRpcResponse::success((*value).clone(), Arc::clone(&request.id)))
            }
            Err(e) => {
                let failure = match &e {
                    RelayError::NoEndpointAvailable => FlightFailure::NoEndpoint,
                    _ => FlightFailure::Upstream,
                };
                guard.complete(FlightOutcome::Failed(failure));
                Err(e)
            }
        }
    }

    /// Selects an endpoint and performs the outbound call, retrying once on
    /// a different endpoint for transport failures.
    async fn fetch(
        &self,
        snapshot: &RegistrySnapshot,
        request: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, RelayError> {
        let wait = Duration::from_secs(snapshot.config.relay.selection_timeout);

        let first = self.select_with_wait(snapshot, Instant::now() + wait, None).await?;
        match self.send_to(snapshot, first, request).await {
            Ok(reply) => Ok(reply),
            Err(e) if e.is_transport() => {
                let failed_url = snapshot.members[first].endpoint.url().to_string();
                tracing::warn!(
                    url = %failed_url,
                    method = %request.method,
                    error = %e,
                    "outbound call failed, retrying on a different endpoint"
                );

                let second = self
                    .select_with_wait(snapshot, Instant::now() + wait, Some(&failed_url))
                    .await?;
                self.send_to(snapshot, second, request).await.map_err(RelayError::Upstream)
            }
            Err(e) => Err(RelayError::Upstream(e)),
        }
    }

    /// Runs the balancer until it yields an endpoint or the deadline passes.
    ///
    /// When every candidate is over its rate budget the loop sleeps until
    /// the earliest budget opens (capped at 10 ms per sleep); when no
    /// candidate is healthy at all it polls, since recovery can arrive from
    /// the monitor at any time.
    async fn select_with_wait(
        &self,
        snapshot: &RegistrySnapshot,
        deadline: Instant,
        exclude: Option<&str>,
    ) -> Result<usize, RelayError> {
        loop {
            let now = Instant::now();
            let wait_until = match self.balancer.select(snapshot, now, exclude) {
                Selection::Selected(index) => return Ok(index),
                Selection::RateDeferred { retry_at } => retry_at,
                Selection::NoCandidates => now + SELECT_POLL_GRANULARITY,
            };

            if now >= deadline {
                return Err(RelayError::NoEndpointAvailable);
            }

            let sleep_for = wait_until
                .min(deadline)
                .saturating_duration_since(now)
                .clamp(Duration::from_millis(1), SELECT_POLL_GRANULARITY);
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Sends the request to one endpoint and parses the reply envelope.
    async fn send_to(
        &self,
        snapshot: &RegistrySnapshot,
        index: usize,
        request: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, crate::upstream::errors::UpstreamError> {
        use crate::upstream::errors::UpstreamError;

        let member = &snapshot.members[index];
        let body = serde_json::to_vec(request)
            .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;

        // The rate window was already charged when the balancer committed
        // this selection; only the call counter is recorded here.
        member.endpoint.record_call();

        let timeout = Duration::from_secs(snapshot.config.relay.request_timeout);
        let started = Instant::now();

        let outcome = self
            .http
            .post_json(member.endpoint.url(), bytes::Bytes::from(body), timeout)
            .await
            .and_then(|bytes| {
                serde_json::from_slice::<JsonRpcResponse>(&bytes).map_err(|e| {
                    UpstreamError::InvalidResponse(format!("reply not JSON-RPC: {e}"))
                })
            });

        match outcome {
            Ok(reply) => {
                #[allow(clippy::cast_possible_truncation)]
                let latency_ms = started.elapsed().as_millis() as u64;
                member.endpoint.record_success(latency_ms);
                self.metrics
                    .record_upstream_call(member.endpoint.url(), &request.method, latency_ms);
                Ok(reply)
            }
            Err(e) => {
                member.endpoint.record_failure();
                self.metrics.record_upstream_error(member.endpoint.url());
                Err(e)
            }
        }
    }
}

/// Builds the client response from an upstream reply, rebinding the id.
fn finish(reply: JsonRpcResponse, request: &JsonRpcRequest) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: crate::types::JSONRPC_VERSION_COW,
        result: reply.result,
        error: reply.error,
        id: Arc::clone(&request.id),
    }
}

/// Awaits a single-flight leader's outcome and maps it into this follower's
/// response.
async fn await_flight(
    mut receiver: watch::Receiver<Option<FlightOutcome>>,
    request: &JsonRpcRequest,
) -> Result<JsonRpcResponse, RelayError> {
    let outcome = match receiver.changed().await {
        Ok(()) => receiver.borrow().clone(),
        // Sender gone without a value: the leader was torn down.
        Err(_) => Some(FlightOutcome::Failed(FlightFailure::Abandoned)),
    };

    match outcome {
        Some(FlightOutcome::Success(value)) => {
            Ok(JsonRpcResponse::success((*value).clone(), Arc::clone(&request.id)))
        }
        Some(FlightOutcome::RpcError(error)) => {
            Ok(JsonRpcResponse::from_error(error, Arc::clone(&request.id)))
        }
        Some(FlightOutcome::Failed(FlightFailure::NoEndpoint)) => {
            Err(RelayError::NoEndpointAvailable)
        }
        Some(FlightOutcome::Failed(_)) | None => {
            Err(RelayError::Upstream(crate::upstream::errors::UpstreamError::InvalidResponse(
                "single-flight leader failed".to_string(),
            )))
        }
    }
}

/// Forces nonce queries onto the pending block: with a second positional
/// param present it is overwritten with `"pending"` unconditionally, so
/// nonces include in-flight transactions. A params list shorter than two is
/// forwarded untouched.
fn rewrite_pending_nonce(request: &mut JsonRpcRequest) {
    if request.method != "eth_getTransactionCount" {
        return;
    }
    if let Some(serde_json::Value::Array(params)) = request.params.as_mut() {
        if params.len() >= 2 {
            params[1] = serde_json::Value::String("pending".to_string());
        }
    }
}
