//! Mock upstream builders and relay fixtures.
//!
//! Wraps mockito with JSON-RPC specific helpers so tests can express "this
//! upstream answers `eth_call` with X" in one line, and assembles a
//! [`RelayEngine`] around an in-memory config.

use mockito::{Matcher, Mock, ServerGuard};
use relay_core::{
    cache::RelayCache,
    config::{EndpointSpec, RelayConfig, RpcEndpoints},
    metrics::MetricsCollector,
    proxy::RelayEngine,
    upstream::{EndpointRegistry, HttpClient},
};
use serde_json::{json, Value};
use std::{io::Write, path::PathBuf, sync::Arc, time::Duration};

/// An endpoint spec pointing at a mock server.
pub fn endpoint(url: &str, max_tps: u32, weight: u32) -> EndpointSpec {
    EndpointSpec { url: url.to_string(), max_tps, max_tpm: None, weight, max_latency_ms: None }
}

/// A relay config with the given tiers and cacheable methods.
pub fn relay_config(
    primary: Vec<EndpointSpec>,
    secondary: Vec<EndpointSpec>,
    cache_ttl: &[(&str, u64)],
) -> RelayConfig {
    let mut config = RelayConfig {
        rpc_endpoints: RpcEndpoints { primary, secondary },
        ..RelayConfig::default()
    };
    for (method, ttl) in cache_ttl {
        config.cache_ttl.insert((*method).to_string(), *ttl);
    }
    // Tests should fail fast rather than wait the full selection window.
    config.relay.selection_timeout = 2;
    config
}

/// Builds an engine over an in-memory config (no config file on disk).
pub fn engine_for(config: RelayConfig) -> Arc<RelayEngine> {
    let registry = Arc::new(EndpointRegistry::new(PathBuf::from("unused.yaml"), config));
    engine_with_registry(registry)
}

/// Builds an engine sharing the given registry, for hot-reload tests.
pub fn engine_with_registry(registry: Arc<EndpointRegistry>) -> Arc<RelayEngine> {
    Arc::new(RelayEngine::new(
        registry,
        Arc::new(RelayCache::new()),
        Arc::new(HttpClient::new(16).expect("http client")),
        Arc::new(MetricsCollector::new().expect("metrics recorder")),
    ))
}

fn method_matcher(method: &str) -> Matcher {
    Matcher::Regex(format!(r#""method"\s*:\s*"{method}""#))
}

/// Mocks a method with a fixed result, asserting exactly `expect` upstream hits.
pub async fn mock_result(
    server: &mut ServerGuard,
    method: &str,
    result: Value,
    expect: usize,
) -> Mock {
    server
        .mock("POST", "/")
        .match_body(method_matcher(method))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": result}).to_string())
        .expect(expect)
        .create_async()
        .await
}

/// Mocks a method whose response body is held back for `delay`, giving
/// concurrent requests time to pile onto one flight.
pub async fn mock_result_delayed(
    server: &mut ServerGuard,
    method: &str,
    result: Value,
    delay: Duration,
    expect: usize,
) -> Mock {
    let body = json!({"jsonrpc": "2.0", "id": 1, "result": result}).to_string();
    server
        .mock("POST", "/")
        .match_body(method_matcher(method))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_chunked_body(move |writer| {
            std::thread::sleep(delay);
            writer.write_all(body.as_bytes())
        })
        .expect(expect)
        .create_async()
        .await
}

/// Mocks a method answering with an HTTP error status.
pub async fn mock_http_error(
    server: &mut ServerGuard,
    method: &str,
    status: usize,
    expect: usize,
) -> Mock {
    server
        .mock("POST", "/")
        .match_body(method_matcher(method))
        .with_status(status)
        .with_body("upstream exploded")
        .expect(expect)
        .create_async()
        .await
}

/// Mocks a method answering with a JSON-RPC error envelope.
pub async fn mock_rpc_error(
    server: &mut ServerGuard,
    method: &str,
    code: i64,
    message: &str,
    expect: usize,
) -> Mock {
    server
        .mock("POST", "/")
        .match_body(method_matcher(method))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": code, "message": message}
            })
            .to_string(),
        )
        .expect(expect)
        .create_async()
        .await
}
