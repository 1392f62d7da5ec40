//! Config hot-reload scenarios: endpoint add/remove under traffic and
//! rejection of invalid snapshots.

use crate::mock_rpc::{engine_with_registry, mock_result};
use relay_core::{
    config::RelayConfig,
    types::JsonRpcRequest,
    upstream::EndpointRegistry,
};
use serde_json::json;
use std::{
    io::{Seek, Write},
    path::Path,
    sync::Arc,
    time::{Duration, SystemTime},
};

fn write_config(file: &mut std::fs::File, urls: &[(&str, u32)]) {
    let mut body = String::from("rpc_endpoints:\n  primary:\n");
    for (url, max_tps) in urls {
        body.push_str(&format!("    - url: {url}\n      max_tps: {max_tps}\n"));
    }
    file.set_len(0).unwrap();
    file.seek(std::io::SeekFrom::Start(0)).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file.flush().unwrap();
}

/// Pushes the file's mtime past the registry's recorded one so the reload
/// protocol sees a change without real wall-clock waiting.
fn bump_mtime(path: &Path) {
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(10)).unwrap();
}

fn registry_for(file: &tempfile::NamedTempFile) -> Arc<EndpointRegistry> {
    let config = RelayConfig::load(file.path()).unwrap();
    Arc::new(EndpointRegistry::new(file.path().to_path_buf(), config))
}

fn request(method: &str, id: u64) -> JsonRpcRequest {
    JsonRpcRequest::new(method, Some(json!([])), json!(id))
}

#[tokio::test]
async fn test_reload_adds_endpoint_to_rotation() {
    let mut server_a = mockito::Server::new_async().await;
    let mock_a = mock_result(&mut server_a, "eth_chainId", json!("0xa"), 3).await;
    let mut server_b = mockito::Server::new_async().await;
    let mock_b = mock_result(&mut server_b, "eth_chainId", json!("0xa"), 2).await;

    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    write_config(file.as_file_mut(), &[(&server_a.url(), 100)]);

    let registry = registry_for(&file);
    let engine = engine_with_registry(Arc::clone(&registry));

    // Only A exists before the reload.
    let response = engine.process_request(request("eth_chainId", 1)).await.unwrap();
    assert_eq!(response.result, Some(json!("0xa")));

    write_config(file.as_file_mut(), &[(&server_a.url(), 100), (&server_b.url(), 100)]);
    bump_mtime(file.path());
    assert!(registry.reload_if_changed().unwrap());

    // Equal weights: the next four calls alternate across both endpoints.
    for id in 2..6 {
        let response = engine.process_request(request("eth_chainId", id)).await.unwrap();
        assert_eq!(response.result, Some(json!("0xa")));
    }

    mock_a.assert_async().await;
    mock_b.assert_async().await;
}

#[tokio::test]
async fn test_reload_removed_endpoint_takes_no_new_calls() {
    let mut server_a = mockito::Server::new_async().await;
    let mock_a = mock_result(&mut server_a, "eth_chainId", json!("0xa"), 4).await;
    let mut server_b = mockito::Server::new_async().await;
    let mock_b = mock_result(&mut server_b, "eth_chainId", json!("0xa"), 0).await;

    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    write_config(file.as_file_mut(), &[(&server_a.url(), 100), (&server_b.url(), 100)]);

    let registry = registry_for(&file);
    let engine = engine_with_registry(Arc::clone(&registry));

    let removed = Arc::clone(&registry.current().members[1].endpoint);

    write_config(file.as_file_mut(), &[(&server_a.url(), 100)]);
    bump_mtime(file.path());
    assert!(registry.reload_if_changed().unwrap());
    assert!(removed.is_draining());

    // Every call after the reload lands on A.
    for id in 0..4 {
        let response = engine.process_request(request("eth_chainId", id)).await.unwrap();
        assert_eq!(response.result, Some(json!("0xa")));
    }

    mock_a.assert_async().await;
    mock_b.assert_async().await;
}

#[tokio::test]
async fn test_invalid_reload_keeps_relay_serving() {
    let mut server_a = mockito::Server::new_async().await;
    let mock_a = mock_result(&mut server_a, "eth_chainId", json!("0xa"), 2).await;

    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    write_config(file.as_file_mut(), &[(&server_a.url(), 100)]);

    let registry = registry_for(&file);
    let engine = engine_with_registry(Arc::clone(&registry));

    let response = engine.process_request(request("eth_chainId", 1)).await.unwrap();
    assert_eq!(response.result, Some(json!("0xa")));

    // max_tps 0 violates validation: the snapshot is rejected wholesale.
    write_config(file.as_file_mut(), &[(&server_a.url(), 0)]);
    bump_mtime(file.path());
    assert!(registry.reload_if_changed().is_err());

    let response = engine.process_request(request("eth_chainId", 2)).await.unwrap();
    assert_eq!(response.result, Some(json!("0xa")));
    assert_eq!(registry.current().members[0].spec.max_tps, 100);

    mock_a.assert_async().await;
}

#[tokio::test]
async fn test_retained_endpoint_keeps_rate_state_across_reload() {
    let mut server_a = mockito::Server::new_async().await;
    let _mock_a = mock_result(&mut server_a, "eth_chainId", json!("0xa"), 2).await;

    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    write_config(file.as_file_mut(), &[(&server_a.url(), 100)]);

    let registry = registry_for(&file);
    let engine = engine_with_registry(Arc::clone(&registry));

    for id in 0..2 {
        engine.process_request(request("eth_chainId", id)).await.unwrap();
    }
    let endpoint_before = Arc::clone(&registry.current().members[0].endpoint);
    assert_eq!(endpoint_before.total_calls(), 2);

    // Reload with a changed cap; the endpoint object survives.
    write_config(file.as_file_mut(), &[(&server_a.url(), 50)]);
    bump_mtime(file.path());
    assert!(registry.reload_if_changed().unwrap());

    let snapshot = registry.current();
    assert!(Arc::ptr_eq(&endpoint_before, &snapshot.members[0].endpoint));
    assert_eq!(snapshot.members[0].spec.max_tps, 50);
    assert_eq!(snapshot.members[0].endpoint.total_calls(), 2);
    let (_, tpm) = snapshot.members[0].endpoint.rate().counts(std::time::Instant::now());
    assert_eq!(tpm, 2);
}
