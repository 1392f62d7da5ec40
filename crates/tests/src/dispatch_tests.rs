//! End-to-end dispatch scenarios: caching, coalescing, rate waits, failover,
//! and envelope fidelity.

use crate::mock_rpc::{
    endpoint, engine_for, mock_http_error, mock_rpc_error, mock_result, mock_result_delayed,
    relay_config,
};
use relay_core::{proxy::RelayError, types::JsonRpcRequest, upstream::EndpointStatus};
use serde_json::json;
use std::time::{Duration, Instant};

fn request(method: &str, params: serde_json::Value, id: serde_json::Value) -> JsonRpcRequest {
    JsonRpcRequest::new(method, Some(params), id)
}

#[tokio::test]
async fn test_cache_hit_then_expiry() {
    let mut server = mockito::Server::new_async().await;
    // Exactly two upstream calls: the initial miss and the post-expiry miss.
    let mock = mock_result(&mut server, "eth_blockNumber", json!("0x100"), 2).await;

    let engine = engine_for(relay_config(
        vec![endpoint(&server.url(), 100, 1)],
        vec![],
        &[("eth_blockNumber", 1)],
    ));

    let first = engine
        .process_request(request("eth_blockNumber", json!([]), json!(1)))
        .await
        .unwrap();
    assert_eq!(first.result, Some(json!("0x100")));
    assert_eq!(*first.id, json!(1));

    // Within the TTL: served from cache under the new id.
    let second = engine
        .process_request(request("eth_blockNumber", json!([]), json!(2)))
        .await
        .unwrap();
    assert_eq!(second.result, Some(json!("0x100")));
    assert_eq!(*second.id, json!(2));

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let third = engine
        .process_request(request("eth_blockNumber", json!([]), json!(3)))
        .await
        .unwrap();
    assert_eq!(third.result, Some(json!("0x100")));
    assert_eq!(*third.id, json!(3));

    mock.assert_async().await;
}

#[tokio::test]
async fn test_nonce_query_rewritten_to_pending_on_the_wire() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_body(mockito::Matcher::Regex(
            r#""params"\s*:\s*\["0xabc","pending"\]"#.to_string(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": "0x5"}).to_string())
        .expect(1)
        .create_async()
        .await;

    let engine = engine_for(relay_config(vec![endpoint(&server.url(), 100, 1)], vec![], &[]));

    let response = engine
        .process_request(request("eth_getTransactionCount", json!(["0xabc", "latest"]), json!(7)))
        .await
        .unwrap();

    assert_eq!(response.result, Some(json!("0x5")));
    assert_eq!(*response.id, json!(7));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_third_concurrent_call_waits_for_rate_budget() {
    let mut server = mockito::Server::new_async().await;
    let mock = mock_result(&mut server, "eth_chainId", json!("0x66eee"), 3).await;

    // One endpoint, two requests per second: the third call must wait out
    // the window before dispatching.
    let engine = engine_for(relay_config(vec![endpoint(&server.url(), 2, 1)], vec![], &[]));

    let started = Instant::now();
    let mut handles = Vec::new();
    for i in 0..3 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.process_request(request("eth_chainId", json!([]), json!(i))).await
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.result, Some(json!("0x66eee")));
    }

    assert!(
        started.elapsed() >= Duration::from_millis(900),
        "third call should have waited for the 1 s window, finished in {:?}",
        started.elapsed()
    );
    mock.assert_async().await;
}

#[tokio::test]
async fn test_failing_primary_fails_over_and_goes_unhealthy() {
    let mut bad_server = mockito::Server::new_async().await;
    let bad = mock_http_error(&mut bad_server, "eth_chainId", 500, 3).await;

    let mut good_server = mockito::Server::new_async().await;
    let good = mock_result(&mut good_server, "eth_chainId", json!("0x66eee"), 4).await;

    // The failing endpoint is the only primary, so every call prefers it
    // until it drops out of rotation.
    let engine = engine_for(relay_config(
        vec![endpoint(&bad_server.url(), 100, 1)],
        vec![endpoint(&good_server.url(), 100, 1)],
        &[],
    ));

    // Three calls: each hits the primary, fails, retries on the secondary.
    for i in 0..3 {
        let response =
            engine.process_request(request("eth_chainId", json!([]), json!(i))).await.unwrap();
        assert_eq!(response.result, Some(json!("0x66eee")));
    }

    let snapshot = engine.registry().current();
    assert_eq!(snapshot.members[0].endpoint.status(), EndpointStatus::Unhealthy);

    // The fourth call goes straight to the secondary.
    let response =
        engine.process_request(request("eth_chainId", json!([]), json!(4))).await.unwrap();
    assert_eq!(response.result, Some(json!("0x66eee")));

    assert_eq!(snapshot.members[0].endpoint.total_calls(), 3);
    bad.assert_async().await;
    good.assert_async().await;
}

#[tokio::test]
async fn test_fifty_concurrent_misses_make_one_upstream_call() {
    let mut server = mockito::Server::new_async().await;
    let mock = mock_result_delayed(
        &mut server,
        "eth_call",
        json!("0xfeed"),
        Duration::from_millis(300),
        1,
    )
    .await;

    let engine = engine_for(relay_config(
        vec![endpoint(&server.url(), 1000, 1)],
        vec![],
        &[("eth_call", 1)],
    ));

    let params = json!([{"to": "0x1234", "data": "0xdead"}, "latest"]);

    // The leader goes first; the rest arrive while its response is held back.
    let leader = {
        let engine = engine.clone();
        let params = params.clone();
        tokio::spawn(async move {
            engine.process_request(request("eth_call", params, json!(0))).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut handles = vec![leader];
    for i in 1..50 {
        let engine = engine.clone();
        let params = params.clone();
        handles.push(tokio::spawn(async move {
            engine.process_request(request("eth_call", params, json!(i))).await
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.result, Some(json!("0xfeed")));
        assert_eq!(*response.id, json!(i));
    }

    mock.assert_async().await;
}

#[tokio::test]
async fn test_upstream_rpc_error_forwarded_without_retry() {
    let mut server = mockito::Server::new_async().await;
    let mock =
        mock_rpc_error(&mut server, "eth_sendRawTransaction", 3, "execution reverted", 1).await;

    let engine = engine_for(relay_config(vec![endpoint(&server.url(), 100, 1)], vec![], &[]));

    let response = engine
        .process_request(request("eth_sendRawTransaction", json!(["0xdead"]), json!("tx-1")))
        .await
        .unwrap();

    let error = response.error.expect("error envelope forwarded");
    assert_eq!(error.code, 3);
    assert_eq!(error.message, "execution reverted");
    assert_eq!(*response.id, json!("tx-1"));

    // Application-level errors do not count against endpoint health.
    let snapshot = engine.registry().current();
    assert_eq!(snapshot.members[0].endpoint.status(), EndpointStatus::Healthy);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_all_endpoints_down_yields_no_endpoint_error() {
    // Unroutable address: connections fail immediately.
    let engine = engine_for(relay_config(vec![endpoint("http://127.0.0.1:1", 100, 1)], vec![], &[]));

    let result = engine.process_request(request("eth_chainId", json!([]), json!(1))).await;

    // First attempt fails on transport; the retry finds no other endpoint.
    assert!(matches!(
        result,
        Err(RelayError::NoEndpointAvailable | RelayError::Upstream(_))
    ));
}

#[tokio::test]
async fn test_response_id_fidelity_across_id_shapes() {
    let mut server = mockito::Server::new_async().await;
    let _mock = mock_result(&mut server, "eth_gasPrice", json!("0x3b9aca00"), 3).await;

    let engine = engine_for(relay_config(vec![endpoint(&server.url(), 100, 1)], vec![], &[]));

    for id in [json!(0), json!("request-abc"), json!(null)] {
        let response = engine
            .process_request(request("eth_gasPrice", json!([]), id.clone()))
            .await
            .unwrap();
        assert_eq!(*response.id, id);
    }
}

#[tokio::test]
async fn test_cached_entries_are_keyed_by_params() {
    let mut server = mockito::Server::new_async().await;
    let _balance_a = server
        .mock("POST", "/")
        .match_body(mockito::Matcher::Regex(r#""params"\s*:\s*\["0xaaa""#.to_string()))
        .with_status(200)
        .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": "0x1"}).to_string())
        .expect(1)
        .create_async()
        .await;
    let _balance_b = server
        .mock("POST", "/")
        .match_body(mockito::Matcher::Regex(r#""params"\s*:\s*\["0xbbb""#.to_string()))
        .with_status(200)
        .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": "0x2"}).to_string())
        .expect(1)
        .create_async()
        .await;

    let engine = engine_for(relay_config(
        vec![endpoint(&server.url(), 100, 1)],
        vec![],
        &[("eth_getBalance", 30)],
    ));

    let a = engine
        .process_request(request("eth_getBalance", json!(["0xaaa", "latest"]), json!(1)))
        .await
        .unwrap();
    let b = engine
        .process_request(request("eth_getBalance", json!(["0xbbb", "latest"]), json!(2)))
        .await
        .unwrap();
    // Repeats are cache hits per key.
    let a2 = engine
        .process_request(request("eth_getBalance", json!(["0xaaa", "latest"]), json!(3)))
        .await
        .unwrap();

    assert_eq!(a.result, Some(json!("0x1")));
    assert_eq!(b.result, Some(json!("0x2")));
    assert_eq!(a2.result, Some(json!("0x1")));
}
