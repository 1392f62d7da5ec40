//! Shared outbound HTTP transport.
//!
//! One reqwest client is shared across all endpoints, with a semaphore
//! capping concurrent outbound requests. Per-request timeouts come from the
//! caller; the dispatcher uses the configured relay timeout and the health
//! monitor a short probe timeout.

use crate::upstream::errors::UpstreamError;
use reqwest::{Client, ClientBuilder};
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;

/// HTTP client with semaphore-based concurrency control over a pooled
/// connection set.
pub struct HttpClient {
    client: Client,
    permits: Arc<Semaphore>,
}

impl HttpClient {
    /// Creates the shared transport with at most `max_connections` concurrent
    /// outbound requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn new(max_connections: usize) -> Result<Self, UpstreamError> {
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(Duration::from_secs(5))
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("rpc-relay/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build http client");
                UpstreamError::ConnectionFailed(format!("http client build failed: {e}"))
            })?;

        Ok(Self { client, permits: Arc::new(Semaphore::new(max_connections)) })
    }

    /// POSTs a JSON body and returns the response bytes.
    ///
    /// # Errors
    ///
    /// - [`UpstreamError::Timeout`] if the request exceeds `timeout`
    /// - [`UpstreamError::HttpStatus`] for any non-2xx response
    /// - [`UpstreamError::ConnectionFailed`] for network-level failures
    /// - [`UpstreamError::PoolClosed`] if the semaphore is closed (shutdown)
    pub async fn post_json(
        &self,
        url: &str,
        body: bytes::Bytes,
        timeout: Duration,
    ) -> Result<bytes::Bytes, UpstreamError> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| UpstreamError::PoolClosed)?;

        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    UpstreamError::ConnectionFailed(sanitize_network_error(&e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::HttpStatus(status.as_u16()));
        }

        response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout
            } else {
                UpstreamError::ConnectionFailed(sanitize_network_error(&e))
            }
        })
    }

    #[cfg(test)]
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Reduces reqwest errors to coarse categories so upstream URLs and internal
/// addresses never leak into client-visible messages.
fn sanitize_network_error(error: &reqwest::Error) -> String {
    if error.is_connect() {
        "connection refused or unreachable".to_string()
    } else if error.is_request() {
        "request failed".to_string()
    } else if error.is_body() || error.is_decode() {
        "response body error".to_string()
    } else if error.is_redirect() {
        "too many redirects".to_string()
    } else {
        "network error".to_string()
    }
}
