use thiserror::Error;

/// Errors from the outbound leg of a relayed call.
///
/// Everything here is a transport-level failure: the upstream never produced
/// a usable JSON-RPC envelope. Upstream JSON-RPC *error envelopes* are not
/// errors at this layer - they parse fine and are forwarded to the client
/// verbatim without penalizing the endpoint.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpstreamError {
    /// Request exceeded its timeout.
    #[error("request timed out")]
    Timeout,

    /// Connection could not be established or broke mid-request.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Upstream answered with a non-2xx HTTP status.
    #[error("upstream returned HTTP {0}")]
    HttpStatus(u16),

    /// Response body was not a JSON-RPC envelope.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Request could not be serialized.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The shared outbound connection pool is closed.
    #[error("outbound connection pool closed")]
    PoolClosed,
}

impl UpstreamError {
    /// Whether this failure should count against the endpoint's health and
    /// trigger the dispatcher's one-shot retry on a different endpoint.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Timeout
            | Self::ConnectionFailed(_)
            | Self::HttpStatus(_)
            | Self::InvalidResponse(_) => true,
            Self::InvalidRequest(_) | Self::PoolClosed => false,
        }
    }
}
