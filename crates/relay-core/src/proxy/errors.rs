use crate::upstream::errors::UpstreamError;
use thiserror::Error;

/// Relay-level failures surfaced to clients as JSON-RPC errors.
///
/// Upstream JSON-RPC error envelopes are *not* represented here - they are
/// successful relays of an upstream answer and flow back verbatim.
#[derive(Error, Debug)]
pub enum RelayError {
    /// No endpoint became selectable within the bounded wait.
    #[error("no upstream available")]
    NoEndpointAvailable,

    /// The outbound call failed on transport, including the one retry.
    #[error("upstream error")]
    Upstream(#[source] UpstreamError),

    /// The client body was not a valid JSON-RPC request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

impl RelayError {
    /// JSON-RPC error code for this failure.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::NoEndpointAvailable | Self::Upstream(_) => -32603,
            Self::MalformedRequest(_) => -32600,
        }
    }
}
