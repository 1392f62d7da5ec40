//! # Relay Core
//!
//! Core library for the JSON-RPC relay: a reverse proxy between blockchain
//! clients and a pool of upstream RPC endpoints.
//!
//! - **[`config`]**: YAML configuration with validation; snapshots are
//!   immutable once published.
//!
//! - **[`upstream`]**: the endpoint pool - per-URL health state, sliding
//!   window rate accounting, weighted latency-aware selection, background
//!   health probing, and the shared outbound HTTP transport.
//!
//! - **[`cache`]**: TTL response cache with single-flight coalescing per
//!   `(method, params)` fingerprint.
//!
//! - **[`proxy`]**: the dispatcher orchestrating one client request.
//!
//! - **[`metrics`]**: Prometheus export plus the in-process status snapshot.
//!
//! ## Request Flow
//!
//! ```text
//! Client Request
//!       |
//!       v
//!  nonce rewrite (eth_getTransactionCount -> "pending")
//!       |
//!       v
//!  TTL cache ---- hit ----> response (caller's id)
//!       | miss
//!       v
//!  single-flight gate ---- join ----> leader's outcome
//!       | lead
//!       v
//!  balancer: healthy -> tier -> latency -> rate budget -> weighted RR
//!       |
//!       v
//!  outbound HTTP (retry once on a different endpoint)
//!       |
//!       v
//!  cache fill -> resolve waiters -> metrics -> response
//! ```
//!
//! The health monitor and the config reloader run as background workers and
//! share the endpoint pool with the dispatch path through registry
//! snapshots.

pub mod cache;
pub mod config;
pub mod metrics;
pub mod proxy;
pub mod types;
pub mod upstream;
