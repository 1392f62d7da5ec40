//! End-to-end tests driving the relay engine against mockito upstreams.
#![cfg(test)]

mod dispatch_tests;
mod mock_rpc;
mod reload_tests;
