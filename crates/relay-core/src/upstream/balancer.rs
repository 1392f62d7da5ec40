//! Endpoint selection: tier preference, latency filtering, rate budget, and
//! weighted round-robin.
//!
//! Selection never blocks, and a successful selection *is* the send commit:
//! the chosen endpoint's rate window is charged atomically, so the TPS cap
//! holds under any interleaving of concurrent requests. When only the rate
//! filter empties the candidate set, the balancer reports the earliest
//! instant a send becomes legal so the dispatcher can sleep precisely
//! instead of spinning.

use crate::{
    config::Tier,
    upstream::{endpoint::EndpointStatus, registry::RegistrySnapshot},
};
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Instant,
};

/// Outcome of one selection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Index of the selected member in the snapshot. The send is already
    /// committed against the member's rate window; the caller must dispatch.
    Selected(usize),
    /// Candidates exist but all are over their rate budget until `retry_at`.
    RateDeferred { retry_at: Instant },
    /// No healthy, non-draining candidate at all.
    NoCandidates,
}

/// Weighted round-robin balancer over a registry snapshot.
///
/// The cursor is the only mutable state; the virtual slot table lives in the
/// snapshot and is rebuilt on config reload, not per request.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    cursor: AtomicUsize,
}

impl LoadBalancer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects an endpoint for dispatch, committing the send against its
    /// rate window.
    ///
    /// Filter order: healthy and not draining, primary tier preferred,
    /// EWMA latency under the configured threshold (falling back to the
    /// single lowest-latency candidate when the filter would empty the set),
    /// then rate budget. The survivors are walked in weighted round-robin
    /// order; ties break deterministically by snapshot order.
    ///
    /// `exclude` removes one URL from consideration, supporting the
    /// dispatcher's retry-on-a-different-endpoint.
    pub fn select(
        &self,
        snapshot: &RegistrySnapshot,
        now: Instant,
        exclude: Option<&str>,
    ) -> Selection {
        let healthy: Vec<usize> = snapshot
            .members
            .iter()
            .enumerate()
            .filter(|(_, member)| {
                member.endpoint.status() == EndpointStatus::Healthy
                    && !member.endpoint.is_draining()
                    && exclude != Some(member.endpoint.url())
            })
            .map(|(index, _)| index)
            .collect();

        if healthy.is_empty() {
            return Selection::NoCandidates;
        }

        let tiered: Vec<usize> = {
            let primaries: Vec<usize> = healthy
                .iter()
                .copied()
                .filter(|&index| snapshot.members[index].tier == Tier::Primary)
                .collect();
            if primaries.is_empty() {
                healthy
            } else {
                primaries
            }
        };

        let candidates = apply_latency_filter(snapshot, tiered);

        let ready: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&index| {
                let member = &snapshot.members[index];
                member.endpoint.rate().can_send(&member.limits(), now)
            })
            .collect();

        if !ready.is_empty() {
            // Weighted round-robin: walk the snapshot's slot table from the
            // cursor and commit the first ready member whose rate window
            // still has room. `try_acquire` is the atomic commit point, so
            // concurrent selections racing for the last slot in a window
            // cannot all win it.
            let slots = &snapshot.slots;
            let start = self.cursor.fetch_add(1, Ordering::Relaxed);
            for offset in 0..slots.len() {
                let member_index = slots[(start + offset) % slots.len()];
                if !ready.contains(&member_index) {
                    continue;
                }
                let member = &snapshot.members[member_index];
                if member.endpoint.rate().try_acquire(&member.limits(), now) {
                    return Selection::Selected(member_index);
                }
            }
        }

        // Every candidate is over budget (or lost the commit race): report
        // when the earliest window opens.
        let retry_at = candidates
            .iter()
            .map(|&index| {
                let member = &snapshot.members[index];
                member.endpoint.rate().earliest_available(&member.limits(), now)
            })
            .min()
            .unwrap_or(now);
        Selection::RateDeferred { retry_at }
    }
}

/// Applies the global EWMA latency threshold. An endpoint with no sample yet
/// passes the filter (it has had no chance to prove itself slow). When the
/// filter would empty the set, the single lowest-latency candidate survives.
fn apply_latency_filter(snapshot: &RegistrySnapshot, candidates: Vec<usize>) -> Vec<usize> {
    let Some(threshold) = snapshot.config.relay.latency_threshold_ms else {
        return candidates;
    };

    #[allow(clippy::cast_precision_loss)]
    let threshold_ms = threshold as f64;

    let under: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|&index| {
            snapshot.members[index]
                .endpoint
                .health()
                .ewma_latency_ms
                .map_or(true, |ewma| ewma <= threshold_ms)
        })
        .collect();

    if !under.is_empty() {
        return under;
    }

    let lowest = candidates.iter().copied().min_by(|&a, &b| {
        let ewma_a = snapshot.members[a].endpoint.health().ewma_latency_ms;
        let ewma_b = snapshot.members[b].endpoint.health().ewma_latency_ms;
        ewma_a.partial_cmp(&ewma_b).unwrap_or(std::cmp::Ordering::Equal)
    });

    match lowest {
        Some(best) => vec![best],
        None => candidates,
    }
}
