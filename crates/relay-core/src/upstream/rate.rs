//! Sliding-window rate accounting for outbound traffic.
//!
//! Each endpoint owns one [`RateWindow`]: a monotonically ordered ring of the
//! timestamps of its recent outbound requests (probes included). The window
//! answers three questions: can this endpoint send *now*, when does it next
//! become able to, and how many requests went out in the last second/minute.
//!
//! Timestamps older than the 60 s window are pruned from the front on every
//! access, which is amortized O(1) per recorded send.

use crate::config::EndpointSpec;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

const WINDOW: Duration = Duration::from_secs(60);
const SECOND: Duration = Duration::from_secs(1);

/// Per-endpoint rate caps, taken from the active config snapshot.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub max_tps: u32,
    pub max_tpm: Option<u32>,
}

impl From<&EndpointSpec> for RateLimits {
    fn from(spec: &EndpointSpec) -> Self {
        Self { max_tps: spec.max_tps, max_tpm: spec.max_tpm }
    }
}

/// Sliding 60-second window of outbound send timestamps.
///
/// The lock is held only for the O(1)-amortized prune/count work; callers
/// must not hold it across await points (the API makes that impossible).
#[derive(Debug, Default)]
pub struct RateWindow {
    ring: Mutex<VecDeque<Instant>>,
}

impl RateWindow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a send at `now` would stay within both the per-second and the
    /// optional per-minute cap.
    pub fn can_send(&self, limits: &RateLimits, now: Instant) -> bool {
        let mut ring = self.ring.lock();
        prune(&mut ring, now);

        if count_since(&ring, now.checked_sub(SECOND)) >= limits.max_tps as usize {
            return false;
        }
        if let Some(max_tpm) = limits.max_tpm {
            if ring.len() >= max_tpm as usize {
                return false;
            }
        }
        true
    }

    /// Records an outbound send without checking the caps.
    pub fn record(&self, now: Instant) {
        let mut ring = self.ring.lock();
        prune(&mut ring, now);
        ring.push_back(now);
    }

    /// Atomically checks the caps and records the send when they allow it.
    ///
    /// This is the commit point for dispatch: check and record happen under
    /// one lock acquisition, so concurrent selections can never admit more
    /// than `max_tps` sends into a window between them. Selection attempts
    /// that lose the race commit nothing and retry elsewhere.
    pub fn try_acquire(&self, limits: &RateLimits, now: Instant) -> bool {
        let mut ring = self.ring.lock();
        prune(&mut ring, now);

        if count_since(&ring, now.checked_sub(SECOND)) >= limits.max_tps as usize {
            return false;
        }
        if let Some(max_tpm) = limits.max_tpm {
            if ring.len() >= max_tpm as usize {
                return false;
            }
        }

        ring.push_back(now);
        true
    }

    /// The earliest instant at which [`Self::can_send`] becomes true given
    /// the current window. Returns `now` when a send is already possible.
    pub fn earliest_available(&self, limits: &RateLimits, now: Instant) -> Instant {
        let mut ring = self.ring.lock();
        prune(&mut ring, now);

        let mut at = now;

        let in_second = count_since(&ring, now.checked_sub(SECOND));
        if in_second >= limits.max_tps as usize {
            // The send becomes legal once the max_tps-th newest entry ages
            // out of the 1 s window; everything newer then counts max_tps - 1.
            let blocking = ring[ring.len() - limits.max_tps as usize];
            at = at.max(blocking + SECOND);
        }

        if let Some(max_tpm) = limits.max_tpm {
            if ring.len() >= max_tpm as usize {
                let blocking = ring[ring.len() - max_tpm as usize];
                at = at.max(blocking + WINDOW);
            }
        }

        at
    }

    /// Observed (requests in the last second, requests in the last minute).
    pub fn counts(&self, now: Instant) -> (usize, usize) {
        let mut ring = self.ring.lock();
        prune(&mut ring, now);
        (count_since(&ring, now.checked_sub(SECOND)), ring.len())
    }
}

fn prune(ring: &mut VecDeque<Instant>, now: Instant) {
    let Some(cutoff) = now.checked_sub(WINDOW) else {
        return;
    };
    while ring.front().is_some_and(|ts| *ts <= cutoff) {
        ring.pop_front();
    }
}

/// Counts entries newer than `cutoff`. The ring is ordered, so counting from
/// the back stops at the first entry outside the window.
fn count_since(ring: &VecDeque<Instant>, cutoff: Option<Instant>) -> usize {
    match cutoff {
        Some(cutoff) => ring.iter().rev().take_while(|ts| **ts > cutoff).count(),
        None => ring.len(),
    }
}
