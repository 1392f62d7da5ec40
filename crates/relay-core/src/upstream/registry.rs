//! Endpoint registry: immutable snapshots of config plus live endpoint state,
//! republished atomically on config hot reload.
//!
//! Readers grab the current snapshot once at the start of an operation
//! (lock-free `ArcSwap` load) and use it for the operation's duration.
//! Endpoints retained across a reload keep their health and rate state; the
//! snapshot only rebinds them to updated limits. Removed endpoints are marked
//! draining so in-flight requests holding an older snapshot finish but never
//! select them again.

use crate::{
    config::{ConfigError, EndpointSpec, RelayConfig, Tier},
    upstream::{endpoint::Endpoint, rate::RateLimits},
};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};

/// Minimum wall-clock gap between reload attempts.
const RELOAD_MIN_INTERVAL: Duration = Duration::from_secs(30);

/// One endpoint as bound by a specific config snapshot: the spec from the
/// file plus the shared live state.
#[derive(Debug, Clone)]
pub struct EndpointMember {
    pub tier: Tier,
    pub spec: EndpointSpec,
    pub endpoint: Arc<Endpoint>,
}

impl EndpointMember {
    #[must_use]
    pub fn limits(&self) -> RateLimits {
        RateLimits::from(&self.spec)
    }
}

/// Immutable view of the endpoint pool derived from one config snapshot.
///
/// The weighted slot table expands every member into `weight` entries in
/// snapshot order; the balancer walks it with an atomic cursor, so it is
/// rebuilt only here, never per request.
#[derive(Debug)]
pub struct RegistrySnapshot {
    pub config: Arc<RelayConfig>,
    pub members: Vec<EndpointMember>,
    pub slots: Vec<usize>,
}

impl RegistrySnapshot {
    /// Builds a snapshot from a validated config, carrying endpoint state
    /// over from `previous` for every retained URL.
    #[must_use]
    pub fn build(config: Arc<RelayConfig>, previous: Option<&RegistrySnapshot>) -> Self {
        let prior: HashMap<&str, &Arc<Endpoint>> = previous
            .map(|snapshot| {
                snapshot
                    .members
                    .iter()
                    .map(|member| (member.endpoint.url(), &member.endpoint))
                    .collect()
            })
            .unwrap_or_default();

        let members: Vec<EndpointMember> = config
            .endpoints()
            .map(|(tier, spec)| {
                let endpoint = prior
                    .get(spec.url.as_str())
                    .map_or_else(|| Arc::new(Endpoint::new(&spec.url)), |kept| Arc::clone(kept));
                EndpointMember { tier, spec: spec.clone(), endpoint }
            })
            .collect();

        let mut slots = Vec::new();
        for (index, member) in members.iter().enumerate() {
            slots.extend(std::iter::repeat(index).take(member.spec.weight as usize));
        }

        Self { config, members, slots }
    }

    /// Member indices for one tier, in snapshot order.
    pub fn tier_members(&self, tier: Tier) -> impl Iterator<Item = usize> + '_ {
        self.members
            .iter()
            .enumerate()
            .filter(move |(_, member)| member.tier == tier)
            .map(|(index, _)| index)
    }
}

#[derive(Debug, Default)]
struct ReloadState {
    last_attempt: Option<SystemTime>,
    applied_mtime: Option<SystemTime>,
}

/// Holds the current snapshot and drives config hot reload.
pub struct EndpointRegistry {
    config_path: PathBuf,
    snapshot: ArcSwap<RegistrySnapshot>,
    reload: Mutex<ReloadState>,
}

impl EndpointRegistry {
    /// Creates the registry from an already-validated initial config.
    #[must_use]
    pub fn new(config_path: PathBuf, initial: RelayConfig) -> Self {
        let applied_mtime = file_mtime(&config_path);
        let snapshot = RegistrySnapshot::build(Arc::new(initial), None);

        Self {
            config_path,
            snapshot: ArcSwap::from_pointee(snapshot),
            reload: Mutex::new(ReloadState { last_attempt: None, applied_mtime }),
        }
    }

    /// The current snapshot. Lock-free; hold the `Arc` for the duration of
    /// one operation.
    #[must_use]
    pub fn current(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Re-reads the config file if it changed on disk and publishes a new
    /// snapshot. Throttled to one attempt per 30 s of wall clock; an
    /// unchanged mtime short-circuits. Returns `true` when a new snapshot
    /// was published.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file fails to parse or validate; the
    /// previously published snapshot stays in effect.
    pub fn reload_if_changed(&self) -> Result<bool, ConfigError> {
        let mtime = {
            let mut reload = self.reload.lock();

            let now = SystemTime::now();
            let throttled = reload.last_attempt.is_some_and(|last| {
                now.duration_since(last).map_or(true, |gap| gap < RELOAD_MIN_INTERVAL)
            });
            if throttled {
                return Ok(false);
            }
            reload.last_attempt = Some(now);

            let mtime = file_mtime(&self.config_path);
            match (mtime, reload.applied_mtime) {
                (Some(current), Some(applied)) if current <= applied => return Ok(false),
                (None, _) => {
                    tracing::warn!(
                        path = %self.config_path.display(),
                        "config file not readable, keeping current snapshot"
                    );
                    return Ok(false);
                }
                _ => {}
            }
            mtime
        };

        // Parse outside the reload lock; `current()` readers are unaffected
        // either way.
        let config = RelayConfig::load(&self.config_path)?;
        self.apply(config);
        self.reload.lock().applied_mtime = mtime;
        Ok(true)
    }

    /// Diffs the new config against the current snapshot and publishes the
    /// rebuilt endpoint table.
    fn apply(&self, config: RelayConfig) {
        let previous = self.snapshot.load();

        let next = RegistrySnapshot::build(Arc::new(config), Some(&previous));

        let mut added = 0usize;
        for member in &next.members {
            if !previous.members.iter().any(|m| m.endpoint.url() == member.endpoint.url()) {
                added += 1;
            }
        }

        let mut removed = 0usize;
        for member in &previous.members {
            let retained = next.members.iter().any(|m| m.endpoint.url() == member.endpoint.url());
            if !retained {
                member.endpoint.set_draining();
                removed += 1;
                tracing::info!(url = %member.endpoint.url(), "endpoint removed, draining");
            }
        }

        let retained = next.members.len() - added;
        self.snapshot.store(Arc::new(next));

        tracing::info!(added, removed, retained, "configuration reloaded");
    }

    #[cfg(test)]
    pub(crate) fn force_reload(&self) -> Result<bool, ConfigError> {
        self.reload.lock().last_attempt = None;
        self.reload_if_changed()
    }
}

fn file_mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}
