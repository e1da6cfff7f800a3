//! Round-robin host selection with failure isolation.
//!
//! # Overview
//!
//! The selector keeps an ordered host list (shuffled on every replacement)
//! and a monotonically increasing cursor. [`HostSelector::select_host`]
//! advances the cursor atomically and scans forward a bounded number of
//! positions for a host that is not currently punished, failing open to the
//! last candidate when every host in the window is sidelined.
//!
//! Punishment is a per-host `{last_punished_at, continuous_punished_times}`
//! record: a host is skipped once it has been punished more than
//! `max_punished_times` in a row and its punishment is younger than
//! `punish_duration`. A single [`HostSelector::reward`] clears the record.
//!
//! When a [`HostsProvider`] is attached, a background task replaces the
//! host list on every refresh interval; punishment state survives for hosts
//! present in both the old and the new list.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::error::ApiError;

/// Default interval between background host-list refreshes.
const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default punishment duration.
const DEFAULT_PUNISH_DURATION: Duration = Duration::from_secs(30);

/// Default number of consecutive punishments a host survives before being
/// skipped.
const DEFAULT_MAX_PUNISHED_TIMES: u32 = 5;

/// Default bound, in percent of the pool size, on how far a selection scans
/// forward past punished hosts.
const DEFAULT_MAX_PUNISHED_PERCENT: usize = 50;

/// Source of refreshed host lists for one service class.
///
/// Implemented by the discovery resolver; `None` means "keep the current
/// list".
#[async_trait]
pub trait HostsProvider: Send + Sync + std::fmt::Debug {
    /// Fetches the current host list, or `None`/empty when the source has
    /// nothing better than what the selector already holds.
    async fn fetch_hosts(&self) -> Option<Vec<String>>;
}

/// Tunables for a [`HostSelector`].
#[derive(Clone)]
pub struct HostSelectorOptions {
    /// Background refresh source. `None` disables the refresh task.
    pub provider: Option<Arc<dyn HostsProvider>>,
    /// Interval between background refreshes.
    pub update_interval: Duration,
    /// How long a punishment keeps a host sidelined.
    pub punish_duration: Duration,
    /// Consecutive punishments a host survives before being skipped.
    pub max_punished_times: u32,
    /// Bound on the forward scan, in percent of the pool size.
    pub max_punished_percent: usize,
    /// Classifies which errors punish the serving host.
    pub should_punish: fn(&ApiError) -> bool,
}

impl Default for HostSelectorOptions {
    fn default() -> Self {
        Self {
            provider: None,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            punish_duration: DEFAULT_PUNISH_DURATION,
            max_punished_times: DEFAULT_MAX_PUNISHED_TIMES,
            max_punished_percent: DEFAULT_MAX_PUNISHED_PERCENT,
            should_punish: ApiError::should_punish,
        }
    }
}

impl std::fmt::Debug for HostSelectorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSelectorOptions")
            .field("provider", &self.provider)
            .field("update_interval", &self.update_interval)
            .field("punish_duration", &self.punish_duration)
            .field("max_punished_times", &self.max_punished_times)
            .field("max_punished_percent", &self.max_punished_percent)
            .finish_non_exhaustive()
    }
}

/// Per-host punishment record.
#[derive(Debug, Default)]
struct PunishRecord {
    last_punished_at: Option<Instant>,
    continuous_punished_times: u32,
}

/// Round-robin selector over one service class's host pool.
///
/// Selection never blocks on I/O: the host list is swapped wholesale by the
/// refresh task, per-host punishment records live in a concurrent map, and
/// the cursor is a plain atomic counter.
#[derive(Debug)]
pub struct HostSelector {
    /// Service class, for diagnostics only.
    service: &'static str,
    /// Current ordered host list. Replaced wholesale, read on every select.
    hosts: RwLock<Vec<String>>,
    /// Punishment records, keyed by host. Entries for vanished hosts are
    /// dropped on refresh.
    punishments: DashMap<String, PunishRecord>,
    /// Round-robin cursor.
    cursor: AtomicUsize,
    punish_duration: Duration,
    max_punished_times: u32,
    max_punished_percent: usize,
    should_punish: fn(&ApiError) -> bool,
}

impl HostSelector {
    /// Creates a selector over `hosts`.
    ///
    /// When `options.provider` is set, a background refresh task is spawned
    /// immediately; this requires a running Tokio runtime. The task holds
    /// only a weak reference and stops once the selector is dropped.
    #[must_use]
    pub fn new(
        service: &'static str,
        hosts: Vec<String>,
        options: HostSelectorOptions,
    ) -> Arc<Self> {
        let selector = Arc::new(Self {
            service,
            hosts: RwLock::new(Vec::new()),
            punishments: DashMap::new(),
            cursor: AtomicUsize::new(0),
            punish_duration: options.punish_duration,
            max_punished_times: options.max_punished_times,
            max_punished_percent: options.max_punished_percent,
            should_punish: options.should_punish,
        });
        selector.set_hosts(hosts);

        if let Some(provider) = options.provider {
            spawn_refresh_task(
                Arc::downgrade(&selector),
                provider,
                options.update_interval,
            );
        }
        selector
    }

    /// Returns the next host to try.
    ///
    /// Advances the cursor, then scans forward up to
    /// `len * max_punished_percent / 100 + 1` positions for a host whose
    /// punishment record is clean or expired. If every scanned host is
    /// punished, the final candidate is returned anyway so a fully degraded
    /// pool still serves. Returns `None` only for an empty pool.
    #[must_use]
    pub fn select_host(&self) -> Option<String> {
        let hosts = self
            .hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if hosts.is_empty() {
            return None;
        }

        let scans = hosts.len() * self.max_punished_percent / 100 + 1;
        let mut candidate = None;
        for _ in 0..scans {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % hosts.len();
            let host = &hosts[index];
            candidate = Some(host.clone());
            if self.is_eligible(host) {
                break;
            }
        }
        candidate
    }

    /// Clears `host`'s punishment record after a successful attempt.
    pub fn reward(&self, host: &str) {
        if let Some(mut record) = self.punishments.get_mut(host) {
            record.continuous_punished_times = 0;
            record.last_punished_at = None;
        }
    }

    /// Records a failure against `host`.
    pub fn punish(&self, host: &str) {
        if let Some(mut record) = self.punishments.get_mut(host) {
            record.continuous_punished_times += 1;
            record.last_punished_at = Some(Instant::now());
            debug!(
                service = self.service,
                host,
                times = record.continuous_punished_times,
                "host punished"
            );
        }
    }

    /// Punishes `host` iff the configured predicate classifies `err` as the
    /// host's fault. Returns the decision.
    pub fn punish_if_needed(&self, host: &str, err: &ApiError) -> bool {
        let needed = (self.should_punish)(err);
        if needed {
            self.punish(host);
        }
        needed
    }

    /// Replaces the host list, preserving punishment state for hosts that
    /// survive and dropping it for hosts that vanish. Empty lists are
    /// ignored. The new list is shuffled so independent processes do not
    /// hammer the same head host.
    pub fn set_hosts(&self, mut hosts: Vec<String>) {
        if hosts.is_empty() {
            return;
        }
        for host in &hosts {
            self.punishments.entry(host.clone()).or_default();
        }
        self.punishments
            .retain(|known, _| hosts.iter().any(|h| h == known));

        hosts.shuffle(&mut rand::thread_rng());
        *self
            .hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner) = hosts;
    }

    /// Snapshot of the current host list, for diagnostics.
    #[must_use]
    pub fn hosts(&self) -> Vec<String> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_eligible(&self, host: &str) -> bool {
        match self.punishments.get(host) {
            Some(record) => {
                record.continuous_punished_times <= self.max_punished_times
                    || record
                        .last_punished_at
                        .is_none_or(|at| at + self.punish_duration < Instant::now())
            }
            None => true,
        }
    }
}

/// Spawns the background refresh loop. The task fetches immediately, then on
/// every interval, and exits when the selector is dropped.
fn spawn_refresh_task(
    selector: Weak<HostSelector>,
    provider: Arc<dyn HostsProvider>,
    interval: Duration,
) {
    tokio::spawn(async move {
        loop {
            let Some(strong) = selector.upgrade() else {
                break;
            };
            match provider.fetch_hosts().await {
                Some(hosts) if !hosts.is_empty() => strong.set_hosts(hosts),
                _ => warn!(service = strong.service, "host refresh returned nothing"),
            }
            drop(strong);
            tokio::time::sleep(interval).await;
        }
    });
}
