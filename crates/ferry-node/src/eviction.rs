use std::sync::Arc;

use ferry_core::{BundleId, Clock, Timestamp};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, SharedConfig};
use crate::flight::SingleFlight;
use crate::store::{BundleStore, RetentionTier, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Victims in eviction order.
    pub evicted: Vec<BundleId>,
    pub bytes_freed: u64,
    pub remaining_bytes: u64,
    pub remaining_count: u64,
    /// Still over budget with nothing left but protected bundles.
    pub over_budget_protected_only: bool,
}

/// Budget enforcement. Single-flight; wakes on request or on a timer.
#[derive(Debug, Default)]
pub struct EvictionEngine {
    flight: SingleFlight,
    wake: Notify,
}

impl EvictionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evicts until the store fits the budget or only protected bundles
    /// remain. Returns `None` when a pass is already running.
    pub fn enforce(
        &self,
        store: &BundleStore,
        config: &NodeConfig,
        now: Timestamp,
    ) -> Result<Option<EvictionReport>, StoreError> {
        let Some(_guard) = self.flight.try_enter() else {
            debug!("eviction pass already running; skipped");
            return Ok(None);
        };
        let budget = config.profile.cache_budget;
        let mut report = EvictionReport::default();
        let mut stats = store.stats()?;

        'budget: while budget.is_exceeded(stats.total_bytes, stats.bundle_count) {
            for tier in RetentionTier::EVICTABLE {
                let candidate = store.eviction_candidate(
                    tier,
                    now,
                    config.perishable_protect_window,
                    config.profile.hot_access_threshold,
                )?;
                if let Some((id, _)) = candidate {
                    if let Some(size) = store.delete(&id)? {
                        debug!(bundle_id = %id.short(), ?tier, bytes = size, "bundle evicted");
                        report.evicted.push(id);
                        report.bytes_freed += size;
                    }
                    stats = store.stats()?;
                    continue 'budget;
                }
            }
            report.over_budget_protected_only = true;
            break;
        }

        report.remaining_bytes = stats.total_bytes;
        report.remaining_count = stats.bundle_count;
        if report.over_budget_protected_only {
            warn!(
                bytes = stats.total_bytes,
                bundles = stats.bundle_count,
                budget = budget.max_bytes,
                "over budget with only protected bundles left; continuing"
            );
        }
        if !report.evicted.is_empty() {
            info!(
                evicted = report.evicted.len(),
                bytes = report.bytes_freed,
                remaining = stats.total_bytes,
                "cache budget enforced"
            );
        }
        Ok(Some(report))
    }

    /// Asks the background task for a pass.
    pub fn request(&self) {
        self.wake.notify_one();
    }

    /// Runs a pass on every request, and at least every `sweep_interval`.
    pub fn spawn(
        self: Arc<Self>,
        store: Arc<BundleStore>,
        config: SharedConfig,
        clock: Arc<dyn Clock>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let interval = config.snapshot().sweep_interval;
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let snapshot = config.snapshot();
                if let Err(err) = self.enforce(&store, &snapshot, clock.now()) {
                    warn!("eviction pass failed: {err}");
                }
            }
            debug!("eviction engine stopped");
        })
    }
}
