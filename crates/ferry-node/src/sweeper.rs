use std::sync::Arc;

use ferry_core::{BundleId, Clock, Timestamp};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SharedConfig;
use crate::flight::SingleFlight;
use crate::store::{BundleStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<BundleId>,
    pub bytes_freed: u64,
}

/// Periodic removal of expired bundles. Expiry ignores priority and budget.
#[derive(Debug, Default)]
pub struct ExpirySweeper {
    flight: SingleFlight,
}

impl ExpirySweeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs one sweep. Returns `None` when another sweep is already running.
    pub fn sweep(
        &self,
        store: &BundleStore,
        now: Timestamp,
    ) -> Result<Option<SweepReport>, StoreError> {
        let Some(_guard) = self.flight.try_enter() else {
            debug!("expiry sweep already running; skipped");
            return Ok(None);
        };
        let removed = store.delete_expired(now)?;
        let report = SweepReport {
            bytes_freed: removed.iter().map(|(_, size)| size).sum(),
            removed: removed.into_iter().map(|(id, _)| id).collect(),
        };
        if !report.removed.is_empty() {
            info!(
                removed = report.removed.len(),
                bytes = report.bytes_freed,
                "expired bundles swept"
            );
        }
        Ok(Some(report))
    }

    /// Sweeps every `sweep_interval` (re-read from config each round) until
    /// `shutdown` flips or its sender is dropped.
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
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if let Err(err) = self.sweep(&store, clock.now()) {
                    warn!("expiry sweep failed: {err}");
                }
            }
            debug!("expiry sweeper stopped");
        })
    }
}
