//! Stale-lease reclamation.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sluice_core::JobState;

use super::executor::WorkerConfig;
use super::store::{JobStore, JobStoreError, ReclaimedJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    pub lease_timeout: Duration,
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for ReaperConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            lease_timeout: config.lease_timeout,
            interval: config.reaper_interval,
        }
    }
}

/// Periodically returns abandoned leases to the queue.
///
/// A job whose worker died becomes eligible again within
/// `lease_timeout + interval`.
pub struct Reaper {
    store: Arc<dyn JobStore>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(store: Arc<dyn JobStore>, config: ReaperConfig) -> Self {
        Self { store, config }
    }

    /// One sweep across all job kinds.
    pub async fn sweep(&self) -> Result<Vec<ReclaimedJob>, JobStoreError> {
        let reclaimed = self.store.reclaim_stale(self.config.lease_timeout).await?;
        for job in &reclaimed {
            match job.state {
                JobState::Failed => warn!(
                    job_id = %job.id,
                    kind = %job.kind,
                    num_resets = job.num_resets,
                    "job exceeded lease resets, marked failed"
                ),
                _ => info!(
                    job_id = %job.id,
                    kind = %job.kind,
                    num_resets = job.num_resets,
                    "reclaimed stale lease"
                ),
            }
        }
        Ok(reclaimed)
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?self.config.interval, lease_timeout = ?self.config.lease_timeout, "reaper started");

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            error!(error = %e, "reaper sweep failed");
                        }
                    }
                }
            }

            info!("reaper stopped");
        })
    }
}
