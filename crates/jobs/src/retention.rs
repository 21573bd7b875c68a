//! Periodic deletion of finished job rows.
//!
//! Only `completed` and `dead` rows older than the retention window go;
//! history and dead letters are untouched.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::queue::{JobQueue, QueueError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Age, measured from `completed_at`, after which a finished row is deleted.
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 3600),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

impl RetentionConfig {
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }
}

pub struct RetentionSweeper<Q> {
    config: RetentionConfig,
    queue: Arc<Q>,
}

impl<Q: JobQueue> RetentionSweeper<Q> {
    pub fn new(config: RetentionConfig, queue: Arc<Q>) -> Self {
        Self { config, queue }
    }

    /// One sweep; returns the number of rows deleted.
    pub async fn sweep_once(&self) -> Result<u64, QueueError> {
        let deleted = self.queue.delete_completed_jobs(self.config.retention).await?;
        if deleted > 0 {
            info!(deleted, retention = ?self.config.retention, "finished jobs deleted");
        }
        Ok(deleted)
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            retention = ?self.config.retention,
            sweep_interval = ?self.config.sweep_interval,
            "retention sweeper started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "retention sweep failed");
                    }
                }
            }
        }

        info!("retention sweeper stopped");
    }
}
