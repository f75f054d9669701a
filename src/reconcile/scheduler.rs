//! Scheduled reconciliation with an explicit start/shutdown lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::ReconciliationEngine;
use crate::error::Result;
use crate::model::report::ReconciliationReport;

/// Owns the periodic sweep task.
///
/// Sweeps run every `interval` whether or not relay workers are alive.
/// [`trigger`](Self::trigger) runs a sweep right away and returns its report;
/// it queues behind a scheduled sweep already in progress.
pub struct ReconcileScheduler {
    engine: Arc<ReconciliationEngine>,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReconcileScheduler {
    /// Start the schedule. The first sweep runs one `interval` from now.
    pub fn start(engine: Arc<ReconciliationEngine>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task_engine = Arc::clone(&engine);

        let join = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_secs = interval.as_secs(), "reconciliation scheduler started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = task_engine.sweep().await {
                            tracing::error!(error = %e, "scheduled reconciliation sweep failed");
                        }
                    }
                }
            }
            tracing::info!("reconciliation scheduler stopped");
        });

        Self {
            engine,
            shutdown_tx,
            join,
        }
    }

    /// Run a sweep now.
    pub async fn trigger(&self) -> Result<ReconciliationReport> {
        self.engine.sweep().await
    }

    /// Stop the schedule and wait for a running sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "reconciliation scheduler panicked");
        }
    }
}
