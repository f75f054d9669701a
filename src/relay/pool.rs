//! Worker pool: `n` relay workers sharing one shutdown signal.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Relay;
use crate::lease::WorkerId;

/// Handle to a set of running relay workers.
///
/// Shutdown stops workers from taking new leases; deliveries already in
/// flight run to completion.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<WorkerId>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n` workers with ids `<prefix>-<n>-<random>`.
    pub fn spawn(n: usize, prefix: &str, relay: Arc<Relay>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut workers = Vec::with_capacity(n);
        let mut joins = Vec::with_capacity(n);
        for i in 0..n {
            let worker = WorkerId::unique(&format!("{prefix}-{i}"));
            let relay = Arc::clone(&relay);
            let rx = shutdown_rx.clone();
            let id = worker.clone();
            joins.push(tokio::spawn(async move {
                relay.run(id, rx).await;
            }));
            workers.push(worker);
        }

        tracing::info!(workers = n, "relay worker pool started");
        Self {
            shutdown_tx,
            workers,
            joins,
        }
    }

    pub fn workers(&self) -> &[WorkerId] {
        &self.workers
    }

    pub fn request_shutdown(&self) {
        // Receivers may already be gone.
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop taking leases and wait for every worker to exit.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "relay worker panicked");
            }
        }
        tracing::info!("relay worker pool stopped");
    }
}
