//! Graceful shutdown coordination for the daemon.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns the cancellation token and the handles of long-running tasks.
pub struct ShutdownManager {
    cancel_token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    /// Token clone for tasks that should observe shutdown.
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    /// Block on ctrl-c, then cancel and await all registered tasks.
    pub async fn wait_for_shutdown(self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("shutdown signal received");
        self.shut_down_now().await;
    }

    /// Cancel and await tasks without waiting for a signal.
    pub async fn shut_down_now(mut self) {
        self.cancel_token.cancel();
        let timeout = tokio::time::Duration::from_secs(10);
        for handle in self.task_handles.drain(..) {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("task did not stop within {:?}", timeout);
            }
        }
        info!("all tasks stopped");
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
