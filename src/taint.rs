//! Background removal of the startup taint
//!
//! New nodes join with a NoSchedule taint so nothing lands on them before
//! they are fully configured. The remover clears it from every Ready node
//! until its handle is stopped or dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::platform::PlatformApi;

/// Default sweep interval
pub const DEFAULT_TAINT_INTERVAL: Duration = Duration::from_secs(15);

/// Periodically removes a taint from Ready nodes
pub struct TaintRemover {
    platform: Arc<dyn PlatformApi>,
    key: String,
    interval: Duration,
}

/// Running remover; dropping it stops the loop
pub struct TaintRemoverHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TaintRemoverHandle {
    /// Signal the loop to exit and wait for it
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "taint remover task failed");
            }
        }
    }
}

impl Drop for TaintRemoverHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl TaintRemover {
    /// Remover for `key` sweeping every [`DEFAULT_TAINT_INTERVAL`]
    pub fn new(platform: Arc<dyn PlatformApi>, key: impl Into<String>) -> Self {
        Self {
            platform,
            key: key.into(),
            interval: DEFAULT_TAINT_INTERVAL,
        }
    }

    /// Override the sweep interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start sweeping in the background
    pub fn spawn(self) -> TaintRemoverHandle {
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(self.run(rx));
        TaintRemoverHandle {
            stop: Some(tx),
            task: Some(task),
        }
    }

    /// One pass over all nodes; returns how many were untainted
    pub async fn sweep(&self) -> usize {
        let nodes = match self.platform.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "failed to list nodes for taint removal");
                return 0;
            }
        };

        let mut removed = 0;
        for node in nodes
            .iter()
            .filter(|n| n.ready && n.taints.iter().any(|t| t == &self.key))
        {
            match self.platform.remove_taint(&node.name, &self.key).await {
                Ok(()) => {
                    info!(node = %node.name, taint = %self.key, "removed startup taint");
                    removed += 1;
                }
                Err(e) => warn!(node = %node.name, error = %e, "failed to remove taint"),
            }
        }
        removed
    }

    async fn run(self, mut stop: oneshot::Receiver<()>) {
        debug!(taint = %self.key, interval = ?self.interval, "taint remover started");
        loop {
            self.sweep().await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                // fires on explicit stop and on a dropped handle alike
                _ = &mut stop => break,
            }
        }
        debug!(taint = %self.key, "taint remover stopped");
    }
}
