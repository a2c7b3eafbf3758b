use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{EngineService, EngineStatus, ScanEvent};
use crate::restart::RestartCoordinator;

/// Follows finished engine update tasks and restarts the engine when an
/// update leaves it in the need-restart state.
pub struct UpdateWatcher {
    engine: Arc<dyn EngineService>,
    coordinator: Arc<RestartCoordinator>,
    retry_delay: Duration,
}

impl std::fmt::Debug for UpdateWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateWatcher")
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl UpdateWatcher {
    pub fn new(
        engine: Arc<dyn EngineService>,
        coordinator: Arc<RestartCoordinator>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            engine,
            coordinator,
            retry_delay,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Re-issues the engine query whenever it exits until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("update watcher started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.watch_once() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
        info!("update watcher shutting down");
    }

    async fn watch_once(&self) {
        let mut events = match self.engine.watch_updates().await {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "unable to query update events");
                return;
            }
        };
        while let Some(event) = events.next().await {
            self.on_update_finished(&event).await;
        }
        debug!("update event query ended");
    }

    /// Checks the engine status after an update task stopped.
    pub async fn on_update_finished(&self, event: &ScanEvent) {
        debug!(event_type = event.event_type(), "update task finished");
        match self.engine.app_status().await {
            Ok(EngineStatus::NeedRestart) => {
                info!("engine needs restart after update");
                if let Err(err) = self.coordinator.request_restart().await {
                    warn!(error = %err, "engine restart after update failed");
                }
            }
            Ok(status) => debug!(status = status.describe(), "engine status after update"),
            Err(err) => warn!(error = %err, "unable to read engine status"),
        }
    }
}
