//! Drain barrier between scan jobs and engine restarts.
//!
//! Jobs enter through [`RestartCoordinator::admit`] and leave when the
//! returned guard drops. A restart closes the gate for new admissions, waits
//! for admitted jobs to drain, restarts the engine and reopens the gate.
//! Admitted jobs are never interrupted.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::engine::EngineService;
use crate::error::EngineError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RestartState {
    restart_requested: bool,
    active_jobs: usize,
}

pub struct RestartCoordinator {
    state: Mutex<RestartState>,
    engine: Arc<dyn EngineService>,
    poll_interval: Duration,
}

impl std::fmt::Debug for RestartCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestartCoordinator")
            .field("state", &*self.state.lock())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl RestartCoordinator {
    pub fn new(engine: Arc<dyn EngineService>, poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(RestartState::default()),
            engine,
            poll_interval,
        }
    }

    pub fn is_restarting(&self) -> bool {
        self.state.lock().restart_requested
    }

    pub fn active_jobs(&self) -> usize {
        self.state.lock().active_jobs
    }

    /// Waits until no restart is pending, then counts the caller as active.
    /// The check and the increment happen under one lock.
    pub async fn admit_job(&self) {
        let mut announced = false;
        loop {
            {
                let mut state = self.state.lock();
                if !state.restart_requested {
                    state.active_jobs += 1;
                    return;
                }
            }
            if !announced {
                debug!("engine restart pending, holding job admission");
                announced = true;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub fn release_job(&self) {
        let mut state = self.state.lock();
        state.active_jobs = state.active_jobs.saturating_sub(1);
    }

    /// [`admit_job`](Self::admit_job) with release on drop.
    pub async fn admit(self: &Arc<Self>) -> ActiveJob {
        self.admit_job().await;
        ActiveJob {
            coordinator: Arc::clone(self),
        }
    }

    /// Closes the gate, waits for active jobs to finish, restarts the engine
    /// and reopens the gate. A call made while another restart is pending
    /// waits for that restart instead of starting a second one.
    pub async fn request_restart(&self) -> Result<(), EngineError> {
        let already_pending = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.restart_requested, true)
        };
        if already_pending {
            info!("engine restart already pending");
            while self.is_restarting() {
                tokio::time::sleep(self.poll_interval).await;
            }
            return Ok(());
        }

        let _reopen = ReopenGate(self);

        info!("engine restart requested, draining active jobs");
        loop {
            let active = self.active_jobs();
            if active == 0 {
                break;
            }
            debug!(active, "waiting for active jobs before restart");
            tokio::time::sleep(self.poll_interval).await;
        }

        let result = self.engine.restart().await;
        match &result {
            Ok(()) => info!("engine restarted"),
            Err(err) => warn!(error = %err, "engine restart failed"),
        }

        result
    }
}

/// Reopens the gate when the restart owner finishes or is dropped mid-drain.
struct ReopenGate<'a>(&'a RestartCoordinator);

impl Drop for ReopenGate<'_> {
    fn drop(&mut self) {
        self.0.state.lock().restart_requested = false;
    }
}

/// Admission held by a running job.
#[derive(Debug)]
pub struct ActiveJob {
    coordinator: Arc<RestartCoordinator>,
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        self.coordinator.release_job();
    }
}
