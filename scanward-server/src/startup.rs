use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use scanward_config::Config;
use scanward_core::engine::KeslControl;

pub const ACTIVATION_ATTEMPTS: usize = 5;
const TRACE_LEVEL: &str = "Detailed";

/// What bootstrap changed on the engine that shutdown has to undo.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapOutcome {
    /// The activation key was added by this process.
    pub self_activated: bool,
}

/// Creates the upload spool directory.
pub async fn prepare_directories(config: &Config) -> Result<()> {
    let tmp = &config.common.tmp_path;
    tokio::fs::create_dir_all(tmp)
        .await
        .with_context(|| format!("failed to create temp directory {}", tmp.display()))
}

/// Brings the engine into a scanning configuration. Every step is best
/// effort; failures are logged and the service starts anyway.
pub async fn bootstrap_engine(kesl: &KeslControl, config: &Config) -> BootstrapOutcome {
    let mut outcome = BootstrapOutcome::default();

    if config.common.log_level.trim().eq_ignore_ascii_case("off") {
        debug!("engine tracing left unchanged");
    } else if let Err(err) = kesl.set_trace_level(TRACE_LEVEL).await {
        error!(error = %err, "unable to set engine trace level");
    }

    if let Some(activation) = config.control.activation.as_deref().filter(|a| !a.trim().is_empty()) {
        let key = resolve_activation(&config.common.key_path, activation.trim());
        outcome.self_activated = activate(kesl, &key).await;
    }

    if let Some(options) = config.control.update_options.as_deref().filter(|o| !o.trim().is_empty())
        && let Err(err) = kesl.setup_update_task(options).await
    {
        error!(error = %err, "unable to set up the update task");
    }

    if let Err(err) = kesl.enable_podman(true).await {
        error!(error = %err, "unable to enable container scanning");
    }

    if config.control.force_update {
        info!("updating engine databases, please wait");
        match kesl.update_bases().await {
            Ok(_) => info!("engine databases updated"),
            Err(err) => error!(error = %err, "unable to download engine databases"),
        }
    }

    outcome
}

/// Revokes the key this process activated.
pub async fn shutdown_engine(kesl: &KeslControl, outcome: BootstrapOutcome) {
    if !outcome.self_activated {
        return;
    }
    match kesl.revoke().await {
        Ok(_) => info!("activation key revoked"),
        Err(err) => error!(error = %err, "unable to revoke active key"),
    }
}

/// A key file under `key_path` wins over treating the value as a code.
pub fn resolve_activation(key_path: &Path, activation: &str) -> String {
    let candidate: PathBuf = key_path.join(activation);
    if candidate.is_file() {
        std::path::absolute(&candidate)
            .unwrap_or(candidate)
            .display()
            .to_string()
    } else {
        activation.to_string()
    }
}

async fn activate(kesl: &KeslControl, key: &str) -> bool {
    for attempt in 1..=ACTIVATION_ATTEMPTS {
        debug!(attempt, "activating engine");
        match kesl.activate(key).await {
            Ok(_) => {
                info!(attempt, "engine activated");
                return true;
            }
            Err(err) => warn!(attempt, error = %err, "unable to activate engine"),
        }
    }
    error!(attempts = ACTIVATION_ATTEMPTS, "engine activation failed");
    false
}
