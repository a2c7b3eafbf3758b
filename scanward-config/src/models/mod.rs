pub mod secret;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use scanward_core::orchestration::OrchestratorSettings;
use scanward_core::registry::{Credentials, KnownRegistries};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

pub use secret::Secret;

/// Where the configuration file layer came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Complete service configuration. Every field has a default, so an empty
/// file is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub common: CommonConfig,
    pub control: ControlConfig,
    pub engine: EngineConfig,
    pub runtime: RuntimeConfig,
    /// Registry URL to credentials. Used when a source or destination URL
    /// carries no credentials of its own.
    pub repositories: BTreeMap<String, RepositoryCredentials>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CommonConfig {
    pub port: u16,
    pub database_path: PathBuf,
    /// Spool directory for uploaded files.
    pub tmp_path: PathBuf,
    pub cert_dir: PathBuf,
    /// Directory searched for activation key files.
    pub key_path: PathBuf,
    pub log_level: String,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            database_path: PathBuf::from("data/scans.sqlite"),
            tmp_path: PathBuf::from("tmp/"),
            cert_dir: PathBuf::from("certificates/"),
            key_path: PathBuf::from("keys/"),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlConfig {
    /// When set, every request must carry it in `x-api-key`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<Secret>,
    /// Activation code, or the name of a key file under `common.key_path`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation: Option<String>,
    /// Whitespace separated `K=V` settings of the engine's update task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_options: Option<String>,
    pub force_update: bool,
    pub skip_image_if_exists: bool,
    pub general_timeout_secs: u64,
    pub update_task_timeout_secs: u64,
    pub restart_poll_interval_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            activation: None,
            update_options: None,
            force_update: true,
            skip_image_if_exists: false,
            general_timeout_secs: 600,
            update_task_timeout_secs: 600,
            restart_poll_interval_ms: 1000,
        }
    }
}

impl ControlConfig {
    pub fn general_timeout(&self) -> Duration {
        Duration::from_secs(self.general_timeout_secs)
    }

    pub fn update_task_timeout(&self) -> Duration {
        Duration::from_secs(self.update_task_timeout_secs)
    }

    pub fn restart_poll_interval(&self) -> Duration {
        Duration::from_millis(self.restart_poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub control_path: PathBuf,
    pub service_path: PathBuf,
    /// Prefix of engine task names created for scans.
    pub task_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_path: PathBuf::from("/usr/bin/kesl-control"),
            service_path: PathBuf::from("/etc/init.d/kesl"),
            task_prefix: "scanward".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub podman_path: PathBuf,
    /// Unprivileged podman runs on the vfs storage driver.
    pub privileged: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            podman_path: PathBuf::from("/usr/bin/podman"),
            privileged: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RepositoryCredentials {
    pub user: String,
    pub pass: Secret,
}

impl Config {
    /// Configured registry credentials keyed the way registry contexts look
    /// them up (`scheme://host[:port]`). URLs without a scheme are taken as
    /// `https`. Unparsable URLs are skipped.
    pub fn known_registries(&self) -> KnownRegistries {
        let mut known = KnownRegistries::new();
        for (raw, creds) in &self.repositories {
            match normalize_registry_url(raw) {
                Some(key) => {
                    known.insert(key, Credentials::new(creds.user.clone(), creds.pass.expose()));
                }
                None => warn!(repository = %raw, "skipping invalid repository url"),
            }
        }
        known
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            task_prefix: self.engine.task_prefix.clone(),
            scan_timeout: self.control.general_timeout(),
            skip_image_if_exists: self.control.skip_image_if_exists,
            known_registries: self.known_registries(),
            ..OrchestratorSettings::default()
        }
    }

    /// The API key when one is configured and non-empty.
    pub fn api_key(&self) -> Option<&str> {
        self.control
            .api_key
            .as_ref()
            .map(Secret::expose)
            .filter(|key| !key.is_empty())
    }
}

/// `scheme://host[:port]` of a configured registry URL.
pub fn normalize_registry_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let url = Url::parse(&with_scheme).ok()?;
    let host = url.host_str().filter(|h| !h.is_empty())?;
    Some(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}
