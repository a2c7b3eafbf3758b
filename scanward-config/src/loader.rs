//! Layered configuration loading.
//!
//! Evaluation order for the file layer:
//! 0) a path given to [`ConfigLoader::with_config_path`],
//! 1) `$SCANWARD_CONFIG_PATH` (TOML or JSON file),
//! 2) `$SCANWARD_CONFIG_JSON` (inline JSON),
//! 3) the first existing default file,
//! 4) built-in defaults.
//!
//! `SCANWARD_*` variables then override single scalar fields.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fs};

use anyhow::{Context, anyhow};
use tracing::{debug, warn};

use crate::models::{Config, ConfigSource, Secret};
use crate::util::{non_empty, parse_bool};

pub const CONFIG_PATH_VAR: &str = "SCANWARD_CONFIG_PATH";
pub const CONFIG_JSON_VAR: &str = "SCANWARD_CONFIG_JSON";

const DEFAULT_FILES: &[&str] = &["scanward.toml", "config/scanward.toml", "scanward.json"];

/// Result of a load: the effective configuration and where it came from.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: Config,
    pub source: ConfigSource,
    pub env_file_loaded: bool,
    /// Names of the `SCANWARD_*` variables that overrode a field.
    pub overrides: Vec<&'static str>,
}

/// Loads [`Config`] from files and the environment.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_file: Option<PathBuf>,
    load_env_file: bool,
    search_dir: PathBuf,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            config_path: None,
            env_file: None,
            load_env_file: true,
            search_dir: PathBuf::from("."),
        }
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit configuration file, ahead of every other file layer.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Read this file instead of `./.env`.
    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_file = Some(path.into());
        self
    }

    pub fn without_env_file(mut self) -> Self {
        self.load_env_file = false;
        self
    }

    /// Directory the default files are looked up in.
    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dir = dir.into();
        self
    }

    /// Loads `.env`, then the configuration from the process environment.
    pub fn load(&self) -> anyhow::Result<ConfigLoad> {
        let env_file_loaded = self.load_env_file();
        let mut load = self.load_with(|name| env::var(name).ok())?;
        load.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Same as [`load`](Self::load) with variables resolved through `lookup`
    /// and no `.env` handling.
    pub fn load_with<F>(&self, lookup: F) -> anyhow::Result<ConfigLoad>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (mut config, source) = self.file_layer(&lookup)?;
        let overrides = apply_env_overrides(&mut config, &lookup);
        debug!(?source, overrides = overrides.len(), "configuration loaded");
        Ok(ConfigLoad {
            config,
            source,
            env_file_loaded: false,
            overrides,
        })
    }

    fn load_env_file(&self) -> bool {
        if !self.load_env_file {
            return false;
        }
        let result = match &self.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| ()),
            None => dotenvy::dotenv().map(|_| ()),
        };
        match result {
            Ok(()) => true,
            Err(err) if err.not_found() => false,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable .env file");
                false
            }
        }
    }

    fn file_layer<F>(&self, lookup: &F) -> anyhow::Result<(Config, ConfigSource)>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &self.config_path {
            let config = load_from_file(path)?;
            return Ok((config, ConfigSource::File(path.clone())));
        }

        if let Some(path) = non_empty(lookup, CONFIG_PATH_VAR) {
            let path = PathBuf::from(path);
            let config = load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Some(raw) = non_empty(lookup, CONFIG_JSON_VAR) {
            let config = parse_json(&raw).with_context(|| format!("failed to parse {CONFIG_JSON_VAR}"))?;
            return Ok((config, ConfigSource::EnvInline));
        }

        if let Some(path) = self.find_default_file() {
            let config = load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((Config::default(), ConfigSource::Default))
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        DEFAULT_FILES
            .iter()
            .map(|name| self.search_dir.join(name))
            .find(|path| path.exists())
    }
}

pub fn load_from_file(path: &Path) -> anyhow::Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config from {}", path.display()))?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&contents).with_context(|| format!("invalid config {}", path.display())),
        Some("toml") => toml::from_str(&contents)
            .map_err(|err| anyhow!("invalid config {}: {}", path.display(), err)),
        _ => parse_from_str(&contents, &path.display().to_string()),
    }
}

/// TOML first, then JSON.
pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Config> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            anyhow!(
                "failed to parse config {}: toml error: {}; json error: {}",
                origin,
                toml_err,
                json_err
            )
        })
    })
}

pub fn parse_json(raw: &str) -> anyhow::Result<Config> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid config json: {err}"))
}

/// Applies `SCANWARD_*` overrides and returns the names that took effect.
/// Values that do not parse are logged and ignored.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: &F) -> Vec<&'static str>
where
    F: Fn(&str) -> Option<String>,
{
    let mut applied = Vec::new();
    let mut string = |name: &'static str, slot: &mut String| {
        if let Some(value) = non_empty(lookup, name) {
            *slot = value;
            applied.push(name);
        }
    };
    string("SCANWARD_LOG_LEVEL", &mut config.common.log_level);
    string("SCANWARD_TASK_PREFIX", &mut config.engine.task_prefix);

    let mut path = |name: &'static str, slot: &mut PathBuf| {
        if let Some(value) = non_empty(lookup, name) {
            *slot = PathBuf::from(value);
            applied.push(name);
        }
    };
    path("SCANWARD_DATABASE_PATH", &mut config.common.database_path);
    path("SCANWARD_TMP_PATH", &mut config.common.tmp_path);
    path("SCANWARD_CERT_DIR", &mut config.common.cert_dir);
    path("SCANWARD_KEY_PATH", &mut config.common.key_path);
    path("SCANWARD_CONTROL_PATH", &mut config.engine.control_path);
    path("SCANWARD_SERVICE_PATH", &mut config.engine.service_path);
    path("SCANWARD_PODMAN_PATH", &mut config.runtime.podman_path);

    let mut optional = |name: &'static str, slot: &mut Option<String>| {
        if let Some(value) = non_empty(lookup, name) {
            *slot = Some(value);
            applied.push(name);
        }
    };
    optional("SCANWARD_ACTIVATION", &mut config.control.activation);
    optional("SCANWARD_UPDATE_OPTIONS", &mut config.control.update_options);

    if let Some(value) = non_empty(lookup, "SCANWARD_API_KEY") {
        config.control.api_key = Some(Secret::new(value));
        applied.push("SCANWARD_API_KEY");
    }

    let mut flag = |name: &'static str, slot: &mut bool| {
        if let Some(raw) = non_empty(lookup, name) {
            match parse_bool(&raw) {
                Some(value) => {
                    *slot = value;
                    applied.push(name);
                }
                None => warn!(variable = name, value = %raw, "ignoring non-boolean override"),
            }
        }
    };
    flag("SCANWARD_FORCE_UPDATE", &mut config.control.force_update);
    flag("SCANWARD_SKIP_IMAGE_IF_EXISTS", &mut config.control.skip_image_if_exists);
    flag("SCANWARD_PRIVILEGED", &mut config.runtime.privileged);

    number(lookup, "SCANWARD_PORT", &mut config.common.port, &mut applied);
    number(lookup, "SCANWARD_GENERAL_TIMEOUT_SECS", &mut config.control.general_timeout_secs, &mut applied);
    number(
        lookup,
        "SCANWARD_UPDATE_TASK_TIMEOUT_SECS",
        &mut config.control.update_task_timeout_secs,
        &mut applied,
    );
    number(
        lookup,
        "SCANWARD_RESTART_POLL_INTERVAL_MS",
        &mut config.control.restart_poll_interval_ms,
        &mut applied,
    );

    applied
}

fn number<F, T>(lookup: &F, name: &'static str, slot: &mut T, applied: &mut Vec<&'static str>)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = non_empty(lookup, name) else {
        return;
    };
    match raw.parse() {
        Ok(value) => {
            *slot = value;
            applied.push(name);
        }
        Err(_) => warn!(variable = name, value = %raw, "ignoring non-numeric override"),
    }
}
