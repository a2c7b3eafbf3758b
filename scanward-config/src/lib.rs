//! Configuration for the Scanward service.
//!
//! A single [`Config`] holds every tunable of the server. [`ConfigLoader`]
//! builds it from an optional TOML/JSON file, `.env` and `SCANWARD_*`
//! environment overrides; every field has a default.

pub mod loader;
pub mod models;
pub mod util;

pub use loader::{ConfigLoad, ConfigLoader};
pub use models::{
    CommonConfig, Config, ConfigSource, ControlConfig, EngineConfig, RepositoryCredentials,
    RuntimeConfig, Secret,
};
