//! Scan engine integration.
//!
//! [`ScanEngine`] is the task-level seam the orchestrator drives per item,
//! [`EngineService`] the product-level seam used by the status endpoint, the
//! restart coordinator and the update watcher. [`KeslControl`] implements both
//! on top of the engine's control CLI.

pub mod adapter;
pub mod events;
pub mod kesl;
pub mod product;

use std::fmt;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::EngineError;

pub use adapter::{EngineAdapter, VerdictReducer};
pub use events::{EventKind, EventStreamParser, ScanEvent, decode_events, decode_str};
pub use kesl::KeslControl;
pub use product::{EngineStatus, ProductInfo, ProductStatus};

/// Engine task type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScanKind {
    /// On-demand scan of a local path.
    Ods,
    /// Scan of a locally pulled container image.
    ContainerScan,
}

impl ScanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanKind::Ods => "ODS",
            ScanKind::ContainerScan => "ContainerScan",
        }
    }
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered `key=value` settings applied to a task before it starts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskSettings {
    entries: Vec<(String, String)>,
}

impl TaskSettings {
    /// Skip-only policy scoped to one target: a path for on-demand scans, an
    /// image id for container scans.
    pub fn for_target(kind: ScanKind, target: &str) -> Self {
        let mut settings = Self::default()
            .with("FirstAction", "Skip")
            .with("SecondAction", "Skip");
        settings = match kind {
            ScanKind::Ods => settings.with("ScanScope.item_0000.Path", target),
            ScanKind::ContainerScan => settings.with("ImageNameMask", target),
        };
        settings
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn to_args(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }
}

/// A started task: its decoded events and the eventual process outcome.
///
/// `events` is a single pass over one process lifetime. Await `exit` only
/// after `events` has ended.
pub struct TaskRun {
    pub events: BoxStream<'static, ScanEvent>,
    pub exit: BoxFuture<'static, Result<(), EngineError>>,
}

impl fmt::Debug for TaskRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRun").finish_non_exhaustive()
    }
}

/// Task lifecycle on the external engine.
#[async_trait]
pub trait ScanEngine: Send + Sync {
    async fn create_task(&self, name: &str, kind: ScanKind) -> Result<(), EngineError>;

    async fn apply_settings(&self, name: &str, settings: &TaskSettings) -> Result<(), EngineError>;

    async fn start_task(&self, name: &str) -> Result<TaskRun, EngineError>;

    async fn delete_task(&self, name: &str) -> Result<(), EngineError>;
}

/// Product-level engine operations.
#[async_trait]
pub trait EngineService: Send + Sync {
    /// Exit-code status of the engine application.
    async fn app_status(&self) -> Result<EngineStatus, EngineError>;

    /// `Ok(None)` when the engine did not answer.
    async fn product_info(&self) -> Result<Option<ProductInfo>, EngineError>;

    async fn restart(&self) -> Result<(), EngineError>;

    /// Events of finished update tasks. The stream ends when the underlying
    /// query process exits.
    async fn watch_updates(&self) -> Result<BoxStream<'static, ScanEvent>, EngineError>;
}
