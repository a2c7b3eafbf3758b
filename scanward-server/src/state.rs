use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use scanward_core::engine::{EngineService, ProductStatus};
use scanward_core::orchestration::ScanOrchestrator;
use tracing::warn;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ScanOrchestrator>,
    pub engine: Arc<dyn EngineService>,
    /// Spool directory for uploaded files.
    pub tmp_path: PathBuf,
    /// Required `x-api-key` value, if any.
    pub api_key: Option<Arc<str>>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("tmp_path", &self.tmp_path)
            .field("api_key", &self.api_key.as_ref().map(|_| "**********"))
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Current availability of the engine for new scans.
    pub async fn product_status(&self) -> ProductStatus {
        let info = match self.engine.product_info().await {
            Ok(info) => info,
            Err(err) => {
                warn!(error = %err, "unable to read product info");
                None
            }
        };
        ProductStatus::evaluate(info, self.orchestrator.gate().is_restarting())
    }
}
