//! Test app wired to in-process fakes.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::Value;
use tower::ServiceExt;

use scanward_core::container::ContainerRuntime;
use scanward_core::engine::{
    EngineService, EngineStatus, ProductInfo, ScanEngine, ScanEvent, ScanKind, TaskRun, TaskSettings,
};
use scanward_core::error::{EngineError, RegistryError};
use scanward_core::orchestration::{Collaborators, OrchestratorSettings, ScanOrchestrator};
use scanward_core::registry::{Credentials, ImageListing, ListQuery, RegistryCatalog, RegistryContext};
use scanward_core::restart::RestartCoordinator;
use scanward_server::{AppState, create_app};

pub const EICAR_MARKER: &str = "EICAR-STANDARD-ANTIVIRUS-TEST-FILE";

/// Engine that reads the scanned file and reports a threat when it carries
/// [`EICAR_MARKER`].
#[derive(Default)]
pub struct ContentEngine {
    targets: Mutex<HashMap<String, String>>,
    pub scanned: Mutex<Vec<String>>,
}

#[async_trait]
impl ScanEngine for ContentEngine {
    async fn create_task(&self, _name: &str, _kind: ScanKind) -> Result<(), EngineError> {
        Ok(())
    }

    async fn apply_settings(&self, name: &str, settings: &TaskSettings) -> Result<(), EngineError> {
        let target = settings
            .get("ScanScope.item_0000.Path")
            .unwrap_or_default()
            .to_string();
        self.targets.lock().insert(name.to_string(), target);
        Ok(())
    }

    async fn start_task(&self, name: &str) -> Result<TaskRun, EngineError> {
        let target = self.targets.lock().get(name).cloned().unwrap_or_default();
        self.scanned.lock().push(target.clone());
        let contents = std::fs::read_to_string(&target).unwrap_or_default();
        let events = if contents.contains(EICAR_MARKER) {
            vec![
                ScanEvent::new("ThreatDetected")
                    .with_field("DetectName", "EICAR-Test-File")
                    .with_field("FileName", target),
            ]
        } else {
            Vec::new()
        };
        Ok(TaskRun {
            events: futures::stream::iter(events).boxed(),
            exit: Box::pin(async { Ok(()) }),
        })
    }

    async fn delete_task(&self, _name: &str) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Engine service whose availability can be switched off.
pub struct SwitchableService {
    pub responding: AtomicBool,
}

impl Default for SwitchableService {
    fn default() -> Self {
        Self {
            responding: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl EngineService for SwitchableService {
    async fn app_status(&self) -> Result<EngineStatus, EngineError> {
        Ok(EngineStatus::Success)
    }

    async fn product_info(&self) -> Result<Option<ProductInfo>, EngineError> {
        if !self.responding.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(ProductInfo {
            databases_loaded: true,
            license_info: "The key is valid".to_string(),
            version: "12.0.0.6672".to_string(),
            ..ProductInfo::default()
        }))
    }

    async fn restart(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn watch_updates(&self) -> Result<BoxStream<'static, ScanEvent>, EngineError> {
        Ok(futures::stream::empty().boxed())
    }
}

/// Runtime and registry that should never be reached by file scans.
#[derive(Default)]
pub struct NoImages;

#[async_trait]
impl ContainerRuntime for NoImages {
    async fn login(&self, _: &str, _: Option<&Credentials>) -> Result<(), EngineError> {
        Ok(())
    }

    async fn pull(&self, _: &str, image: &str, _: bool) -> Result<String, EngineError> {
        Ok(format!("iid-{image}"))
    }

    async fn tag(&self, _: &str, _: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn push(&self, _: &str, _: bool) -> Result<(), EngineError> {
        Ok(())
    }

    async fn remove(&self, _: &str) -> Result<(), EngineError> {
        Ok(())
    }
}

#[async_trait]
impl RegistryCatalog for NoImages {
    async fn list_images(&self, ctx: &RegistryContext, _: ListQuery) -> Result<ImageListing, RegistryError> {
        Err(RegistryError::Status {
            route: ctx.repository.clone(),
            status: 404,
            reason: "Not Found".to_string(),
        })
    }
}

pub struct TestApp {
    pub app: Router,
    pub engine: Arc<ContentEngine>,
    pub service: Arc<SwitchableService>,
    pub orchestrator: Arc<ScanOrchestrator>,
    pub tmp_path: PathBuf,
    pub dir: tempfile::TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::build(None).await
    }

    pub async fn with_api_key(key: &str) -> Self {
        Self::build(Some(key)).await
    }

    async fn build(api_key: Option<&str>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let tmp_path = dir.path().join("tmp");
        std::fs::create_dir_all(&tmp_path).expect("tmp dir");

        let engine = Arc::new(ContentEngine::default());
        let service = Arc::new(SwitchableService::default());
        let images = Arc::new(NoImages);
        let gate = Arc::new(RestartCoordinator::new(service.clone(), Duration::from_millis(10)));
        let orchestrator = ScanOrchestrator::start(
            &dir.path().join("scans.sqlite"),
            Collaborators {
                engine: engine.clone(),
                runtime: images.clone(),
                registry: images,
                gate,
            },
            OrchestratorSettings::default(),
        )
        .await
        .expect("orchestrator starts");
        let orchestrator = Arc::new(orchestrator);

        let app = create_app(AppState {
            orchestrator: orchestrator.clone(),
            engine: service.clone(),
            tmp_path: tmp_path.clone(),
            api_key: api_key.map(Arc::from),
        });

        Self {
            app,
            engine,
            service,
            orchestrator,
            tmp_path,
            dir,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.expect("infallible")
    }

    /// Files left in the upload spool.
    pub fn spooled(&self) -> usize {
        std::fs::read_dir(&self.tmp_path).map(|dir| dir.count()).unwrap_or(0)
    }
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}
