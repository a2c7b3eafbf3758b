//! In-process fakes for the engine, container runtime and registry.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;

use scanward_core::container::ContainerRuntime;
use scanward_core::engine::{
    EngineService, EngineStatus, ProductInfo, ScanEngine, ScanEvent, ScanKind, TaskRun,
    TaskSettings,
};
use scanward_core::error::{EngineError, RegistryError};
use scanward_core::model::OrderedMap;
use scanward_core::orchestration::{Collaborators, OrchestratorSettings, ScanOrchestrator};
use scanward_core::persistence::JobStore;
use scanward_core::registry::{Credentials, ImageListing, ListQuery, RegistryCatalog, RegistryContext};
use scanward_core::restart::RestartCoordinator;

pub fn exit_error(code: i32, output: &str) -> EngineError {
    EngineError::Exit {
        program: "/usr/bin/fake".to_string(),
        code,
        output: output.to_string(),
    }
}

pub fn threat(name: &str, object: &str) -> ScanEvent {
    ScanEvent::new("ThreatDetected")
        .with_field("DetectName", name)
        .with_field("FileName", object)
}

/// Scripted engine keyed by scan target (path or image id).
#[derive(Default)]
pub struct FakeEngine {
    scripts: Mutex<HashMap<String, Result<Vec<ScanEvent>, EngineError>>>,
    targets: Mutex<HashMap<String, String>>,
    pub created: Mutex<Vec<(String, ScanKind)>>,
    pub deleted: Mutex<Vec<String>>,
    pub fail_create: Mutex<Option<EngineError>>,
    pub fail_settings: Mutex<Option<EngineError>>,
    /// When set, job progress is sampled as each task starts.
    pub observer: OnceLock<Weak<ScanOrchestrator>>,
    pub progress_seen: Mutex<Vec<u8>>,
}

impl FakeEngine {
    pub fn script(&self, target: &str, outcome: Result<Vec<ScanEvent>, EngineError>) {
        self.scripts.lock().insert(target.to_string(), outcome);
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl ScanEngine for FakeEngine {
    async fn create_task(&self, name: &str, kind: ScanKind) -> Result<(), EngineError> {
        if let Some(err) = self.fail_create.lock().clone() {
            return Err(err);
        }
        self.created.lock().push((name.to_string(), kind));
        Ok(())
    }

    async fn apply_settings(&self, name: &str, settings: &TaskSettings) -> Result<(), EngineError> {
        if let Some(err) = self.fail_settings.lock().clone() {
            return Err(err);
        }
        let target = settings
            .get("ScanScope.item_0000.Path")
            .or_else(|| settings.get("ImageNameMask"))
            .unwrap_or_default()
            .to_string();
        self.targets.lock().insert(name.to_string(), target);
        Ok(())
    }

    async fn start_task(&self, name: &str) -> Result<TaskRun, EngineError> {
        if let Some(orchestrator) = self.observer.get().and_then(Weak::upgrade) {
            let listed = orchestrator.list_jobs(false).await;
            self.progress_seen.lock().extend(listed.values().map(|line| line.progress));
        }
        let target = self.targets.lock().get(name).cloned().unwrap_or_default();
        let outcome = self
            .scripts
            .lock()
            .get(&target)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()));
        Ok(match outcome {
            Ok(events) => TaskRun {
                events: futures::stream::iter(events).boxed(),
                exit: Box::pin(async { Ok(()) }),
            },
            Err(err) => TaskRun {
                events: futures::stream::empty().boxed(),
                exit: Box::pin(async move { Err(err) }),
            },
        })
    }

    async fn delete_task(&self, name: &str) -> Result<(), EngineError> {
        self.deleted.lock().push(name.to_string());
        Ok(())
    }
}

/// Engine service that only counts restarts.
#[derive(Default)]
pub struct FakeService {
    pub restarts: AtomicUsize,
    pub status: Mutex<Option<EngineStatus>>,
    pub restart_delay: Mutex<Duration>,
}

impl FakeService {
    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineService for FakeService {
    async fn app_status(&self) -> Result<EngineStatus, EngineError> {
        Ok(self.status.lock().unwrap_or(EngineStatus::Success))
    }

    async fn product_info(&self) -> Result<Option<ProductInfo>, EngineError> {
        Ok(Some(ProductInfo {
            databases_loaded: true,
            license_info: "The key is valid".to_string(),
            ..ProductInfo::default()
        }))
    }

    async fn restart(&self) -> Result<(), EngineError> {
        let delay = *self.restart_delay.lock();
        tokio::time::sleep(delay).await;
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn watch_updates(&self) -> Result<BoxStream<'static, ScanEvent>, EngineError> {
        Ok(futures::stream::empty().boxed())
    }
}

/// Container runtime recording every call. Pulled images get the id
/// `iid-<image>`.
#[derive(Default)]
pub struct FakeRuntime {
    pub calls: Mutex<Vec<String>>,
    pub fail_pull: Mutex<Option<EngineError>>,
    pub fail_login: Mutex<Option<EngineError>>,
}

impl FakeRuntime {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls().into_iter().filter(|c| c.starts_with(prefix)).collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn login(&self, repository: &str, credentials: Option<&Credentials>) -> Result<(), EngineError> {
        self.calls
            .lock()
            .push(format!("login {repository} {}", credentials.is_some()));
        match self.fail_login.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn pull(&self, repository: &str, image: &str, tls: bool) -> Result<String, EngineError> {
        self.calls.lock().push(format!("pull {repository}/{image} {tls}"));
        match self.fail_pull.lock().clone() {
            Some(err) => Err(err),
            None => Ok(format!("iid-{image}")),
        }
    }

    async fn tag(&self, source: &str, destination: &str) -> Result<(), EngineError> {
        self.calls.lock().push(format!("tag {source} {destination}"));
        Ok(())
    }

    async fn push(&self, destination: &str, tls: bool) -> Result<(), EngineError> {
        self.calls.lock().push(format!("push {destination} {tls}"));
        Ok(())
    }

    async fn remove(&self, image_id: &str) -> Result<(), EngineError> {
        self.calls.lock().push(format!("rmi {image_id}"));
        Ok(())
    }
}

/// Registry answering from fixed listings keyed by `host/mask`.
#[derive(Default)]
pub struct FakeRegistry {
    listings: Mutex<HashMap<String, Vec<(String, Option<String>)>>>,
    pub queries: Mutex<Vec<(String, ListQuery)>>,
}

impl FakeRegistry {
    pub fn serve(&self, repository_and_mask: &str, images: &[(&str, Option<&str>)]) {
        self.listings.lock().insert(
            repository_and_mask.to_string(),
            images
                .iter()
                .map(|(name, digest)| (name.to_string(), digest.map(str::to_string)))
                .collect(),
        );
    }
}

#[async_trait]
impl RegistryCatalog for FakeRegistry {
    async fn list_images(
        &self,
        ctx: &RegistryContext,
        query: ListQuery,
    ) -> Result<ImageListing, RegistryError> {
        let key = format!("{}/{}", ctx.repository, ctx.image_mask);
        self.queries.lock().push((key.clone(), query));
        let Some(images) = self.listings.lock().get(&key).cloned() else {
            return Err(RegistryError::Status {
                route: key,
                status: 404,
                reason: "Not Found".to_string(),
            });
        };
        Ok(ImageListing {
            images: images
                .into_iter()
                .map(|(name, digest)| (name, if query.digests { digest } else { None }))
                .collect::<OrderedMap<_>>(),
            errors: Vec::new(),
        })
    }
}

pub struct Harness {
    pub engine: Arc<FakeEngine>,
    pub service: Arc<FakeService>,
    pub runtime: Arc<FakeRuntime>,
    pub registry: Arc<FakeRegistry>,
    pub gate: Arc<RestartCoordinator>,
    pub orchestrator: Arc<ScanOrchestrator>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(OrchestratorSettings::default()).await
    }

    pub async fn with_settings(settings: OrchestratorSettings) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(FakeEngine::default());
        let service = Arc::new(FakeService::default());
        let runtime = Arc::new(FakeRuntime::default());
        let registry = Arc::new(FakeRegistry::default());
        let gate = Arc::new(RestartCoordinator::new(service.clone(), Duration::from_millis(10)));

        let orchestrator = ScanOrchestrator::start(
            &dir.path().join("scans.sqlite"),
            collaborators(&engine, &runtime, &registry, &gate),
            settings,
        )
        .await
        .expect("orchestrator starts");

        Self {
            engine,
            service,
            runtime,
            registry,
            gate,
            orchestrator: Arc::new(orchestrator),
            dir,
        }
    }

    /// A second orchestrator over the same database, as after a process
    /// restart.
    pub async fn reopen(&self) -> ScanOrchestrator {
        ScanOrchestrator::start(
            &self.dir.path().join("scans.sqlite"),
            collaborators(&self.engine, &self.runtime, &self.registry, &self.gate),
            OrchestratorSettings::default(),
        )
        .await
        .expect("orchestrator reopens")
    }

    pub async fn store(&self) -> JobStore {
        JobStore::connect(&self.dir.path().join("scans.sqlite"))
            .await
            .expect("store opens")
    }

    /// Creates a file under the harness directory and returns its path.
    pub fn upload(&self, name: &str, contents: &str) -> String {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).expect("write upload");
        path.display().to_string()
    }
}

fn collaborators(
    engine: &Arc<FakeEngine>,
    runtime: &Arc<FakeRuntime>,
    registry: &Arc<FakeRegistry>,
    gate: &Arc<RestartCoordinator>,
) -> Collaborators {
    Collaborators {
        engine: engine.clone(),
        runtime: runtime.clone(),
        registry: registry.clone(),
        gate: gate.clone(),
    }
}
