use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::callbacks::{CALLBACK_TIMEOUT, CallbackDispatcher, Substitutions};
use super::images::{ImageSession, ImageSetup};
use crate::container::ContainerRuntime;
use crate::engine::{EngineAdapter, ScanEngine, ScanKind};
use crate::error::{Result, ScanwardError, StoreError};
use crate::model::{
    ItemReport, ItemResult, JobError, JobId, JobKind, JobStatusLine, JobSummary, ScanJob,
    Verdict,
};
use crate::persistence::JobStore;
use crate::registry::{KnownRegistries, RegistryCatalog};
use crate::restart::RestartCoordinator;

/// Tunables of the orchestrator.
#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    /// Prefix of engine task names.
    pub task_prefix: String,
    /// Upper bound for one engine task run.
    pub scan_timeout: Duration,
    /// Used when a job does not say whether to skip published images.
    pub skip_image_if_exists: bool,
    pub callback_timeout: Duration,
    pub known_registries: KnownRegistries,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            task_prefix: "scanward".to_string(),
            scan_timeout: Duration::from_secs(600),
            skip_image_if_exists: false,
            callback_timeout: CALLBACK_TIMEOUT,
            known_registries: KnownRegistries::new(),
        }
    }
}

/// External collaborators the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub engine: Arc<dyn ScanEngine>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub registry: Arc<dyn RegistryCatalog>,
    pub gate: Arc<RestartCoordinator>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

/// Owns every known job and runs them.
///
/// The job map is shared with the request layer. Each running job is mutated
/// only by its own worker; the map lock is held for single updates and never
/// across an await.
pub struct ScanOrchestrator {
    jobs: RwLock<HashMap<JobId, ScanJob>>,
    store: JobStore,
    adapter: EngineAdapter,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<dyn RegistryCatalog>,
    gate: Arc<RestartCoordinator>,
    callbacks: CallbackDispatcher,
    settings: OrchestratorSettings,
}

impl std::fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("jobs", &self.jobs.read().len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ScanOrchestrator {
    pub fn new(
        store: JobStore,
        collaborators: Collaborators,
        settings: OrchestratorSettings,
    ) -> Result<Self> {
        let callbacks = CallbackDispatcher::new(settings.callback_timeout)?;
        let adapter = EngineAdapter::new(
            collaborators.engine,
            settings.task_prefix.clone(),
            settings.scan_timeout,
        );
        Ok(Self {
            jobs: RwLock::new(HashMap::new()),
            store,
            adapter,
            runtime: collaborators.runtime,
            registry: collaborators.registry,
            gate: collaborators.gate,
            callbacks,
            settings,
        })
    }

    /// Opens the job database and loads the stored jobs. Failing to open the
    /// database is fatal.
    pub async fn start(
        database_path: &Path,
        collaborators: Collaborators,
        settings: OrchestratorSettings,
    ) -> Result<Self> {
        let store = JobStore::connect(database_path).await?;
        let orchestrator = Self::new(store, collaborators, settings)?;
        match orchestrator.reload().await {
            Ok(loaded) => info!(loaded, "stored jobs loaded"),
            Err(err) => error!(error = %err, "unable to read stored jobs"),
        }
        Ok(orchestrator)
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn gate(&self) -> &Arc<RestartCoordinator> {
        &self.gate
    }

    /// Inserts jobs from the store that are not in memory yet. Jobs already
    /// in memory are never replaced. Returns how many were added.
    pub async fn reload(&self) -> std::result::Result<usize, StoreError> {
        let stored = self.store.load_all().await?;
        let mut jobs = self.jobs.write();
        let mut added = 0;
        for job in stored {
            match job {
                Ok(job) => {
                    if let std::collections::hash_map::Entry::Vacant(slot) = jobs.entry(job.id) {
                        slot.insert(job);
                        added += 1;
                    }
                }
                Err(err) => warn!(error = %err, "skipping unreadable job row"),
            }
        }
        debug!(added, total = jobs.len(), "jobs reloaded");
        Ok(added)
    }

    /// Registers a new job and records it durably. A failed insert is logged;
    /// the in-memory job stays authoritative.
    pub async fn create_job(&self, job: ScanJob) -> JobId {
        let id = job.id;
        if let Err(err) = self.store.insert(&job).await {
            error!(job_id = %id, error = %err, "unable to store new job");
        }
        info!(job_id = %id, kind = %job.kind, items = job.items.len(), "job created");
        self.jobs.write().insert(id, job);
        id
    }

    /// Status and progress of every job, ordered by id (creation order).
    pub async fn list_jobs(&self, force_reload: bool) -> BTreeMap<JobId, JobStatusLine> {
        if force_reload {
            self.reload_logged().await;
        }
        self.jobs
            .read()
            .iter()
            .map(|(id, job)| (*id, job.status_line()))
            .collect()
    }

    pub async fn get_job(&self, id: JobId, force_reload: bool) -> Option<JobSummary> {
        if force_reload {
            self.reload_logged().await;
        }
        self.jobs.read().get(&id).map(ScanJob::summary)
    }

    async fn reload_logged(&self) {
        if let Err(err) = self.reload().await {
            error!(error = %err, "unable to reload jobs");
        }
    }

    /// Runs the job on the caller's task and returns its final summary.
    pub async fn run_sync(&self, id: JobId) -> Result<JobSummary> {
        self.run_job(id).await?;
        self.jobs
            .read()
            .get(&id)
            .map(ScanJob::summary)
            .ok_or_else(|| ScanwardError::NotFound(id.to_string()))
    }

    /// Runs the job on its own task.
    pub fn spawn(self: &Arc<Self>, id: JobId) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = this.run_job(id).await {
                warn!(job_id = %id, error = %err, "background job not run");
            }
        })
    }

    /// Drives one job from `created` to `completed`. A job is run at most
    /// once; later calls return without doing anything.
    pub async fn run_job(&self, id: JobId) -> Result<()> {
        let claimed = {
            let mut jobs = self.jobs.write();
            let job = jobs
                .get_mut(&id)
                .ok_or_else(|| ScanwardError::NotFound(id.to_string()))?;
            if job.started.is_some() || job.is_completed() {
                false
            } else {
                job.started = Some(Utc::now());
                true
            }
        };
        if !claimed {
            debug!(job_id = %id, "job already run");
            return Ok(());
        }

        let _admission = self.gate.admit().await;
        info!(job_id = %id, "job started");

        let Some((kind, source, destination, skip)) = self.with_job(id, |job| {
            (
                job.kind,
                job.source.clone(),
                job.params.destination.clone(),
                job.params.skip_image_if_exists_or(self.settings.skip_image_if_exists),
            )
        }) else {
            return Err(ScanwardError::NotFound(id.to_string()));
        };

        let session = match kind {
            JobKind::Stream => None,
            JobKind::Image => {
                let setup = ImageSetup {
                    registry: &self.registry,
                    runtime: &self.runtime,
                    known: &self.settings.known_registries,
                };
                let outcome = setup
                    .prepare(source.as_deref(), destination.as_deref(), skip)
                    .await;
                let fatal = outcome.session.is_none();
                self.with_job(id, |job| {
                    job.items = outcome.items;
                    job.errors.extend(outcome.errors);
                });
                if fatal {
                    warn!(job_id = %id, "image job setup failed");
                    self.finalize(id).await;
                    return Ok(());
                }
                outcome.session
            }
        };

        let items: Vec<(String, Option<String>)> = self
            .with_job(id, |job| {
                job.items
                    .iter()
                    .map(|(name, locator)| (name.to_string(), locator.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let total = items.len();

        for (seq, (name, locator)) in items.into_iter().enumerate() {
            let (result, errors) = match session.as_ref() {
                Some(session) => self.process_image(id, seq + 1, &name, locator.as_deref(), session).await,
                None => (self.process_stream(id, seq + 1, &name, locator.as_deref()).await, Vec::new()),
            };
            debug!(job_id = %id, item = %name, verdict = ?result.verdict(), "item processed");

            self.with_job(id, |job| {
                if !job.results.contains_key(&name) {
                    job.results.insert(name.clone(), result);
                }
                job.errors.extend(errors);
                job.advance_progress(seq + 1, total);
            });
        }

        self.finalize(id).await;
        Ok(())
    }

    async fn process_stream(&self, id: JobId, seq: usize, name: &str, path: Option<&str>) -> ItemResult {
        let Some(path) = path else {
            return ItemResult::failed(-1, format!("no source for item {name}"));
        };
        let started = Utc::now();
        let outcome = self.adapter.scan_item(id, seq, path, ScanKind::Ods).await;

        if let Err(err) = tokio::fs::remove_file(path).await {
            debug!(job_id = %id, path, error = %err, "unable to remove scanned file");
        }

        match outcome {
            Ok(report) => stamp(report, started).into(),
            Err(err) => {
                warn!(job_id = %id, item = name, error = %err, "item scan failed");
                ItemResult::failed(err.code(), err.output())
            }
        }
    }

    async fn process_image(
        &self,
        id: JobId,
        seq: usize,
        item: &str,
        digest: Option<&str>,
        session: &ImageSession,
    ) -> (ItemResult, Vec<JobError>) {
        let mut errors = Vec::new();

        if session.already_published(item, digest) {
            debug!(job_id = %id, item, "image already published, skipped");
            return (ItemReport::skipped_existing().into(), errors);
        }

        let started = Utc::now();
        let image_id = match self
            .runtime
            .pull(&session.source.repository, item, session.source.tls())
            .await
        {
            Ok(image_id) => image_id,
            Err(err) => {
                warn!(job_id = %id, item, error = %err, "image pull failed");
                let message = format!("podman: unable pull image {item}");
                errors.push(JobError::new(err.code(), message.clone()).with_details(err.output()));
                return (ItemResult::failed(err.code(), message), errors);
            }
        };

        let result = match self
            .adapter
            .scan_item(id, seq, &image_id, ScanKind::ContainerScan)
            .await
        {
            Ok(report) => stamp(report, started).into(),
            Err(err) => {
                warn!(job_id = %id, item, error = %err, "image scan failed");
                ItemResult::failed(err.code(), err.output())
            }
        };

        if let Some(destination) = session.destination.as_ref()
            && result.verdict() == Some(Verdict::Clean)
        {
            let source_ref = session.source.source_reference(item);
            let target_ref = destination.ctx.destination_reference(item);
            match self.runtime.tag(&source_ref, &target_ref).await {
                Err(err) => errors.push(
                    JobError::new(err.code(), format!("podman: unable re-tag image {source_ref}: {target_ref}"))
                        .with_details(err.output()),
                ),
                Ok(()) => {
                    if let Err(err) = self.runtime.push(&target_ref, destination.ctx.tls()).await {
                        errors.push(
                            JobError::new(err.code(), format!("podman: unable push image {target_ref}"))
                                .with_details(err.output()),
                        );
                    } else {
                        info!(job_id = %id, image = %target_ref, "clean image published");
                    }
                }
            }
        }

        if let Err(err) = self.runtime.remove(&image_id).await {
            errors.push(
                JobError::new(err.code(), format!("podman: unable to delete image {item}"))
                    .with_details(err.output()),
            );
        }

        (result, errors)
    }

    /// Completes the job, persists it and fires its callbacks.
    async fn finalize(&self, id: JobId) {
        let Some(job) = self.with_job(id, |job| {
            job.complete(Utc::now());
            job.clone()
        }) else {
            return;
        };

        if let Err(err) = self.store.update_full(&job).await {
            error!(job_id = %id, error = %err, "unable to store completed job");
        }
        info!(
            job_id = %id,
            verdicts = ?job.verdicts,
            errors = job.errors.len(),
            "job completed"
        );

        if job.params.custom_callbacks.is_empty() {
            return;
        }

        let subst = Substitutions::from_job(&job);
        let mut failures = Vec::new();
        for (name, spec) in job.params.custom_callbacks.iter() {
            if let Err(err) = self.callbacks.dispatch(name, spec, &subst).await {
                failures.push(JobError::new(-1, "unable to send callback").with_details(err.to_string()));
            }
        }

        if !failures.is_empty()
            && let Some(job) = self.with_job(id, |job| {
                job.errors.extend(failures);
                job.clone()
            })
            && let Err(err) = self.store.update_full(&job).await
        {
            error!(job_id = %id, error = %err, "unable to store callback errors");
        }
    }

    fn with_job<T>(&self, id: JobId, f: impl FnOnce(&mut ScanJob) -> T) -> Option<T> {
        self.jobs.write().get_mut(&id).map(f)
    }
}

/// Falls back to wall-clock times when the engine did not report its own.
fn stamp(mut report: ItemReport, started: chrono::DateTime<Utc>) -> ItemReport {
    report.started.get_or_insert(started);
    report.stopped.get_or_insert_with(Utc::now);
    report
}

