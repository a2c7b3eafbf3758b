use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::StreamExt;
use tracing::{debug, warn};

use super::events::{EventKind, ScanEvent};
use super::{ScanEngine, ScanKind, TaskSettings};
use crate::error::EngineError;
use crate::model::{ItemReport, JobId, ObjectError, Threat, Verdict};

const GENERIC_OBJECT_ERROR: &str = "generic";

/// Runs one item through an engine task: create, configure, start, reduce,
/// delete.
#[derive(Clone)]
pub struct EngineAdapter {
    engine: Arc<dyn ScanEngine>,
    task_prefix: String,
    scan_timeout: Duration,
}

impl std::fmt::Debug for EngineAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineAdapter")
            .field("task_prefix", &self.task_prefix)
            .field("scan_timeout", &self.scan_timeout)
            .finish_non_exhaustive()
    }
}

impl EngineAdapter {
    pub fn new(engine: Arc<dyn ScanEngine>, task_prefix: impl Into<String>, scan_timeout: Duration) -> Self {
        Self {
            engine,
            task_prefix: task_prefix.into(),
            scan_timeout,
        }
    }

    /// Engine task names only allow `[A-Za-z0-9_]`.
    pub fn task_name(&self, job_id: JobId, seq: usize) -> String {
        format!("{}_{}_{}", self.task_prefix, job_id, seq).replace('-', "_")
    }

    /// Scans `target` (a local path or a local image id). The error's
    /// [`EngineError::code`] is the exit code reported for the item.
    pub async fn scan_item(
        &self,
        job_id: JobId,
        seq: usize,
        target: &str,
        kind: ScanKind,
    ) -> Result<ItemReport, EngineError> {
        let task = self.task_name(job_id, seq);

        self.engine.create_task(&task, kind).await.inspect_err(|err| {
            warn!(%job_id, task = %task, %kind, error = %err, "unable to create scan task");
        })?;

        let settings = TaskSettings::for_target(kind, target);
        if let Err(err) = self.engine.apply_settings(&task, &settings).await {
            warn!(%job_id, task = %task, error = %err, "unable to apply task settings");
            self.delete(&task).await;
            return Err(err);
        }

        let outcome = match tokio::time::timeout(self.scan_timeout, self.run(&task)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::Timeout {
                program: task.clone(),
                seconds: self.scan_timeout.as_secs(),
            }),
        };

        self.delete(&task).await;
        outcome
    }

    async fn run(&self, task: &str) -> Result<ItemReport, EngineError> {
        let run = self.engine.start_task(task).await?;
        let mut events = run.events;
        let mut reducer = VerdictReducer::new();
        while let Some(event) = events.next().await {
            debug!(task, event_type = event.event_type(), "engine event");
            reducer.observe(&event);
        }
        drop(events);
        run.exit.await?;
        Ok(reducer.finish())
    }

    async fn delete(&self, task: &str) {
        if let Err(err) = self.engine.delete_task(task).await {
            warn!(task, error = %err, "unable to delete task");
        }
    }
}

/// Folds a task's event sequence into an [`ItemReport`].
///
/// A task that produced no events at all is reported `clean`.
#[derive(Debug, Default)]
pub struct VerdictReducer {
    started: Option<DateTime<Utc>>,
    stopped: Option<DateTime<Utc>>,
    threats: Vec<Threat>,
    errors: Vec<ObjectError>,
}

impl VerdictReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &ScanEvent) {
        match event.kind() {
            EventKind::TaskStateChanged => {
                let date = event.get("Date").and_then(parse_engine_date);
                match event.get("TaskState") {
                    Some("Started") => self.started = date.or(self.started),
                    Some("Stopped") => self.stopped = date.or(self.stopped),
                    _ => {}
                }
            }
            EventKind::ThreatDetected => self.threats.push(Threat {
                name: event.get("DetectName").unwrap_or_default().to_string(),
                object: event.get("FileName").unwrap_or_default().to_string(),
            }),
            EventKind::ObjectProcessingError => self.errors.push(ObjectError {
                error: event
                    .get("ObjectProcessError")
                    .unwrap_or(GENERIC_OBJECT_ERROR)
                    .to_string(),
                object: event.get("FileName").unwrap_or_default().to_string(),
            }),
            EventKind::Other(_) => {}
        }
    }

    pub fn verdict(&self) -> Verdict {
        if !self.threats.is_empty() {
            Verdict::Infected
        } else if !self.errors.is_empty() {
            Verdict::NonScanned
        } else {
            Verdict::Clean
        }
    }

    pub fn finish(self) -> ItemReport {
        ItemReport {
            verdict: self.verdict(),
            threats: self.threats,
            errors: self.errors,
            started: self.started,
            stopped: self.stopped,
            ..ItemReport::new(Verdict::Clean)
        }
    }
}

/// The engine prints either RFC 3339 or a naive local-less timestamp.
fn parse_engine_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::decode_str;

    fn reduce(output: &str) -> ItemReport {
        let mut reducer = VerdictReducer::new();
        for event in decode_str(output) {
            reducer.observe(&event);
        }
        reducer.finish()
    }

    #[test]
    fn no_events_is_clean() {
        let report = reduce("");
        assert_eq!(report.verdict, Verdict::Clean);
        assert!(report.threats.is_empty());
    }

    #[test]
    fn threat_wins_over_errors() {
        let report = reduce(
            "EventType=ObjectProcessingError\nFileName=/tmp/a\n\
             EventType=ThreatDetected\nDetectName=EICAR-Test-File\nFileName=/tmp/a\n",
        );
        assert_eq!(report.verdict, Verdict::Infected);
        assert_eq!(
            report.threats,
            vec![Threat {
                name: "EICAR-Test-File".into(),
                object: "/tmp/a".into()
            }]
        );
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn processing_error_without_threat_is_non_scanned() {
        let report = reduce("EventType=ObjectProcessingError\nFileName=/tmp/enc.zip\n");
        assert_eq!(report.verdict, Verdict::NonScanned);
        assert_eq!(report.errors[0].error, "generic");

        let report = reduce(
            "EventType=ObjectProcessingError\nObjectProcessError=PasswordProtected\nFileName=/tmp/enc.zip\n",
        );
        assert_eq!(report.errors[0].error, "PasswordProtected");
    }

    #[test]
    fn task_state_dates_become_timestamps() {
        let report = reduce(
            "EventType=TaskStateChanged\nTaskState=Started\nDate=2024-05-01T10:00:00Z\n\
             EventType=TaskStateChanged\nTaskState=Stopped\nDate=2024-05-01 10:00:07\n",
        );
        assert_eq!(report.started.map(|d| d.to_rfc3339()), Some("2024-05-01T10:00:00+00:00".into()));
        assert_eq!(report.stopped.map(|d| d.to_rfc3339()), Some("2024-05-01T10:00:07+00:00".into()));
        assert_eq!(report.verdict, Verdict::Clean);
    }

    #[test]
    fn task_names_are_sanitized() {
        let engine: Arc<dyn ScanEngine> = Arc::new(NoEngine);
        let adapter = EngineAdapter::new(engine, "scanward", Duration::from_secs(1));
        let id: JobId = "0190a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b".parse().unwrap();
        assert_eq!(
            adapter.task_name(id, 2),
            "scanward_0190a1b2_c3d4_7e5f_8a9b_0c1d2e3f4a5b_2"
        );
    }

    struct NoEngine;

    #[async_trait::async_trait]
    impl ScanEngine for NoEngine {
        async fn create_task(&self, _: &str, _: ScanKind) -> Result<(), EngineError> {
            Ok(())
        }
        async fn apply_settings(&self, _: &str, _: &TaskSettings) -> Result<(), EngineError> {
            Ok(())
        }
        async fn start_task(&self, _: &str) -> Result<super::super::TaskRun, EngineError> {
            Err(EngineError::RelativeProgram("none".into()))
        }
        async fn delete_task(&self, _: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }
}
