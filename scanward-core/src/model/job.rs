use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::ordered::OrderedMap;
use super::params::ScanParams;
use super::result::{ItemResult, Verdict};

/// Unique identifier for scan jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

/// What a job scans.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Uploaded files spooled to local temporary paths.
    Stream,
    /// Container images resolved from a registry.
    Image,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Stream => write!(f, "stream"),
            JobKind::Image => write!(f, "image"),
        }
    }
}

/// Persisted job status. `running` is never stored, see
/// [`ScanJob::is_running`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Completed => "completed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobStatus::Created),
            "completed" => Ok(JobStatus::Completed),
            other => Err(format!("unknown job status {other}")),
        }
    }
}

/// Error accumulated during a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl JobError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<Value>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// The unit of work tracked from request to completion.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanJob {
    pub id: JobId,
    pub kind: JobKind,
    /// Registry URL for image jobs, upload content type for stream jobs.
    pub source: Option<String>,
    pub status: JobStatus,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub progress: u8,
    /// Item identifier to source locator (temporary path or image digest).
    pub items: OrderedMap<Option<String>>,
    pub params: ScanParams,
    pub errors: Vec<JobError>,
    pub results: OrderedMap<ItemResult>,
    pub verdicts: Vec<Verdict>,
}

impl ScanJob {
    fn new(kind: JobKind, source: Option<String>, params: ScanParams) -> Self {
        Self {
            id: JobId::new(),
            kind,
            source,
            status: JobStatus::Created,
            created: Utc::now(),
            started: None,
            completed: None,
            progress: 0,
            items: OrderedMap::new(),
            params,
            errors: Vec::new(),
            results: OrderedMap::new(),
            verdicts: Vec::new(),
        }
    }

    /// A job over uploaded files. `items` maps file names to spooled paths.
    pub fn stream<I, K, P>(source: impl Into<String>, items: I, params: ScanParams) -> Self
    where
        I: IntoIterator<Item = (K, P)>,
        K: Into<String>,
        P: Into<String>,
    {
        let mut job = Self::new(JobKind::Stream, Some(source.into()), params);
        job.items = items
            .into_iter()
            .map(|(name, path)| (name, Some(path.into())))
            .collect();
        job
    }

    /// A job over the images a registry URL resolves to. Items are filled in
    /// by the setup phase of the run.
    pub fn image(source: impl Into<String>, params: ScanParams) -> Self {
        Self::new(JobKind::Image, Some(source.into()), params)
    }

    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }

    /// A worker has admitted the job and it has not finished yet.
    pub fn is_running(&self) -> bool {
        self.started.is_some() && self.completed.is_none()
    }

    /// Advances progress to `floor(100 * done / total)`. Never moves backwards.
    pub fn advance_progress(&mut self, done: usize, total: usize) {
        if total == 0 {
            return;
        }
        let pct = (100 * done.min(total) / total) as u8;
        self.progress = self.progress.max(pct);
    }

    /// Distinct verdicts in the order they first appear in `results`.
    pub fn distinct_verdicts(&self) -> Vec<Verdict> {
        let mut verdicts = Vec::new();
        for (_, result) in self.results.iter() {
            if let Some(verdict) = result.verdict()
                && !verdicts.contains(&verdict)
            {
                verdicts.push(verdict);
            }
        }
        verdicts
    }

    /// Marks the job completed. Calling it twice keeps the first timestamp.
    pub fn complete(&mut self, at: DateTime<Utc>) {
        if self.is_completed() {
            return;
        }
        self.verdicts = self.distinct_verdicts();
        self.progress = 100;
        self.completed = Some(at);
        self.status = JobStatus::Completed;
    }

    /// Results whose verdict equals `verdict`.
    pub fn results_with(&self, verdict: Verdict) -> OrderedMap<ItemResult> {
        self.results
            .filtered(|_, result| result.verdict() == Some(verdict))
    }

    pub fn status_line(&self) -> JobStatusLine {
        JobStatusLine {
            status: self.status,
            progress: self.progress,
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            scan_id: self.id,
            kind: self.kind,
            status: self.status,
            created: self.created,
            completed: self.completed,
            progress: self.progress,
            scan_params: self.params.clone(),
            scan_errors: self.errors.clone(),
            scan_result: self.results.clone(),
            verdicts: self.verdicts.clone(),
        }
    }
}

/// Entry of the job listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusLine {
    pub status: JobStatus,
    pub progress: u8,
}

/// Full view of one job as reported to callers. Empty collections and unset
/// timestamps are omitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub scan_id: JobId,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub status: JobStatus,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "is_default_params")]
    pub scan_params: ScanParams,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scan_errors: Vec<JobError>,
    #[serde(default, skip_serializing_if = "OrderedMap::is_empty")]
    pub scan_result: OrderedMap<ItemResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verdicts: Vec<Verdict>,
}

fn is_default_params(params: &ScanParams) -> bool {
    *params == ScanParams::default()
}
