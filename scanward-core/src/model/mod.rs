//! Job records and per-item outcomes shared by the orchestrator, the job
//! store and the HTTP layer.

pub mod job;
pub mod ordered;
pub mod params;
pub mod result;

pub use job::{JobError, JobId, JobKind, JobStatus, JobStatusLine, JobSummary, ScanJob};
pub use ordered::OrderedMap;
pub use params::{CallbackSpec, ScanParams};
pub use result::{ItemFailure, ItemReport, ItemResult, ObjectError, Threat, Verdict};
