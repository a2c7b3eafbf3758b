//! Job lifecycle: admission through the restart gate, per-item engine runs,
//! result aggregation, persistence and completion callbacks.

pub mod callbacks;
pub mod images;
pub mod orchestrator;

pub use callbacks::{CallbackDispatcher, Substitutions, render_body};
pub use orchestrator::{Collaborators, OrchestratorSettings, ScanOrchestrator};
