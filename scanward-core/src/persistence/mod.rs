//! SQLite persistence for scan jobs.

pub mod jobs;

pub use jobs::{JobRow, JobStore};
