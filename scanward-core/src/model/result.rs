use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-item outcome classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "clean")]
    Clean,
    #[serde(rename = "infected")]
    Infected,
    #[serde(rename = "non scanned")]
    NonScanned,
    #[serde(rename = "skipped")]
    Skipped,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Clean => "clean",
            Verdict::Infected => "infected",
            Verdict::NonScanned => "non scanned",
            Verdict::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detection reported by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threat {
    pub name: String,
    pub object: String,
}

/// An object the engine could not process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectError {
    pub error: String,
    pub object: String,
}

/// Outcome of a scanned (or deliberately skipped) item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub threats: Vec<Threat>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ObjectError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped: Option<DateTime<Utc>>,
}

impl ItemReport {
    pub fn new(verdict: Verdict) -> Self {
        Self {
            info: None,
            verdict,
            threats: Vec::new(),
            errors: Vec::new(),
            started: None,
            stopped: None,
        }
    }

    /// Result recorded for an image the destination already holds.
    pub fn skipped_existing() -> Self {
        Self {
            info: Some("image exists and skipped".to_string()),
            ..Self::new(Verdict::Skipped)
        }
    }
}

/// Failure recorded in place of a report when an item could not be scanned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub code: i64,
    pub message: String,
}

/// Entry of a job's result map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemResult {
    Report(ItemReport),
    Failed { error: ItemFailure },
}

impl ItemResult {
    pub fn failed(code: i64, message: impl Into<String>) -> Self {
        ItemResult::Failed {
            error: ItemFailure {
                code,
                message: message.into(),
            },
        }
    }

    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            ItemResult::Report(report) => Some(report.verdict),
            ItemResult::Failed { .. } => None,
        }
    }
}

impl From<ItemReport> for ItemResult {
    fn from(report: ItemReport) -> Self {
        ItemResult::Report(report)
    }
}
