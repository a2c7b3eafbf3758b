use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ordered::OrderedMap;

/// Caller supplied scan options. Immutable once the job is created.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanParams {
    /// Registry URL clean images are pushed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Skip images whose digest already exists in the destination. Falls back
    /// to the service default when absent.
    #[serde(
        default,
        rename = "skipimageifexists",
        alias = "skip_image_if_exists",
        skip_serializing_if = "Option::is_none"
    )]
    pub skip_image_if_exists: Option<bool>,
    /// Webhooks fired once the job completes, keyed by a caller chosen name
    /// (`on_detect`, `on_complete`, ...).
    #[serde(default, skip_serializing_if = "OrderedMap::is_empty")]
    pub custom_callbacks: OrderedMap<CallbackSpec>,
}

impl ScanParams {
    pub fn skip_image_if_exists_or(&self, default: bool) -> bool {
        self.skip_image_if_exists.unwrap_or(default)
    }

    /// Every URL the caller handed us, labelled for validation errors.
    pub fn urls(&self) -> Vec<(String, &str)> {
        let mut urls = Vec::new();
        if let Some(destination) = self.destination.as_deref() {
            urls.push(("destination".to_string(), destination));
        }
        for (name, callback) in self.custom_callbacks.iter() {
            urls.push((format!("{name} uri"), callback.uri.as_str()));
        }
        urls
    }
}

/// Webhook definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallbackSpec {
    pub uri: String,
    #[serde(
        default,
        rename = "content-type",
        alias = "content_type",
        skip_serializing_if = "Option::is_none"
    )]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}
