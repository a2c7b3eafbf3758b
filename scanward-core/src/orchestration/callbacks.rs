use std::time::Duration;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use reqwest::header::CONTENT_TYPE;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::CallbackError;
use crate::model::{CallbackSpec, ScanJob, Verdict};

pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(2);

const JSON_CONTENT: &str = "application/json";
const TEXT_CONTENT: &str = "text/plain";

static TEMPLATE_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(?:infected|clean|skipped)").expect("template pattern compiles"));

/// Values of the `$infected`, `$clean` and `$skipped` template variables.
#[derive(Clone, Debug, PartialEq)]
pub struct Substitutions {
    entries: [(&'static str, Value); 3],
}

impl Substitutions {
    pub fn from_job(job: &ScanJob) -> Self {
        let subset = |verdict| serde_json::to_value(job.results_with(verdict)).unwrap_or(Value::Null);
        Self {
            entries: [
                ("$infected", subset(Verdict::Infected)),
                ("$clean", subset(Verdict::Clean)),
                ("$skipped", subset(Verdict::Skipped)),
            ],
        }
    }

    fn lookup(&self, token: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(name, _)| *name == token)
            .map(|(_, value)| value)
    }

    /// Replaces leaf strings that are exactly a variable name.
    pub fn apply_json(&self, template: &Value) -> Value {
        match template {
            Value::String(s) => self.lookup(s).cloned().unwrap_or_else(|| template.clone()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.apply_json(v)))
                    .collect::<Map<_, _>>(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.apply_json(v)).collect()),
            other => other.clone(),
        }
    }

    /// Replaces every variable occurrence with its JSON text, in one pass
    /// over the template.
    pub fn apply_text(&self, template: &str) -> String {
        TEMPLATE_VAR
            .replace_all(template, |caps: &Captures<'_>| {
                self.lookup(&caps[0]).map(Value::to_string).unwrap_or_default()
            })
            .into_owned()
    }
}

/// Builds the request body for one callback definition.
pub fn render_body(spec: &CallbackSpec, subst: &Substitutions) -> Value {
    let Some(body) = spec.body.as_ref() else {
        return Value::Null;
    };
    match spec.content_type.as_deref() {
        Some(JSON_CONTENT) => subst.apply_json(body),
        Some(TEXT_CONTENT) => match body {
            Value::String(text) => Value::String(subst.apply_text(text)),
            other => other.clone(),
        },
        _ => body.clone(),
    }
}

/// Posts completion callbacks. Never retries.
#[derive(Clone, Debug)]
pub struct CallbackDispatcher {
    http: reqwest::Client,
}

impl CallbackDispatcher {
    pub fn new(timeout: Duration) -> Result<Self, CallbackError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallbackError::Request {
                uri: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { http })
    }

    pub async fn dispatch(&self, name: &str, spec: &CallbackSpec, subst: &Substitutions) -> Result<(), CallbackError> {
        let body = render_body(spec, subst);
        debug!(callback = name, uri = %spec.uri, "sending callback");

        let response = self
            .http
            .post(&spec.uri)
            .header(CONTENT_TYPE, JSON_CONTENT)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(callback = name, uri = %spec.uri, error = %e, "callback request failed");
                CallbackError::Request {
                    uri: spec.uri.clone(),
                    message: e.to_string(),
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(callback = name, uri = %spec.uri, status = status.as_u16(), "callback rejected");
            return Err(CallbackError::Status {
                uri: spec.uri.clone(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
