use serde::{Deserialize, Deserializer, Serialize};

/// Status reported by the engine's `--app-info` exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EngineStatus {
    Success,
    CouldNotConnect,
    NeedRestart,
    NeedReboot,
    Unknown(i32),
}

impl EngineStatus {
    pub const NEED_RESTART_CODE: i32 = 74;

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => EngineStatus::Success,
            64 => EngineStatus::CouldNotConnect,
            Self::NEED_RESTART_CODE => EngineStatus::NeedRestart,
            75 => EngineStatus::NeedReboot,
            other => EngineStatus::Unknown(other),
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            EngineStatus::Success => "success",
            EngineStatus::CouldNotConnect => "could not connect",
            EngineStatus::NeedRestart => "need restart",
            EngineStatus::NeedReboot => "need reboot",
            EngineStatus::Unknown(_) => "unknown status",
        }
    }
}

const NOT_AVAILABLE: &str = "Not available";
const VALID_LICENSE: &str = "The key is valid";

fn not_available() -> String {
    NOT_AVAILABLE.to_string()
}

/// Engine product information as printed by `--app-info --json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    #[serde(
        rename(deserialize = "Application databases loaded"),
        default,
        deserialize_with = "databases_loaded"
    )]
    pub databases_loaded: bool,
    #[serde(rename(deserialize = "Last release date of databases"), default = "not_available")]
    pub databases_date: String,
    #[serde(rename(deserialize = "Policy"), default = "not_available")]
    pub policy: String,
    #[serde(rename(deserialize = "Version"), default = "not_available")]
    pub version: String,
    #[serde(rename(deserialize = "License information"), default = "not_available")]
    pub license_info: String,
    #[serde(rename(deserialize = "License expiration date"), default = "not_available")]
    pub license_expiration: String,
}

impl Default for ProductInfo {
    fn default() -> Self {
        Self {
            databases_loaded: false,
            databases_date: not_available(),
            policy: not_available(),
            version: not_available(),
            license_info: not_available(),
            license_expiration: not_available(),
        }
    }
}

/// The engine prints `"None"` until databases are loaded and a free-form
/// value afterwards.
fn databases_loaded<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(loaded) => loaded,
        serde_json::Value::String(s) => s != "None",
        _ => true,
    })
}

/// Availability verdict combining product info and restart state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProductStatus {
    pub info: ProductInfo,
    pub reasons: Vec<String>,
}

impl ProductStatus {
    /// `info` is `None` when the engine did not answer.
    pub fn evaluate(info: Option<ProductInfo>, restarting: bool) -> Self {
        let mut reasons = Vec::new();
        let responded = info.is_some();
        let info = info.unwrap_or_default();

        if restarting {
            reasons.push("engine restarting".to_string());
        } else if !responded {
            reasons.push("engine not responding".to_string());
        } else {
            if !info.databases_loaded {
                reasons.push("Databases not loaded".to_string());
            }
            if info.license_info != VALID_LICENSE {
                reasons.push(format!("License error: {}", info.license_info));
            }
        }

        Self { info, reasons }
    }

    pub fn available(&self) -> bool {
        self.reasons.is_empty()
    }
}
