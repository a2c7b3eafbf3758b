use thiserror::Error;

/// Failure of a single external command invocation (engine or container
/// runtime).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("relative execution disabled ({0})")]
    RelativeProgram(String),

    #[error("unable to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("{program} timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },

    #[error("{program} exited with code {code}: {output}")]
    Exit {
        program: String,
        code: i32,
        output: String,
    },
}

impl EngineError {
    /// Exit code reported to job error records. Failures that never produced
    /// an exit status map to `-1`.
    pub fn code(&self) -> i64 {
        match self {
            EngineError::Exit { code, .. } => i64::from(*code),
            _ => -1,
        }
    }

    /// Human readable output captured from the failed invocation.
    pub fn output(&self) -> String {
        match self {
            EngineError::Exit { output, .. } => output.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unable to open job database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("job database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("job database query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("unable to encode job {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unable to decode column {column} of job {id}: {message}")]
    Decode {
        id: String,
        column: &'static str,
        message: String,
    },
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("bad registry url {0}")]
    BadUrl(String),

    #[error("registry request to {route} failed: {message}")]
    Request { route: String, message: String },

    #[error("registry answered {status} for {route}: {reason}")]
    Status {
        route: String,
        status: u16,
        reason: String,
    },
}

impl RegistryError {
    pub fn code(&self) -> i64 {
        match self {
            RegistryError::Status { status, .. } => i64::from(*status),
            RegistryError::Request { .. } => 500,
            RegistryError::BadUrl(_) => -1,
        }
    }
}

#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("callback request to {uri} failed: {message}")]
    Request { uri: String, message: String },

    #[error("callback {uri} answered {status}")]
    Status { uri: String, status: u16 },
}

#[derive(Error, Debug)]
pub enum ScanwardError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ScanwardError>;
