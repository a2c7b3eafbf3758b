use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{JobId, JobKind, JobStatus, OrderedMap, ScanJob, Verdict};

/// Fields of a job that have no column of their own.
#[derive(Debug, Serialize, Deserialize)]
struct SessionEnvelope {
    kind: JobKind,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    items: OrderedMap<Option<String>>,
    #[serde(default)]
    started: Option<DateTime<Utc>>,
    #[serde(default)]
    verdicts: Vec<Verdict>,
}

/// Raw `scans` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub guid: String,
    pub status: String,
    pub created: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
    pub progress: i64,
    pub scan_params: String,
    pub scan_errors: String,
    pub scan_result: String,
    pub scan_session: String,
}

fn decode_column<T: DeserializeOwned>(
    guid: &str,
    column: &'static str,
    raw: &str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Decode {
        id: guid.to_string(),
        column,
        message: e.to_string(),
    })
}

impl TryFrom<JobRow> for ScanJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let decode_error = |column: &'static str, message: String| StoreError::Decode {
            id: row.guid.clone(),
            column,
            message,
        };

        let id = JobId::from_str(&row.guid).map_err(|e| decode_error("guid", e.to_string()))?;
        let status = JobStatus::from_str(&row.status).map_err(|e| decode_error("status", e))?;
        let progress = u8::try_from(row.progress.clamp(0, 100))
            .map_err(|e| decode_error("progress", e.to_string()))?;
        let session: SessionEnvelope = decode_column(&row.guid, "scan_session", &row.scan_session)?;

        Ok(ScanJob {
            id,
            kind: session.kind,
            source: session.source,
            status,
            created: row.created,
            started: session.started,
            completed: row.completed,
            progress,
            items: session.items,
            params: decode_column(&row.guid, "scan_params", &row.scan_params)?,
            errors: decode_column(&row.guid, "scan_errors", &row.scan_errors)?,
            results: decode_column(&row.guid, "scan_result", &row.scan_result)?,
            verdicts: session.verdicts,
        })
    }
}

/// Encoded columns of one job.
struct EncodedJob {
    params: String,
    errors: String,
    results: String,
    session: String,
}

impl EncodedJob {
    fn new(job: &ScanJob) -> Result<Self, StoreError> {
        let encode_error = |source| StoreError::Encode {
            id: job.id.to_string(),
            source,
        };
        let session = SessionEnvelope {
            kind: job.kind,
            source: job.source.clone(),
            items: job.items.clone(),
            started: job.started,
            verdicts: job.verdicts.clone(),
        };
        Ok(Self {
            params: serde_json::to_string(&job.params).map_err(encode_error)?,
            errors: serde_json::to_string(&job.errors).map_err(encode_error)?,
            results: serde_json::to_string(&job.results).map_err(encode_error)?,
            session: serde_json::to_string(&session).map_err(encode_error)?,
        })
    }
}

/// Durable record of scan jobs in SQLite.
#[derive(Clone, Debug)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Opens (creating when missing) the database at `path` and applies
    /// migrations.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Connect(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(StoreError::Connect)?;

        let store = Self::from_pool(pool);
        store.migrate().await?;
        info!(path = %path.display(), "job database ready");
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        crate::MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn insert(&self, job: &ScanJob) -> Result<(), StoreError> {
        let encoded = EncodedJob::new(job)?;
        sqlx::query(
            r#"
            INSERT INTO scans
                (guid, status, created, completed, progress,
                 scan_params, scan_errors, scan_result, scan_session)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.status.as_str())
        .bind(job.created)
        .bind(job.completed)
        .bind(i64::from(job.progress))
        .bind(encoded.params)
        .bind(encoded.errors)
        .bind(encoded.results)
        .bind(encoded.session)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job.id, "job inserted");
        Ok(())
    }

    /// Overwrites every mutable column of the job's row.
    pub async fn update_full(&self, job: &ScanJob) -> Result<(), StoreError> {
        let encoded = EncodedJob::new(job)?;
        let result = sqlx::query(
            r#"
            UPDATE scans
            SET status = ?, completed = ?, progress = ?,
                scan_params = ?, scan_errors = ?, scan_result = ?, scan_session = ?
            WHERE guid = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.completed)
        .bind(i64::from(job.progress))
        .bind(encoded.params)
        .bind(encoded.errors)
        .bind(encoded.results)
        .bind(encoded.session)
        .bind(job.id.to_string())
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job.id, rows = result.rows_affected(), "job updated");
        Ok(())
    }

    pub async fn list_all(&self) -> Result<Vec<JobRow>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT guid, status, created, completed, progress,
                   scan_params, scan_errors, scan_result, scan_session
            FROM scans
            ORDER BY created
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Every stored job, decoded independently. A row that does not decode
    /// yields an error in its slot.
    pub async fn load_all(&self) -> Result<Vec<Result<ScanJob, StoreError>>, StoreError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .map(ScanJob::try_from)
            .collect())
    }
}
