//! Scan submission and job inspection.

use std::path::{Path, PathBuf};

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{FromRequest, Multipart, Path as UrlPath, Query, Request, State},
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use scanward_core::model::{JobId, OrderedMap, ScanJob, ScanParams};

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

/// Item name used when an upload carries no usable file name.
pub const NONAME: &str = "noname";

const OCTET_STREAM: &str = "application/octet-stream";
const MULTIPART: &str = "multipart/form-data";
const JSON_CONTENT: &str = "application/json";
const TEXT_CONTENT: &str = "text/plain";

const MAX_REQUEST_DOCUMENT: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentKind {
    OctetStream,
    Multipart,
    Json,
    Text,
}

impl ContentKind {
    fn detect(content_type: &str) -> Option<Self> {
        let content_type = content_type.trim_start();
        [
            (OCTET_STREAM, ContentKind::OctetStream),
            (MULTIPART, ContentKind::Multipart),
            (JSON_CONTENT, ContentKind::Json),
            (TEXT_CONTENT, ContentKind::Text),
        ]
        .into_iter()
        .find(|(prefix, _)| content_type.starts_with(prefix))
        .map(|(_, kind)| kind)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitQuery {
    pub wait: Option<String>,
}

impl SubmitQuery {
    fn synchronous(&self) -> bool {
        self.wait.as_deref() == Some("1")
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ForceQuery {
    /// Present (with any value) to re-read the job store first.
    pub force: Option<String>,
}

impl ForceQuery {
    fn force(&self) -> bool {
        self.force.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct ImageRequest {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    params: Option<ScanParams>,
}

/// `POST /scans[?wait=1]`
pub async fn create_scan(
    State(state): State<AppState>,
    Query(query): Query<SubmitQuery>,
    request: Request,
) -> AppResult<Response> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let Some(kind) = ContentKind::detect(&content_type) else {
        warn!(content_type = %content_type, "unsupported content type");
        return Err(AppError::unsupported_content_type().with_details(content_type));
    };

    let status = state.product_status().await;
    if !status.available() {
        warn!(reasons = ?status.reasons, "service not ready");
        return Err(AppError::service_not_available().with_details(status.reasons));
    }

    debug!(content_type = %content_type, wait = query.synchronous(), "scan request");
    let job = match kind {
        ContentKind::OctetStream => octet_stream_job(&state.tmp_path, request.into_body()).await?,
        ContentKind::Multipart => multipart_job(&state, request).await?,
        ContentKind::Json => json_job(request.into_body()).await?,
        ContentKind::Text => text_job(request.into_body()).await?,
    };

    let id = state.orchestrator.create_job(job).await;
    if query.synchronous() {
        let summary = state.orchestrator.run_sync(id).await?;
        return Ok((StatusCode::OK, Json(summary)).into_response());
    }

    state.orchestrator.spawn(id);
    info!(job_id = %id, "scan accepted");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": id,
            "location": format!("/scans/{id}"),
        })),
    )
        .into_response())
}

/// `GET /scans[?force]`
pub async fn list_scans(State(state): State<AppState>, Query(query): Query<ForceQuery>) -> impl IntoResponse {
    Json(state.orchestrator.list_jobs(query.force()).await)
}

/// `GET /scans/{id}[?force]`
pub async fn show_scan(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
    Query(query): Query<ForceQuery>,
) -> AppResult<Response> {
    let id: JobId = id.parse().map_err(|_| AppError::not_found())?;
    let summary = state
        .orchestrator
        .get_job(id, query.force())
        .await
        .ok_or_else(AppError::not_found)?;
    Ok(Json(summary).into_response())
}

async fn octet_stream_job(dir: &Path, body: Body) -> AppResult<ScanJob> {
    let path = spool_path(dir);
    let written = match write_stream(&path, body.into_data_stream()).await {
        Ok(written) => written,
        Err(err) => {
            discard(&path).await;
            return Err(err);
        }
    };
    if written == 0 {
        discard(&path).await;
        return Err(AppError::nothing_to_process());
    }
    Ok(ScanJob::stream(
        OCTET_STREAM,
        [(NONAME, path.display().to_string())],
        ScanParams::default(),
    ))
}

async fn multipart_job(state: &AppState, request: Request) -> AppResult<ScanJob> {
    let mut multipart = Multipart::from_request(request, state).await.map_err(|rejection| {
        AppError::unsupported_content_type().with_details(rejection.body_text())
    })?;

    let mut items = OrderedMap::new();
    let params = match read_form(&mut multipart, &state.tmp_path, &mut items).await {
        Ok(params) => params,
        Err(err) => {
            discard_all(&items).await;
            return Err(err);
        }
    };

    if items.is_empty() {
        return Err(AppError::nothing_to_process());
    }
    if let Err(err) = validate_urls(None, &params) {
        discard_all(&items).await;
        return Err(err);
    }
    Ok(ScanJob::stream(MULTIPART, items, params))
}

/// Spools every file part and parses the `params` part. Items map sanitized
/// file names to spooled paths.
async fn read_form(
    multipart: &mut Multipart,
    dir: &Path,
    items: &mut OrderedMap<String>,
) -> AppResult<ScanParams> {
    let mut params = ScanParams::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        match field.file_name().map(sanitize_file_name) {
            Some(name) => {
                let path = spool_path(dir);
                let path_text = path.display().to_string();
                // Registered before writing so a failed write is cleaned up.
                if let Some(replaced) = items.insert(name, path_text) {
                    discard(Path::new(&replaced)).await;
                }
                write_stream(&path, field).await?;
            }
            None if field.name() == Some("params") => {
                let text = field.text().await.map_err(multipart_error)?;
                params = serde_json::from_str(&text)
                    .map_err(|err| AppError::invalid_json().with_details(err.to_string()))?;
            }
            None => debug!(field = ?field.name(), "ignoring form field"),
        }
    }
    Ok(params)
}

async fn json_job(body: Body) -> AppResult<ScanJob> {
    let bytes = read_document(body).await?;
    let request: ImageRequest = serde_json::from_slice(&bytes)
        .map_err(|err| AppError::invalid_json().with_details(err.to_string()))?;
    let source = request
        .source
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(AppError::nothing_to_process)?;
    let params = request.params.unwrap_or_default();
    validate_urls(Some(&source), &params)?;
    Ok(ScanJob::image(source, params))
}

async fn text_job(body: Body) -> AppResult<ScanJob> {
    let bytes = read_document(body).await?;
    let source = String::from_utf8_lossy(&bytes).trim().to_string();
    if source.is_empty() {
        return Err(AppError::nothing_to_process());
    }
    let params = ScanParams::default();
    validate_urls(Some(&source), &params)?;
    Ok(ScanJob::image(source, params))
}

async fn read_document(body: Body) -> AppResult<Bytes> {
    axum::body::to_bytes(body, MAX_REQUEST_DOCUMENT)
        .await
        .map_err(|err| AppError::invalid_json().with_details(err.to_string()))
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> AppError {
    warn!(error = %err, "malformed multipart body");
    AppError::internal().with_details(err.body_text())
}

/// Rejects source, destination and callback URLs that are not absolute
/// http(s) URLs.
fn validate_urls(source: Option<&str>, params: &ScanParams) -> AppResult<()> {
    let mut bad = Vec::new();
    if let Some(source) = source
        && !is_valid_url(source)
    {
        bad.push(json!({ "source": source }));
    }
    for (label, url) in params.urls() {
        if !is_valid_url(url) {
            bad.push(json!({ (label): url }));
        }
    }
    if bad.is_empty() {
        Ok(())
    } else {
        Err(AppError::invalid_url_format().with_details(Value::Array(bad)))
    }
}

pub fn is_valid_url(raw: &str) -> bool {
    match Url::parse(raw) {
        Ok(url) => {
            matches!(url.scheme(), "http" | "https") && url.host_str().is_some_and(|host| !host.is_empty())
        }
        Err(_) => false,
    }
}

/// Reduces an uploaded file name to `[A-Za-z0-9_.-]`, dropping directory
/// parts' separators and non-ASCII characters.
pub fn sanitize_file_name(raw: &str) -> String {
    let spaced: String = raw
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    let trimmed = kept.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        NONAME.to_string()
    } else {
        trimmed.to_string()
    }
}

fn spool_path(dir: &Path) -> PathBuf {
    let path = dir.join(Uuid::new_v4().to_string());
    std::path::absolute(&path).unwrap_or(path)
}

async fn write_stream<S, E>(path: &Path, stream: S) -> AppResult<usize>
where
    S: futures::Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| {
            warn!(error = %err, "upload interrupted");
            AppError::internal().with_details(err.to_string())
        })?;
        file.write_all(&chunk).await?;
        written += chunk.len();
    }
    file.flush().await?;
    Ok(written)
}

async fn discard(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %err, "unable to remove spooled file");
    }
}

async fn discard_all(items: &OrderedMap<String>) {
    for (_, path) in items.iter() {
        discard(Path::new(path)).await;
    }
}
