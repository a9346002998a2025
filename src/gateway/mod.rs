//! HTTP gateway over the storage core.
//!
//! Every handler hands its work to `spawn_blocking`: the depot does plain
//! blocking file I/O and holds a mutex across whole read-modify-write cycles.

use crate::config::GatewayConfig;
use crate::depot::schema::{DirectoryStats, FileQuery, QueryPage, UploadOutcome, UploadRequest};
use crate::depot::storage::{ExtractionOutcome, Preview, StoredFile};
use crate::depot::{preview, ArchiveSummary, DepotError, DepotResult, ErrorKind, FileDepot};
use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, FromRequest, FromRequestParts, Multipart, Path, State,
    },
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub depot: Arc<FileDepot>,
}

/// Create the API router
pub fn router(state: AppState, config: &GatewayConfig) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/upload", post(upload))
        .route("/query", get(query_files))
        .route("/download/{*path}", get(download))
        .route("/preview/{*path}", get(preview_file))
        .route("/reports/{*path}", get(direct_access))
        .route("/extracted/{*path}", get(direct_access))
        .route("/inspect/{*path}", get(inspect_archive))
        .route("/extract/{*path}", get(extract_archive))
        .route("/delete", post(delete_file))
        .route("/mark-viewed", post(mark_viewed))
        .route("/directory-stats", get(directory_stats))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_upload_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)))
        .with_state(state)
}

/// Bind and serve until Ctrl-C or SIGTERM.
pub async fn run(config: &GatewayConfig, depot: Arc<FileDepot>) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, root = %depot.root().display(), "gateway listening");

    let app = router(AppState { depot }, config);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Gateway server failed")?;

    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Error body: a message plus the machine-checkable kind.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: &'static str,
}

#[derive(Debug)]
pub enum ApiError {
    Depot(DepotError),
    BadRequest(String),
    /// Request the extractors could not parse; keeps their status code.
    Rejected { status: StatusCode, message: String },
    Internal(String),
}

impl From<DepotError> for ApiError {
    fn from(err: DepotError) -> Self {
        Self::Depot(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Rejected {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::Rejected {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        Self::Rejected {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

/// JSON body extractor that rejects with an [`ApiError`] body.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
struct ApiJson<T>(T);

/// Query string extractor that rejects with an [`ApiError`] body.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
struct ApiQuery<T>(T);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Depot(err) => {
                let kind = err.kind();
                let status = match kind {
                    ErrorKind::AccessDenied => StatusCode::FORBIDDEN,
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    ErrorKind::CodecError => StatusCode::UNPROCESSABLE_ENTITY,
                    ErrorKind::IoFailure | ErrorKind::ConcurrencyFailure => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                if status.is_server_error() {
                    error!(kind = %kind, error = %err, "request failed");
                } else {
                    warn!(kind = %kind, error = %err, "request rejected");
                }
                (status, kind.as_str(), err.to_string())
            }
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorKind::InvalidInput.as_str(),
                msg,
            ),
            ApiError::Rejected { status, message } => {
                warn!(%status, error = %message, "malformed request");
                (status, ErrorKind::InvalidInput.as_str(), message)
            }
            ApiError::Internal(msg) => {
                error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorKind::IoFailure.as_str(),
                    msg,
                )
            }
        };
        (status, Json(ErrorResponse { error: message, kind })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Run a depot call on the blocking pool.
async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    F: FnOnce() -> DepotResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::Internal(format!("worker task failed: {e}")))?
        .map_err(ApiError::from)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "message": "File upload service is running"
    }))
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    message: &'static str,
    #[serde(flatten)]
    outcome: UploadOutcome,
}

async fn upload(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<UploadResponse>> {
    let mut multipart = multipart?;
    let mut request = UploadRequest::default();
    let mut saw_file = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed upload: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                saw_file = true;
                request.original_filename = field.file_name().unwrap_or_default().to_string();
                request.data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read file: {e}")))?
                    .to_vec();
            }
            "filename" | "relative_path" | "date" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read {name}: {e}")))?;
                let slot = match name.as_str() {
                    "filename" => &mut request.custom_filename,
                    "relative_path" => &mut request.relative_path,
                    _ => &mut request.date,
                };
                *slot = Some(value);
            }
            _ => {}
        }
    }

    if !saw_file {
        return Err(ApiError::BadRequest("No file provided".into()));
    }
    if request.original_filename.is_empty() {
        return Err(ApiError::BadRequest("No file selected".into()));
    }

    let depot = state.depot.clone();
    let outcome = blocking(move || depot.upload(request)).await?;
    Ok(Json(UploadResponse {
        message: "File uploaded successfully",
        outcome,
    }))
}

async fn query_files(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<FileQuery>,
) -> ApiResult<Json<QueryPage>> {
    let depot = state.depot.clone();
    let page = blocking(move || Ok(depot.query(&query))).await?;
    Ok(Json(page))
}

async fn download(State(state): State<AppState>, Path(path): Path<String>) -> ApiResult<Response> {
    let depot = state.depot.clone();
    let stored = blocking(move || depot.open_stored(&path)).await?;
    serve_stored(stored, stored_is_html).await
}

async fn preview_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> ApiResult<Response> {
    let depot = state.depot.clone();
    let logical = path.clone();
    let rendered = blocking(move || depot.preview(&logical, false)).await?;
    render_preview(rendered, &path).await
}

/// Preview when possible, otherwise download.
async fn direct_access(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> ApiResult<Response> {
    let depot = state.depot.clone();
    let logical = path.clone();
    let rendered = blocking(move || depot.preview(&logical, true)).await?;
    render_preview(rendered, &path).await
}

async fn render_preview(rendered: Preview, logical_path: &str) -> ApiResult<Response> {
    match rendered {
        Preview::Html(html) => Ok(Html(html).into_response()),
        Preview::Archive { filename, summary } => {
            let href = format!("/download/{logical_path}");
            Ok(Html(preview::render_archive_page(&filename, &summary, &href)).into_response())
        }
        Preview::Download(stored) => serve_stored(stored, |_| false).await,
    }
}

fn stored_is_html(stored: &StoredFile) -> bool {
    stored.mime_type.starts_with("text/html")
}

/// Send a stored file, inline when `inline` says so, as an attachment otherwise.
async fn serve_stored(stored: StoredFile, inline: fn(&StoredFile) -> bool) -> ApiResult<Response> {
    let data = tokio::fs::read(&stored.path).await.map_err(|e| {
        ApiError::from(DepotError::io(
            format!("failed to read {}", stored.path.display()),
            e,
        ))
    })?;
    let disposition = if inline(&stored) {
        "inline".to_string()
    } else {
        format!("attachment; filename=\"{}\"", stored.filename.replace('"', ""))
    };
    Ok((
        [
            (header::CONTENT_TYPE, stored.mime_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        data,
    )
        .into_response())
}

async fn inspect_archive(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> ApiResult<Json<ArchiveSummary>> {
    let depot = state.depot.clone();
    let summary = blocking(move || depot.inspect_archive(&path)).await?;
    Ok(Json(summary))
}

#[derive(Debug, Serialize)]
struct ExtractResponse {
    message: &'static str,
    #[serde(flatten)]
    outcome: ExtractionOutcome,
}

async fn extract_archive(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> ApiResult<Json<ExtractResponse>> {
    let depot = state.depot.clone();
    let outcome = blocking(move || depot.extract_archive(&path)).await?;
    Ok(Json(ExtractResponse {
        message: "Archive extracted successfully",
        outcome,
    }))
}

#[derive(Debug, Deserialize)]
struct IdRequest {
    #[serde(default)]
    uuid: String,
}

impl IdRequest {
    fn into_id(self) -> ApiResult<String> {
        let id = self.uuid.trim().to_string();
        if id.is_empty() {
            return Err(ApiError::BadRequest("uuid is required".into()));
        }
        Ok(id)
    }
}

async fn delete_file(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<IdRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = body.into_id()?;
    let depot = state.depot.clone();
    let removed = blocking(move || depot.delete(&id)).await?;
    Ok(Json(serde_json::json!({
        "message": "File deleted successfully",
        "removed": removed
    })))
}

async fn mark_viewed(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<IdRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = body.into_id()?;
    let depot = state.depot.clone();
    blocking(move || depot.mark_viewed(&id)).await?;
    Ok(Json(serde_json::json!({
        "message": "File marked as viewed successfully"
    })))
}

async fn directory_stats(State(state): State<AppState>) -> ApiResult<Json<DirectoryStats>> {
    let depot = state.depot.clone();
    let stats = blocking(move || Ok(depot.directory_stats())).await?;
    Ok(Json(stats))
}
