//! HTTP surface for the presentation layer.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/status` | Root, manifest and index status |
//! | `GET`  | `/documents` | Paged catalog (`page`, `pageSize`, `q`, `sort`, `desc`, `refresh`) |
//! | `GET`  | `/files/{*path}` | Live file bytes |
//! | `GET`  | `/versions` | Version history of a document (`path`, `limit`) |
//! | `GET`  | `/versions/file` | Bytes of one version (`path`, `id`) |
//! | `POST` | `/documents` | Upload a new document |
//! | `POST` | `/documents/update` | Replace content and/or metadata |
//! | `POST` | `/documents/activate` | Make a stored version live |
//! | `POST` | `/index/refresh` | Run the indexer now |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "Document not found." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `timeout` (503),
//! `root_unavailable` (503), `manifest_unreadable` (500), `save_failed` (500),
//! `internal` (500).

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use url::form_urlencoded;

use crate::catalog::DocumentCatalog;
use crate::config::LiveConfig;
use crate::db;
use crate::error::WriteError;
use crate::index_store::IndexStore;
use crate::indexer::Indexer;
use crate::migrate::migrate_pool;
use crate::models::{CatalogRecord, IndexReport, Page};
use crate::query::{PageRequest, SearchFilters, SortColumn, DEFAULT_PAGE_SIZE};
use crate::service::{
    DocumentMetadata, DocumentService, NewContent, UpdateRequest, UploadOutcome, UploadRequest,
};
use crate::status::{collect_status, StatusReport};
use crate::versions::{VersionDescriptor, VersionHandle};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<LiveConfig>,
    pub catalog: Arc<DocumentCatalog>,
    pub service: Arc<DocumentService>,
    pub indexer: Arc<Indexer>,
    pub shutdown: CancellationToken,
}

/// Starts the HTTP server and the background indexer.
///
/// Runs until `shutdown` is cancelled, then waits for the indexer loop to
/// stop.
pub async fn run_server(config: Arc<LiveConfig>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let current = config.current();
    let bind_addr = current.server.bind.clone();

    let pool = db::connect(&current).await?;
    migrate_pool(&pool).await?;

    let catalog = Arc::new(DocumentCatalog::new(&current)?);
    let service = Arc::new(DocumentService::new(catalog.clone()));
    let indexer = Arc::new(Indexer::new(
        catalog.clone(),
        IndexStore::new(pool),
        config.clone(),
    ));

    let loop_handle = {
        let indexer = indexer.clone();
        let token = shutdown.child_token();
        tokio::spawn(async move { indexer.run_loop(token).await })
    };

    let state = AppState {
        config,
        catalog,
        service,
        indexer,
        shutdown: shutdown.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("listening on http://{}", bind_addr);
    println!("oiwi server listening on http://{}", bind_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    if let Err(e) = loop_handle.await {
        error!("indexer task ended abnormally: {}", e);
    }
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/documents", get(handle_documents).post(handle_upload))
        .route("/documents/update", post(handle_update))
        .route("/documents/activate", post(handle_activate))
        .route("/files/{*path}", get(handle_file))
        .route("/versions", get(handle_versions))
        .route("/versions/file", get(handle_version_file))
        .route("/index/refresh", post(handle_refresh))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<WriteError> for AppError {
    fn from(err: WriteError) -> Self {
        let status = match err.code() {
            "bad_request" => StatusCode::BAD_REQUEST,
            "not_found" => StatusCode::NOT_FOUND,
            "root_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn timeout_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "timeout".to_string(),
        message: message.into(),
    }
}

/// Logs the cause and returns a message without internal detail.
fn internal(err: anyhow::Error) -> AppError {
    error!("request failed: {:#}", err);
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: "Something went wrong. Please try again.".to_string(),
    }
}

// ============ GET /health, GET /status ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusReport> {
    let config = state.config.current();
    Json(collect_status(&config, &state.catalog, Some(state.indexer.store())).await)
}

// ============ GET /documents ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentsQuery {
    page: Option<i64>,
    page_size: Option<i64>,
    /// Filter token, see [`SearchFilters::decode`].
    q: Option<String>,
    sort: Option<String>,
    desc: Option<bool>,
    refresh: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentsResponse {
    #[serde(flatten)]
    page: Page<CatalogRecord>,
    total_pages: usize,
    filters: String,
    sort: &'static str,
    descending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    refreshed: Option<IndexReport>,
}

/// Refreshing the index and fetching the page share one wall-clock budget.
async fn handle_documents(
    State(state): State<AppState>,
    Query(query): Query<DocumentsQuery>,
) -> Result<Json<DocumentsResponse>, AppError> {
    let filters = SearchFilters::decode(query.q.as_deref().unwrap_or(""));
    let request = PageRequest::new(
        query.page.unwrap_or(1),
        query.page_size.unwrap_or(DEFAULT_PAGE_SIZE as i64),
        filters,
        SortColumn::from_param(query.sort.as_deref()),
        query.desc.unwrap_or(true),
    );
    let budget = Duration::from_secs(state.config.current().server.page_timeout_secs);
    let token = state.shutdown.child_token();

    let work = async {
        let refreshed = if query.refresh.unwrap_or(false) {
            Some(state.indexer.run_once(&token).await?)
        } else {
            None
        };
        let page = state.catalog.page(&request).await?;
        anyhow::Ok((page, refreshed))
    };

    let (page, refreshed) = match tokio::time::timeout(budget, work).await {
        Ok(result) => result.map_err(internal)?,
        Err(_) => {
            token.cancel();
            return Err(timeout_error(
                "Loading the document list is taking too long. Please try again.",
            ));
        }
    };

    Ok(Json(DocumentsResponse {
        total_pages: page.total_pages(),
        filters: request.filters.encode(),
        sort: request.sort.as_str(),
        descending: request.descending,
        page,
        refreshed,
    }))
}

// ============ GET /files/{*path} ============

async fn handle_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let physical = state
        .catalog
        .resolve_listed_file(&path)
        .await
        .ok_or_else(|| not_found("File not found."))?;
    let name = physical
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    file_response(&physical, &name).await
}

async fn file_response(path: &std::path::Path, file_name: &str) -> Result<Response, AppError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| internal(anyhow::Error::from(e)))?;
    let disposition = format!(
        "inline; filename=\"{}\"",
        file_name.replace(['"', '\\'], "_")
    );
    Ok((
        [
            (header::CONTENT_TYPE, content_type_for(file_name).to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

fn content_type_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "txt" => "text/plain; charset=utf-8",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

// ============ GET /versions, GET /versions/file ============

#[derive(Deserialize)]
struct VersionsQuery {
    path: String,
    limit: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VersionView {
    #[serde(flatten)]
    descriptor: VersionDescriptor,
    is_active: bool,
}

#[derive(Serialize)]
struct VersionsResponse {
    versions: Vec<VersionView>,
}

async fn handle_versions(
    State(state): State<AppState>,
    Query(query): Query<VersionsQuery>,
) -> Result<Json<VersionsResponse>, AppError> {
    if query.path.trim().is_empty() {
        return Err(bad_request("path must not be empty"));
    }
    let versions = state
        .service
        .list_versions(&query.path, query.limit.unwrap_or(50))
        .await?
        .into_iter()
        .map(|d| {
            let descriptor = if d.url.is_some() {
                d
            } else {
                let url = version_file_url(&d.document_path, &d.version_id);
                d.with_url(Some(url))
            };
            VersionView {
                is_active: descriptor.is_active,
                descriptor,
            }
        })
        .collect();
    Ok(Json(VersionsResponse { versions }))
}

fn version_file_url(path: &str, id: &str) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("path", path)
        .append_pair("id", id)
        .finish();
    format!("/versions/file?{}", query)
}

#[derive(Deserialize)]
struct VersionFileQuery {
    path: String,
    id: String,
}

async fn handle_version_file(
    State(state): State<AppState>,
    Query(query): Query<VersionFileQuery>,
) -> Result<Response, AppError> {
    let VersionHandle {
        path, file_name, ..
    } = state.service.open_version(&query.path, &query.id).await?;
    file_response(&path, &file_name).await
}

// ============ POST /documents, /documents/update, /documents/activate ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadBody {
    document_type: String,
    file_name: String,
    /// File bytes, standard base64.
    content: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    line: Option<String>,
    #[serde(default)]
    station: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    machine_name: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    uploaded_by: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    code: String,
    sequence_number: u32,
    relative_path: String,
    url: String,
}

fn decode_content(content: &str) -> Result<Vec<u8>, AppError> {
    STANDARD
        .decode(content.trim())
        .map_err(|_| bad_request("content must be base64"))
}

async fn handle_upload(
    State(state): State<AppState>,
    Json(body): Json<UploadBody>,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let content = decode_content(&body.content)?;
    let UploadOutcome {
        code,
        sequence_number,
        relative_path,
    } = state
        .service
        .upload(UploadRequest {
            document_type: body.document_type,
            file_name: body.file_name,
            content,
            metadata: DocumentMetadata {
                display_name: body.display_name,
                line: body.line,
                station: body.station,
                model: body.model,
                machine_name: body.machine_name,
                comment: body.comment,
            },
            uploaded_by: body.uploaded_by,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            url: state.catalog.public_url(&relative_path),
            code,
            sequence_number,
            relative_path,
        }),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateBody {
    path: String,
    #[serde(default)]
    document_type: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    line: Option<String>,
    #[serde(default)]
    station: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    machine_name: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    updated_by: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateResponse {
    relative_path: String,
    version: i64,
    url: String,
}

async fn handle_update(
    State(state): State<AppState>,
    Json(body): Json<UpdateBody>,
) -> Result<Json<UpdateResponse>, AppError> {
    let content = match body.content.as_deref() {
        Some(encoded) => Some(NewContent {
            file_name: body.file_name.clone(),
            bytes: decode_content(encoded)?,
        }),
        None => None,
    };

    let outcome = state
        .service
        .update(UpdateRequest {
            relative_path: body.path,
            document_type: body.document_type,
            metadata: DocumentMetadata {
                display_name: body.display_name,
                line: body.line,
                station: body.station,
                model: body.model,
                machine_name: body.machine_name,
                comment: body.comment,
            },
            content,
            updated_by: body.updated_by,
        })
        .await?;

    Ok(Json(UpdateResponse {
        url: state.catalog.public_url(&outcome.relative_path),
        relative_path: outcome.relative_path,
        version: outcome.version,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivateBody {
    path: String,
    version_id: String,
    #[serde(default)]
    actor: Option<String>,
}

async fn handle_activate(
    State(state): State<AppState>,
    Json(body): Json<ActivateBody>,
) -> Result<StatusCode, AppError> {
    state
        .service
        .set_active_version(&body.path, &body.version_id, body.actor.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ POST /index/refresh ============

async fn handle_refresh(State(state): State<AppState>) -> Result<Json<IndexReport>, AppError> {
    let token = state.shutdown.child_token();
    let report = state.indexer.run_once(&token).await.map_err(internal)?;
    Ok(Json(report))
}
