use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use kmem_core::pipeline::PipelineStatus;
use kmem_core::tags::TagCollection;
use kmem_pipeline::{PipelineError, PoisonedMessage, SearchRequest, SearchResult, UploadFile, UploadRequest};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadFileBody {
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Base64 encoded file content.
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadBody {
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default, alias = "documentId")]
    pub document_id: Option<String>,
    #[serde(default)]
    pub tags: TagCollection,
    #[serde(default)]
    pub steps: Vec<String>,
    pub files: Vec<UploadFileBody>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadAccepted {
    pub index: String,
    pub document_id: String,
    pub execution_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DocumentQuery {
    #[serde(default)]
    pub index: Option<String>,
    #[serde(alias = "documentId")]
    pub document_id: String,
}

/// Without a document id every unfinished pipeline is resumed.
#[derive(Debug, Deserialize)]
pub struct ResumeQuery {
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default, alias = "documentId")]
    pub document_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResumeResponse {
    pub resumed: Vec<PipelineStatus>,
}

#[derive(Debug, Deserialize)]
pub struct IndexQuery {
    #[serde(default)]
    pub index: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexList {
    pub indexes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
}

/// Pipeline errors rendered as JSON with a matching status code.
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::InvalidPipeline(_)
            | PipelineError::InvalidRequest(_)
            | PipelineError::InvalidArtifactName(_)
            | PipelineError::TokenLimitExceeded { .. } => StatusCode::BAD_REQUEST,
            PipelineError::StatusNotFound { .. } | PipelineError::IndexNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            PipelineError::Http(_)
            | PipelineError::Embedding(_)
            | PipelineError::EmbeddingRejected(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("request failed: {}", self.0);
        } else {
            warn!("request rejected: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(PipelineError::InvalidRequest(message.into()))
}

/// Run the HTTP server until `shutdown` resolves
pub async fn run(
    state: Arc<AppState>,
    bind_addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Create the router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_upload_bytes;
    Router::new()
        .route("/health", get(health_handler))
        .route("/upload", post(upload_handler))
        .route("/upload-status", get(upload_status_handler))
        .route("/documents", delete(delete_document_handler))
        .route("/resume", post(resume_handler))
        .route("/indexes", get(list_indexes_handler).delete(delete_index_handler))
        .route("/search", post(search_handler))
        .route("/poison", get(poison_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /upload
async fn upload_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UploadBody>,
) -> Result<(StatusCode, Json<UploadAccepted>), ApiError> {
    let mut files = Vec::with_capacity(body.files.len());
    for file in body.files {
        let content = BASE64
            .decode(file.content.as_bytes())
            .map_err(|e| bad_request(format!("file {}: invalid base64: {e}", file.name)))?;
        files.push(UploadFile {
            name: file.name,
            mime_type: file.mime_type,
            content,
        });
    }

    let index = body.index.clone();
    let request = UploadRequest {
        index: body.index,
        document_id: body.document_id,
        tags: body.tags,
        steps: body.steps,
        files,
    };
    let document_id = state.service.upload_document(request).await?;
    let status = state
        .service
        .pipeline_status(index.as_deref(), &document_id)
        .await?
        .ok_or_else(|| PipelineError::StatusNotFound {
            index: index.clone().unwrap_or_default(),
            document_id: document_id.clone(),
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadAccepted {
            index: status.index,
            document_id,
            execution_id: status.execution_id,
        }),
    ))
}

/// GET /upload-status
async fn upload_status_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DocumentQuery>,
) -> Result<Json<PipelineStatus>, ApiError> {
    let status = state
        .service
        .pipeline_status(query.index.as_deref(), &query.document_id)
        .await?
        .ok_or_else(|| PipelineError::StatusNotFound {
            index: query.index.clone().unwrap_or_default(),
            document_id: query.document_id.clone(),
        })?;
    Ok(Json(status))
}

/// DELETE /documents
async fn delete_document_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DocumentQuery>,
) -> Result<(StatusCode, Json<PipelineStatus>), ApiError> {
    let status = state
        .service
        .delete_document(query.index.as_deref(), &query.document_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

/// POST /resume
async fn resume_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResumeQuery>,
) -> Result<Json<ResumeResponse>, ApiError> {
    let resumed = match query.document_id {
        Some(document_id) => vec![
            state
                .service
                .resume(query.index.as_deref(), &document_id)
                .await?,
        ],
        None => state.service.resume_unfinished().await?,
    };
    Ok(Json(ResumeResponse { resumed }))
}

/// GET /indexes
async fn list_indexes_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<IndexList>, ApiError> {
    let indexes = state.service.list_indexes().await?;
    Ok(Json(IndexList { indexes }))
}

/// DELETE /indexes
async fn delete_index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IndexQuery>,
) -> Result<(StatusCode, Json<PipelineStatus>), ApiError> {
    let status = state.service.delete_index(query.index.as_deref()).await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

/// POST /search
async fn search_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let results = state.service.search(request).await?;
    Ok(Json(SearchResponse { results }))
}

/// GET /poison
async fn poison_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PoisonedMessage>>, ApiError> {
    Ok(Json(state.service.poisoned_messages().await?))
}
