use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use axum_typed_multipart::{FieldData, TryFromMultipart, TypedMultipart};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::NamedTempFile;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use common::auth::{AuthClaims, JwtVerifier};
use common::error::AppError;
use common::metadata::{AgentIdsOperation, MetadataStore};
use common::model::DocumentType;
use common::action::payload::DocumentIngestPayload;
use common::ws::ConnectionRegistry;

use crate::error::ApiError;
use crate::pipeline::IngestionPipeline;

/// Composition root of the ingestion HTTP surface.
#[derive(Clone)]
pub struct IngestionState {
    pub pipeline: Arc<IngestionPipeline>,
    pub store: Arc<dyn MetadataStore>,
    pub verifier: Arc<JwtVerifier>,
    pub ws: Arc<ConnectionRegistry>,
    pub public_base_url: String,
    pub upload_dir: PathBuf,
}

pub fn ingestion_routes(state: IngestionState) -> Router {
    Router::new()
        .route("/ingest", post(ingest))
        .route("/upload", post(upload))
        .route("/document/{document_id}", delete(delete_document))
        .route("/document/{document_id}/agents", put(update_agents))
        .route("/status/{task_id}", get(task_status))
        .route("/ws/ingestion/{task_id}", get(crate::ws::ingestion_socket))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn authorize(state: &IngestionState, headers: &HeaderMap) -> Result<AuthClaims, ApiError> {
    let header_value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing Authorization header".into()))?;
    let claims = state.verifier.verify_bearer(header_value)?;
    Ok(claims)
}

fn tenant_of(claims: &AuthClaims) -> Result<Uuid, ApiError> {
    claims
        .tenant_id
        .ok_or_else(|| ApiError::Unauthorized("token carries no tenant".into()))
}

#[derive(Debug, Serialize)]
struct IngestionResponse {
    task_id: String,
    document_id: Uuid,
    collection_id: String,
    agent_ids: Vec<Uuid>,
    status: String,
    websocket_url: String,
}

async fn ingest(
    State(state): State<IngestionState>,
    headers: HeaderMap,
    Json(request): Json<DocumentIngestPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = authorize(&state, &headers)?;
    let tenant_id = tenant_of(&claims)?;

    let receipt = state
        .pipeline
        .begin_ingestion(tenant_id, request, Some(claims.sub))
        .await?;
    Ok(Json(IngestionResponse {
        websocket_url: format!("{}/ws/ingestion/{}", state.public_base_url, receipt.task_id),
        task_id: receipt.task_id,
        document_id: receipt.document_id,
        collection_id: receipt.collection_id,
        agent_ids: receipt.agent_ids,
        status: receipt.status,
    }))
}

#[derive(Debug, TryFromMultipart)]
pub struct UploadParams {
    #[form_data(limit = "26214400")]
    pub file: FieldData<NamedTempFile>,
    pub collection_id: Option<String>,
    pub embedding_model: String,
    pub embedding_dimensions: Option<u32>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    #[form_data(default)]
    pub agent_ids: Vec<String>,
}

async fn upload(
    State(state): State<IngestionState>,
    headers: HeaderMap,
    TypedMultipart(params): TypedMultipart<UploadParams>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = authorize(&state, &headers)?;
    let tenant_id = tenant_of(&claims)?;

    let file_name = params
        .file
        .metadata
        .file_name
        .clone()
        .ok_or_else(|| ApiError::Validation("uploaded file needs a name".into()))?;
    let extension = std::path::Path::new(&file_name)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ApiError::Validation("file has no extension".into()))?;
    let document_type = DocumentType::from_extension(extension)
        .ok_or_else(|| ApiError::Validation(format!("unsupported document type .{extension}")))?;

    let agent_ids = params
        .agent_ids
        .iter()
        .map(|raw| Uuid::parse_str(raw))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ApiError::Validation(format!("invalid agent id: {err}")))?;

    tokio::fs::create_dir_all(&state.upload_dir)
        .await
        .map_err(AppError::from)?;
    let stored_path = state
        .upload_dir
        .join(format!("{}_{}", Uuid::new_v4().simple(), file_name));
    let temp_path = params.file.contents.into_temp_path();
    let stored_for_copy = stored_path.clone();
    tokio::task::spawn_blocking(move || std::fs::copy(&temp_path, &stored_for_copy))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .map_err(AppError::from)?;
    info!(file = %file_name, path = %stored_path.display(), "upload stored");

    let request = DocumentIngestPayload {
        document_name: file_name,
        document_type,
        collection_id: params.collection_id,
        embedding_model: params.embedding_model,
        embedding_dimensions: params.embedding_dimensions.unwrap_or(1536),
        chunk_size: params.chunk_size.unwrap_or(512),
        chunk_overlap: params.chunk_overlap.unwrap_or(50),
        agent_ids,
        file_path: stored_path.to_string_lossy().into_owned(),
        metadata: None,
    };
    let receipt = state
        .pipeline
        .begin_ingestion(tenant_id, request, Some(claims.sub))
        .await?;
    Ok(Json(IngestionResponse {
        websocket_url: format!("{}/ws/ingestion/{}", state.public_base_url, receipt.task_id),
        task_id: receipt.task_id,
        document_id: receipt.document_id,
        collection_id: receipt.collection_id,
        agent_ids: receipt.agent_ids,
        status: receipt.status,
    }))
}

#[derive(Debug, Deserialize)]
struct DeleteDocumentBody {
    collection_id: String,
}

async fn delete_document(
    State(state): State<IngestionState>,
    headers: HeaderMap,
    Path(document_id): Path<Uuid>,
    Json(body): Json<DeleteDocumentBody>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = authorize(&state, &headers)?;
    let tenant_id = tenant_of(&claims)?;
    state
        .pipeline
        .delete_document(tenant_id, &body.collection_id, document_id)
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct UpdateAgentsBody {
    agent_ids: Vec<Uuid>,
    operation: AgentIdsOperation,
}

async fn update_agents(
    State(state): State<IngestionState>,
    headers: HeaderMap,
    Path(document_id): Path<Uuid>,
    Json(body): Json<UpdateAgentsBody>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    state
        .store
        .update_document_agents(document_id, &body.agent_ids, body.operation)
        .await?;
    Ok(Json(json!({ "status": "ok", "document_id": document_id })))
}

async fn task_status(
    State(state): State<IngestionState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let task = state
        .pipeline
        .task_store()
        .load(&task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task {task_id} not found")))?;
    Ok(Json(task.progress_frame()))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}
