use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use common::action::{payload::types, DomainAction, ServiceName};
use common::transport::ActionPublisher;

use crate::chat::ChatHandler;
use crate::config_handler::AgentLookup;
use crate::error::ApiError;
use crate::session::{Session, SessionHandler};
use crate::ws::WebSocketManager;

/// Composition root of the orchestrator's HTTP surface.
#[derive(Clone)]
pub struct OrchestratorState {
    pub sessions: Arc<SessionHandler>,
    pub configs: Arc<dyn AgentLookup>,
    pub ws: Arc<WebSocketManager>,
    pub chat: Arc<ChatHandler>,
    pub publisher: Arc<dyn ActionPublisher>,
    pub public_base_url: String,
}

pub fn chat_routes(state: OrchestratorState) -> Router {
    Router::new()
        .route("/api/v1/chat/init", post(init_session))
        .route("/api/v1/chat/session/{session_id}/status", get(session_status))
        .route("/api/v1/chat/session/{session_id}/task", post(create_task))
        .route("/api/v1/chat/session/{session_id}", delete(delete_session))
        .route("/ws/chat/{session_id}", get(crate::ws::chat_socket))
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/health/metrics", get(health_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct InitRequest {
    agent_id: Uuid,
    #[serde(default)]
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct InitResponse {
    session_id: String,
    task_id: String,
    websocket_url: String,
    agent_name: String,
}

/// Creates a session for a public agent. The agent owner's tenant becomes
/// the session tenant: public visitors have none of their own.
async fn init_session(
    State(state): State<OrchestratorState>,
    Json(request): Json<InitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resolved = state.configs.agent_configs(request.agent_id).await?;

    let session = Session::new(
        resolved.tenant_id,
        resolved.agent_id,
        resolved.agent_name.clone(),
        None,
    );
    let (session_id, task_id) = state.sessions.create(session).await?;

    Ok(Json(InitResponse {
        websocket_url: format!("{}/ws/chat/{}", state.public_base_url, session_id),
        session_id,
        task_id,
        agent_name: resolved.agent_name,
    }))
}

async fn session_status(
    State(state): State<OrchestratorState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.sessions.snapshot(&session_id).await?;
    Ok(Json(session))
}

async fn create_task(
    State(state): State<OrchestratorState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = state.sessions.begin_task(&session_id).await?;
    Ok(Json(json!({
        "task_id": task_id,
        "session_id": session_id,
        "created_at": Utc::now(),
    })))
}

async fn delete_session(
    State(state): State<OrchestratorState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.sessions.delete(&session_id).await?;
    state.ws.unregister(&session_id).await;

    // Fire-and-forget: conversation persistence closes its log. Errors are
    // logged and swallowed.
    let mut action = DomainAction::new(
        types::SESSION_CLOSED,
        ServiceName::Orchestrator,
        session.tenant_id,
        json!({ "session_id": session_id }),
    )
    .with_session(&session_id)
    .with_agent(session.agent_id);
    action.user_id = session.user_id;
    if let Err(err) = state.publisher.publish(&action).await {
        warn!(%session_id, error = %err, "failed to publish session close");
    }

    Ok(Json(json!({ "status": "ok" })))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn health_detailed(State(state): State<OrchestratorState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "components": {
            "sessions": { "status": "healthy", "count": state.sessions.session_count().await },
            "websockets": { "status": "healthy", "count": state.ws.connection_count().await },
        }
    }))
}

async fn health_metrics(State(state): State<OrchestratorState>) -> impl IntoResponse {
    Json(json!({
        "active_sessions": state.sessions.session_count().await,
        "active_connections": state.ws.connection_count().await,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::StreamingSettings;
    use crate::config_handler::ResolvedAgent;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use common::error::AppError;
    use common::model::{ExecutionConfig, QueryConfig, RagConfig};
    use common::transport::RecordingPublisher;
    use std::time::Duration;
    use tower::ServiceExt;

    struct StubLookup {
        known_agent: Uuid,
        tenant_id: Uuid,
    }

    #[async_trait]
    impl AgentLookup for StubLookup {
        async fn agent_configs(&self, agent_id: Uuid) -> Result<ResolvedAgent, AppError> {
            if agent_id != self.known_agent {
                return Err(AppError::NotFound(format!("agent {agent_id} not found")));
            }
            Ok(ResolvedAgent {
                agent_id,
                tenant_id: self.tenant_id,
                agent_name: "support-bot".into(),
                execution_config: ExecutionConfig::default(),
                query_config: QueryConfig {
                    model: "llama-3.3-70b-versatile".into(),
                    system_prompt_template: "You are helpful.".into(),
                    temperature: 0.3,
                    max_tokens: 128,
                    top_p: 1.0,
                    frequency_penalty: 0.0,
                    presence_penalty: 0.0,
                    stop: None,
                    timeout_secs: None,
                    max_retries: None,
                },
                rag_config: RagConfig {
                    collection_ids: vec!["col_a".into()],
                    document_ids: vec![],
                    top_k: 5,
                    similarity_threshold: 0.0,
                    embedding_model: "text-embedding-3-small".into(),
                    embedding_dimensions: 1536,
                    fact_density_boost: 0.0,
                    max_text_length: 8192,
                    max_retries: 3,
                },
            })
        }

        async fn invalidate(&self, _agent_id: Uuid) {}
    }

    fn test_app() -> (Router, Uuid, Arc<RecordingPublisher>) {
        let known_agent = Uuid::new_v4();
        let tenant_id = Uuid::new_v4();
        let sessions = Arc::new(SessionHandler::new(None, Duration::from_secs(1800)));
        let configs: Arc<dyn AgentLookup> = Arc::new(StubLookup {
            known_agent,
            tenant_id,
        });
        let ws = Arc::new(WebSocketManager::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let chat = Arc::new(ChatHandler::new(
            sessions.clone(),
            configs.clone(),
            ws.clone(),
            publisher.clone(),
        ));
        // Constructed for parity with production wiring; the HTTP tests
        // exercise routes only.
        let _callbacks = crate::callback::OrchestratorCallbacks::new(
            sessions.clone(),
            ws.clone(),
            StreamingSettings {
                enabled: true,
                chunk_size: 48,
                delay_ms: 0,
            },
        );
        let state = OrchestratorState {
            sessions,
            configs,
            ws,
            chat,
            publisher: publisher.clone(),
            public_base_url: "ws://localhost:8000".into(),
        };
        (chat_routes(state), known_agent, publisher)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (app, _, _) = test_app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn init_returns_session_and_websocket_url() {
        let (app, agent_id, _) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/chat/init")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({"agent_id": agent_id}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["agent_name"], "support-bot");
        let ws_url = body["websocket_url"].as_str().unwrap();
        assert!(ws_url.contains("/ws/chat/"));
        assert!(!body["task_id"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn init_with_unknown_agent_is_404() {
        let (app, _, _) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/chat/init")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({"agent_id": Uuid::new_v4()}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_of_missing_session_is_404() {
        let (app, _, _) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/chat/session/missing/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn session_lifecycle_init_task_delete() {
        let (app, agent_id, publisher) = test_app();

        let init = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/chat/init")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({"agent_id": agent_id}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let session_id = body_json(init).await["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        let status = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/chat/session/{session_id}/status"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::OK);

        let task = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/v1/chat/session/{session_id}/task"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(task.status(), StatusCode::OK);
        assert!(!body_json(task).await["task_id"]
            .as_str()
            .unwrap()
            .is_empty());

        let deleted = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/v1/chat/session/{session_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::OK);

        // Session close fans out to conversation persistence.
        let published = publisher.published();
        assert!(published
            .iter()
            .any(|a| a.action_type == types::SESSION_CLOSED));

        let gone = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/chat/session/{session_id}/status"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }
}
