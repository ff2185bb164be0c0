use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use common::error::ErrorInfo;
use common::ws::ServerFrame;

use crate::routes::IngestionState;

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    token: String,
}

/// `GET /ws/ingestion/{task_id}?token=…`: authenticated progress feed for
/// one task. On connect the latest cached state is replayed, so a client
/// reconnecting mid-pipeline catches up immediately.
pub async fn ingestion_socket(
    State(state): State<IngestionState>,
    Path(task_id): Path<String>,
    Query(query): Query<TokenQuery>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    let authorized = state.verifier.verify(&query.token).is_ok();
    upgrade.on_upgrade(move |socket| handle_socket(state, task_id, socket, authorized))
}

async fn handle_socket(
    state: IngestionState,
    task_id: String,
    mut socket: WebSocket,
    authorized: bool,
) {
    if !authorized {
        send_error(&mut socket, "unauthorized", "invalid or missing token").await;
        return;
    }
    let task = match state.pipeline.task_store().load(&task_id).await {
        Ok(Some(task)) => task,
        _ => {
            send_error(&mut socket, "not_found", &format!("task {task_id} not found")).await;
            return;
        }
    };

    let (connection_id, mut outbound) = state.ws.register(&task_id).await;
    info!(%task_id, %connection_id, "ingestion socket connected");

    let (mut sink, mut stream) = socket.split();

    // Catch-up frame with the latest cached state.
    if let Ok(text) =
        serde_json::to_string(&ServerFrame::IngestionProgress(task.progress_frame()))
    {
        sink.send(Message::Text(text.into())).await.ok();
    }

    let pump = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Ok(text) = serde_json::to_string(&frame) {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(other) => debug!(%task_id, ?other, "ignoring inbound frame"),
        }
    }

    pump.abort();
    state.ws.unregister(&task_id).await;
    info!(%task_id, %connection_id, "ingestion socket disconnected");
}

async fn send_error(socket: &mut WebSocket, error_type: &str, message: &str) {
    let frame = ServerFrame::Error(ErrorInfo {
        error_type: error_type.to_string(),
        message: message.to_string(),
        details: None,
    });
    if let Ok(text) = serde_json::to_string(&frame) {
        socket.send(Message::Text(text.into())).await.ok();
    }
}
