use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use common::error::ErrorInfo;
use common::ws::{ClientFrame, ConnectionAck, ServerFrame};

use crate::routes::OrchestratorState;

/// Session-keyed socket registry; one connection per chat session.
pub type WebSocketManager = common::ws::ConnectionRegistry;

/// `GET /ws/chat/{session_id}`: upgrades and binds the socket to a session.
pub async fn chat_socket(
    State(state): State<OrchestratorState>,
    Path(session_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_chat_socket(state, session_id, socket))
}

async fn handle_chat_socket(state: OrchestratorState, session_id: String, socket: WebSocket) {
    if state.sessions.get(&session_id).await.is_none() {
        let mut socket = socket;
        let frame = ServerFrame::Error(ErrorInfo {
            error_type: "not_found".into(),
            message: format!("session {session_id} not found"),
            details: None,
        });
        if let Ok(text) = serde_json::to_string(&frame) {
            socket.send(Message::Text(text.into())).await.ok();
        }
        return;
    }

    let (connection_id, mut outbound) = state.ws.register(&session_id).await;
    state
        .sessions
        .set_connected(&session_id, Some(connection_id.clone()), true)
        .await;
    info!(%session_id, %connection_id, "chat socket connected");

    let (mut sink, mut stream) = socket.split();

    state
        .ws
        .send(
            &session_id,
            ServerFrame::ConnectionAck(ConnectionAck {
                connection_id: connection_id.clone(),
                session_id: Some(session_id.clone()),
            }),
        )
        .await;

    let pump = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match serde_json::to_string(&frame) {
                Ok(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "failed to serialize server frame"),
            }
        }
    });

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(%session_id, error = %err, "chat socket read error");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                handle_client_frame(&state, &session_id, text.as_str()).await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    pump.abort();
    state.ws.unregister(&session_id).await;
    state.sessions.set_connected(&session_id, None, false).await;
    info!(%session_id, %connection_id, "chat socket disconnected");
}

async fn handle_client_frame(state: &OrchestratorState, session_id: &str, text: &str) {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::ChatMessage(request)) => {
            if let Err(err) = state.chat.handle_chat_message(session_id, request).await {
                warn!(%session_id, error = %err, "chat message failed");
                state
                    .ws
                    .send(
                        session_id,
                        ServerFrame::ChatError(ErrorInfo::from_error(&err)),
                    )
                    .await;
            }
        }
        Ok(ClientFrame::Ping(ping)) => {
            state.ws.send(session_id, ServerFrame::Pong(ping)).await;
        }
        Err(err) => {
            state
                .ws
                .send(
                    session_id,
                    ServerFrame::Error(ErrorInfo {
                        error_type: "validation_error".into(),
                        message: format!("unrecognized frame: {err}"),
                        details: None,
                    }),
                )
                .await;
        }
    }
}
