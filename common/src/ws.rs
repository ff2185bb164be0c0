use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::ErrorInfo;
use crate::model::{ChatRequest, ChatResponse};

/// Key-addressed registry of live sockets (session ids on the chat side,
/// task ids on the ingestion side). Senders fan frames out to the
/// per-connection pump task; a dropped receiver makes `send` a no-op.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, mpsc::UnboundedSender<ServerFrame>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, key: &str) -> (String, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4().to_string();
        self.connections.write().await.insert(key.to_string(), tx);
        (connection_id, rx)
    }

    pub async fn unregister(&self, key: &str) {
        self.connections.write().await.remove(key);
    }

    pub async fn send(&self, key: &str, frame: ServerFrame) -> bool {
        let connections = self.connections.read().await;
        match connections.get(key) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

/// Frames a chat client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    ChatMessage(ChatRequest),
    Ping(PingData),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PingData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Frames the platform pushes to clients, on both the chat and the
/// ingestion sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectionAck(ConnectionAck),
    ChatProcessing(ChatProcessing),
    ChatStreaming(ChatStreaming),
    ChatResponse(Box<ChatResponse>),
    ChatError(ErrorInfo),
    IngestionProgress(IngestionProgress),
    Pong(PingData),
    Error(ErrorInfo),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionAck {
    pub connection_id: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatProcessing {
    pub task_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatStreaming {
    pub task_id: String,
    pub content: String,
    pub chunk_index: u32,
    pub is_final: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionProgress {
    pub task_id: String,
    pub status: String,
    pub message: String,
    pub percentage: u8,
    pub total_chunks: usize,
    pub processed_chunks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
