#![allow(clippy::missing_docs_in_private_items)]

pub mod callback;
pub mod chat;
pub mod config_handler;
pub mod error;
pub mod routes;
pub mod session;
pub mod streaming;
pub mod ws;

pub use callback::{OrchestratorCallbacks, StreamingSettings};
pub use chat::ChatHandler;
pub use config_handler::{AgentLookup, ConfigHandler, ResolvedAgent};
pub use routes::{chat_routes, OrchestratorState};
pub use session::{Session, SessionHandler};
pub use ws::WebSocketManager;
