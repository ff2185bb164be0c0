#![allow(clippy::missing_docs_in_private_items)]

pub mod handler;
pub mod llm;
pub mod prompt;

pub use handler::QueryHandler;
pub use llm::{ChatProvider, OpenAiChatProvider};
