#![allow(clippy::missing_docs_in_private_items)]

pub mod handler;
pub mod provider;

pub use handler::EmbeddingHandler;
pub use provider::{Embedder, OpenAiEmbedder};
