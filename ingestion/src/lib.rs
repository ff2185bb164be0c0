#![allow(clippy::missing_docs_in_private_items)]

pub mod chunker;
pub mod error;
pub mod pipeline;
pub mod routes;
pub mod task;
pub mod ws;

pub use pipeline::IngestionPipeline;
pub use routes::{ingestion_routes, IngestionState};
pub use task::{IngestionStatus, IngestionTask, TaskStore};
