#![allow(clippy::missing_docs_in_private_items)]

pub mod handler;
pub mod history;

pub use handler::ExecutionHandler;
pub use history::{integrate_messages, HistoryStore};
