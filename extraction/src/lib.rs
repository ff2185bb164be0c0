#![allow(clippy::missing_docs_in_private_items)]

pub mod extract;
pub mod handler;
pub mod nlp;

pub use handler::ExtractionHandler;
pub use nlp::{Annotator, AnnotatorCache};
