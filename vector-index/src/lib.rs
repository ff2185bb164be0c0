#![allow(clippy::missing_docs_in_private_items)]

pub mod bm25;
pub mod client;
pub mod fusion;
pub mod memory;
pub mod types;

pub use bm25::{Bm25Encoder, SparseIndexVector};
pub use client::{DocumentIndex, QdrantIndex, TextField, UpsertOutcome};
pub use fusion::{boosted_score, reciprocal_rank_fusion, FusedHit};
pub use memory::InMemoryIndex;
pub use types::{ChunkModel, SearchHit, SearchRequest};
