pub mod chat;
pub mod configs;
pub mod extraction;

pub use chat::{
    ChatMessage, ChatRequest, ChatResponse, ConversationHistory, MessageRole, TokenUsage,
};
pub use configs::{ExecutionConfig, QueryConfig, RagConfig, NO_DOCUMENTS_SENTINEL};
pub use extraction::{
    DocumentStructure, DocumentType, EntitySpan, ExtractionOutcome, NlpEnrichment, SectionInfo,
};
