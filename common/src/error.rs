use async_openai::error::OpenAIError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core internal errors shared by every service.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Authorization error: {0}")]
    Auth(String),
    #[error("Transient upstream error: {0}")]
    UpstreamTransient(String),
    #[error("Permanent upstream error: {0}")]
    UpstreamPermanent(String),
    #[error("Extraction error: {0}")]
    Extraction(ExtractionFailure),
    #[error("Integrity error: {0}")]
    Integrity(String),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("OpenAI error: {0}")]
    OpenAI(OpenAIError),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal service error: {0}")]
    Internal(String),
}

impl AppError {
    /// Transient errors are worth retrying with backoff; everything else is
    /// surfaced to the owning state machine immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::UpstreamTransient(_) | Self::Redis(_))
    }

    /// Stable wire identifier used in callback error payloads.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Auth(_) => "unauthorized",
            Self::UpstreamTransient(_) | Self::UpstreamPermanent(_) | Self::OpenAI(_) => {
                "external_service_error"
            }
            Self::Extraction(_) => "extraction_error",
            Self::Integrity(_) => "integrity_error",
            Self::Redis(_) | Self::Serde(_) | Self::Http(_) | Self::Io(_) | Self::Internal(_) => {
                "internal_error"
            }
        }
    }
}

impl From<OpenAIError> for AppError {
    fn from(err: OpenAIError) -> Self {
        match classify_openai_error(&err) {
            ProviderErrorKind::Transient => Self::UpstreamTransient(err.to_string()),
            ProviderErrorKind::Permanent => Self::UpstreamPermanent(err.to_string()),
            ProviderErrorKind::Other => Self::OpenAI(err),
        }
    }
}

/// Failure detail for document extraction, carried across the wire so the
/// ingestion state machine can decide between fallback and task failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractionFailure {
    pub error_type: String,
    pub message: String,
    pub stage: String,
    pub recoverable: bool,
}

impl std::fmt::Display for ExtractionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}: {}", self.error_type, self.stage, self.message)
    }
}

/// Typed error payload published on callback streams and WebSocket frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub error_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorInfo {
    pub fn from_error(err: &AppError) -> Self {
        Self {
            error_type: err.error_type().to_string(),
            message: err.to_string(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Transient,
    Permanent,
    Other,
}

/// Rate limits, timeouts and dropped connections are retried within the
/// call; provider 4xx responses are not.
pub fn classify_openai_error(err: &OpenAIError) -> ProviderErrorKind {
    match err {
        OpenAIError::Reqwest(inner) => {
            if inner.is_timeout() || inner.is_connect() {
                ProviderErrorKind::Transient
            } else {
                ProviderErrorKind::Other
            }
        }
        OpenAIError::ApiError(api) => {
            let code = api.code.as_deref().unwrap_or_default();
            let transient = code == "rate_limit_exceeded"
                || api
                    .r#type
                    .as_deref()
                    .is_some_and(|t| t.contains("rate_limit") || t.contains("overloaded"));
            if transient {
                ProviderErrorKind::Transient
            } else {
                ProviderErrorKind::Permanent
            }
        }
        OpenAIError::StreamError(_) => ProviderErrorKind::Transient,
        _ => ProviderErrorKind::Other,
    }
}
