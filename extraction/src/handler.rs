use std::path::Path;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use common::action::payload::{types, ActionPayload, ExtractionProcessPayload};
use common::action::{DomainAction, ServiceName};
use common::error::{AppError, ExtractionFailure};
use common::model::DocumentType;
use common::transport::ActionHandler;

use crate::extract::{self, ExtractedDocument};
use crate::nlp::{guess_language, AnnotatorCache};

/// Document parsing plus NLP enrichment. Recoverable primary failures fall
/// back to the flat extractor; everything else reports a failed stage on
/// the callback stream.
pub struct ExtractionHandler {
    nlp: AnnotatorCache,
}

impl Default for ExtractionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionHandler {
    pub fn new() -> Self {
        Self {
            nlp: AnnotatorCache::new(),
        }
    }

    async fn extract(
        &self,
        payload: &ExtractionProcessPayload,
    ) -> Result<ExtractedDocument, ExtractionFailure> {
        let path = Path::new(&payload.file_path);
        let primary = match payload.document_type {
            DocumentType::Pdf => extract::pdf::extract_pdf(path).await,
            DocumentType::Html => extract::html::extract_html(path).await,
            DocumentType::Markdown | DocumentType::Txt => {
                extract::extract_text_file(path, payload.document_type).await
            }
            DocumentType::Docx => Err(extract::failure(
                "unsupported_format",
                "no structured extractor for this format",
                "structured_extraction",
                true,
            )),
        };

        match primary {
            Ok(document) => Ok(document),
            Err(err) if err.recoverable => {
                warn!(
                    document = %payload.document_name,
                    error = %err,
                    "structured extraction failed; using fallback"
                );
                self.fallback(path, payload.document_type).await
            }
            Err(err) => Err(err),
        }
    }

    async fn fallback(
        &self,
        path: &Path,
        document_type: DocumentType,
    ) -> Result<ExtractedDocument, ExtractionFailure> {
        match document_type {
            DocumentType::Pdf => extract::pdf::extract_pdf_fallback(path).await,
            // Anything else: best-effort plain read, flat structure.
            _ => {
                let mut document = extract::extract_text_file(path, DocumentType::Txt).await?;
                document.extraction_method = "fallback_flat".to_string();
                Ok(document)
            }
        }
    }
}

#[async_trait]
impl ActionHandler for ExtractionHandler {
    fn service(&self) -> ServiceName {
        ServiceName::Extraction
    }

    async fn handle(&self, action: DomainAction) -> Result<Option<DomainAction>, AppError> {
        if action.action_type != types::EXTRACTION_PROCESS {
            warn!(action_type = %action.action_type, "unrecognized action");
            return Ok(None);
        }
        let ActionPayload::ExtractionProcess(payload) =
            ActionPayload::decode(&action.action_type, &action.data)?
        else {
            return Err(AppError::Validation("expected extraction payload".into()));
        };

        match self.extract(&payload).await {
            Ok(document) => {
                let language = guess_language(&document.markdown);
                let annotator = self.nlp.get(&language, payload.language_model_size).await;
                let enrichment = annotator.annotate(&document.markdown);

                info!(
                    action_id = %action.action_id,
                    tenant_id = %action.tenant_id,
                    task_id = action.task_id.as_deref().unwrap_or(""),
                    document = %payload.document_name,
                    method = %document.extraction_method,
                    sections = document.structure.sections.len(),
                    entities = enrichment.entities.len(),
                    "document extracted"
                );

                let data = json!({
                    "status": "completed",
                    "outcome": {
                        "extracted_text": document.markdown,
                        "structure": document.structure,
                        "enrichment": enrichment,
                        "extraction_method": document.extraction_method,
                        "language": language,
                    },
                });
                Ok(action.reply(ServiceName::Extraction, data))
            }
            Err(failure) => {
                warn!(
                    action_id = %action.action_id,
                    task_id = action.task_id.as_deref().unwrap_or(""),
                    document = %payload.document_name,
                    error = %failure,
                    "extraction failed"
                );
                let data = json!({ "status": "failed", "error": failure });
                Ok(action.reply(ServiceName::Extraction, data))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::action::payload::{ExtractionResultPayload, LanguageModelSize, StageStatus};
    use uuid::Uuid;

    fn process_action(file_path: &str, document_type: DocumentType) -> DomainAction {
        DomainAction::new(
            types::EXTRACTION_PROCESS,
            ServiceName::Ingestion,
            Uuid::new_v4(),
            json!({
                "file_path": file_path,
                "document_name": "sample",
                "document_type": document_type,
                "language_model_size": LanguageModelSize::Medium,
            }),
        )
        .with_callback("extraction.response")
        .with_task("task-1")
    }

    fn decode_reply(reply: DomainAction) -> ExtractionResultPayload {
        serde_json::from_value(reply.data).unwrap()
    }

    #[tokio::test]
    async fn markdown_extraction_completes_with_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guide.md");
        tokio::fs::write(
            &path,
            "# Guide\n\nThe onboarding guide for new employees at Acme Corp.\n\n## Benefits\n\nEmployees receive annual leave and health coverage from day one.\n",
        )
        .await
        .unwrap();

        let handler = ExtractionHandler::new();
        let reply = handler
            .handle(process_action(path.to_str().unwrap(), DocumentType::Markdown))
            .await
            .unwrap()
            .expect("reply owed");
        assert_eq!(reply.action_type, "ingestion.extraction.response");

        let payload = decode_reply(reply);
        assert_eq!(payload.status, StageStatus::Completed);
        let outcome = payload.outcome.unwrap();
        assert_eq!(outcome.extraction_method, "markdown");
        assert_eq!(outcome.structure.sections.len(), 2);
        assert_eq!(outcome.language, "en");
    }

    #[tokio::test]
    async fn missing_file_reports_failed_stage() {
        let handler = ExtractionHandler::new();
        let reply = handler
            .handle(process_action("/nope/missing.md", DocumentType::Markdown))
            .await
            .unwrap()
            .expect("failure still replies");
        let payload = decode_reply(reply);
        assert_eq!(payload.status, StageStatus::Failed);
        let error = payload.error.unwrap();
        assert!(!error.recoverable);
        assert_eq!(error.error_type, "file_not_found");
    }

    #[tokio::test]
    async fn docx_routes_to_flat_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memo.docx");
        // Not real docx content; the fallback treats it as plain text.
        tokio::fs::write(&path, "Quarterly results improved across regions.")
            .await
            .unwrap();

        let handler = ExtractionHandler::new();
        let reply = handler
            .handle(process_action(path.to_str().unwrap(), DocumentType::Docx))
            .await
            .unwrap()
            .unwrap();
        let payload = decode_reply(reply);
        assert_eq!(payload.status, StageStatus::Completed);
        assert_eq!(payload.outcome.unwrap().extraction_method, "fallback_flat");
    }
}
