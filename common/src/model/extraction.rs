use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Supported document kinds. Anything the structured extractors cannot parse
/// is routed to the flat fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Pdf,
    Markdown,
    Txt,
    Html,
    Docx,
}

impl DocumentType {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "md" | "markdown" => Some(Self::Markdown),
            "txt" | "text" => Some(Self::Txt),
            "html" | "htm" => Some(Self::Html),
            "docx" => Some(Self::Docx),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Markdown => "md",
            Self::Txt => "txt",
            Self::Html => "html",
            Self::Docx => "docx",
        }
    }

    /// Coarse nature tag stored in the vector payload for filtered search.
    pub fn document_nature(&self) -> &'static str {
        match self {
            Self::Markdown => "technical",
            Self::Txt | Self::Html => "narrative",
            Self::Pdf | Self::Docx => "other",
        }
    }
}

/// One heading-delimited region of the extracted markdown. Offsets are char
/// positions into the extracted text; `end_char` is the next sibling start
/// or EOF, assigned during section parsing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectionInfo {
    pub title: String,
    pub level: u8,
    pub start_char: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_char: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocumentStructure {
    pub sections: Vec<SectionInfo>,
    pub tables: usize,
    pub page_count: Option<u32>,
    pub word_count: usize,
    pub has_toc: bool,
    pub has_images: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySpan {
    pub text: String,
    pub label: String,
}

/// Linguistic annotations produced by the extraction service and consumed
/// by the hierarchical chunker.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NlpEnrichment {
    pub entities: Vec<EntitySpan>,
    pub noun_chunks: Vec<String>,
    pub unique_lemmas: Vec<String>,
    pub entities_by_label: HashMap<String, Vec<String>>,
    pub language: String,
}

/// Extraction result shipped back on the ingestion callback stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub extracted_text: String,
    pub structure: DocumentStructure,
    pub enrichment: NlpEnrichment,
    pub extraction_method: String,
    pub language: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_mapping_is_case_insensitive() {
        assert_eq!(DocumentType::from_extension("PDF"), Some(DocumentType::Pdf));
        assert_eq!(
            DocumentType::from_extension("markdown"),
            Some(DocumentType::Markdown)
        );
        assert_eq!(DocumentType::from_extension("exe"), None);
    }

    #[test]
    fn nature_follows_document_type() {
        assert_eq!(DocumentType::Markdown.document_nature(), "technical");
        assert_eq!(DocumentType::Html.document_nature(), "narrative");
        assert_eq!(DocumentType::Pdf.document_nature(), "other");
    }
}
