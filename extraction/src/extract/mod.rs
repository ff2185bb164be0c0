pub mod html;
pub mod pdf;

use common::error::ExtractionFailure;
use common::model::{DocumentStructure, DocumentType, SectionInfo};

/// A parsed document before NLP enrichment: markdown text plus structural
/// observations.
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub markdown: String,
    pub structure: DocumentStructure,
    pub extraction_method: String,
}

pub fn failure(
    error_type: &str,
    message: impl Into<String>,
    stage: &str,
    recoverable: bool,
) -> ExtractionFailure {
    ExtractionFailure {
        error_type: error_type.to_string(),
        message: message.into(),
        stage: stage.to_string(),
        recoverable,
    }
}

/// Parses markdown headings into sections. Offsets are char positions;
/// `end_char` is the next heading's start (any level) or EOF, so a parent
/// section owns only its own intro text.
pub fn parse_markdown_sections(text: &str) -> Vec<SectionInfo> {
    let mut sections: Vec<SectionInfo> = Vec::new();
    // (level, title) stack for parent resolution.
    let mut ancestry: Vec<(u8, String)> = Vec::new();

    let mut char_pos = 0usize;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end();
        let hashes = trimmed.chars().take_while(|c| *c == '#').count();
        if (1..=6).contains(&hashes) && trimmed.chars().nth(hashes) == Some(' ') {
            let level = hashes as u8;
            let title = trimmed[hashes + 1..].trim().to_string();
            while ancestry.last().is_some_and(|(l, _)| *l >= level) {
                ancestry.pop();
            }
            let parent_title = ancestry.last().map(|(_, t)| t.clone());
            ancestry.push((level, title.clone()));

            if let Some(previous) = sections.last_mut() {
                previous.end_char = Some(char_pos);
            }
            sections.push(SectionInfo {
                title,
                level,
                start_char: char_pos,
                end_char: None,
                parent_title,
            });
        }
        char_pos += line.chars().count();
    }

    let total = text.chars().count();
    if let Some(last) = sections.last_mut() {
        last.end_char = Some(total);
    }
    sections
}

/// Structural observations over the extracted markdown.
pub fn analyze_structure(markdown: &str, page_count: Option<u32>) -> DocumentStructure {
    let sections = parse_markdown_sections(markdown);
    let tables = markdown
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed.starts_with('|') && trimmed.contains("---")
        })
        .count();
    let word_count = markdown.split_whitespace().count();
    let has_toc = markdown.lines().take(40).any(|line| {
        let lower = line.trim_start_matches('#').trim().to_lowercase();
        lower == "table of contents" || lower == "contents" || lower == "índice"
    });
    let has_images = markdown.contains("![");

    DocumentStructure {
        sections,
        tables,
        page_count,
        word_count,
        has_toc,
        has_images,
    }
}

/// Markdown and plain-text files are read as-is; plain text gets no heading
/// detection, matching its flat nature.
pub async fn extract_text_file(
    path: &std::path::Path,
    document_type: DocumentType,
) -> Result<ExtractedDocument, ExtractionFailure> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
        failure(
            "file_not_found",
            format!("cannot read {}: {err}", path.display()),
            "read",
            false,
        )
    })?;

    let method = match document_type {
        DocumentType::Markdown => "markdown",
        _ => "plain_text",
    };
    let structure = if document_type == DocumentType::Markdown {
        analyze_structure(&raw, None)
    } else {
        DocumentStructure {
            word_count: raw.split_whitespace().count(),
            ..Default::default()
        }
    };

    Ok(ExtractedDocument {
        markdown: raw,
        structure,
        extraction_method: method.to_string(),
    })
}
