use std::path::Path;

use lopdf::Document;
use tracing::debug;

use common::error::ExtractionFailure;

use super::{analyze_structure, failure, ExtractedDocument};

const MIN_TEXT_LEN: usize = 150;
const MIN_ASCII_RATIO: f64 = 0.7;
const HEADING_MAX_LEN: usize = 72;

/// Structured path: text layer via `pdf-extract`, heading heuristics to
/// rebuild a markdown outline. A missing or garbled text layer is
/// recoverable, handing over to the flat fallback.
pub async fn extract_pdf(path: &Path) -> Result<ExtractedDocument, ExtractionFailure> {
    let bytes = tokio::fs::read(path).await.map_err(|err| {
        failure(
            "file_not_found",
            format!("cannot read {}: {err}", path.display()),
            "read",
            false,
        )
    })?;

    let page_count = load_page_count(bytes.clone()).await;

    let text = tokio::task::spawn_blocking(move || {
        pdf_extract::extract_text_from_mem(&bytes).map(|s| s.trim().to_string())
    })
    .await
    .map_err(|err| failure("task_panic", err.to_string(), "structured_extraction", false))?
    .map_err(|err| {
        failure(
            "text_layer_error",
            err.to_string(),
            "structured_extraction",
            true,
        )
    })?;

    if text.chars().count() < MIN_TEXT_LEN || ascii_ratio(&text) < MIN_ASCII_RATIO {
        return Err(failure(
            "text_layer_noise",
            "text layer missing or too noisy for structured extraction",
            "structured_extraction",
            true,
        ));
    }

    let markdown = markdownify(&text);
    let structure = analyze_structure(&markdown, page_count);
    Ok(ExtractedDocument {
        markdown,
        structure,
        extraction_method: "structured_pdf".to_string(),
    })
}

/// Flat fallback: page-by-page text through `lopdf`, no structure.
pub async fn extract_pdf_fallback(path: &Path) -> Result<ExtractedDocument, ExtractionFailure> {
    let bytes = tokio::fs::read(path).await.map_err(|err| {
        failure(
            "file_not_found",
            format!("cannot read {}: {err}", path.display()),
            "read",
            false,
        )
    })?;

    let result = tokio::task::spawn_blocking(move || {
        let document = Document::load_mem(&bytes)
            .map_err(|err| format!("cannot parse pdf: {err}"))?;
        let mut page_numbers: Vec<u32> = document.get_pages().keys().copied().collect();
        page_numbers.sort_unstable();
        let mut pages = Vec::with_capacity(page_numbers.len());
        for page in &page_numbers {
            match document.extract_text(&[*page]) {
                Ok(text) => pages.push(text.trim().to_string()),
                Err(err) => debug!(page, error = %err, "page text extraction failed"),
            }
        }
        Ok::<(Vec<String>, u32), String>((pages, page_numbers.len() as u32))
    })
    .await
    .map_err(|err| failure("task_panic", err.to_string(), "fallback_extraction", false))?;

    let (pages, page_count) = result
        .map_err(|message| failure("pdf_parse_error", message, "fallback_extraction", false))?;

    let markdown = pages
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    if markdown.is_empty() {
        return Err(failure(
            "empty_document",
            "no extractable text in any page",
            "fallback_extraction",
            false,
        ));
    }

    let mut structure = analyze_structure(&markdown, Some(page_count));
    structure.sections.clear();
    Ok(ExtractedDocument {
        markdown,
        structure,
        extraction_method: "fallback_flat".to_string(),
    })
}

async fn load_page_count(bytes: Vec<u8>) -> Option<u32> {
    tokio::task::spawn_blocking(move || {
        Document::load_mem(&bytes)
            .ok()
            .map(|doc| doc.get_pages().len() as u32)
    })
    .await
    .ok()
    .flatten()
}

fn ascii_ratio(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    let ascii = text.chars().filter(|c| c.is_ascii()).count();
    ascii as f64 / text.chars().count() as f64
}

/// Short, unterminated, capitalized lines become level-two headings; the
/// rest flows through untouched.
fn markdownify(text: &str) -> String {
    text.lines()
        .map(|line| {
            let trimmed = line.trim();
            if looks_like_heading(trimmed) {
                format!("## {trimmed}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn looks_like_heading(line: &str) -> bool {
    if line.is_empty() || line.len() > HEADING_MAX_LEN {
        return false;
    }
    if line.ends_with(['.', ',', ';', ':']) {
        return false;
    }
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() || words.len() > 8 {
        return false;
    }
    let first_word_capitalized = words[0]
        .chars()
        .next()
        .is_some_and(|c| c.is_uppercase() || c.is_numeric());
    let all_caps = line
        .chars()
        .filter(|c| c.is_alphabetic())
        .all(|c| c.is_uppercase());
    first_word_capitalized && (all_caps || words.len() <= 6)
}
