use std::path::Path;

use dom_smoothie::{Article, Readability, TextMode};

use common::error::ExtractionFailure;

use super::{analyze_structure, failure, ExtractedDocument};

/// Readability-based extraction: boilerplate stripped, content rendered as
/// markdown. A parse failure is recoverable; the fallback treats the file
/// as plain text.
pub async fn extract_html(path: &Path) -> Result<ExtractedDocument, ExtractionFailure> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
        failure(
            "file_not_found",
            format!("cannot read {}: {err}", path.display()),
            "read",
            false,
        )
    })?;

    let config = dom_smoothie::Config {
        text_mode: TextMode::Markdown,
        ..Default::default()
    };
    let (title, body): (String, String) = tokio::task::spawn_blocking(move || {
        let mut readability = Readability::new(raw, None, Some(config))
            .map_err(|err| err.to_string())?;
        let article: Article = readability.parse().map_err(|err| err.to_string())?;
        Ok::<(String, String), String>((article.title.to_string(), article.text_content.to_string()))
    })
    .await
    .map_err(|err| failure("task_panic", err.to_string(), "structured_extraction", false))?
    .map_err(|message| {
        failure(
            "readability_error",
            message,
            "structured_extraction",
            true,
        )
    })?;

    let title = title.trim().to_string();
    let body = body.trim().to_string();
    if body.is_empty() {
        return Err(failure(
            "empty_document",
            "readability produced no content",
            "structured_extraction",
            true,
        ));
    }

    let markdown = if title.is_empty() {
        body
    } else {
        format!("# {title}\n\n{body}")
    };
    let structure = analyze_structure(&markdown, None);
    Ok(ExtractedDocument {
        markdown,
        structure,
        extraction_method: "readability_html".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn extracts_article_content_as_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        let html = r#"<html><head><title>Leave Policy</title></head><body>
            <nav>Home | About</nav>
            <article><h1>Leave Policy</h1>
            <p>Employees accrue twenty five days of annual leave, prorated by start date. Requests are filed in the portal and approved by the direct manager within five working days.</p>
            <p>Unused days roll over to the next calendar year up to a maximum of five. Beyond that the remainder is forfeited at the end of March.</p>
            </article></body></html>"#;
        tokio::fs::write(&path, html).await.unwrap();

        let doc = extract_html(&path).await.unwrap();
        assert_eq!(doc.extraction_method, "readability_html");
        assert!(doc.markdown.contains("annual leave"));
        assert!(doc.structure.word_count > 20);
    }

    #[tokio::test]
    async fn missing_file_is_non_recoverable() {
        let err = extract_html(Path::new("/missing.html")).await.unwrap_err();
        assert!(!err.recoverable);
    }
}
