use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;
use tokio::sync::RwLock;
use tracing::info;

use common::action::payload::LanguageModelSize;
use common::model::{EntitySpan, NlpEnrichment};

const EN_STOPWORDS: &[&str] = &[
    "the", "a", "an", "of", "to", "and", "or", "in", "on", "for", "with", "is", "are", "was",
    "were", "be", "been", "by", "at", "as", "it", "its", "this", "that", "these", "those", "from",
    "but", "not", "have", "has", "had", "will", "would", "can", "could", "should", "may",
];
const ES_STOPWORDS: &[&str] = &[
    "el", "la", "los", "las", "un", "una", "de", "del", "y", "o", "en", "que", "es", "son", "por",
    "para", "con", "se", "su", "al", "lo", "como", "más", "pero", "sus", "le", "ya", "este",
    "esta", "tiene",
];
const COUNTRIES: &[&str] = &[
    "France", "Germany", "Spain", "Mexico", "Argentina", "Chile", "Colombia", "Brazil", "Italy",
    "Portugal", "Japan", "China", "India", "Canada", "Australia", "Netherlands", "Switzerland",
    "Austria", "Belgium", "Sweden", "Norway", "Denmark", "Poland", "Ireland",
    "United States", "United Kingdom",
];

/// Deterministic linguistic annotator. One instance per `(language, size)`
/// tier; the large tier additionally resolves locations and lemmas.
pub struct Annotator {
    language: String,
    size: LanguageModelSize,
    date_pattern: Regex,
    money_pattern: Regex,
    proper_pattern: Regex,
    honorific_pattern: Regex,
    org_suffix_pattern: Regex,
    stopwords: HashSet<&'static str>,
}

impl Annotator {
    pub fn load(language: &str, size: LanguageModelSize) -> Self {
        let stopwords = match language {
            "es" => ES_STOPWORDS,
            _ => EN_STOPWORDS,
        };
        Self {
            language: language.to_string(),
            size,
            date_pattern: Regex::new(
                r"(?x)
                \b\d{4}-\d{2}-\d{2}\b
                | \b\d{1,2}/\d{1,2}/\d{2,4}\b
                | \b(?:January|February|March|April|May|June|July|August|September|October|November|December)\s+\d{1,2},?\s+\d{4}\b",
            )
            .expect("date pattern"),
            money_pattern: Regex::new(
                r"(?x)
                [$€£]\s?\d[\d,.]*
                | \b\d[\d,.]*\s?(?:USD|EUR|GBP|dollars|euros)\b",
            )
            .expect("money pattern"),
            proper_pattern: Regex::new(
                r"\b[A-ZÁÉÍÓÚÑ][\wáéíóúñ]+(?:\s+[A-ZÁÉÍÓÚÑ][\wáéíóúñ]+)+\b",
            )
            .expect("proper noun pattern"),
            honorific_pattern: Regex::new(r"(?:Mr|Mrs|Ms|Dr|Prof|Sr|Sra|Don|Doña)\.?\s*$")
                .expect("honorific pattern"),
            org_suffix_pattern: Regex::new(
                r"(?:Inc|Ltd|LLC|Corp|GmbH|S\.A\.|Company|University|Institute|Foundation|Bank|Group)\.?$",
            )
            .expect("org suffix pattern"),
            stopwords: stopwords.iter().copied().collect(),
        }
    }

    pub fn annotate(&self, text: &str) -> NlpEnrichment {
        let mut entities = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();

        for m in self.date_pattern.find_iter(text) {
            push_unique(&mut entities, &mut seen, m.as_str(), "DATE");
        }
        for m in self.money_pattern.find_iter(text) {
            push_unique(&mut entities, &mut seen, m.as_str(), "MONEY");
        }
        for m in self.proper_pattern.find_iter(text) {
            let span = m.as_str();
            if self.date_pattern.is_match(span) {
                continue;
            }
            // An honorific immediately before the span marks a person.
            let preceded_by_honorific = self.honorific_pattern.is_match(&text[..m.start()]);
            let label = if preceded_by_honorific {
                "PER"
            } else if self.org_suffix_pattern.is_match(span) {
                "ORG"
            } else if self.size == LanguageModelSize::Large && COUNTRIES.contains(&span) {
                "GPE"
            } else {
                "MISC"
            };
            push_unique(&mut entities, &mut seen, span, label);
        }
        if self.size == LanguageModelSize::Large {
            for country in COUNTRIES {
                if country.split_whitespace().count() == 1 && contains_word(text, country) {
                    push_unique(&mut entities, &mut seen, country, "GPE");
                }
            }
        }

        let noun_chunks = self.noun_chunks(text);
        let unique_lemmas = match self.size {
            LanguageModelSize::Large => self.lemmas(text),
            LanguageModelSize::Medium => Vec::new(),
        };

        let mut entities_by_label: HashMap<String, Vec<String>> = HashMap::new();
        for entity in &entities {
            entities_by_label
                .entry(entity.label.clone())
                .or_default()
                .push(entity.text.clone());
        }

        NlpEnrichment {
            entities,
            noun_chunks,
            unique_lemmas,
            entities_by_label,
            language: self.language.clone(),
        }
    }

    /// Runs of two-to-four content words between stopwords and punctuation,
    /// a cheap stand-in for syntactic noun phrases.
    fn noun_chunks(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut seen = HashSet::new();
        let mut run: Vec<String> = Vec::new();

        let mut flush = |run: &mut Vec<String>| {
            if (2..=4).contains(&run.len()) {
                let chunk = run.join(" ");
                if seen.insert(chunk.clone()) {
                    chunks.push(chunk);
                }
            }
            run.clear();
        };

        for raw in text.split(|c: char| !c.is_alphanumeric() && c != '\'') {
            let word = raw.trim_matches('\'').to_lowercase();
            if word.len() < 2 || self.stopwords.contains(word.as_str()) {
                flush(&mut run);
            } else {
                run.push(word);
                if run.len() == 4 {
                    flush(&mut run);
                }
            }
        }
        flush(&mut run);
        chunks
    }

    fn lemmas(&self, text: &str) -> Vec<String> {
        let mut lemmas: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .map(|w| w.to_lowercase())
            .filter(|w| w.len() > 3 && !self.stopwords.contains(w.as_str()))
            .map(|w| strip_suffix(&w))
            .collect();
        lemmas.sort();
        lemmas.dedup();
        lemmas
    }
}

fn push_unique(
    entities: &mut Vec<EntitySpan>,
    seen: &mut HashSet<(String, String)>,
    text: &str,
    label: &str,
) {
    if seen.insert((text.to_string(), label.to_string())) {
        entities.push(EntitySpan {
            text: text.to_string(),
            label: label.to_string(),
        });
    }
}

fn contains_word(text: &str, word: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|w| w == word)
}

fn strip_suffix(word: &str) -> String {
    for suffix in ["ing", "ed", "es", "s"] {
        if let Some(stem) = word.strip_suffix(suffix) {
            if stem.len() >= 3 {
                return stem.to_string();
            }
        }
    }
    word.to_string()
}

/// Per-process annotator cache keyed by `(language, size)`. Loaded lazily,
/// never evicted for the process lifetime.
#[derive(Default)]
pub struct AnnotatorCache {
    annotators: RwLock<HashMap<(String, LanguageModelSize), Arc<Annotator>>>,
}

impl AnnotatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, language: &str, size: LanguageModelSize) -> Arc<Annotator> {
        let key = (language.to_string(), size);
        if let Some(annotator) = self.annotators.read().await.get(&key) {
            return Arc::clone(annotator);
        }
        let mut annotators = self.annotators.write().await;
        Arc::clone(annotators.entry(key).or_insert_with(|| {
            info!(language, ?size, "loading language annotator");
            Arc::new(Annotator::load(language, size))
        }))
    }
}

/// Stopword-vote language guess between the supported languages.
pub fn guess_language(text: &str) -> String {
    let mut en = 0usize;
    let mut es = 0usize;
    for word in text
        .split_whitespace()
        .take(400)
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
    {
        if EN_STOPWORDS.contains(&word.as_str()) {
            en += 1;
        }
        if ES_STOPWORDS.contains(&word.as_str()) {
            es += 1;
        }
    }
    if es > en {
        "es".to_string()
    } else {
        "en".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotator() -> Annotator {
        Annotator::load("en", LanguageModelSize::Large)
    }

    #[test]
    fn dates_and_amounts_are_labelled() {
        let enrichment = annotator()
            .annotate("The contract was signed on 2024-03-15 for $1,200,000 with Acme Corp.");
        let labels: Vec<&str> = enrichment.entities.iter().map(|e| e.label.as_str()).collect();
        assert!(labels.contains(&"DATE"));
        assert!(labels.contains(&"MONEY"));
        assert!(labels.contains(&"ORG"));
    }

    #[test]
    fn honorifics_mark_people() {
        let enrichment = annotator().annotate("Dr. Elena Ramos presented the findings.");
        assert!(enrichment
            .entities
            .iter()
            .any(|e| e.label == "PER" && e.text.contains("Elena Ramos")));
    }

    #[test]
    fn large_tier_resolves_countries() {
        let large = annotator().annotate("The rollout starts in Germany next quarter.");
        assert!(large.entities.iter().any(|e| e.label == "GPE" && e.text == "Germany"));

        let medium = Annotator::load("en", LanguageModelSize::Medium)
            .annotate("The rollout starts in Germany next quarter.");
        assert!(!medium.entities.iter().any(|e| e.label == "GPE"));
        assert!(medium.unique_lemmas.is_empty());
    }

    #[test]
    fn noun_chunks_are_content_word_runs() {
        let enrichment =
            annotator().annotate("the retrieval pipeline uses a hybrid vector search index");
        assert!(enrichment
            .noun_chunks
            .iter()
            .any(|c| c.contains("retrieval pipeline")));
        assert!(enrichment
            .noun_chunks
            .iter()
            .any(|c| c.contains("hybrid vector search")));
    }

    #[test]
    fn entities_group_by_label() {
        let enrichment = annotator().annotate("Paid $50 on 2024-01-01, then $70 on 2024-02-02.");
        assert_eq!(enrichment.entities_by_label["DATE"].len(), 2);
        assert_eq!(enrichment.entities_by_label["MONEY"].len(), 2);
    }

    #[test]
    fn language_guess_splits_en_and_es() {
        assert_eq!(
            guess_language("the system is ready and the pipeline has been started"),
            "en"
        );
        assert_eq!(
            guess_language("el sistema de ingesta de documentos es una parte del servicio"),
            "es"
        );
    }

    #[tokio::test]
    async fn cache_returns_the_same_instance() {
        let cache = AnnotatorCache::new();
        let first = cache.get("en", LanguageModelSize::Medium).await;
        let second = cache.get("en", LanguageModelSize::Medium).await;
        assert!(Arc::ptr_eq(&first, &second));
    }
}
