use serde::{Deserialize, Serialize};

/// Sparse term-weighted vector in the index's hashed term space. IDF is
/// applied server-side by the sparse index modifier; values here carry the
/// saturated term-frequency component only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SparseIndexVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseIndexVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// BM25 term weighting over hashed tokens. Deterministic, allocation-light,
/// shared by the ingestion upsert path and the query service.
#[derive(Debug, Clone)]
pub struct Bm25Encoder {
    pub k1: f32,
    pub b: f32,
    pub avg_doc_len: f32,
}

impl Default for Bm25Encoder {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            avg_doc_len: 256.0,
        }
    }
}

impl Bm25Encoder {
    pub fn encode(&self, text: &str) -> SparseIndexVector {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return SparseIndexVector::default();
        }

        let doc_len = tokens.len() as f32;
        let mut frequencies: std::collections::BTreeMap<u32, f32> = std::collections::BTreeMap::new();
        for token in &tokens {
            *frequencies.entry(fnv1a_32(token)).or_insert(0.0) += 1.0;
        }

        let norm = self.k1 * (1.0 - self.b + self.b * doc_len / self.avg_doc_len);
        let mut indices = Vec::with_capacity(frequencies.len());
        let mut values = Vec::with_capacity(frequencies.len());
        for (index, tf) in frequencies {
            indices.push(index);
            values.push(tf * (self.k1 + 1.0) / (tf + norm));
        }

        SparseIndexVector { indices, values }
    }
}

/// Lowercased alphanumeric tokens, two characters or longer.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .collect()
}

/// 32-bit FNV-1a over the token bytes; stable across processes and
/// releases, which keys the sparse term space.
pub fn fnv1a_32(token: &str) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET;
    for byte in token.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
