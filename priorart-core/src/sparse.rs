//! Lexical signal: keyword extraction and a BM25-style sparse encoder.
//!
//! Term indices are hashed, so no vocabulary has to be stored alongside the
//! index. Corpus statistics (document frequencies, average length) are
//! optional; an unfitted encoder weights every query term equally.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// Keyword cap for sparse queries.
pub const MAX_KEYWORDS: usize = 15;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "must", "shall",
    "can", "need", "dare", "to", "of", "in", "for", "on", "with", "at", "by", "from", "as",
    "into", "through", "during", "before", "after", "above", "below", "between", "under",
    "again", "further", "then", "once", "here", "there", "when", "where", "why", "how", "all",
    "each", "few", "more", "most", "other", "some", "such", "no", "nor", "not", "only", "own",
    "same", "so", "than", "too", "very", "just", "and", "but", "if", "or", "because", "until",
    "while", "this", "that", "these", "those", "what", "which", "who", "whom", "whose",
];

const TECHNICAL_TERMS: &[&str] = &[
    "method", "system", "apparatus", "device", "process", "machine", "algorithm", "model",
    "network", "layer", "module", "component", "database", "index", "vector", "embedding",
    "retrieval", "search", "query", "document", "text", "language", "neural", "learning",
    "training", "inference", "classification", "clustering", "ranking", "generation",
    "processing", "analysis", "extraction", "recognition",
];

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[a-z][a-z0-9]*\b").expect("valid word regex"));

static STOP_SET: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| STOP_WORDS.iter().copied().collect());

static TECH_SET: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| TECHNICAL_TERMS.iter().copied().collect());

/// Extract up to `max_keywords` keywords, most important first.
///
/// Importance is term frequency, doubled for technical vocabulary. Ties keep
/// first-occurrence order.
pub fn extract_keywords(text: &str, max_keywords: usize) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut order: Vec<&str> = Vec::new();
    let mut freq: HashMap<&str, usize> = HashMap::new();

    for word in WORD_RE.find_iter(&lowered).map(|m| m.as_str()) {
        if word.len() <= 2 || STOP_SET.contains(word) {
            continue;
        }
        let count = freq.entry(word).or_insert(0);
        if *count == 0 {
            order.push(word);
        }
        *count += 1;
    }

    let mut scored: Vec<(&str, usize)> = order
        .into_iter()
        .map(|w| {
            let boost = if TECH_SET.contains(w) { 2 } else { 1 };
            (w, freq[w] * boost)
        })
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1));

    scored
        .into_iter()
        .take(max_keywords)
        .map(|(w, _)| w.to_string())
        .collect()
}

/// Build the keyword query for one search variant from the user's idea and
/// the variant text.
pub fn keyword_query(context_text: &str, query_text: &str) -> String {
    extract_keywords(&format!("{context_text} {query_text}"), MAX_KEYWORDS).join(" ")
}

/// A sparse term-weight vector with hashed indices, sorted by index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    fn from_map(map: HashMap<u32, f32>) -> Self {
        let mut pairs: Vec<(u32, f32)> = map.into_iter().collect();
        pairs.sort_by_key(|(idx, _)| *idx);
        let (indices, values) = pairs.into_iter().unzip();
        Self { indices, values }
    }

    /// Dot product of two index-sorted vectors.
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let (mut i, mut j) = (0, 0);
        let mut sum = 0.0;
        while i < self.indices.len() && j < other.indices.len() {
            match self.indices[i].cmp(&other.indices[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    sum += self.values[i] * other.values[j];
                    i += 1;
                    j += 1;
                }
            }
        }
        sum
    }
}

/// BM25-style encoder over hashed terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Encoder {
    k1: f32,
    b: f32,
    avg_doc_len: f32,
    n_docs: usize,
    doc_freq: HashMap<u32, usize>,
}

impl Default for Bm25Encoder {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            avg_doc_len: 256.0,
            n_docs: 0,
            doc_freq: HashMap::new(),
        }
    }
}

impl Bm25Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Learn document frequencies and average length from a corpus.
    pub fn fit<'a>(&mut self, corpus: impl IntoIterator<Item = &'a str>) {
        let mut total_len = 0usize;
        self.n_docs = 0;
        self.doc_freq.clear();
        for doc in corpus {
            let terms = tokenize(doc);
            total_len += terms.len();
            self.n_docs += 1;
            let unique: HashSet<u32> = terms.iter().map(|t| term_index(t)).collect();
            for idx in unique {
                *self.doc_freq.entry(idx).or_insert(0) += 1;
            }
        }
        if self.n_docs > 0 && total_len > 0 {
            self.avg_doc_len = total_len as f32 / self.n_docs as f32;
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.n_docs > 0
    }

    /// Encode a document: saturated, length-normalised term frequencies.
    pub fn encode_document(&self, text: &str) -> SparseVector {
        let terms = tokenize(text);
        if terms.is_empty() {
            return SparseVector::default();
        }
        let doc_len = terms.len() as f32;
        let mut tf: HashMap<u32, f32> = HashMap::new();
        for term in &terms {
            *tf.entry(term_index(term)).or_insert(0.0) += 1.0;
        }
        let norm = self.k1 * (1.0 - self.b + self.b * doc_len / self.avg_doc_len);
        let weights = tf
            .into_iter()
            .map(|(idx, f)| (idx, f * (self.k1 + 1.0) / (f + norm)))
            .collect();
        SparseVector::from_map(weights)
    }

    /// Encode a query: IDF weights normalised to sum to one.
    pub fn encode_query(&self, text: &str) -> SparseVector {
        let unique: HashSet<u32> = tokenize(text).iter().map(|t| term_index(t)).collect();
        if unique.is_empty() {
            return SparseVector::default();
        }
        let weights: HashMap<u32, f32> = unique
            .into_iter()
            .map(|idx| (idx, self.idf(idx)))
            .collect();
        let total: f32 = weights.values().sum();
        if total <= 0.0 {
            return SparseVector::default();
        }
        SparseVector::from_map(weights.into_iter().map(|(i, w)| (i, w / total)).collect())
    }

    fn idf(&self, idx: u32) -> f32 {
        if self.n_docs == 0 {
            return 1.0;
        }
        let df = self.doc_freq.get(&idx).copied().unwrap_or(0) as f32;
        let n = self.n_docs as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !STOP_SET.contains(w))
        .map(str::to_string)
        .collect()
}

fn term_index(term: &str) -> u32 {
    let mut hash: u32 = 5381;
    for b in term.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}
