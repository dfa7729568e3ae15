//! In-memory search backend.
//!
//! Holds every document's dense vector, sparse vector and payload. Dense
//! search ranks by cosine similarity, sparse search by sparse dot product.
//! Category filters are applied after ranking on an over-fetched window, the
//! way a remote index without server-side filtering would be queried.

use super::{SearchClient, SearchFilters};
use crate::embeddings::{Embedder, cosine_similarity};
use crate::error::SearchError;
use crate::sparse::{Bm25Encoder, SparseVector};
use crate::types::{DocumentPayload, HitSource, RankedHit};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// One line of a JSON-lines corpus file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusRecord {
    pub id: String,
    #[serde(flatten)]
    pub payload: DocumentPayload,
}

impl CorpusRecord {
    /// Text that is embedded and sparse-encoded for this record.
    pub fn index_text(&self) -> String {
        let p = &self.payload;
        [p.title.as_str(), p.abstract_text.as_str(), p.claims.as_str(), p.content.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone)]
struct IndexedDocument {
    id: String,
    dense: Vec<f32>,
    sparse: SparseVector,
    payload: DocumentPayload,
}

/// In-memory `SearchClient`.
#[derive(Debug, Clone)]
pub struct LocalIndex {
    dimensions: usize,
    encoder: Bm25Encoder,
    documents: Vec<IndexedDocument>,
    by_key: HashMap<String, usize>,
}

impl LocalIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            encoder: Bm25Encoder::new(),
            documents: Vec::new(),
            by_key: HashMap::new(),
        }
    }

    /// Add or replace a document. Its sparse vector is encoded from `text`.
    pub fn insert(
        &mut self,
        id: impl Into<String>,
        dense: Vec<f32>,
        text: &str,
        payload: DocumentPayload,
    ) -> Result<(), SearchError> {
        if dense.len() != self.dimensions {
            return Err(SearchError::DimensionMismatch {
                expected: self.dimensions,
                actual: dense.len(),
            });
        }
        let id = id.into();
        let doc = IndexedDocument {
            sparse: self.encoder.encode_document(text),
            id: id.clone(),
            dense,
            payload,
        };
        match self.by_key.get(&lookup_key(&id)) {
            Some(&idx) => self.documents[idx] = doc,
            None => {
                self.by_key.insert(lookup_key(&id), self.documents.len());
                self.documents.push(doc);
            }
        }
        Ok(())
    }

    /// Embed and index a batch of corpus records.
    ///
    /// The sparse encoder is fitted on the batch first, so term weights carry
    /// corpus IDF.
    pub async fn from_records(
        records: Vec<CorpusRecord>,
        embedder: &dyn Embedder,
    ) -> Result<Self, SearchError> {
        let texts: Vec<String> = records.iter().map(CorpusRecord::index_text).collect();
        let vectors = embedder.embed_batch(&texts).await?;

        let mut index = Self::new(embedder.dimensions());
        index.encoder.fit(texts.iter().map(String::as_str));
        for ((record, text), vector) in records.into_iter().zip(&texts).zip(vectors) {
            index.insert(record.id, vector, text, record.payload)?;
        }
        tracing::info!(
            documents = index.len(),
            dimensions = index.dimensions,
            "Local index built"
        );
        Ok(index)
    }

    /// Read a JSON-lines corpus. Blank lines are skipped.
    pub fn read_corpus(path: &Path) -> Result<Vec<CorpusRecord>, SearchError> {
        let raw = std::fs::read_to_string(path).map_err(|e| SearchError::Unavailable {
            message: format!("cannot read corpus {}: {e}", path.display()),
        })?;
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| SearchError::Backend {
                    message: format!("{}:{}: {e}", path.display(), n + 1),
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn ranked(
        &self,
        mut scored: Vec<(usize, f32)>,
        source: HitSource,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Vec<RankedHit> {
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let hits = scored
            .into_iter()
            .take(filters.fetch_k(top_k))
            .map(|(idx, score)| {
                let doc = &self.documents[idx];
                RankedHit::new(doc.id.clone(), score, source).with_payload(doc.payload.clone())
            })
            .collect();
        filters.apply(hits, top_k)
    }
}

/// Identifiers compare upper-cased, ignoring hyphens and spaces.
fn lookup_key(id: &str) -> String {
    id.chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

#[async_trait]
impl SearchClient for LocalIndex {
    async fn dense_search(
        &self,
        vector: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<RankedHit>, SearchError> {
        if vector.len() != self.dimensions {
            return Err(SearchError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        let scored = self
            .documents
            .iter()
            .enumerate()
            .map(|(i, doc)| (i, cosine_similarity(vector, &doc.dense)))
            .collect();
        Ok(self.ranked(scored, HitSource::Dense, top_k, filters))
    }

    async fn sparse_search(
        &self,
        text: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<RankedHit>, SearchError> {
        let query = self.encoder.encode_query(text);
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let scored = self
            .documents
            .iter()
            .enumerate()
            .map(|(i, doc)| (i, query.dot(&doc.sparse)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        Ok(self.ranked(scored, HitSource::Sparse, top_k, filters))
    }

    async fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<RankedHit>, SearchError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.by_key.get(&lookup_key(id)))
            .map(|&idx| {
                let doc = &self.documents[idx];
                RankedHit::new(doc.id.clone(), 1.0, HitSource::Dense)
                    .with_payload(doc.payload.clone())
            })
            .collect())
    }

    fn backend_name(&self) -> &str {
        "local"
    }
}
