//! Core type definitions for the retrieval pipeline.
//!
//! Values flow through the pipeline stage by stage and are never mutated in
//! place: `Query` → `RankedHit` → `FusedResult` → `Candidate` →
//! `GradedResult` → `RerankedResult`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a query was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// The user's own idea text.
    Original,
    /// A hypothetical claim generated from the idea (HyDE).
    HypotheticalClaim,
    /// A reformulation from a different angle (terminology, claim style, problem/solution).
    ParaphraseAngle,
    /// A query proposed by the rewrite step after low grading scores.
    Rewritten,
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryKind::Original => write!(f, "original"),
            QueryKind::HypotheticalClaim => write!(f, "hypothetical_claim"),
            QueryKind::ParaphraseAngle => write!(f, "paraphrase_angle"),
            QueryKind::Rewritten => write!(f, "rewritten"),
        }
    }
}

/// A search query. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    text: String,
    kind: QueryKind,
}

impl Query {
    pub fn new(text: impl Into<String>, kind: QueryKind) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }

    /// The user's own idea as a query.
    pub fn original(text: impl Into<String>) -> Self {
        Self::new(text, QueryKind::Original)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }
}

/// Which retrieval signal produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitSource {
    Dense,
    Sparse,
}

/// Display fields and metadata for a document, as stored in the index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentPayload {
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "abstract")]
    pub abstract_text: String,
    #[serde(default)]
    pub claims: String,
    #[serde(default)]
    pub content: String,
    /// Classification code (e.g. an IPC code like `G06F 16/33`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl DocumentPayload {
    /// The abstract, or the first 500 characters of the content when no
    /// abstract is stored.
    pub fn summary(&self) -> String {
        if self.abstract_text.is_empty() {
            truncate_chars(&self.content, 500)
        } else {
            self.abstract_text.clone()
        }
    }

    /// Text fed to the cross-encoder: title, abstract and claims, capped.
    pub fn rerank_text(&self, max_chars: usize) -> String {
        let joined = format!("{} {} {}", self.title, self.summary(), self.claims);
        truncate_chars(&joined, max_chars)
    }
}

/// A single scored hit from one retrieval signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedHit {
    pub document_id: String,
    /// Raw backend score (cosine similarity, BM25 dot product, ...).
    pub score: f32,
    pub source: HitSource,
    #[serde(default)]
    pub payload: DocumentPayload,
}

impl RankedHit {
    pub fn new(document_id: impl Into<String>, score: f32, source: HitSource) -> Self {
        Self {
            document_id: document_id.into(),
            score,
            source,
            payload: DocumentPayload::default(),
        }
    }

    pub fn with_payload(mut self, payload: DocumentPayload) -> Self {
        self.payload = payload;
        self
    }
}

/// A document after fusing one or more ranked lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedResult {
    pub document_id: String,
    /// Raw dense score, 0.0 when the document was not in the dense list.
    pub dense_score: f32,
    /// Raw sparse score, 0.0 when the document was not in the sparse list.
    pub sparse_score: f32,
    /// Rank key: the RRF sum in hybrid mode, the dense similarity in dense-only mode.
    pub fused_score: f32,
    pub payload: DocumentPayload,
}

impl FusedResult {
    /// Wrap a dense-only hit; its rank key is the raw similarity.
    pub fn from_dense(hit: RankedHit) -> Self {
        Self {
            document_id: hit.document_id,
            dense_score: hit.score,
            sparse_score: 0.0,
            fused_score: hit.score,
            payload: hit.payload,
        }
    }
}

/// A merged candidate, tagged by how it entered the result set.
///
/// `Prioritized` candidates were named explicitly in the user's text and
/// force-fetched; the tag is carried unchanged through every later stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum Candidate {
    Prioritized(FusedResult),
    Ranked(FusedResult),
}

impl Candidate {
    pub fn result(&self) -> &FusedResult {
        match self {
            Candidate::Prioritized(r) | Candidate::Ranked(r) => r,
        }
    }

    pub fn into_result(self) -> FusedResult {
        match self {
            Candidate::Prioritized(r) | Candidate::Ranked(r) => r,
        }
    }

    pub fn is_prioritized(&self) -> bool {
        matches!(self, Candidate::Prioritized(_))
    }

    pub fn document_id(&self) -> &str {
        &self.result().document_id
    }

    pub fn payload(&self) -> &DocumentPayload {
        &self.result().payload
    }
}

/// Relevance score assigned to a single candidate by the grading step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemGrade {
    pub document_id: String,
    pub score: f32,
    pub reason: String,
}

/// Outcome of one grading pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradingSummary {
    pub grades: Vec<ItemGrade>,
    /// Mean of the per-item scores the grader returned; 0.0 when none.
    pub average_score: f32,
}

impl GradingSummary {
    /// Build a summary, computing the average from the item scores.
    pub fn from_grades(grades: Vec<ItemGrade>) -> Self {
        let average_score = if grades.is_empty() {
            0.0
        } else {
            grades.iter().map(|g| g.score).sum::<f32>() / grades.len() as f32
        };
        Self {
            grades,
            average_score,
        }
    }

    /// The safe default used when grading could not be parsed or failed.
    pub fn failed() -> Self {
        Self::default()
    }

    pub fn grade_for(&self, document_id: &str) -> Option<&ItemGrade> {
        self.grades.iter().find(|g| g.document_id == document_id)
    }
}

/// A candidate with its relevance grade. One set per grading pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradedResult {
    pub candidate: Candidate,
    /// Relevance in `[0, 1]`; always 1.0 for prioritized candidates.
    pub relevance_score: f32,
    pub reason: String,
}

impl GradedResult {
    pub fn document_id(&self) -> &str {
        self.candidate.document_id()
    }
}

/// A graded candidate after cross-encoder reranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankedResult {
    pub graded: GradedResult,
    /// Cross-encoder score; `None` when the reranker passed candidates through.
    pub rerank_score: Option<f32>,
}

impl RerankedResult {
    pub fn document_id(&self) -> &str {
        self.graded.document_id()
    }
}

/// Output of one multi-query orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiQueryOutcome {
    /// The query variants that were searched, in generation order.
    pub queries: Vec<Query>,
    /// Merged, deduplicated candidates; prioritized ones first.
    pub candidates: Vec<Candidate>,
    /// Number of query variants whose search failed after retries.
    pub failed_searches: usize,
}

/// Which pass of the adaptive loop produced the returned results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteState {
    Initial,
    Rewritten,
}

/// Output of `search_with_grading`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradedSearch {
    /// Queries used by the pass that was kept.
    pub queries: Vec<Query>,
    /// Graded results sorted by relevance, highest first.
    pub results: Vec<GradedResult>,
    pub average_score: f32,
    /// The pass whose results were kept.
    pub state: RewriteState,
    /// The rewritten query, when a rewrite was attempted.
    pub rewritten_query: Option<String>,
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
