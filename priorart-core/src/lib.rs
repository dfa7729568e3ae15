//! # Priorart Core
//!
//! Core library for priorart prior-art retrieval.
//! Provides query expansion, hybrid dense/sparse search with RRF fusion,
//! identifier-aware priority merging, LLM grading with an adaptive query
//! rewrite, cross-encoder reranking, configuration, and fundamental types.

pub mod config;
pub mod embeddings;
pub mod error;
pub mod expansion;
pub mod fusion;
pub mod grading;
pub mod identifiers;
pub mod orchestrator;
pub mod pipeline;
pub mod providers;
pub mod reranker;
pub mod retry;
pub mod sanitize;
pub mod search;
pub mod sparse;
pub mod types;

// Re-export commonly used types at the crate root.
pub use config::{PipelineConfig, load_config};
pub use embeddings::{Embedder, LocalEmbedder, OpenAiEmbedder};
pub use error::{
    ConfigError, GenerationParseError, LlmError, Result, RetrievalError, SearchError,
};
pub use fusion::fuse;
pub use pipeline::{PipelineBuilder, RetrievalPipeline};
pub use providers::{MockTextGeneration, TextGeneration};
pub use reranker::{CrossEncoder, RerankerHandle};
pub use search::{CorpusRecord, LocalIndex, SearchClient, SearchFilters};
pub use types::{
    Candidate, DocumentPayload, FusedResult, GradedResult, GradedSearch, GradingSummary,
    MultiQueryOutcome, Query, QueryKind, RankedHit, RerankedResult, RewriteState,
};
