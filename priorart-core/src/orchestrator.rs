//! Multi-query search: concurrent fan-out over the query variants, then a
//! priority-aware merge.
//!
//! Documents named explicitly in the idea are force-fetched and seeded first.
//! Every per-query list is then flattened, ordered by rank key, and appended
//! skipping ids already present, so each document survives exactly once in
//! its highest-scoring instance.

use crate::embeddings::Embedder;
use crate::error::{RetrievalError, SearchError};
use crate::expansion::QueryExpander;
use crate::identifiers::{extract_identifiers, fetch_prioritized};
use crate::retry::{RetryPolicy, with_retry};
use crate::search::{HybridQuery, SearchClient, SearchFilters};
use crate::sparse::keyword_query;
use crate::types::{Candidate, FusedResult, MultiQueryOutcome, Query};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Per-call search parameters.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub top_k: usize,
    pub use_hybrid: bool,
    pub dense_weight: f32,
    pub sparse_weight: f32,
    pub rrf_k: u32,
    pub filters: SearchFilters,
}

/// Fans query variants out to the search backend and merges the results.
pub struct MultiQueryOrchestrator {
    expander: QueryExpander,
    embedder: Arc<dyn Embedder>,
    client: Arc<dyn SearchClient>,
    search_retry: RetryPolicy,
    id_fetch_retry: RetryPolicy,
}

impl MultiQueryOrchestrator {
    pub fn new(
        expander: QueryExpander,
        embedder: Arc<dyn Embedder>,
        client: Arc<dyn SearchClient>,
        search_retry: RetryPolicy,
        id_fetch_retry: RetryPolicy,
    ) -> Self {
        Self {
            expander,
            embedder,
            client,
            search_retry,
            id_fetch_retry,
        }
    }

    /// Search for `idea` and return up to `2 × top_k` merged candidates.
    ///
    /// A variant whose search fails after retries contributes nothing. When
    /// every variant fails and nothing was force-fetched, the result is
    /// `NoRelevantDocuments` rather than an empty list.
    pub async fn search(
        &self,
        idea: &str,
        params: &SearchParams,
        cancel: &CancellationToken,
    ) -> Result<MultiQueryOutcome, RetrievalError> {
        let ids = extract_identifiers(idea);
        self.search_with_identifiers(idea, &ids, params, cancel).await
    }

    /// Like `search`, but force-fetches `ids` instead of the identifiers
    /// found in `idea`.
    pub async fn search_with_identifiers(
        &self,
        idea: &str,
        ids: &[String],
        params: &SearchParams,
        cancel: &CancellationToken,
    ) -> Result<MultiQueryOutcome, RetrievalError> {
        if !ids.is_empty() {
            info!(identifiers = ?ids, "Detected explicit identifiers");
        }

        let (prioritized, queries) = tokio::join!(
            fetch_prioritized(self.client.as_ref(), ids, &self.id_fetch_retry, cancel),
            self.expander.expand(idea, cancel),
        );
        let queries = queries?;
        let prioritized = match prioritized {
            Ok(fetched) => {
                if !fetched.missing.is_empty() {
                    warn!(missing = ?fetched.missing, "Named identifiers not found");
                }
                fetched.candidates
            }
            Err(RetrievalError::Cancelled) => return Err(RetrievalError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Identifier fetch failed; continuing without prioritized results");
                Vec::new()
            }
        };

        let searches = queries
            .iter()
            .map(|query| self.search_variant(query, idea, params, cancel));
        let outcomes = futures::future::join_all(searches).await;

        let attempted = outcomes.len();
        let mut failed = 0;
        let mut per_query = Vec::with_capacity(attempted);
        for (query, outcome) in queries.iter().zip(outcomes) {
            match outcome {
                Ok(results) => per_query.push(results),
                Err(RetrievalError::Cancelled) => return Err(RetrievalError::Cancelled),
                Err(e) => {
                    failed += 1;
                    warn!(kind = %query.kind(), error = %e, "Query variant failed; skipping");
                }
            }
        }

        if failed == attempted && prioritized.is_empty() {
            return Err(RetrievalError::NoRelevantDocuments {
                failed_searches: failed,
                attempted_searches: attempted,
            });
        }

        let total: usize = per_query.iter().map(Vec::len).sum::<usize>() + prioritized.len();
        let candidates = merge_candidates(prioritized, per_query, params.top_k.saturating_mul(2));
        info!(
            query_count = attempted,
            failed_searches = failed,
            total,
            unique = candidates.len(),
            "Multi-query search merged"
        );

        Ok(MultiQueryOutcome {
            queries,
            candidates,
            failed_searches: failed,
        })
    }

    /// Run one variant under the search retry policy.
    async fn search_variant(
        &self,
        query: &Query,
        idea: &str,
        params: &SearchParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<FusedResult>, RetrievalError> {
        let keywords = keyword_query(idea, query.text());
        with_retry(&self.search_retry, cancel, "search", || {
            let keywords = keywords.as_str();
            async move {
                let vector = self.embedder.embed(query.text()).await.map_err(SearchError::from)?;
                if params.use_hybrid {
                    self.client
                        .hybrid_search(HybridQuery {
                            vector: &vector,
                            text: keywords,
                            top_k: params.top_k,
                            dense_weight: params.dense_weight,
                            sparse_weight: params.sparse_weight,
                            rrf_k: params.rrf_k,
                            filters: &params.filters,
                        })
                        .await
                } else {
                    let hits = self
                        .client
                        .dense_search(&vector, params.top_k, &params.filters)
                        .await?;
                    Ok::<_, SearchError>(hits.into_iter().map(FusedResult::from_dense).collect())
                }
            }
        })
        .await
    }
}

/// Merge prioritized candidates and per-query results.
///
/// Prioritized candidates go first in their given order. The per-query lists
/// are flattened in query order and stably sorted by `fused_score`, so equal
/// scores keep first-encountered order. Later duplicates are dropped without
/// touching the kept instance.
pub fn merge_candidates(
    prioritized: Vec<Candidate>,
    per_query: Vec<Vec<FusedResult>>,
    limit: usize,
) -> Vec<Candidate> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut merged = Vec::new();

    for candidate in prioritized {
        if seen.insert(candidate.document_id().to_string()) {
            merged.push(candidate);
        }
    }

    let mut flattened: Vec<FusedResult> = per_query.into_iter().flatten().collect();
    flattened.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    for result in flattened {
        if seen.insert(result.document_id.clone()) {
            merged.push(Candidate::Ranked(result));
        }
    }

    merged.truncate(limit);
    merged
}
