//! The retrieval pipeline: sanitize, multi-query search, grade, an optional
//! single rewrite pass, rerank.
//!
//! Every collaborator is resolved in `PipelineBuilder::build()`, so missing
//! credentials or an invalid configuration fail at construction rather than
//! on the first request.

use crate::config::PipelineConfig;
use crate::embeddings::{Embedder, create_embedder};
use crate::error::{ConfigError, RetrievalError};
use crate::expansion::QueryExpander;
use crate::grading::Grader;
use crate::identifiers::extract_identifiers;
use crate::orchestrator::{MultiQueryOrchestrator, SearchParams};
use crate::providers::{TextGeneration, create_generator};
use crate::reranker::RerankerHandle;
use crate::sanitize::InputSanitizer;
use crate::search::{SearchClient, SearchFilters};
use crate::types::{
    GradedSearch, MultiQueryOutcome, Query, QueryKind, RerankedResult, RewriteState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Assembles a `RetrievalPipeline`.
///
/// The search client must be supplied. The text generator, embedder and
/// reranker default to what the configuration names.
pub struct PipelineBuilder {
    config: PipelineConfig,
    generator: Option<Arc<dyn TextGeneration>>,
    embedder: Option<Arc<dyn Embedder>>,
    search: Option<Arc<dyn SearchClient>>,
    reranker: Option<RerankerHandle>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            generator: None,
            embedder: None,
            search: None,
            reranker: None,
        }
    }

    pub fn generator(mut self, generator: Arc<dyn TextGeneration>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn search_client(mut self, search: Arc<dyn SearchClient>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn reranker(mut self, reranker: RerankerHandle) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Validate the configuration and resolve every collaborator.
    pub fn build(self) -> Result<RetrievalPipeline, ConfigError> {
        let config = self.config;
        config.validate()?;

        let search = self.search.ok_or_else(|| ConfigError::MissingCapability {
            capability: "search client".to_string(),
        })?;
        let generator = match self.generator {
            Some(generator) => generator,
            None => create_generator(&config.llm)?,
        };
        let embedder = match self.embedder {
            Some(embedder) => embedder,
            None => create_embedder(&config)?,
        };
        let reranker = self
            .reranker
            .unwrap_or_else(|| RerankerHandle::load(&config.reranker));

        let expander = QueryExpander::new(
            generator.clone(),
            config.models.expansion.clone(),
            config.retry.generation.clone(),
            config.search.include_hypothetical,
            config.search.max_paraphrases,
        );
        let orchestrator = MultiQueryOrchestrator::new(
            expander,
            embedder.clone(),
            search.clone(),
            config.retry.search.clone(),
            config.retry.id_fetch.clone(),
        );
        let grader = Grader::new(
            generator.clone(),
            config.models.grading.clone(),
            config.retry.generation.clone(),
            config.grading.digest_chars,
        );

        info!(
            generator = generator.provider_name(),
            embedder = embedder.provider_name(),
            backend = search.backend_name(),
            reranker = reranker.is_available(),
            "Retrieval pipeline ready"
        );

        Ok(RetrievalPipeline {
            sanitizer: InputSanitizer::new(&config.sanitize),
            config,
            orchestrator,
            grader,
            reranker,
            cancel: CancellationToken::new(),
        })
    }
}

/// Hybrid prior-art retrieval with grading and reranking.
pub struct RetrievalPipeline {
    config: PipelineConfig,
    sanitizer: InputSanitizer,
    orchestrator: MultiQueryOrchestrator,
    grader: Grader,
    reranker: RerankerHandle,
    cancel: CancellationToken,
}

impl RetrievalPipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Cancel every in-flight and future request on this pipeline.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Filters from the configured category prefixes.
    pub fn default_filters(&self) -> SearchFilters {
        SearchFilters::categories(
            self.config.search.category_filters.clone(),
            self.config.search.filter_overfetch,
        )
    }

    /// Multi-query search without grading.
    pub async fn search_multi_query(
        &self,
        idea: &str,
        top_k: usize,
        use_hybrid: bool,
        filters: &SearchFilters,
    ) -> Result<MultiQueryOutcome, RetrievalError> {
        let idea = self.sanitizer.sanitize(idea)?;
        let params = self.params(top_k, use_hybrid, filters.clone());
        self.orchestrator
            .search(&idea, &params, &self.cancel.child_token())
            .await
    }

    /// Search, grade and, when the average is below threshold, try one
    /// rewritten query. Results come back sorted by relevance.
    pub async fn search_with_grading(
        &self,
        idea: &str,
        use_hybrid: bool,
    ) -> Result<GradedSearch, RetrievalError> {
        let idea = self.sanitizer.sanitize(idea)?;
        self.graded_search(&idea, use_hybrid, &self.cancel.child_token())
            .await
    }

    /// The full flow: `search_with_grading`, then rerank the top
    /// `reranker.top_k`. Both stages together are bounded by
    /// `request_timeout_secs`.
    pub async fn run(
        &self,
        idea: &str,
        use_hybrid: bool,
    ) -> Result<Vec<RerankedResult>, RetrievalError> {
        let idea = self.sanitizer.sanitize(idea)?;
        let cancel = self.cancel.child_token();
        let timeout_secs = self.config.request_timeout_secs;

        let flow = async {
            let graded = self.graded_search(&idea, use_hybrid, &cancel).await?;
            let reranked = self
                .reranker
                .rerank(&idea, graded.results, self.config.reranker.top_k)
                .await;
            info!(
                results = reranked.len(),
                state = ?graded.state,
                average_score = graded.average_score,
                "Retrieval complete"
            );
            Ok::<_, RetrievalError>(reranked)
        };

        match tokio::time::timeout(Duration::from_secs(timeout_secs), flow).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                warn!(timeout_secs, "Retrieval timed out");
                Err(RetrievalError::Timeout { timeout_secs })
            }
        }
    }

    fn params(&self, top_k: usize, use_hybrid: bool, filters: SearchFilters) -> SearchParams {
        let search = &self.config.search;
        SearchParams {
            top_k,
            use_hybrid,
            dense_weight: search.dense_weight,
            sparse_weight: search.sparse_weight,
            rrf_k: search.rrf_k,
            filters,
        }
    }

    /// Adaptive loop over an already sanitized idea.
    ///
    /// `Initial → Rewritten` happens at most once, only when the first
    /// average is below threshold and a rewrite was produced. The rewritten
    /// pass is kept only when its average is strictly higher. Both passes
    /// are graded against the original idea.
    async fn graded_search(
        &self,
        idea: &str,
        use_hybrid: bool,
        cancel: &CancellationToken,
    ) -> Result<GradedSearch, RetrievalError> {
        let params = self.params(self.config.search.top_k, use_hybrid, self.default_filters());

        let first = self.orchestrator.search(idea, &params, cancel).await?;
        if first.candidates.is_empty() {
            warn!("No search results found");
            return Ok(GradedSearch {
                queries: first.queries,
                results: Vec::new(),
                average_score: 0.0,
                state: RewriteState::Initial,
                rewritten_query: None,
            });
        }

        let (summary, graded) = self.grader.grade(idea, &first.candidates, cancel).await?;
        info!(average_score = summary.average_score, "Initial grading");

        let mut best = GradedSearch {
            queries: first.queries,
            results: graded,
            average_score: summary.average_score,
            state: RewriteState::Initial,
            rewritten_query: None,
        };

        let threshold = self.config.grading.threshold;
        if best.average_score >= threshold || self.config.grading.max_rewrite_attempts == 0 {
            return Ok(best);
        }
        info!(
            average_score = best.average_score,
            threshold, "Score below threshold, attempting query rewrite"
        );

        let Some(rewritten) = self
            .grader
            .rewrite_query(idea, &best.results, cancel)
            .await?
        else {
            warn!("No usable rewrite; keeping initial results");
            return Ok(best);
        };
        best.rewritten_query = Some(rewritten.clone());

        // Documents named in the idea stay prioritized in the second pass.
        let ids = extract_identifiers(&format!("{idea}\n{rewritten}"));

        let second = match self
            .orchestrator
            .search_with_identifiers(&rewritten, &ids, &params, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(RetrievalError::Cancelled) => return Err(RetrievalError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Rewritten search failed; keeping initial results");
                return Ok(best);
            }
        };

        let (new_summary, new_graded) = self.grader.grade(idea, &second.candidates, cancel).await?;
        info!(average_score = new_summary.average_score, "Grading after rewrite");

        if new_summary.average_score > best.average_score {
            best.queries = mark_rewritten(second.queries);
            best.results = new_graded;
            best.average_score = new_summary.average_score;
            best.state = RewriteState::Rewritten;
        } else {
            info!("Rewrite did not improve the average; keeping initial results");
        }
        Ok(best)
    }
}

/// The rewritten query stands in for the user's text in the second pass.
fn mark_rewritten(queries: Vec<Query>) -> Vec<Query> {
    queries
        .into_iter()
        .map(|q| match q.kind() {
            QueryKind::Original => Query::new(q.text(), QueryKind::Rewritten),
            _ => q,
        })
        .collect()
}
