//! Subcommand handlers.

use crate::ConfigAction;
use priorart_core::embeddings::create_embedder;
use priorart_core::{
    GradedResult, LocalIndex, PipelineConfig, RerankedResult, RetrievalPipeline, load_config,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Handle `priorart config ...`.
pub fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".priorart");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&PipelineConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

/// Arguments for one search run.
#[derive(Debug)]
pub struct SearchOptions {
    pub idea: String,
    pub corpus: PathBuf,
    pub dense_only: bool,
    pub top_k: Option<usize>,
    pub categories: Vec<String>,
    pub graded: bool,
}

/// One printed result.
#[derive(Debug, Serialize)]
struct ResultLine {
    rank: usize,
    document_id: String,
    title: String,
    prioritized: bool,
    relevance_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    rerank_score: Option<f32>,
    fused_score: f32,
    reason: String,
}

impl ResultLine {
    fn new(rank: usize, graded: &GradedResult, rerank_score: Option<f32>) -> Self {
        let result = graded.candidate.result();
        Self {
            rank,
            document_id: result.document_id.clone(),
            title: result.payload.title.clone(),
            prioritized: graded.candidate.is_prioritized(),
            relevance_score: graded.relevance_score,
            rerank_score,
            fused_score: result.fused_score,
            reason: graded.reason.clone(),
        }
    }
}

/// Apply command-line overrides on top of the loaded configuration.
fn apply_overrides(config: &mut PipelineConfig, options: &SearchOptions) {
    if options.dense_only {
        config.search.use_hybrid = false;
    }
    if let Some(top_k) = options.top_k {
        config.search.top_k = top_k;
    }
    if !options.categories.is_empty() {
        config.search.category_filters = options.categories.clone();
    }
}

/// Index the corpus, run the pipeline and print the results as JSON.
pub async fn run_search(options: SearchOptions, workspace: &Path) -> anyhow::Result<()> {
    let mut config = load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    apply_overrides(&mut config, &options);

    let embedder = create_embedder(&config)?;
    let records = LocalIndex::read_corpus(&options.corpus)?;
    tracing::info!(
        corpus = %options.corpus.display(),
        documents = records.len(),
        "Indexing corpus"
    );
    let index = LocalIndex::from_records(records, embedder.as_ref()).await?;

    let use_hybrid = config.search.use_hybrid;
    let pipeline = RetrievalPipeline::builder(config)
        .embedder(embedder)
        .search_client(Arc::new(index))
        .build()?;

    let lines: Vec<ResultLine> = if options.graded {
        let graded = tokio::select! {
            result = pipeline.search_with_grading(&options.idea, use_hybrid) => result?,
            _ = tokio::signal::ctrl_c() => {
                pipeline.cancel();
                anyhow::bail!("interrupted");
            }
        };
        graded
            .results
            .iter()
            .enumerate()
            .map(|(i, g)| ResultLine::new(i + 1, g, None))
            .collect()
    } else {
        let reranked = tokio::select! {
            result = pipeline.run(&options.idea, use_hybrid) => result?,
            _ = tokio::signal::ctrl_c() => {
                pipeline.cancel();
                anyhow::bail!("interrupted");
            }
        };
        reranked
            .iter()
            .enumerate()
            .map(|(i, r): (usize, &RerankedResult)| ResultLine::new(i + 1, &r.graded, r.rerank_score))
            .collect()
    };

    println!("{}", serde_json::to_string_pretty(&lines)?);
    Ok(())
}
