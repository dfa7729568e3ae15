//! Query expansion: a hypothetical claim (HyDE) plus angled paraphrases.
//!
//! Both calls fail soft. A failed hypothetical claim is simply left out; a
//! failed paraphrase call falls back to the user's own text, so the query set
//! is never empty.

use crate::error::{GenerationParseError, RetrievalError};
use crate::providers::{GenerationRequest, GenerationTask, TextGeneration, parse_json_object};
use crate::retry::{RetryPolicy, with_retry};
use crate::sanitize::wrap_user_query;
use crate::types::{Query, QueryKind};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HYDE_SYSTEM_PROMPT: &str = "You are a patent attorney with twenty years of litigation experience. \
Turn the user's abstract idea into one hypothetical independent claim that is as clear and \
technically specific as possible. The claim is used only as a search query to find similar \
technology in a patent corpus. Reply with the claim text only, in the language of the idea.";

const MULTI_QUERY_SYSTEM_PROMPT: &str = "You are a patent search specialist. To widen recall, \
write three search queries for the user's idea, each from a different angle:\n\
1. technical terminology and synonyms\n\
2. claim-style phrasing\n\
3. the problem being solved and the solution keywords\n\
Respond in JSON: {\"queries\": [\"...\", \"...\", \"...\"]}";

/// Generates the query variants for one idea.
pub struct QueryExpander {
    generator: Arc<dyn TextGeneration>,
    model: String,
    retry: RetryPolicy,
    include_hypothetical: bool,
    max_paraphrases: usize,
}

impl QueryExpander {
    pub fn new(
        generator: Arc<dyn TextGeneration>,
        model: impl Into<String>,
        retry: RetryPolicy,
        include_hypothetical: bool,
        max_paraphrases: usize,
    ) -> Self {
        Self {
            generator,
            model: model.into(),
            retry,
            include_hypothetical,
            max_paraphrases,
        }
    }

    /// Build the query set: the hypothetical claim first (when enabled and
    /// generated), then the paraphrases or, failing those, the idea itself.
    ///
    /// Only cancellation is returned as an error.
    pub async fn expand(
        &self,
        idea: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Query>, RetrievalError> {
        let hyde = async {
            if self.include_hypothetical {
                Some(self.hypothetical_claim(idea, cancel).await)
            } else {
                None
            }
        };
        let (hyde, paraphrases) = tokio::join!(hyde, self.paraphrases(idea, cancel));

        let mut queries = Vec::with_capacity(1 + self.max_paraphrases);
        match hyde {
            Some(Ok(claim)) => queries.push(Query::new(claim, QueryKind::HypotheticalClaim)),
            Some(Err(RetrievalError::Cancelled)) => return Err(RetrievalError::Cancelled),
            Some(Err(e)) => warn!(error = %e, "Hypothetical claim generation failed; skipping"),
            None => {}
        }

        match paraphrases {
            Ok(list) if list.is_empty() => queries.push(Query::original(idea)),
            Ok(list) => queries.extend(
                list.into_iter()
                    .map(|q| Query::new(q, QueryKind::ParaphraseAngle)),
            ),
            Err(RetrievalError::Cancelled) => return Err(RetrievalError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Multi-query generation failed; falling back to original idea");
                queries.push(Query::original(idea));
            }
        }

        info!(query_count = queries.len(), "Queries generated");
        Ok(queries)
    }

    /// Rewrite the idea as one hypothetical independent claim.
    pub async fn hypothetical_claim(
        &self,
        idea: &str,
        cancel: &CancellationToken,
    ) -> Result<String, RetrievalError> {
        let request = GenerationRequest::new(
            GenerationTask::HypotheticalClaim,
            format!(
                "{}\n\nWrite a professional hypothetical claim 1 (independent claim) for the idea above.",
                wrap_user_query(idea)
            ),
        )
        .with_system(HYDE_SYSTEM_PROMPT)
        .with_model(&self.model)
        .with_temperature(0.3)
        .with_max_tokens(500);

        let generation = with_retry(&self.retry, cancel, "hypothetical_claim", || {
            self.generator.generate(request.clone())
        })
        .await?;

        let claim = generation.text.trim();
        if claim.is_empty() {
            return Err(GenerationParseError::Empty.into());
        }
        debug!(claim = %claim.chars().take(100).collect::<String>(), "Hypothetical claim generated");
        Ok(claim.to_string())
    }

    /// Up to `max_paraphrases` differently angled reformulations.
    pub async fn paraphrases(
        &self,
        idea: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, RetrievalError> {
        if self.max_paraphrases == 0 {
            return Ok(Vec::new());
        }
        let request = GenerationRequest::new(GenerationTask::MultiQuery, wrap_user_query(idea))
            .with_system(MULTI_QUERY_SYSTEM_PROMPT)
            .with_model(&self.model)
            .with_temperature(0.7)
            .json();

        let generation = with_retry(&self.retry, cancel, "multi_query", || {
            self.generator.generate(request.clone())
        })
        .await?;

        Ok(parse_query_list(&generation.text, self.max_paraphrases)?)
    }
}

/// Parse `{"queries": [...]}`, dropping blanks and case-insensitive duplicates.
pub fn parse_query_list(text: &str, max: usize) -> Result<Vec<String>, GenerationParseError> {
    let value = parse_json_object(text)?;
    let items = value
        .get("queries")
        .ok_or_else(|| GenerationParseError::MissingField {
            field: "queries".to_string(),
        })?
        .as_array()
        .ok_or_else(|| GenerationParseError::InvalidField {
            field: "queries".to_string(),
            reason: "expected an array".to_string(),
        })?;

    let mut seen = HashSet::new();
    let mut queries = Vec::new();
    for item in items {
        let query = item
            .as_str()
            .ok_or_else(|| GenerationParseError::InvalidField {
                field: "queries".to_string(),
                reason: "expected strings".to_string(),
            })?
            .trim();
        if !query.is_empty() && seen.insert(query.to_lowercase()) {
            queries.push(query.to_string());
        }
    }
    queries.truncate(max);
    if queries.is_empty() {
        return Err(GenerationParseError::Empty);
    }
    Ok(queries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::providers::MockTextGeneration;
    use pretty_assertions::assert_eq;

    fn expander(mock: Arc<MockTextGeneration>, include_hypothetical: bool) -> QueryExpander {
        QueryExpander::new(mock, "gpt-4o-mini", RetryPolicy::none(), include_hypothetical, 3)
    }

    #[test]
    fn test_parse_query_list() {
        let queries = parse_query_list(
            r#"{"queries": ["battery swap drone", "  ", "Battery swap drone", "a", "b", "c"]}"#,
            3,
        )
        .unwrap();
        assert_eq!(queries, vec!["battery swap drone", "a", "b"]);
    }

    #[test]
    fn test_parse_query_list_errors() {
        assert!(matches!(
            parse_query_list(r#"{"items": []}"#, 3),
            Err(GenerationParseError::MissingField { .. })
        ));
        assert!(matches!(
            parse_query_list(r#"{"queries": "one"}"#, 3),
            Err(GenerationParseError::InvalidField { .. })
        ));
        assert!(matches!(
            parse_query_list(r#"{"queries": [1, 2]}"#, 3),
            Err(GenerationParseError::InvalidField { .. })
        ));
        assert!(matches!(
            parse_query_list(r#"{"queries": []}"#, 3),
            Err(GenerationParseError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_expand_full_query_set() {
        let mock = Arc::new(MockTextGeneration::new());
        mock.queue(GenerationTask::HypotheticalClaim, "A system comprising a drone...")
            .queue(
                GenerationTask::MultiQuery,
                r#"{"queries": ["q1", "q2", "q3", "q4"]}"#,
            );
        let queries = expander(mock.clone(), true)
            .expand("drone battery swap", &CancellationToken::new())
            .await
            .unwrap();
        let kinds: Vec<QueryKind> = queries.iter().map(Query::kind).collect();
        assert_eq!(
            kinds,
            vec![
                QueryKind::HypotheticalClaim,
                QueryKind::ParaphraseAngle,
                QueryKind::ParaphraseAngle,
                QueryKind::ParaphraseAngle,
            ]
        );
        assert_eq!(queries[0].text(), "A system comprising a drone...");

        let requests = mock.requests();
        let hyde = requests
            .iter()
            .find(|r| r.task == GenerationTask::HypotheticalClaim)
            .unwrap();
        assert_eq!(hyde.temperature, 0.3);
        assert_eq!(hyde.max_tokens, Some(500));
    }

    #[tokio::test]
    async fn test_expand_falls_back_to_original() {
        let mock = Arc::new(MockTextGeneration::new());
        mock.queue_error(
            GenerationTask::HypotheticalClaim,
            LlmError::Timeout { timeout_secs: 1 },
        )
        .queue(GenerationTask::MultiQuery, "not json at all");
        let queries = expander(mock, true)
            .expand("drone battery swap", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(queries, vec![Query::original("drone battery swap")]);
    }

    #[tokio::test]
    async fn test_expand_without_hypothetical() {
        let mock = Arc::new(MockTextGeneration::new());
        mock.queue(GenerationTask::MultiQuery, r#"{"queries": ["only one"]}"#);
        let queries = expander(mock.clone(), false)
            .expand("idea", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(mock.call_count(GenerationTask::HypotheticalClaim), 0);
    }

    #[tokio::test]
    async fn test_expand_cancelled() {
        let mock = Arc::new(MockTextGeneration::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = expander(mock, true).expand("idea", &cancel).await;
        assert!(matches!(result, Err(RetrievalError::Cancelled)));
    }
}
