//! Relevance grading of retrieved candidates, and the one-shot query rewrite.
//!
//! Grading fails soft: an unusable reply grades every ranked candidate 0.0.
//! Prioritized candidates end at 1.0 whatever the grader says, including
//! when the call fails outright.

use crate::error::{GenerationParseError, RetrievalError};
use crate::providers::{GenerationRequest, GenerationTask, TextGeneration, parse_json_object};
use crate::retry::{RetryPolicy, with_retry};
use crate::sanitize::wrap_user_query;
use crate::types::{Candidate, GradedResult, GradingSummary, ItemGrade, truncate_chars};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const PRIORITIZED_TAG: &str = "[PRIORITIZED]";

const GRADING_SYSTEM_PROMPT: &str = "You are a patent attorney with twenty years of \
infringement-dispute experience. Judge, critically and conservatively, whether each retrieved \
document is technically and substantively related to the user's idea.\n\
Guidelines:\n\
1. Technical feasibility: an idea that does not hold together logically, or that is only a \
patchwork of keywords, earns a low score.\n\
2. Field and purpose: weigh whether the idea's real technical problem matches the problem the \
document solves.\n\
3. Scale from 0.0 to 1.0:\n\
   - 0.8-1.0: nearly identical technical means and purpose (direct infringement risk)\n\
   - 0.5-0.7: same field, different implementation (improvement or design-around possible)\n\
   - 0.1-0.4: shared keywords only, or a different technical context\n\
   - 0.0: technically unrelated\n\
Documents that merely share keywords with the idea must not be scored high.\n\
Always respond in JSON.";

/// Scores candidates and proposes rewritten queries.
pub struct Grader {
    generator: Arc<dyn TextGeneration>,
    model: String,
    retry: RetryPolicy,
    digest_chars: usize,
}

impl Grader {
    pub fn new(
        generator: Arc<dyn TextGeneration>,
        model: impl Into<String>,
        retry: RetryPolicy,
        digest_chars: usize,
    ) -> Self {
        Self {
            generator,
            model: model.into(),
            retry,
            digest_chars,
        }
    }

    /// Grade `candidates` against `idea`.
    ///
    /// Returns the grading summary and one `GradedResult` per candidate,
    /// sorted by relevance. Only cancellation is returned as an error.
    pub async fn grade(
        &self,
        idea: &str,
        candidates: &[Candidate],
        cancel: &CancellationToken,
    ) -> Result<(GradingSummary, Vec<GradedResult>), RetrievalError> {
        if candidates.is_empty() {
            return Ok((GradingSummary::failed(), Vec::new()));
        }

        let prompt = format!(
            "[User idea]\n{}\n\n[Retrieved documents]\n{}\n\n\
             Grade every document in this JSON format:\n\
             {{\n  \"results\": [\n    {{\"patent_id\": \"document id\", \"score\": 0.0, \"reason\": \"why\"}}\n  ],\n  \"average_score\": 0.0\n}}",
            wrap_user_query(idea),
            build_digest(candidates, self.digest_chars)
        );
        let request = GenerationRequest::new(GenerationTask::Grading, prompt)
            .with_system(GRADING_SYSTEM_PROMPT)
            .with_model(&self.model)
            .with_temperature(0.1)
            .json();

        let reply = with_retry(&self.retry, cancel, "grading", || {
            self.generator.generate(request.clone())
        })
        .await;

        let summary = match reply {
            Ok(generation) => match parse_grading(&generation.text) {
                Ok(parsed) => Some(restrict_to(parsed, candidates)),
                Err(e) => {
                    warn!(error = %e, "Failed to parse grading response; scoring 0.0");
                    None
                }
            },
            Err(RetrievalError::Cancelled) => return Err(RetrievalError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Grading call failed; scoring 0.0");
                None
            }
        };

        let graded = apply_grades(candidates, summary.as_ref());
        let summary = summary.unwrap_or_else(GradingSummary::failed);
        info!(
            candidates = candidates.len(),
            graded = summary.grades.len(),
            average_score = summary.average_score,
            "Grading complete"
        );
        Ok((summary, graded))
    }

    /// Propose a better query from a poorly graded result set.
    ///
    /// Returns `Ok(None)` when no usable rewrite came back.
    pub async fn rewrite_query(
        &self,
        idea: &str,
        graded: &[GradedResult],
        cancel: &CancellationToken,
    ) -> Result<Option<String>, RetrievalError> {
        let summary: Vec<String> = graded
            .iter()
            .map(|g| {
                format!(
                    "- {}: score={:.2}, {}",
                    g.document_id(),
                    g.relevance_score,
                    g.reason
                )
            })
            .collect();
        let prompt = format!(
            "The search results have low relevance. Optimize the search query.\n\n\
             [Original idea]\n{}\n\n[Previous results (low scores)]\n{}\n\n\
             Respond in JSON:\n\
             {{\n  \"optimized_query\": \"improved search query\",\n  \"keywords\": [\"core\", \"technical\", \"keywords\"],\n  \"reasoning\": \"why it is better\"\n}}",
            wrap_user_query(idea),
            summary.join("\n")
        );
        let request = GenerationRequest::new(GenerationTask::Rewrite, prompt)
            .with_model(&self.model)
            .with_temperature(0.3)
            .json();

        let reply = with_retry(&self.retry, cancel, "rewrite", || {
            self.generator.generate(request.clone())
        })
        .await;

        match reply {
            Ok(generation) => match parse_rewrite(&generation.text) {
                Ok(query) => {
                    info!(rewritten_query = %query, "Query rewritten");
                    Ok(Some(query))
                }
                Err(e) => {
                    warn!(error = %e, "Failed to parse rewrite response");
                    Ok(None)
                }
            },
            Err(RetrievalError::Cancelled) => Err(RetrievalError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Rewrite call failed");
                Ok(None)
            }
        }
    }
}

/// Compact digest of the candidates for the grading prompt.
fn build_digest(candidates: &[Candidate], digest_chars: usize) -> String {
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let payload = c.payload();
            format!(
                "[Document {}: {}]\nTitle: {}\nAbstract: {}...\nClaims: {}...",
                i + 1,
                c.document_id(),
                payload.title,
                truncate_chars(&payload.summary(), digest_chars),
                truncate_chars(&payload.claims, digest_chars)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Validate a grading reply.
///
/// Expects `{"results": [{"patent_id" | "document_id", "score", "reason"}]}`.
/// Scores are clamped to `[0, 1]`; the reply's own `average_score` is ignored
/// and recomputed from the items.
pub fn parse_grading(text: &str) -> Result<GradingSummary, GenerationParseError> {
    let value = parse_json_object(text)?;
    let items = value
        .get("results")
        .ok_or_else(|| GenerationParseError::MissingField {
            field: "results".to_string(),
        })?
        .as_array()
        .ok_or_else(|| GenerationParseError::InvalidField {
            field: "results".to_string(),
            reason: "expected an array".to_string(),
        })?;

    let grades = items.iter().map(parse_item).collect::<Result<Vec<_>, _>>()?;
    Ok(GradingSummary::from_grades(grades))
}

fn parse_item(item: &Value) -> Result<ItemGrade, GenerationParseError> {
    let document_id = item
        .get("patent_id")
        .or_else(|| item.get("document_id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| GenerationParseError::MissingField {
            field: "results[].patent_id".to_string(),
        })?;
    let score = match item.get("score") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => {
            s.trim()
                .parse::<f64>()
                .map_err(|_| GenerationParseError::InvalidField {
                    field: "results[].score".to_string(),
                    reason: format!("'{s}' is not a number"),
                })?
        }
        Some(_) => {
            return Err(GenerationParseError::InvalidField {
                field: "results[].score".to_string(),
                reason: "expected a number".to_string(),
            });
        }
        None => {
            return Err(GenerationParseError::MissingField {
                field: "results[].score".to_string(),
            });
        }
    };
    let reason = item
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(ItemGrade {
        document_id: document_id.to_string(),
        score: score.clamp(0.0, 1.0) as f32,
        reason,
    })
}

/// Validate a rewrite reply and return the optimized query.
pub fn parse_rewrite(text: &str) -> Result<String, GenerationParseError> {
    let value = parse_json_object(text)?;
    let query = value
        .get("optimized_query")
        .ok_or_else(|| GenerationParseError::MissingField {
            field: "optimized_query".to_string(),
        })?
        .as_str()
        .ok_or_else(|| GenerationParseError::InvalidField {
            field: "optimized_query".to_string(),
            reason: "expected a string".to_string(),
        })?
        .trim();
    if query.is_empty() {
        return Err(GenerationParseError::Empty);
    }
    Ok(query.to_string())
}

/// Keep only grades for documents that were actually graded, first grade
/// per id winning.
fn restrict_to(summary: GradingSummary, candidates: &[Candidate]) -> GradingSummary {
    let known: HashSet<&str> = candidates.iter().map(Candidate::document_id).collect();
    let mut seen = HashSet::new();
    let grades = summary
        .grades
        .into_iter()
        .filter(|g| known.contains(g.document_id.as_str()) && seen.insert(g.document_id.clone()))
        .collect();
    GradingSummary::from_grades(grades)
}

/// Attach grades to candidates and sort by relevance, highest first.
///
/// `None` means grading failed. Ungraded ranked candidates score 0.0;
/// prioritized candidates always score 1.0. The sort is stable, so equal
/// scores keep merge order.
pub fn apply_grades(candidates: &[Candidate], summary: Option<&GradingSummary>) -> Vec<GradedResult> {
    let mut graded: Vec<GradedResult> = candidates
        .iter()
        .map(|candidate| {
            let grade = summary.and_then(|s| s.grade_for(candidate.document_id()));
            let (relevance_score, reason) = match (candidate, grade, summary) {
                (Candidate::Prioritized(_), Some(g), _) if g.reason.contains(PRIORITIZED_TAG) => {
                    (1.0, g.reason.clone())
                }
                (Candidate::Prioritized(_), Some(g), _) if !g.reason.is_empty() => {
                    (1.0, format!("{PRIORITIZED_TAG} {}", g.reason))
                }
                (Candidate::Prioritized(_), _, Some(_)) => {
                    (1.0, format!("{PRIORITIZED_TAG} Explicitly requested by user"))
                }
                (Candidate::Prioritized(_), _, None) => {
                    (1.0, format!("{PRIORITIZED_TAG} Grading failed but ID matched"))
                }
                (Candidate::Ranked(_), Some(g), _) => (g.score, g.reason.clone()),
                (Candidate::Ranked(_), None, _) => (0.0, String::new()),
            };
            GradedResult {
                candidate: candidate.clone(),
                relevance_score,
                reason,
            }
        })
        .collect();

    graded.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    graded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::providers::MockTextGeneration;
    use crate::types::{DocumentPayload, FusedResult};
    use pretty_assertions::assert_eq;

    fn fused(id: &str) -> FusedResult {
        FusedResult {
            document_id: id.into(),
            dense_score: 0.5,
            sparse_score: 0.0,
            fused_score: 0.5,
            payload: DocumentPayload {
                title: format!("Title {id}"),
                abstract_text: "a".repeat(400),
                claims: "c".repeat(400),
                ..Default::default()
            },
        }
    }

    fn candidates() -> Vec<Candidate> {
        vec![
            Candidate::Prioritized(fused("KR-1234567-B1")),
            Candidate::Ranked(fused("US-1111111")),
            Candidate::Ranked(fused("US-2222222")),
        ]
    }

    fn grader(mock: Arc<MockTextGeneration>) -> Grader {
        Grader::new(mock, "gpt-4o-mini", RetryPolicy::none(), 300)
    }

    #[test]
    fn test_parse_grading_recomputes_average() {
        let summary = parse_grading(
            r#"{"results": [
                {"patent_id": "A", "score": 0.9, "reason": "same mechanism"},
                {"document_id": "B", "score": "0.3", "reason": "keywords only"},
                {"patent_id": "C", "score": 1.7}
            ], "average_score": 0.99}"#,
        )
        .unwrap();
        assert_eq!(summary.grades.len(), 3);
        assert_eq!(summary.grades[1].document_id, "B");
        assert_eq!(summary.grades[2].score, 1.0);
        assert!((summary.average_score - (0.9 + 0.3 + 1.0) / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_grading_rejects_bad_shapes() {
        assert!(matches!(
            parse_grading(r#"{"average_score": 0.5}"#),
            Err(GenerationParseError::MissingField { .. })
        ));
        assert!(matches!(
            parse_grading(r#"{"results": [{"score": 0.5}]}"#),
            Err(GenerationParseError::MissingField { .. })
        ));
        assert!(matches!(
            parse_grading(r#"{"results": [{"patent_id": "A", "score": "high"}]}"#),
            Err(GenerationParseError::InvalidField { .. })
        ));
        assert!(parse_grading("plain prose").is_err());
    }

    #[test]
    fn test_parse_rewrite() {
        let query = parse_rewrite(
            r#"{"optimized_query": " rooftop drone battery exchange ", "keywords": [], "reasoning": "narrower"}"#,
        )
        .unwrap();
        assert_eq!(query, "rooftop drone battery exchange");
        assert!(matches!(
            parse_rewrite(r#"{"optimized_query": "  "}"#),
            Err(GenerationParseError::Empty)
        ));
    }

    #[test]
    fn test_digest_truncates_fields() {
        let digest = build_digest(&candidates()[..1], 300);
        assert!(digest.starts_with("[Document 1: KR-1234567-B1]\nTitle: Title KR-1234567-B1"));
        assert!(digest.contains(&format!("Abstract: {}...", "a".repeat(300))));
        assert!(!digest.contains(&"a".repeat(301)));
    }

    #[tokio::test]
    async fn test_grade_applies_scores_and_prioritized_override() {
        let mock = Arc::new(MockTextGeneration::new());
        mock.queue(
            GenerationTask::Grading,
            r#"{"results": [
                {"patent_id": "KR-1234567-B1", "score": 0.2, "reason": "different field"},
                {"patent_id": "US-1111111", "score": 0.8, "reason": "close match"},
                {"patent_id": "US-9999999", "score": 1.0, "reason": "not a candidate"}
            ]}"#,
        );
        let (summary, graded) = grader(mock.clone())
            .grade("drone battery swap", &candidates(), &CancellationToken::new())
            .await
            .unwrap();

        assert!((summary.average_score - 0.5).abs() < 1e-6);
        assert_eq!(graded[0].document_id(), "KR-1234567-B1");
        assert_eq!(graded[0].relevance_score, 1.0);
        assert_eq!(graded[0].reason, "[PRIORITIZED] different field");
        assert_eq!(graded[1].document_id(), "US-1111111");
        assert_eq!(graded[2].relevance_score, 0.0);

        let request = &mock.requests()[0];
        assert_eq!(request.temperature, 0.1);
        assert!(request.prompt.contains("[Document 3: US-2222222]"));
    }

    #[tokio::test]
    async fn test_grade_omitted_prioritized_still_boosted() {
        let mock = Arc::new(MockTextGeneration::new());
        mock.queue(
            GenerationTask::Grading,
            r#"{"results": [{"patent_id": "US-1111111", "score": 0.4, "reason": "partial"}]}"#,
        );
        let (_, graded) = grader(mock)
            .grade("idea", &candidates(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(graded[0].relevance_score, 1.0);
        assert_eq!(graded[0].reason, "[PRIORITIZED] Explicitly requested by user");
    }

    #[tokio::test]
    async fn test_grade_failure_is_soft() {
        let mock = Arc::new(MockTextGeneration::new());
        mock.queue_error(
            GenerationTask::Grading,
            LlmError::Connection {
                message: "refused".into(),
            },
        );
        let (summary, graded) = grader(mock)
            .grade("idea", &candidates(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.average_score, 0.0);
        assert_eq!(graded.len(), 3);
        assert_eq!(graded[0].relevance_score, 1.0);
        assert_eq!(graded[0].reason, "[PRIORITIZED] Grading failed but ID matched");
        assert!(graded[1..].iter().all(|g| g.relevance_score == 0.0));
    }

    #[tokio::test]
    async fn test_grade_empty_skips_call() {
        let mock = Arc::new(MockTextGeneration::new());
        let (summary, graded) = grader(mock.clone())
            .grade("idea", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(graded.is_empty());
        assert_eq!(summary.average_score, 0.0);
        assert_eq!(mock.call_count(GenerationTask::Grading), 0);
    }

    #[tokio::test]
    async fn test_rewrite_query() {
        let mock = Arc::new(MockTextGeneration::new());
        mock.queue(
            GenerationTask::Rewrite,
            r#"{"optimized_query": "autonomous UAV battery exchange station", "keywords": ["UAV"], "reasoning": "terminology"}"#,
        );
        let graded = apply_grades(&candidates(), None);
        let query = grader(mock.clone())
            .rewrite_query("drone battery swap", &graded, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(query.as_deref(), Some("autonomous UAV battery exchange station"));

        let request = &mock.requests()[0];
        assert_eq!(request.temperature, 0.3);
        assert!(request.prompt.contains("- US-1111111: score=0.00"));
    }

    #[tokio::test]
    async fn test_rewrite_unparseable_is_none() {
        let mock = Arc::new(MockTextGeneration::new());
        mock.queue(GenerationTask::Rewrite, "sorry, cannot help");
        let query = grader(mock)
            .rewrite_query("idea", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(query.is_none());
    }
}
