//! Explicit document identifiers in the user's text.
//!
//! Identifiers look like `KR-102842452-B1`, `CN119821168` or `US-7654321-A`:
//! a two-letter authority prefix, an optional hyphen, at least four digits
//! and an optional hyphenated kind suffix. Word boundaries are ASCII, so an
//! identifier glued to Hangul text is still found.
//!
//! Named documents are assumed to exist in the corpus. A short fetch is
//! therefore treated as transient and retried under the id-fetch policy.

use crate::error::RetrievalError;
use crate::retry::{RetryPolicy, with_retry};
use crate::search::SearchClient;
use crate::types::{Candidate, FusedResult, RankedHit};
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

static IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^A-Za-z0-9_])([A-Z]{2}-?[0-9]{4,}(?:-[A-Z0-9]+)?)(?:$|[^A-Za-z0-9_])")
        .expect("valid identifier regex")
});

/// Extract identifiers, upper-cased and deduplicated in first-seen order.
///
/// Spellings that differ only by hyphens name the same document; the first
/// one seen is kept.
pub fn extract_identifiers(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    let mut pos = 0;
    while let Some(caps) = IDENTIFIER_RE.captures_at(text, pos) {
        let Some(m) = caps.get(1) else { break };
        let id = m.as_str().to_uppercase();
        if seen.insert(normalize(&id)) {
            ids.push(id);
        }
        // The trailing delimiter may lead the next identifier.
        pos = m.end();
    }
    ids
}

/// Result of one identifier fetch, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Complete(Vec<RankedHit>),
    Partial {
        hits: Vec<RankedHit>,
        found: usize,
        expected: usize,
    },
}

impl FetchOutcome {
    /// Classify a fetch by comparing distinct documents found against the
    /// number of identifiers requested.
    pub fn classify(hits: Vec<RankedHit>, expected: usize) -> Self {
        let mut seen = HashSet::new();
        let hits: Vec<RankedHit> = hits
            .into_iter()
            .filter(|h| seen.insert(h.document_id.clone()))
            .collect();
        let found = hits.len();
        if found < expected {
            FetchOutcome::Partial {
                hits,
                found,
                expected,
            }
        } else {
            FetchOutcome::Complete(hits)
        }
    }
}

/// Documents recovered by the priority fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorityFetch {
    /// Always `Candidate::Prioritized`.
    pub candidates: Vec<Candidate>,
    /// Requested identifiers still missing after every attempt.
    pub missing: Vec<String>,
}

/// Force-fetch `ids`, retrying both transport failures and short results.
///
/// When every attempt comes back short, the best partial result is returned
/// with the missing identifiers listed. Transport failures that outlast the
/// policy, and cancellation, are returned as errors.
pub async fn fetch_prioritized(
    client: &dyn SearchClient,
    ids: &[String],
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<PriorityFetch, RetrievalError> {
    if ids.is_empty() {
        return Ok(PriorityFetch::default());
    }

    let best_partial: Arc<Mutex<Vec<RankedHit>>> = Arc::new(Mutex::new(Vec::new()));
    let expected = ids.iter().map(|id| normalize(id)).collect::<HashSet<_>>().len();

    let result = with_retry(policy, cancel, "fetch_by_ids", || {
        let best_partial = best_partial.clone();
        async move {
            let hits = client.fetch_by_ids(ids).await?;
            match FetchOutcome::classify(hits, expected) {
                FetchOutcome::Complete(hits) => Ok(hits),
                FetchOutcome::Partial {
                    hits,
                    found,
                    expected,
                } => {
                    let mut best = best_partial.lock().unwrap_or_else(PoisonError::into_inner);
                    if hits.len() > best.len() {
                        *best = hits;
                    }
                    Err(RetrievalError::PartialRetrieval { found, expected })
                }
            }
        }
    })
    .await;

    let hits = match result {
        Ok(hits) => hits,
        Err(RetrievalError::PartialRetrieval { found, expected }) => {
            tracing::warn!(
                found,
                expected,
                "Identifier fetch still partial after retries; keeping what was found"
            );
            std::mem::take(&mut *best_partial.lock().unwrap_or_else(PoisonError::into_inner))
        }
        Err(e) => return Err(e),
    };

    let found_keys: HashSet<String> = hits.iter().map(|h| normalize(&h.document_id)).collect();
    let missing = ids
        .iter()
        .filter(|id| !found_keys.contains(&normalize(id)))
        .cloned()
        .collect();

    Ok(PriorityFetch {
        candidates: hits
            .into_iter()
            .map(|hit| Candidate::Prioritized(FusedResult::from_dense(hit)))
            .collect(),
        missing,
    })
}

fn normalize(id: &str) -> String {
    id.chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}
