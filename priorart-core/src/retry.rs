//! Randomized exponential backoff for transient failures.
//!
//! One policy type drives every retried call in the pipeline: search
//! requests, the identifier priority fetch, and text generation. The loop is
//! cancellation-aware: a cancelled token aborts both the in-flight attempt
//! and any pending backoff sleep.

use crate::error::{RetrievalError, Retryable};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Backoff parameters for one class of retried call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Randomize each wait between the initial backoff and the computed cap.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy for dense/sparse/hybrid search requests.
    pub fn search() -> Self {
        Self::default()
    }

    /// Policy for the identifier priority fetch.
    pub fn id_fetch() -> Self {
        Self {
            max_attempts: 5,
            ..Self::default()
        }
    }

    /// Policy for text-generation calls.
    pub fn generation() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 5_000,
            ..Self::default()
        }
    }

    /// A single attempt with no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Wait before retry number `attempt` (0-based), ignoring server hints.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64) as u64;
        if self.jitter && capped > 0 {
            let floor = self.initial_backoff_ms.min(capped);
            rand::thread_rng().gen_range(floor..=capped)
        } else {
            capped
        }
    }

    /// Wait before retry number `attempt`, honoring a server hint up to
    /// `max_backoff_ms`.
    pub fn delay_ms(&self, attempt: u32, server_hint_ms: Option<u64>) -> u64 {
        let computed = self.backoff_ms(attempt);
        match server_hint_ms {
            Some(hint) => hint.min(self.max_backoff_ms).max(computed),
            None => computed,
        }
    }
}

/// Run `operation` under `policy`, retrying errors that report themselves as
/// transient.
///
/// Permanent errors return immediately. Exhaustion surfaces the last error.
/// When `cancel` fires, the attempt in flight is dropped and
/// `RetrievalError::Cancelled` is returned.
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut operation: F,
) -> Result<T, RetrievalError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display + Into<RetrievalError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RetrievalError::Cancelled);
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(RetrievalError::Cancelled),
            result = operation() => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        attempt += 1;
        if !err.is_retryable() || attempt >= max_attempts {
            if attempt > 1 {
                tracing::warn!(operation = label, attempts = attempt, error = %err, "Retries exhausted");
            }
            return Err(err.into());
        }

        let backoff_ms = policy.delay_ms(attempt - 1, err.retry_after_ms());
        tracing::warn!(
            operation = label,
            attempt,
            max = max_attempts,
            backoff_ms,
            error = %err,
            "Retrying after transient error"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetrievalError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
        }
    }
}
