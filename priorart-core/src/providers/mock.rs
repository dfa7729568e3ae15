//! Scriptable text-generation provider for tests and offline runs.

use super::{Generation, GenerationRequest, GenerationTask, TextGeneration, TokenUsage};
use crate::error::LlmError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

type Handler = Box<dyn Fn(&GenerationRequest) -> Result<String, LlmError> + Send + Sync>;

/// A provider that replays queued replies per task, or answers through a
/// handler closure.
///
/// Replies are keyed by `GenerationTask` so concurrent calls for different
/// tasks cannot steal each other's reply. When a task's queue is empty the
/// handler is consulted; without one, an empty JSON object is returned.
pub struct MockTextGeneration {
    queues: Mutex<HashMap<GenerationTask, VecDeque<Result<String, LlmError>>>>,
    handler: Option<Handler>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockTextGeneration {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            handler: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every request through `handler`.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&GenerationRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            handler: Some(Box::new(handler)),
            ..Self::new()
        }
    }

    /// Queue a reply for the next call of `task`.
    pub fn queue(&self, task: GenerationTask, reply: impl Into<String>) -> &Self {
        self.push(task, Ok(reply.into()));
        self
    }

    /// Queue a failure for the next call of `task`.
    pub fn queue_error(&self, task: GenerationTask, err: LlmError) -> &Self {
        self.push(task, Err(err));
        self
    }

    fn push(&self, task: GenerationTask, reply: Result<String, LlmError>) {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(task)
            .or_default()
            .push_back(reply);
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of requests received for `task`.
    pub fn call_count(&self, task: GenerationTask) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.task == task)
            .count()
    }
}

impl Default for MockTextGeneration {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextGeneration for MockTextGeneration {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let queued = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&request.task)
            .and_then(VecDeque::pop_front);

        let text = match (queued, &self.handler) {
            (Some(reply), _) => reply?,
            (None, Some(handler)) => handler(&request)?,
            (None, None) => "{}".to_string(),
        };

        Ok(Generation {
            usage: TokenUsage {
                input_tokens: request.prompt.len() / 4,
                output_tokens: text.len() / 4,
            },
            text,
            model: request.model.unwrap_or_else(|| "mock-model".to_string()),
        })
    }

    fn provider_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_per_task() {
        let mock = MockTextGeneration::new();
        mock.queue(GenerationTask::Grading, "first")
            .queue(GenerationTask::Grading, "second")
            .queue(GenerationTask::Rewrite, "rewrite");

        let r = mock
            .generate(GenerationRequest::new(GenerationTask::Rewrite, "p"))
            .await
            .unwrap();
        assert_eq!(r.text, "rewrite");
        let g1 = mock
            .generate(GenerationRequest::new(GenerationTask::Grading, "p"))
            .await
            .unwrap();
        let g2 = mock
            .generate(GenerationRequest::new(GenerationTask::Grading, "p"))
            .await
            .unwrap();
        assert_eq!((g1.text.as_str(), g2.text.as_str()), ("first", "second"));
        assert_eq!(mock.call_count(GenerationTask::Grading), 2);
    }

    #[tokio::test]
    async fn test_queued_error() {
        let mock = MockTextGeneration::new();
        mock.queue_error(
            GenerationTask::MultiQuery,
            LlmError::Timeout { timeout_secs: 1 },
        );
        let result = mock
            .generate(GenerationRequest::new(GenerationTask::MultiQuery, "p"))
            .await;
        assert!(matches!(result, Err(LlmError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_handler_fallback() {
        let mock = MockTextGeneration::with_handler(|req| Ok(format!("echo:{}", req.task)));
        let r = mock
            .generate(GenerationRequest::new(GenerationTask::HypotheticalClaim, "p"))
            .await
            .unwrap();
        assert_eq!(r.text, "echo:hypothetical_claim");
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_default_reply_is_empty_object() {
        let mock = MockTextGeneration::default();
        let r = mock
            .generate(GenerationRequest::new(GenerationTask::Grading, "p"))
            .await
            .unwrap();
        assert_eq!(r.text, "{}");
        assert_eq!(r.model, "mock-model");
    }
}
