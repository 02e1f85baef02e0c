//! Engine that replays canned completions in order
//!
//! Used for offline runs (`--scripted` in the CLI) and for driving the
//! pipeline deterministically in tests. Every request is recorded.
use super::runtime_trait::{GenerationEngine, GenerationRequest};
use crate::error::GenerationError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct ScriptedEngine {
    replies: Mutex<VecDeque<Result<String, GenerationError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    delay: Option<Duration>,
}

impl ScriptedEngine {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            ..Default::default()
        }
    }

    /// Wait this long before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.lock_replies().push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, error: GenerationError) {
        self.lock_replies().push_back(Err(error));
    }

    /// Prompts received so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.lock_replies().len()
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, GenerationError>>> {
        self.replies.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    async fn generate(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.lock_replies().pop_front();
        next.unwrap_or_else(|| Err(GenerationError::Unavailable("no scripted reply left".to_string())))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
