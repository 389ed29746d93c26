//! Completion Service port.
//!
//! Every agent talks to the language model through [`CompletionClient`]; HTTP providers live in
//! [`crate::providers`] and [`ScriptedCompletionClient`] stands in for them in tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionRole {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: CompletionRole,
    pub content: String,
}

impl CompletionMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: CompletionRole::User, content: content.into() }
    }
}

/// Generation parameters for one call. `model: None` defers to the provider's configured model and
/// `timeout: None` to the provider's client timeout (`llm.timeout_secs`).
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionParams {
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Option<Duration>,
}

impl CompletionParams {
    pub fn new(max_tokens: u32, temperature: f32) -> Self {
        Self { model: None, max_tokens, temperature, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// One-word routing answer.
    pub fn classifier() -> Self {
        Self::new(10, 0.1)
    }

    pub fn sql_generation() -> Self {
        Self::new(500, 0.1)
    }

    pub fn title() -> Self {
        Self::new(50, 0.3)
    }

    pub fn database_synthesis() -> Self {
        Self::new(1000, 0.7)
    }

    pub fn system_synthesis() -> Self {
        Self::new(1500, 0.7)
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("completion transport failed: {0}")]
    Transport(String),
    #[error("completion service answered {code}: {body}")]
    Status { code: u16, body: String },
    #[error("completion service returned no text")]
    EmptyReply,
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),
    #[error("completion provider not configured: {0}")]
    NotConfigured(String),
}

impl LlmError {
    /// Failures worth another attempt: transport errors, timeouts, throttling and 5xx answers.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Status { code, .. } => *code == 429 || *code >= 500,
            Self::EmptyReply | Self::NotConfigured(_) => false,
        }
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<CompletionMessage>,
        params: CompletionParams,
    ) -> Result<String, LlmError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedCompletion {
    pub messages: Vec<CompletionMessage>,
    pub params: CompletionParams,
}

impl RecordedCompletion {
    pub fn prompt(&self) -> &str {
        self.messages.first().map(|message| message.content.as_str()).unwrap_or_default()
    }
}

/// In-process double that answers from a queue and records every request.
///
/// Once the queue is drained every call fails with [`LlmError::Transport`].
#[derive(Default)]
pub struct ScriptedCompletionClient {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<RecordedCompletion>>,
}

impl ScriptedCompletionClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::default();
        for reply in replies {
            client.push_reply(reply);
        }
        client
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.lock_replies().push_back(Ok(reply.into()));
    }

    pub fn push_failure(&self, error: LlmError) {
        self.lock_replies().push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<RecordedCompletion> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or_default()
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, LlmError>>> {
        match self.replies.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletionClient {
    async fn complete(
        &self,
        messages: Vec<CompletionMessage>,
        params: CompletionParams,
    ) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCompletion { messages, params });
        }
        self.lock_replies()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Transport("no scripted reply left".to_string())))
    }
}
