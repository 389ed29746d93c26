//! HTTP completion providers selected from [`LlmConfig`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use concierge_core::config::{LlmConfig, LlmProvider};

use crate::llm::{CompletionClient, LlmError};

pub mod anthropic;
pub mod openai_compat;

pub use anthropic::AnthropicProvider;
pub use openai_compat::OpenAiCompatibleProvider;

const OPENAI_API_BASE: &str = "https://api.openai.com";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries, base_delay: Duration::from_millis(200) }
    }

    /// Runs `attempt` once, then again up to `max_retries` times while the failure is transient.
    pub async fn run<F, Fut>(&self, mut attempt: F) -> Result<String, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String, LlmError>>,
    {
        let strategy = ExponentialBackoff::from_millis(self.base_delay.as_millis().max(1) as u64)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.max_retries as usize);

        RetryIf::start(strategy, || attempt(), |error: &LlmError| {
            let retry = error.is_retryable();
            if retry {
                tracing::warn!(event_name = "llm.request.retry", error = %error, "retrying completion");
            }
            retry
        })
        .await
    }
}

pub(crate) fn map_transport(error: reqwest::Error, timeout: Duration) -> LlmError {
    if error.is_timeout() {
        LlmError::Timeout(timeout)
    } else {
        LlmError::Transport(error.to_string())
    }
}

fn owned_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_string())
}

/// Builds the provider named by `config.provider`.
pub fn build_client(config: &LlmConfig) -> Result<Arc<dyn CompletionClient>, LlmError> {
    let retry = RetryPolicy::new(config.max_retries);
    let timeout = Duration::from_secs(config.timeout_secs.max(1));

    match config.provider {
        LlmProvider::Anthropic => {
            let api_key = config
                .api_key
                .as_ref()
                .map(owned_secret)
                .ok_or_else(|| LlmError::NotConfigured("anthropic requires llm.api_key".into()))?;
            let provider = AnthropicProvider::new(api_key, config.model.clone(), timeout)?
                .with_retry(retry);
            let provider = match config.base_url.as_deref() {
                Some(base_url) => provider.with_base_url(base_url),
                None => provider,
            };
            Ok(Arc::new(provider))
        }
        LlmProvider::OpenAi => {
            let api_key = config
                .api_key
                .as_ref()
                .map(owned_secret)
                .ok_or_else(|| LlmError::NotConfigured("openai requires llm.api_key".into()))?;
            let base_url = config.base_url.as_deref().unwrap_or(OPENAI_API_BASE);
            let provider =
                OpenAiCompatibleProvider::new(base_url, Some(api_key), config.model.clone(), timeout)?
                    .with_retry(retry);
            Ok(Arc::new(provider))
        }
        LlmProvider::Ollama => {
            let base_url = config
                .base_url
                .as_deref()
                .ok_or_else(|| LlmError::NotConfigured("ollama requires llm.base_url".into()))?;
            let provider = OpenAiCompatibleProvider::new(
                base_url,
                config.api_key.as_ref().map(owned_secret),
                config.model.clone(),
                timeout,
            )?
            .with_retry(retry);
            Ok(Arc::new(provider))
        }
    }
}
