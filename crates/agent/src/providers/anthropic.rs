//! Anthropic Messages API provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{map_transport, RetryPolicy};
use crate::llm::{CompletionClient, CompletionMessage, CompletionParams, LlmError};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("api_key", &"<REDACTED>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: &'a [CompletionMessage],
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

impl AnthropicProvider {
    pub fn new(api_key: SecretString, model: String, timeout: Duration) -> Result<Self, LlmError> {
        if api_key.expose_secret().trim().is_empty() {
            return Err(LlmError::NotConfigured("anthropic api key is empty".to_string()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| LlmError::Transport(error.to_string()))?;
        Ok(Self {
            client,
            api_key,
            base_url: ANTHROPIC_API_BASE.to_string(),
            model,
            timeout,
            retry: RetryPolicy::new(0),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn send_once(
        &self,
        messages: &[CompletionMessage],
        params: &CompletionParams,
    ) -> Result<String, LlmError> {
        let model = params.model.as_deref().unwrap_or(&self.model);
        let body = MessagesRequest {
            model,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            messages,
        };

        let mut request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(timeout) = params.timeout {
            request = request.timeout(timeout);
        }
        let timeout = params.timeout.unwrap_or(self.timeout);

        let response = request.send().await.map_err(|error| map_transport(error, timeout))?;
        let status = response.status();
        let text = response.text().await.map_err(|error| map_transport(error, timeout))?;
        if !status.is_success() {
            return Err(LlmError::Status { code: status.as_u16(), body: text });
        }

        let parsed: MessagesResponse = serde_json::from_str(&text)
            .map_err(|error| LlmError::Transport(format!("malformed anthropic reply: {error}")))?;
        parsed
            .content
            .into_iter()
            .find_map(|block| match block {
                ContentBlock::Text { text } if !text.trim().is_empty() => Some(text),
                _ => None,
            })
            .ok_or(LlmError::EmptyReply)
    }
}

#[async_trait]
impl CompletionClient for AnthropicProvider {
    async fn complete(
        &self,
        messages: Vec<CompletionMessage>,
        params: CompletionParams,
    ) -> Result<String, LlmError> {
        tracing::debug!(
            event_name = "llm.anthropic.request",
            model = params.model.as_deref().unwrap_or(&self.model),
            max_tokens = params.max_tokens,
            "sending completion request"
        );
        let reply = self.retry.run(|| self.send_once(&messages, &params)).await;
        if let Ok(text) = &reply {
            tracing::debug!(
                event_name = "llm.anthropic.response",
                chars = text.chars().count(),
                "completion received"
            );
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::AnthropicProvider;
    use crate::llm::{CompletionClient, CompletionMessage, CompletionParams, LlmError};
    use crate::providers::RetryPolicy;

    fn provider(server: &MockServer) -> AnthropicProvider {
        AnthropicProvider::new(
            SecretString::from("test-key".to_string()),
            "claude-3-haiku-20240307".to_string(),
            Duration::from_secs(5),
        )
        .expect("provider")
        .with_base_url(&server.uri())
    }

    #[tokio::test]
    async fn sends_messages_api_request_and_returns_first_text_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", "2023-06-01"))
            .and(body_partial_json(json!({
                "model": "claude-3-haiku-20240307",
                "max_tokens": 10,
                "messages": [{"role": "user", "content": "¿sistema?"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "TRUE"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reply = provider(&server)
            .complete(vec![CompletionMessage::user("¿sistema?")], CompletionParams::classifier())
            .await
            .expect("reply");
        assert_eq!(reply, "TRUE");
    }

    #[tokio::test]
    async fn empty_content_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": []})))
            .mount(&server)
            .await;

        let error = provider(&server)
            .complete(vec![CompletionMessage::user("hola")], CompletionParams::title())
            .await
            .expect_err("no text");
        assert!(matches!(error, LlmError::EmptyReply));
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_surface_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
            .expect(3)
            .mount(&server)
            .await;

        let error = provider(&server)
            .with_retry(RetryPolicy { max_retries: 2, base_delay: Duration::from_millis(1) })
            .complete(vec![CompletionMessage::user("hola")], CompletionParams::title())
            .await
            .expect_err("overloaded");
        assert!(matches!(error, LlmError::Status { code: 529, .. }));
    }

    #[tokio::test]
    async fn slow_replies_time_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"content": [{"type": "text", "text": "tarde"}]}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let params = CompletionParams::title().with_timeout(Duration::from_millis(50));
        let error = provider(&server)
            .complete(vec![CompletionMessage::user("hola")], params)
            .await
            .expect_err("timeout");
        assert!(matches!(error, LlmError::Timeout(_)));
    }

    #[tokio::test]
    async fn client_timeout_applies_when_params_leave_it_unset() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"content": [{"type": "text", "text": "tarde"}]}))
                    .set_delay(Duration::from_millis(1500)),
            )
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(
            SecretString::from("test-key".to_string()),
            "claude-3-haiku-20240307".to_string(),
            Duration::from_millis(200),
        )
        .expect("provider")
        .with_base_url(&server.uri());

        let error = provider
            .complete(vec![CompletionMessage::user("hola")], CompletionParams::title())
            .await
            .expect_err("configured client timeout");
        assert!(matches!(error, LlmError::Timeout(timeout) if timeout == Duration::from_millis(200)));
    }
}
