//! Chat-completions provider for OpenAI and OpenAI-compatible servers such as Ollama.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{map_transport, RetryPolicy};
use crate::llm::{CompletionClient, CompletionMessage, CompletionParams, LlmError};

pub struct OpenAiCompatibleProvider {
    client: Client,
    api_key: Option<SecretString>,
    base_url: String,
    model: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl std::fmt::Debug for OpenAiCompatibleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleProvider")
            .field("api_key", &self.api_key.as_ref().map(|_| "<REDACTED>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [CompletionMessage],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        base_url: &str,
        api_key: Option<SecretString>,
        model: String,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| LlmError::Transport(error.to_string()))?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout,
            retry: RetryPolicy::new(0),
        })
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
        let body = ChatRequest {
            model: params.model.as_deref().unwrap_or(&self.model),
            messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        };

        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }
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

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|error| LlmError::Transport(format!("malformed chat completion: {error}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyReply)
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatibleProvider {
    async fn complete(
        &self,
        messages: Vec<CompletionMessage>,
        params: CompletionParams,
    ) -> Result<String, LlmError> {
        tracing::debug!(
            event_name = "llm.chat_completions.request",
            base_url = %self.base_url,
            max_tokens = params.max_tokens,
            "sending completion request"
        );
        self.retry.run(|| self.send_once(&messages, &params)).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::OpenAiCompatibleProvider;
    use crate::llm::{CompletionClient, CompletionMessage, CompletionParams, LlmError};

    #[tokio::test]
    async fn returns_first_choice_content_with_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-local"))
            .and(body_partial_json(json!({"model": "llama3", "max_tokens": 500})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "SELECT 1;"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::new(
            &format!("{}/", server.uri()),
            Some(SecretString::from("sk-local".to_string())),
            "llama3".to_string(),
            Duration::from_secs(5),
        )
        .expect("provider");

        let reply = provider
            .complete(vec![CompletionMessage::user("sql")], CompletionParams::sql_generation())
            .await
            .expect("reply");
        assert_eq!(reply, "SELECT 1;");
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let provider =
            OpenAiCompatibleProvider::new(&server.uri(), None, "llama3".into(), Duration::from_secs(5))
                .expect("provider")
                .with_retry(crate::providers::RetryPolicy::new(3));

        let error = provider
            .complete(vec![CompletionMessage::user("hola")], CompletionParams::title())
            .await
            .expect_err("bad request");
        assert!(matches!(error, LlmError::Status { code: 400, ref body } if body == "bad request"));
    }

    #[tokio::test]
    async fn configured_timeout_bounds_slow_servers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"choices": [{"message": {"content": "tarde"}}]}))
                    .set_delay(Duration::from_millis(1500)),
            )
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::new(
            &server.uri(),
            None,
            "llama3".into(),
            Duration::from_millis(200),
        )
        .expect("provider");

        let error = provider
            .complete(vec![CompletionMessage::user("hola")], CompletionParams::classifier())
            .await
            .expect_err("configured client timeout");
        assert!(matches!(error, LlmError::Timeout(_)));
    }
}
