use std::sync::Arc;

use tracing::Span;

use crate::llm::{CompletionClient, CompletionMessage, CompletionParams};

pub const DEFAULT_TITLE: &str = "Nueva conversación";

const PROMPT_EXCERPT_CHARS: usize = 80;
const MAX_GENERATED_TITLE_CHARS: usize = 100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TitleOutcome {
    Generated(String),
    Fallback { reason: String },
}

impl TitleOutcome {
    pub fn into_title(self) -> String {
        match self {
            Self::Generated(title) => title,
            Self::Fallback { .. } => DEFAULT_TITLE.to_string(),
        }
    }
}

pub struct TitleGenerator {
    client: Arc<dyn CompletionClient>,
    span: Span,
}

impl TitleGenerator {
    pub fn new(client: Arc<dyn CompletionClient>, span: Span) -> Self {
        Self { client, span }
    }

    pub async fn generate(&self, first_message: &str) -> TitleOutcome {
        let prompt = title_prompt(first_message);
        match self.client.complete(vec![CompletionMessage::user(prompt)], CompletionParams::title()).await {
            Ok(reply) => match clean_title(&reply) {
                Some(title) => {
                    tracing::debug!(parent: &self.span, event_name = "agent.title.generated", title = %title);
                    TitleOutcome::Generated(title)
                }
                None => TitleOutcome::Fallback { reason: "empty title".to_string() },
            },
            Err(error) => {
                tracing::warn!(
                    parent: &self.span,
                    event_name = "agent.title.failed",
                    error = %error,
                    "title generation failed, using default"
                );
                TitleOutcome::Fallback { reason: error.to_string() }
            }
        }
    }
}

pub fn title_prompt(first_message: &str) -> String {
    let excerpt: String = first_message.chars().take(PROMPT_EXCERPT_CHARS).collect();
    format!(
        "Genera un título corto y descriptivo (máximo 5 palabras) que comienza con: \"{excerpt}...\"\n\
         Ejemplos de buenos títulos:\n\
         - \"Crear nuevo usuario\"\n\
         - \"Consulta sobre lotes\"\n\
         - \"Proceso de venta\"\n\
         - \"Validar archivo Excel\"\n\
         - \"Gestión de pagos\"\n\
         Responde SOLO con el título, sin comillas ni explicaciones."
    )
}

/// Drops quotes, trims and caps the length. `None` when nothing is left.
pub fn clean_title(reply: &str) -> Option<String> {
    let unquoted: String = reply.chars().filter(|c| *c != '"' && *c != '\'').collect();
    let title: String = unquoted.trim().chars().take(MAX_GENERATED_TITLE_CHARS).collect();
    (!title.is_empty()).then_some(title)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tracing::Span;

    use super::{clean_title, title_prompt, TitleGenerator, TitleOutcome, DEFAULT_TITLE};
    use crate::llm::{LlmError, ScriptedCompletionClient};

    #[test]
    fn prompt_embeds_first_eighty_characters() {
        let long = "ñ".repeat(120);
        let prompt = title_prompt(&long);
        assert!(prompt.contains(&format!("\"{}...\"", "ñ".repeat(80))));
        assert!(!prompt.contains(&"ñ".repeat(81)));
    }

    #[test]
    fn clean_title_strips_quotes_and_caps_length() {
        assert_eq!(clean_title("  \"Crear 'nuevo' usuario\"\n"), Some("Crear nuevo usuario".to_string()));
        assert_eq!(clean_title("\"\"  "), None);
        assert_eq!(clean_title(&"a".repeat(150)).map(|t| t.chars().count()), Some(100));
    }

    #[tokio::test]
    async fn failures_and_blank_replies_fall_back_to_default_title() {
        let client = Arc::new(ScriptedCompletionClient::new(["  '' "]));
        client.push_failure(LlmError::EmptyReply);
        let generator = TitleGenerator::new(client.clone(), Span::none());

        let blank = generator.generate("hola").await;
        assert!(matches!(blank, TitleOutcome::Fallback { .. }));
        assert_eq!(blank.into_title(), DEFAULT_TITLE);
        assert_eq!(generator.generate("hola").await.into_title(), DEFAULT_TITLE);

        let params = &client.calls()[0].params;
        assert_eq!((params.max_tokens, params.temperature), (50, 0.3));
    }
}
