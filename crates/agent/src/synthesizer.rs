//! Turns query results or role knowledge into the assistant's conversational reply.

use std::sync::Arc;

use tracing::Span;

use concierge_core::domain::context::{RoleContext, SystemGuide};
use concierge_core::domain::message::{ChatMessage, MessageRole};
use concierge_core::domain::user::User;
use concierge_db::ResultRow;

use crate::llm::{CompletionClient, CompletionMessage, CompletionParams};

pub const DATABASE_FALLBACK_REPLY: &str =
    "He encontrado la información solicitada, pero ocurrió un error al formatear la respuesta.";
pub const SYSTEM_FALLBACK_REPLY: &str =
    "Estoy aquí para ayudarte, pero ocurrió un error al procesar tu consulta. ¿Podrías reformular tu pregunta?";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Synthesis {
    Generated(String),
    Fallback { text: &'static str, reason: String },
}

impl Synthesis {
    pub fn into_text(self) -> String {
        match self {
            Self::Generated(text) => text,
            Self::Fallback { text, .. } => text.to_string(),
        }
    }
}

/// Rows plus whether the store held more than were fetched.
pub struct QueryResults<'a> {
    pub rows: &'a [ResultRow],
    pub truncated: bool,
}

pub struct ResponseSynthesizer {
    client: Arc<dyn CompletionClient>,
    span: Span,
}

impl ResponseSynthesizer {
    pub fn new(client: Arc<dyn CompletionClient>, span: Span) -> Self {
        Self { client, span }
    }

    pub async fn database_reply(
        &self,
        question: &str,
        user: &User,
        results: QueryResults<'_>,
        history: &[ChatMessage],
    ) -> Synthesis {
        let prompt = database_prompt(question, user, &results, history);
        self.synthesize(prompt, CompletionParams::database_synthesis(), DATABASE_FALLBACK_REPLY, "database")
            .await
    }

    pub async fn system_reply(
        &self,
        question: &str,
        user: &User,
        history: &[ChatMessage],
        role_context: Option<&RoleContext>,
        guides: &[SystemGuide],
    ) -> Synthesis {
        let prompt = system_prompt(question, user, history, role_context, guides);
        self.synthesize(prompt, CompletionParams::system_synthesis(), SYSTEM_FALLBACK_REPLY, "system")
            .await
    }

    async fn synthesize(
        &self,
        prompt: String,
        params: CompletionParams,
        fallback: &'static str,
        mode: &'static str,
    ) -> Synthesis {
        match self.client.complete(vec![CompletionMessage::user(prompt)], params).await {
            Ok(reply) if !reply.trim().is_empty() => Synthesis::Generated(reply.trim().to_string()),
            Ok(_) => Synthesis::Fallback { text: fallback, reason: "blank reply".to_string() },
            Err(error) => {
                tracing::warn!(
                    parent: &self.span,
                    event_name = "agent.synthesizer.failed",
                    mode,
                    error = %error,
                    "synthesis failed, replying with fallback"
                );
                Synthesis::Fallback { text: fallback, reason: error.to_string() }
            }
        }
    }
}

/// Renders the trailing window as "Usuario:"/"Asistente:" lines. Empty history renders nothing.
pub fn render_history(history: &[ChatMessage]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let lines = history
        .iter()
        .map(|message| {
            let speaker = match message.role {
                MessageRole::User => "Usuario",
                MessageRole::Assistant | MessageRole::System => "Asistente",
            };
            format!("{speaker}: {}", message.content)
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("HISTORIAL DE CONVERSACIÓN RECIENTE:\n{lines}")
}

fn user_block(user: &User) -> String {
    format!(
        "INFORMACIÓN DEL USUARIO:\n- Nombre: {}\n- Email: {}\n- Rol: {} ({})",
        user.display_name(),
        user.email,
        user.role.name,
        user.role_code()
    )
}

fn bullets(items: &[String]) -> String {
    items.iter().map(|item| format!("• {item}")).collect::<Vec<_>>().join("\n")
}

fn join_blocks(blocks: Vec<String>) -> String {
    blocks.into_iter().filter(|block| !block.is_empty()).collect::<Vec<_>>().join("\n\n")
}

pub fn database_prompt(
    question: &str,
    user: &User,
    results: &QueryResults<'_>,
    history: &[ChatMessage],
) -> String {
    let rendered_rows =
        serde_json::to_string_pretty(results.rows).unwrap_or_else(|_| "[]".to_string());
    let mut results_block = format!("RESULTADOS DE LA CONSULTA:\n{rendered_rows}");
    if results.truncated {
        results_block.push_str(&format!(
            "\n(Se muestran solo las primeras {} filas; hay más resultados.)",
            results.rows.len()
        ));
    }

    join_blocks(vec![
        "Eres un asistente especializado del sistema. Basándote en los resultados de la consulta \
         a la base de datos, proporciona una respuesta clara y útil al usuario."
            .to_string(),
        user_block(user),
        format!("PREGUNTA ORIGINAL: \"{question}\""),
        results_block,
        render_history(history),
        "INSTRUCCIONES PARA LA RESPUESTA:\n\
         1. Interpreta y presenta los datos de manera clara y comprensible\n\
         2. Si hay muchos resultados, resume los más relevantes y menciona el total\n\
         3. Incluye información contextual relevante basada en los datos\n\
         4. Usa un tono profesional pero amigable\n\
         5. Si los datos están relacionados con fechas, formatéalas apropiadamente\n\
         6. Si hay números o cantidades, preséntalos de manera clara\n\
         7. Sugiere acciones adicionales si es relevante"
            .to_string(),
        "Responde de manera conversacional, como si fueras un asistente experto del sistema."
            .to_string(),
    ])
}

fn role_block(context: &RoleContext) -> String {
    format!(
        "CONTEXTO DE TU ROL ({} - {}):\nDescripción: {}\n\n\
         CAPACIDADES QUE TIENES:\n{}\n\n\
         CONSULTAS COMUNES DE TU ROL:\n{}\n\n\
         FLUJOS DE TRABAJO DISPONIBLES:\n{}",
        context.role_code,
        context.name,
        context.description,
        bullets(&context.capabilities),
        bullets(&context.common_queries),
        bullets(&context.workflows)
    )
}

fn guides_block(guides: &[SystemGuide]) -> String {
    if guides.is_empty() {
        return String::new();
    }
    let rendered = guides
        .iter()
        .map(|guide| {
            let mut lines = vec![format!("📋 {}", guide.title)];
            if let Some(description) = guide.description.as_deref().filter(|d| !d.trim().is_empty()) {
                lines.push(format!("   Descripción: {description}"));
            }
            lines.push("   Pasos:".to_string());
            lines.extend(
                guide.steps.iter().enumerate().map(|(index, step)| format!("   {}. {step}", index + 1)),
            );
            lines.join("\n")
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("GUÍAS DEL SISTEMA DISPONIBLES PARA TI:\n{rendered}")
}

pub fn system_prompt(
    question: &str,
    user: &User,
    history: &[ChatMessage],
    role_context: Option<&RoleContext>,
    guides: &[SystemGuide],
) -> String {
    join_blocks(vec![
        "Eres un asistente especializado del sistema, experto en ayudar a usuarios con su rol \
         específico."
            .to_string(),
        user_block(user),
        role_context.map(role_block).unwrap_or_default(),
        guides_block(guides),
        format!("PREGUNTA DEL USUARIO: \"{question}\""),
        render_history(history),
        "INSTRUCCIONES PARA LA RESPUESTA:\n\
         1. Responde específicamente a la pregunta basándote en el contexto del rol del usuario\n\
         2. Si la pregunta está relacionada con una guía disponible, proporciona los pasos específicos\n\
         3. Si es sobre capacidades, explica cómo puede usar esas funciones\n\
         4. Si es una consulta común de su rol, da una respuesta detallada\n\
         5. Si menciona un flujo de trabajo, guíalo paso a paso\n\
         6. Usa un tono profesional pero amigable\n\
         7. Si no tienes información específica, sugiere las opciones más relevantes para su rol\n\
         8. Siempre mantén el contexto de la conversación anterior si es relevante"
            .to_string(),
        "Responde de manera conversacional, como si fueras un experto del sistema especializado \
         en el rol del usuario."
            .to_string(),
    ])
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;
    use tracing::Span;

    use concierge_core::domain::context::{RoleContext, SystemGuide};
    use concierge_core::domain::message::{ChatMessage, QueryType};
    use concierge_core::domain::session::SessionId;
    use concierge_core::domain::user::{User, UserId, UserRole};

    use super::{
        database_prompt, render_history, system_prompt, QueryResults, ResponseSynthesizer,
        Synthesis, DATABASE_FALLBACK_REPLY, SYSTEM_FALLBACK_REPLY,
    };
    use crate::llm::{LlmError, ScriptedCompletionClient};

    fn user() -> User {
        User {
            id: UserId("u-7".to_string()),
            email: "ana@example.com".to_string(),
            first_name: "Ana".to_string(),
            last_name: "Pérez".to_string(),
            full_name: None,
            role: UserRole { id: None, code: "ADM".to_string(), name: "Administrador".to_string() },
        }
    }

    fn history() -> Vec<ChatMessage> {
        let user_id = UserId("u-7".to_string());
        let session = SessionId("s-1".to_string());
        vec![
            ChatMessage::from_user(session.clone(), &user_id, "hola", Utc::now()),
            ChatMessage::from_assistant(session, &user_id, "¿En qué te ayudo?", QueryType::System, Utc::now()),
        ]
    }

    fn guide() -> SystemGuide {
        SystemGuide {
            key: "crear-usuario".to_string(),
            title: "Crear usuario".to_string(),
            applicable_roles: vec!["ADM".to_string()],
            steps: vec!["Abrir el módulo Usuarios".to_string(), "Pulsar Nuevo".to_string()],
            description: Some("Alta de usuarios".to_string()),
            priority: 10,
            is_active: true,
        }
    }

    #[test]
    fn history_renders_speaker_labels_or_nothing() {
        assert_eq!(
            render_history(&history()),
            "HISTORIAL DE CONVERSACIÓN RECIENTE:\nUsuario: hola\nAsistente: ¿En qué te ayudo?"
        );
        assert_eq!(render_history(&[]), "");
    }

    #[test]
    fn system_prompt_lists_role_and_numbered_guide_steps() {
        let context = RoleContext {
            role_code: "ADM".to_string(),
            name: "Administrador".to_string(),
            description: "Gestiona usuarios".to_string(),
            capabilities: vec!["Crear usuarios".to_string()],
            common_queries: Vec::new(),
            workflows: vec!["Alta".to_string()],
            metadata: None,
            is_active: true,
        };
        let prompt = system_prompt("¿Cómo crear un usuario?", &user(), &[], Some(&context), &[guide()]);

        assert!(prompt.contains("- Nombre: Ana Pérez\n- Email: ana@example.com\n- Rol: Administrador (ADM)"));
        assert!(prompt.contains("CONTEXTO DE TU ROL (ADM - Administrador):"));
        assert!(prompt.contains("CAPACIDADES QUE TIENES:\n• Crear usuarios"));
        assert!(prompt.contains(
            "📋 Crear usuario\n   Descripción: Alta de usuarios\n   Pasos:\n   1. Abrir el módulo Usuarios\n   2. Pulsar Nuevo"
        ));
        assert!(!prompt.contains("HISTORIAL DE CONVERSACIÓN"));
    }

    #[test]
    fn database_prompt_embeds_rows_and_truncation_note() {
        let rows = vec![json!({"total": 3}).as_object().cloned().expect("object")];
        let prompt = database_prompt(
            "¿Cuántos proyectos hay activos?",
            &user(),
            &QueryResults { rows: &rows, truncated: true },
            &history(),
        );
        assert!(prompt.contains("PREGUNTA ORIGINAL: \"¿Cuántos proyectos hay activos?\""));
        assert!(prompt.contains("\"total\": 3"));
        assert!(prompt.contains("primeras 1 filas"));
        assert!(prompt.contains("Usuario: hola"));
    }

    #[tokio::test]
    async fn failures_fall_back_to_fixed_copy() {
        let client = Arc::new(ScriptedCompletionClient::default());
        client.push_failure(LlmError::Timeout(std::time::Duration::from_secs(30)));
        client.push_reply("   ");
        let synthesizer = ResponseSynthesizer::new(client.clone(), Span::none());

        let database = synthesizer
            .database_reply("q", &user(), QueryResults { rows: &[], truncated: false }, &[])
            .await;
        assert_eq!(database.clone().into_text(), DATABASE_FALLBACK_REPLY);
        assert!(matches!(database, Synthesis::Fallback { .. }));

        let system = synthesizer.system_reply("q", &user(), &[], None, &[]).await;
        assert_eq!(system.into_text(), SYSTEM_FALLBACK_REPLY);

        let calls = client.calls();
        assert_eq!((calls[0].params.max_tokens, calls[1].params.max_tokens), (1000, 1500));
    }

    #[tokio::test]
    async fn generated_reply_is_trimmed() {
        let client = Arc::new(ScriptedCompletionClient::new(["  Hay 3 proyectos activos.\n"]));
        let synthesizer = ResponseSynthesizer::new(client, Span::none());
        let reply = synthesizer.system_reply("q", &user(), &history(), None, &[]).await;
        assert_eq!(reply, Synthesis::Generated("Hay 3 proyectos activos.".to_string()));
    }
}
