//! SYSTEM-vs-DATA routing for one inbound message.
//!
//! A completion failure routes to SYSTEM: that branch only narrates role context and guides, so
//! it can neither expose nor change reporting data.

use std::sync::Arc;

use tracing::Span;

use concierge_core::domain::context::{RoleContext, SystemGuide};
use concierge_core::domain::message::QueryType;

use crate::llm::{CompletionClient, CompletionMessage, CompletionParams};

const SYSTEM_MARKERS: &[&str] = &["true", "sí", "si", "sistema"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    Routed(QueryType),
    FailedOpen { reason: String },
}

impl Classification {
    pub fn query_type(&self) -> QueryType {
        match self {
            Self::Routed(query_type) => *query_type,
            Self::FailedOpen { .. } => QueryType::System,
        }
    }
}

pub struct QueryClassifier {
    client: Arc<dyn CompletionClient>,
    span: Span,
}

impl QueryClassifier {
    pub fn new(client: Arc<dyn CompletionClient>, span: Span) -> Self {
        Self { client, span }
    }

    pub async fn classify(
        &self,
        message: &str,
        role_context: Option<&RoleContext>,
        guides: &[SystemGuide],
    ) -> Classification {
        let prompt = classification_prompt(message, role_context, guides);
        match self
            .client
            .complete(vec![CompletionMessage::user(prompt)], CompletionParams::classifier())
            .await
        {
            Ok(reply) => {
                let query_type = interpret_reply(&reply);
                tracing::debug!(
                    parent: &self.span,
                    event_name = "agent.classifier.routed",
                    query_type = query_type.as_str(),
                    reply = %reply.trim()
                );
                Classification::Routed(query_type)
            }
            Err(error) => {
                tracing::warn!(
                    parent: &self.span,
                    event_name = "agent.classifier.failed",
                    error = %error,
                    "classification failed, routing to system"
                );
                Classification::FailedOpen { reason: error.to_string() }
            }
        }
    }
}

/// Any system marker anywhere in the reply means SYSTEM.
pub fn interpret_reply(reply: &str) -> QueryType {
    let lowered = reply.to_lowercase();
    if SYSTEM_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        QueryType::System
    } else {
        QueryType::Database
    }
}

pub fn classification_prompt(
    message: &str,
    role_context: Option<&RoleContext>,
    guides: &[SystemGuide],
) -> String {
    let mut prompt = String::from(
        "Analiza la siguiente pregunta del usuario y determina si es una consulta sobre el \
         funcionamiento del sistema o una consulta de datos.\n\n",
    );

    if let Some(context) = role_context {
        prompt.push_str(&format!("CONTEXTO DEL ROL ({}):\n", context.role_code));
        prompt.push_str(&format!("- Capacidades: {}\n", context.capabilities.join(", ")));
        prompt.push_str(&format!("- Consultas comunes: {}\n", context.common_queries.join(", ")));
        prompt.push_str(&format!("- Flujos de trabajo: {}\n\n", context.workflows.join(", ")));
    }

    if !guides.is_empty() {
        prompt.push_str("GUÍAS DEL SISTEMA DISPONIBLES:\n");
        for guide in guides {
            prompt.push_str(&format!(
                "- {}: {}\n",
                guide.title,
                guide.description.as_deref().unwrap_or_default()
            ));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!("PREGUNTA DEL USUARIO: \"{message}\"\n\n"));
    prompt.push_str(
        "CRITERIOS:\n\
         - TRUE (consulta del sistema): cómo usar el sistema, cómo realizar un proceso, pasos \
         de un flujo de trabajo, dudas sobre funcionalidades o permisos.\n  \
         Ejemplos: \"¿Cómo crear un usuario?\", \"¿Qué pasos sigo para registrar una venta?\", \
         \"¿Cómo cambio mi contraseña?\"\n\
         - FALSE (consulta de datos): pide cifras, listados, totales o registros concretos \
         almacenados en la base de datos.\n  \
         Ejemplos: \"¿Cuántos proyectos hay activos?\", \"Muéstrame los clientes con pagos \
         pendientes\", \"¿Cuál es el presupuesto del proyecto Norte?\"\n\n\
         Responde SOLO: TRUE (si es consulta del sistema) o FALSE (si es consulta de datos)",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tracing::Span;

    use concierge_core::domain::context::{RoleContext, SystemGuide};
    use concierge_core::domain::message::QueryType;

    use super::{classification_prompt, interpret_reply, Classification, QueryClassifier};
    use crate::llm::{LlmError, ScriptedCompletionClient};

    fn role_context() -> RoleContext {
        RoleContext {
            role_code: "ADM".to_string(),
            name: "Administrador".to_string(),
            description: "Administra usuarios".to_string(),
            capabilities: vec!["Crear usuarios".to_string(), "Asignar roles".to_string()],
            common_queries: vec!["¿Cómo crear un usuario?".to_string()],
            workflows: vec!["Alta de usuario".to_string()],
            metadata: None,
            is_active: true,
        }
    }

    fn guide() -> SystemGuide {
        SystemGuide {
            key: "crear-usuario".to_string(),
            title: "Crear usuario".to_string(),
            applicable_roles: vec!["ADM".to_string()],
            steps: vec!["Abrir Usuarios".to_string()],
            description: Some("Alta de usuarios nuevos".to_string()),
            priority: 10,
            is_active: true,
        }
    }

    #[test]
    fn reply_markers_route_to_system() {
        assert_eq!(interpret_reply("TRUE"), QueryType::System);
        assert_eq!(interpret_reply("Sí, es del sistema"), QueryType::System);
        assert_eq!(interpret_reply("  SISTEMA "), QueryType::System);
        assert_eq!(interpret_reply("FALSE"), QueryType::Database);
        assert_eq!(interpret_reply("datos"), QueryType::Database);
    }

    #[test]
    fn prompt_includes_role_and_guides_only_when_present() {
        let full = classification_prompt("¿Cómo crear un usuario?", Some(&role_context()), &[guide()]);
        assert!(full.contains("CONTEXTO DEL ROL (ADM):"));
        assert!(full.contains("- Capacidades: Crear usuarios, Asignar roles"));
        assert!(full.contains("GUÍAS DEL SISTEMA DISPONIBLES:\n- Crear usuario: Alta de usuarios nuevos"));
        assert!(full.contains("PREGUNTA DEL USUARIO: \"¿Cómo crear un usuario?\""));

        let bare = classification_prompt("hola", None, &[]);
        assert!(!bare.contains("CONTEXTO DEL ROL"));
        assert!(!bare.contains("GUÍAS DEL SISTEMA"));
        assert!(bare.ends_with("FALSE (si es consulta de datos)"));
    }

    #[tokio::test]
    async fn completion_failure_fails_open_to_system() {
        let client = Arc::new(ScriptedCompletionClient::default());
        client.push_failure(LlmError::Status { code: 503, body: "overloaded".to_string() });
        let classifier = QueryClassifier::new(client.clone(), Span::none());

        let outcome = classifier.classify("¿Cuántos proyectos hay?", None, &[]).await;
        assert!(matches!(outcome, Classification::FailedOpen { .. }));
        assert_eq!(outcome.query_type(), QueryType::System);

        let params = &client.calls()[0].params;
        assert_eq!((params.max_tokens, params.temperature), (10, 0.1));
    }

    #[tokio::test]
    async fn data_reply_routes_to_database() {
        let client = Arc::new(ScriptedCompletionClient::new(["FALSE"]));
        let classifier = QueryClassifier::new(client, Span::none());

        let outcome = classifier.classify("¿Cuántos proyectos hay activos?", None, &[]).await;
        assert_eq!(outcome, Classification::Routed(QueryType::Database));
    }
}
