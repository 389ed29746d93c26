//! Role-scoped SQL generation and guarded execution against the reporting store.

use std::sync::Arc;
use std::time::Duration;

use tracing::Span;

use concierge_core::domain::context::{DatabaseAccessPolicy, QueryLimits};
use concierge_db::{RelationalStore, ResultRow};

use crate::guardrails::{GuardrailDecision, StatementGuard};
use crate::llm::{CompletionClient, CompletionMessage, CompletionParams};

pub const PERMISSION_DENIED_MESSAGE: &str = "No tienes permisos para realizar esta consulta.";
pub const UNRECOGNIZED_SQL_MESSAGE: &str = "No se pudo generar una consulta SQL válida.";
pub const GENERATION_FAILED_MESSAGE: &str = "Error al generar la consulta SQL.";
pub const NO_RESULTS_MESSAGE: &str = "No se encontraron resultados.";
pub const EXECUTION_FAILED_MESSAGE: &str = "Error al ejecutar la consulta en la base de datos.";

const DENIAL_PHRASES: &[&str] = &["no tienes permisos", "sin permisos", "no autorizado", "no permitido"];
const SQL_KEYWORDS: &[&str] = &["SELECT", "INSERT", "UPDATE", "DELETE"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SqlGeneration {
    Generated { sql: String },
    PermissionDenied,
    Unrecognized,
    Failed { reason: String },
}

impl SqlGeneration {
    /// User-facing copy for the non-generated variants.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            Self::Generated { .. } => None,
            Self::PermissionDenied => Some(PERMISSION_DENIED_MESSAGE),
            Self::Unrecognized => Some(UNRECOGNIZED_SQL_MESSAGE),
            Self::Failed { .. } => Some(GENERATION_FAILED_MESSAGE),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionOutcome {
    Rows { rows: Vec<ResultRow>, truncated: bool },
    NoRows,
    Rejected { user_message: String },
    Failed { reason: String },
}

impl ExecutionOutcome {
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Rows { .. } => None,
            Self::NoRows => Some(NO_RESULTS_MESSAGE),
            Self::Rejected { user_message } => Some(user_message),
            Self::Failed { .. } => Some(EXECUTION_FAILED_MESSAGE),
        }
    }
}

pub struct DatabaseQueryAgent {
    client: Arc<dyn CompletionClient>,
    store: Arc<dyn RelationalStore>,
    guard: StatementGuard,
    default_timeout: Duration,
    span: Span,
}

impl DatabaseQueryAgent {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        store: Arc<dyn RelationalStore>,
        default_timeout: Duration,
        span: Span,
    ) -> Self {
        Self { client, store, guard: StatementGuard, default_timeout, span }
    }

    pub async fn generate_sql(&self, question: &str, policy: &DatabaseAccessPolicy) -> SqlGeneration {
        let prompt = sql_prompt(question, policy);
        let reply = match self
            .client
            .complete(vec![CompletionMessage::user(prompt)], CompletionParams::sql_generation())
            .await
        {
            Ok(reply) => reply,
            Err(error) => {
                tracing::warn!(
                    parent: &self.span,
                    event_name = "agent.sql.generation_failed",
                    role_code = %policy.role_code,
                    error = %error,
                    "sql generation failed"
                );
                return SqlGeneration::Failed { reason: error.to_string() };
            }
        };

        let reply = reply.trim();
        let lowered = reply.to_lowercase();
        if DENIAL_PHRASES.iter().any(|phrase| lowered.contains(phrase)) {
            tracing::info!(
                parent: &self.span,
                event_name = "agent.sql.permission_denied",
                role_code = %policy.role_code
            );
            return SqlGeneration::PermissionDenied;
        }

        if SQL_KEYWORDS.iter().any(|keyword| lowered.contains(&keyword.to_ascii_lowercase())) {
            let sql = extract_sql(reply);
            tracing::debug!(parent: &self.span, event_name = "agent.sql.generated", sql = %sql);
            return SqlGeneration::Generated { sql };
        }

        tracing::warn!(
            parent: &self.span,
            event_name = "agent.sql.unrecognized",
            reply = %reply,
            "completion reply carried no sql statement"
        );
        SqlGeneration::Unrecognized
    }

    /// Runs `sql` if it passes the SELECT-only guard, capped at `limits.max_rows` rows and bounded
    /// by `limits.timeout_seconds` or the agent default.
    pub async fn execute(&self, sql: &str, limits: &QueryLimits) -> ExecutionOutcome {
        if let GuardrailDecision::Deny { reason_code, user_message } = self.guard.evaluate(sql) {
            tracing::warn!(
                parent: &self.span,
                event_name = "agent.sql.rejected",
                reason_code,
                sql = %sql,
                "statement rejected before execution"
            );
            return ExecutionOutcome::Rejected { user_message };
        }

        let timeout = limits.timeout_seconds.map(Duration::from_secs).unwrap_or(self.default_timeout);
        let max_rows = usize::try_from(limits.max_rows).unwrap_or(usize::MAX);
        match self.store.fetch_rows(sql, max_rows, timeout).await {
            Ok(result) if result.rows.is_empty() => ExecutionOutcome::NoRows,
            Ok(result) => {
                tracing::debug!(
                    parent: &self.span,
                    event_name = "agent.sql.executed",
                    rows = result.rows.len(),
                    truncated = result.truncated
                );
                ExecutionOutcome::Rows { rows: result.rows, truncated: result.truncated }
            }
            Err(error) => {
                tracing::warn!(
                    parent: &self.span,
                    event_name = "agent.sql.execution_failed",
                    error = %error,
                    "reporting query failed"
                );
                ExecutionOutcome::Failed { reason: error.to_string() }
            }
        }
    }
}

pub fn sql_prompt(question: &str, policy: &DatabaseAccessPolicy) -> String {
    let max_rows = policy.query_limits.max_rows;
    let max_joins = policy.query_limits.max_joins;
    let restricted = if policy.restricted_columns.is_empty() {
        "Ninguna".to_string()
    } else {
        policy.restricted_columns.join(", ")
    };

    format!(
        "Eres un asistente SQL especializado. Analiza la pregunta del usuario y genera una consulta \
         SQL válida o indica si no tienes permisos.\n\n\
         ESQUEMA DE BASE DE DATOS:\n{schema}\n\n\
         CONFIGURACIÓN DE PERMISOS:\n\
         - Tablas permitidas: {tables}\n\
         - Columnas restringidas: {restricted}\n\
         - Operaciones permitidas: {operations}\n\
         - Límite de filas: {max_rows}\n\
         - Límite de JOINs: {max_joins}\n\n\
         PREGUNTA DEL USUARIO: \"{question}\"\n\n\
         INSTRUCCIONES CRÍTICAS:\n\
         1. Si la pregunta requiere tablas que NO están en las tablas permitidas, responde EXACTAMENTE: \
         \"No tienes permisos para acceder a esas tablas\"\n\
         2. Si la pregunta requiere operaciones no permitidas, responde EXACTAMENTE: \
         \"No tienes permisos para realizar esa operación\"\n\
         3. Si la consulta es válida, genera SOLO la consulta SQL completa en una sola línea, sin explicaciones\n\
         4. Siempre incluye LIMIT {max_rows} al final de las consultas SELECT\n\
         5. No uses más de {max_joins} JOINs\n\
         6. No incluyas columnas restringidas en el SELECT\n\
         7. Usa nombres de tabla y columna exactos del esquema\n\
         8. NO uses bloques de código markdown\n\
         9. NO agregues explicaciones antes o después del SQL\n\
         10. La consulta debe estar completa en una sola respuesta\n\n\
         FORMATO DE RESPUESTA:\n\
         - Si hay permisos: Una sola línea con la consulta SQL completa\n\
         - Si no hay permisos: El mensaje de error exacto mencionado arriba\n\n\
         Ejemplo de respuesta válida:\n\
         SELECT columna1, columna2 FROM tabla WHERE condicion LIMIT {max_rows};",
        schema = policy.schema_description,
        tables = policy.allowed_tables.join(", "),
        operations = policy.effective_operations().join(", "),
    )
}

/// Pulls a single-line statement out of a completion reply.
///
/// Code fences are dropped, everything before the first SQL keyword is discarded, lines are
/// trimmed and joined with single spaces, and the statement ends in exactly one `;`. Replies with
/// no keyword come back fence-free and trimmed. Applying it twice gives the same result as once.
pub fn extract_sql(reply: &str) -> String {
    let cleaned = strip_code_fences(reply.trim());
    let cleaned = cleaned.trim();

    // ASCII upper-casing keeps byte offsets aligned with `cleaned`.
    let upper = cleaned.to_ascii_uppercase();
    let Some(start) = SQL_KEYWORDS.iter().filter_map(|keyword| upper.find(keyword)).min() else {
        return cleaned.to_string();
    };

    let joined = cleaned[start..]
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let body = joined.trim_end();
    let body = body.strip_suffix(';').unwrap_or(body).trim_end();
    if body.ends_with(';') {
        body.to_string()
    } else {
        format!("{body};")
    }
}

fn strip_code_fences(text: &str) -> String {
    let without_sql_fences = remove_marker(text, "```sql", true);
    remove_marker(&without_sql_fences, "```", false)
}

/// Removes every occurrence of `marker` plus one directly following newline.
fn remove_marker(text: &str, marker: &str, ignore_ascii_case: bool) -> String {
    let haystack = if ignore_ascii_case { text.to_ascii_lowercase() } else { text.to_string() };
    let mut output = String::with_capacity(text.len());
    let mut cursor = 0;

    while let Some(offset) = haystack[cursor..].find(marker) {
        let found = cursor + offset;
        output.push_str(&text[cursor..found]);
        cursor = found + marker.len();
        if text[cursor..].starts_with('\n') {
            cursor += 1;
        }
    }
    output.push_str(&text[cursor..]);
    output
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tracing::Span;

    use concierge_core::domain::context::{DatabaseAccessPolicy, QueryLimits};
    use concierge_db::{QueryRows, RelationalStore, ReportingError};

    use super::{
        extract_sql, sql_prompt, DatabaseQueryAgent, ExecutionOutcome, SqlGeneration,
        EXECUTION_FAILED_MESSAGE, NO_RESULTS_MESSAGE, PERMISSION_DENIED_MESSAGE,
        UNRECOGNIZED_SQL_MESSAGE,
    };
    use crate::guardrails::SELECT_ONLY_MESSAGE;
    use crate::llm::{LlmError, ScriptedCompletionClient};

    #[derive(Default)]
    struct RecordingStore {
        rows: Vec<serde_json::Value>,
        fail: bool,
        seen: Mutex<Vec<(String, usize, Duration)>>,
    }

    #[async_trait]
    impl RelationalStore for RecordingStore {
        async fn fetch_rows(
            &self,
            sql: &str,
            max_rows: usize,
            timeout: Duration,
        ) -> Result<QueryRows, ReportingError> {
            self.seen.lock().expect("seen lock").push((sql.to_string(), max_rows, timeout));
            if self.fail {
                return Err(ReportingError::Timeout(timeout));
            }
            let rows = self
                .rows
                .iter()
                .filter_map(|row| row.as_object().cloned())
                .take(max_rows)
                .collect();
            Ok(QueryRows { rows, truncated: false })
        }
    }

    fn policy() -> DatabaseAccessPolicy {
        let mut policy = DatabaseAccessPolicy::new(
            "VEN",
            "CREATE TABLE projects (id INTEGER, name TEXT, budget REAL, status TEXT);",
        );
        policy.allowed_tables = vec!["projects".to_string()];
        policy.query_limits = QueryLimits { max_rows: 50, max_joins: 1, timeout_seconds: Some(7) };
        policy
    }

    fn agent(client: Arc<ScriptedCompletionClient>, store: Arc<RecordingStore>) -> DatabaseQueryAgent {
        DatabaseQueryAgent::new(client, store, Duration::from_secs(30), Span::none())
    }

    #[test]
    fn extract_strips_fences_prefix_and_whitespace() {
        let reply = "Aquí está:\n```SQL\nSELECT name,\n   budget\nFROM projects\n\nLIMIT 50;\n```";
        assert_eq!(extract_sql(reply), "SELECT name, budget FROM projects LIMIT 50;");
        assert_eq!(extract_sql("select 1"), "select 1;");
        assert_eq!(extract_sql("SELECT 1;;  "), "SELECT 1;");
        assert_eq!(extract_sql("SELECT name FROM projects\n;"), "SELECT name FROM projects;");
        assert_eq!(extract_sql("SELECT 1 ;  \n"), "SELECT 1;");
        assert_eq!(extract_sql("```\n sin sql \n```"), "sin sql");
    }

    #[test]
    fn extract_is_idempotent() {
        for reply in [
            "SELECT COUNT(*) FROM projects WHERE status = 'active' LIMIT 50;",
            "```sql\nSELECT *\nFROM projects\n```",
            "Consulta: delete from projects",
            "`````sql`\nSELECT 1",
            "```\n hola ",
            "",
        ] {
            let once = extract_sql(reply);
            assert_eq!(extract_sql(&once), once, "reply: {reply:?}");
        }
    }

    #[test]
    fn prompt_states_policy_limits() {
        let prompt = sql_prompt("¿Cuántos proyectos hay activos?", &policy());
        assert!(prompt.contains("- Tablas permitidas: projects"));
        assert!(prompt.contains("- Columnas restringidas: Ninguna"));
        assert!(prompt.contains("- Operaciones permitidas: SELECT"));
        assert!(prompt.contains("- Límite de JOINs: 1"));
        assert!(prompt.contains("Siempre incluye LIMIT 50"));
        assert!(prompt.contains("\"No tienes permisos para acceder a esas tablas\""));
        assert!(prompt.contains("CREATE TABLE projects"));
    }

    #[tokio::test]
    async fn generation_distinguishes_denials_and_noise() {
        let client = Arc::new(ScriptedCompletionClient::new([
            "No tienes permisos para acceder a esas tablas",
            "No lo sé",
            "SELECT COUNT(*) AS total FROM projects WHERE status = 'active' LIMIT 50",
        ]));
        client.push_failure(LlmError::EmptyReply);
        let agent = agent(client.clone(), Arc::new(RecordingStore::default()));
        let policy = policy();

        let denied = agent.generate_sql("salarios", &policy).await;
        assert_eq!(denied, SqlGeneration::PermissionDenied);
        assert_eq!(denied.message(), Some(PERMISSION_DENIED_MESSAGE));
        assert_eq!(agent.generate_sql("?", &policy).await.message(), Some(UNRECOGNIZED_SQL_MESSAGE));
        assert_eq!(
            agent.generate_sql("activos", &policy).await,
            SqlGeneration::Generated {
                sql: "SELECT COUNT(*) AS total FROM projects WHERE status = 'active' LIMIT 50;"
                    .to_string()
            }
        );
        assert!(matches!(agent.generate_sql("x", &policy).await, SqlGeneration::Failed { .. }));

        let params = &client.calls()[0].params;
        assert_eq!((params.max_tokens, params.temperature), (500, 0.1));
    }

    #[tokio::test]
    async fn non_select_never_reaches_the_store() {
        let store = Arc::new(RecordingStore::default());
        let agent = agent(Arc::new(ScriptedCompletionClient::default()), store.clone());

        for sql in ["DELETE FROM projects;", "  update projects set budget = 0;", "PRAGMA table_info(projects)"] {
            let outcome = agent.execute(sql, &QueryLimits::default()).await;
            assert_eq!(outcome.message(), Some(SELECT_ONLY_MESSAGE));
        }
        assert!(store.seen.lock().expect("seen lock").is_empty());
    }

    #[tokio::test]
    async fn execution_applies_policy_limits_and_reports_outcomes() {
        let store = Arc::new(RecordingStore {
            rows: vec![json!({"total": 3})],
            ..RecordingStore::default()
        });
        let agent = agent(Arc::new(ScriptedCompletionClient::default()), store.clone());

        let outcome = agent.execute("SELECT COUNT(*) AS total FROM projects;", &policy().query_limits).await;
        let ExecutionOutcome::Rows { rows, .. } = outcome else {
            panic!("expected rows");
        };
        assert_eq!(rows[0].get("total"), Some(&json!(3)));

        let outcome = agent.execute("SELECT 1", &QueryLimits::default()).await;
        assert!(matches!(outcome, ExecutionOutcome::Rows { .. }));

        let seen = store.seen.lock().expect("seen lock").clone();
        assert_eq!((seen[0].1, seen[0].2), (50, Duration::from_secs(7)));
        assert_eq!((seen[1].1, seen[1].2), (100, Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn empty_and_failed_queries_map_to_copy() {
        let empty = agent(Arc::new(ScriptedCompletionClient::default()), Arc::new(RecordingStore::default()));
        assert_eq!(
            empty.execute("SELECT 1", &QueryLimits::default()).await.message(),
            Some(NO_RESULTS_MESSAGE)
        );

        let failing = agent(
            Arc::new(ScriptedCompletionClient::default()),
            Arc::new(RecordingStore { fail: true, ..RecordingStore::default() }),
        );
        let outcome = failing.execute("SELECT 1", &QueryLimits::default()).await;
        assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));
        assert_eq!(outcome.message(), Some(EXECUTION_FAILED_MESSAGE));
    }
}
