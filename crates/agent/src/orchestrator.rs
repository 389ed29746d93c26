//! One inbound message in, one persisted assistant reply out.
//!
//! A turn runs strictly in sequence: session resolution, user message, history window, role
//! context, classification, then either the data branch (generate, execute, narrate) or the system
//! branch (narrate from role context and guides), and finally the assistant message. Every
//! completion call is charged two rate points; a missing access policy short-circuits before any
//! completion call and costs nothing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Span;

use concierge_core::domain::context::{RoleContext, SystemGuide};
use concierge_core::domain::message::{ChatMessage, QueryType};
use concierge_core::domain::session::{Session, SessionId};
use concierge_core::domain::user::User;
use concierge_core::errors::{ApplicationError, DomainError};
use concierge_db::repositories::SessionRepository;

use crate::classifier::QueryClassifier;
use crate::clock::Clock;
use crate::context::ContextService;
use crate::database_agent::{DatabaseQueryAgent, ExecutionOutcome, SqlGeneration, PERMISSION_DENIED_MESSAGE};
use crate::rate_limiter::RateLimiter;
use crate::sessions::{persistence, SessionService};
use crate::synthesizer::{QueryResults, ResponseSynthesizer};
use crate::title::TitleGenerator;

pub const AGENT_CALL_POINTS: u32 = 2;
pub const DEFAULT_HISTORY_WINDOW: usize = 5;

pub const NO_DATABASE_ACCESS_REPLY: &str =
    "No tienes permisos para realizar consultas a la base de datos.";
pub const QUERY_UNAVAILABLE_REPLY: &str =
    "No se pudo ejecutar la consulta o no se encontraron resultados.";
pub const DATABASE_BRANCH_ERROR_REPLY: &str =
    "Ocurrió un error al procesar tu consulta a la base de datos.";

pub const NEW_SESSION_MESSAGE: &str = "Nueva conversación iniciada";
pub const MESSAGE_SENT_MESSAGE: &str = "Mensaje enviado exitosamente";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnOutcome {
    pub session_id: SessionId,
    pub reply: String,
    pub is_new_session: bool,
    pub query_type: QueryType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub success: bool,
    pub message: String,
    pub session_id: SessionId,
    pub response: String,
    pub timestamp: DateTime<Utc>,
}

impl From<TurnOutcome> for SendMessageResponse {
    fn from(outcome: TurnOutcome) -> Self {
        let message = if outcome.is_new_session { NEW_SESSION_MESSAGE } else { MESSAGE_SENT_MESSAGE };
        Self {
            success: true,
            message: message.to_string(),
            session_id: outcome.session_id,
            response: outcome.reply,
            timestamp: outcome.timestamp,
        }
    }
}

pub struct OrchestratorParts {
    pub sessions: Arc<dyn SessionRepository>,
    pub session_service: Arc<SessionService>,
    pub context: Arc<ContextService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub classifier: QueryClassifier,
    pub titles: TitleGenerator,
    pub database_agent: DatabaseQueryAgent,
    pub synthesizer: ResponseSynthesizer,
    pub clock: Arc<dyn Clock>,
}

pub struct ConversationOrchestrator {
    sessions: Arc<dyn SessionRepository>,
    session_service: Arc<SessionService>,
    context: Arc<ContextService>,
    rate_limiter: Arc<RateLimiter>,
    classifier: QueryClassifier,
    titles: TitleGenerator,
    database_agent: DatabaseQueryAgent,
    synthesizer: ResponseSynthesizer,
    clock: Arc<dyn Clock>,
    history_window: usize,
    span: Span,
}

struct TurnContext<'a> {
    user: &'a User,
    message: &'a str,
    history: &'a [ChatMessage],
    role_context: Option<&'a RoleContext>,
    guides: &'a [SystemGuide],
}

impl ConversationOrchestrator {
    pub fn new(parts: OrchestratorParts, history_window: usize, span: Span) -> Self {
        Self {
            sessions: parts.sessions,
            session_service: parts.session_service,
            context: parts.context,
            rate_limiter: parts.rate_limiter,
            classifier: parts.classifier,
            titles: parts.titles,
            database_agent: parts.database_agent,
            synthesizer: parts.synthesizer,
            clock: parts.clock,
            history_window,
            span,
        }
    }

    /// Processes one turn. Session lookups fail as structured not-found errors; every other
    /// failure becomes [`ApplicationError::ProcessingFailed`]. Nothing persisted before a failure
    /// is rolled back.
    pub async fn handle_turn(
        &self,
        user: &User,
        message: &str,
        session_id: Option<&SessionId>,
    ) -> Result<TurnOutcome, ApplicationError> {
        let result = self.run_turn(user, message, session_id).await;
        match result {
            Ok(outcome) => {
                tracing::info!(
                    parent: &self.span,
                    event_name = "chat.turn.completed",
                    user_id = %user.id,
                    session_id = %outcome.session_id,
                    query_type = outcome.query_type.as_str(),
                    new_session = outcome.is_new_session
                );
                Ok(outcome)
            }
            Err(error) => {
                tracing::error!(
                    parent: &self.span,
                    event_name = "chat.turn.failed",
                    user_id = %user.id,
                    error = %error,
                    "turn failed"
                );
                Err(match error {
                    ApplicationError::SessionNotFound { .. }
                    | ApplicationError::SessionMismatch { .. }
                    | ApplicationError::SessionNotOpen { .. }
                    | ApplicationError::ProcessingFailed(_) => error,
                    other => ApplicationError::ProcessingFailed(other.to_string()),
                })
            }
        }
    }

    async fn run_turn(
        &self,
        user: &User,
        message: &str,
        session_id: Option<&SessionId>,
    ) -> Result<TurnOutcome, ApplicationError> {
        if message.trim().is_empty() {
            return Err(DomainError::InvariantViolation("message must not be empty".to_string()).into());
        }

        let (session, is_new_session) = match session_id {
            Some(id) => (self.session_service.open_session_for(id, &user.id).await?, false),
            None => (self.open_session(user, message).await?, true),
        };

        self.sessions
            .append_message(ChatMessage::from_user(session.id.clone(), &user.id, message, self.clock.now()))
            .await
            .map_err(persistence)?;

        let history = match self.sessions.recent_window(&session.id, self.history_window).await {
            Ok(history) => history,
            Err(error) => {
                tracing::warn!(
                    parent: &self.span,
                    event_name = "chat.history.unavailable",
                    session_id = %session.id,
                    error = %error,
                    "continuing without history"
                );
                Vec::new()
            }
        };

        let role_code = user.role_code();
        let role_context = self.context.role_context(role_code).await?;
        let guides = self.context.guides_for_role(role_code).await?;
        let turn = TurnContext {
            user,
            message,
            history: &history,
            role_context: role_context.as_ref(),
            guides: &guides,
        };

        let classification = self.classifier.classify(message, turn.role_context, turn.guides).await;
        self.rate_limiter.consume(user, AGENT_CALL_POINTS).await;
        let query_type = classification.query_type();

        let reply = match query_type {
            QueryType::Database => self.answer_from_database(&turn).await.unwrap_or_else(|error| {
                tracing::error!(
                    parent: &self.span,
                    event_name = "chat.database.failed",
                    user_id = %user.id,
                    error = %error,
                    "data branch failed, replying with fallback"
                );
                DATABASE_BRANCH_ERROR_REPLY.to_string()
            }),
            QueryType::System => self.answer_from_knowledge(&turn).await,
        };

        let timestamp = self.clock.now();
        self.sessions
            .append_message(ChatMessage::from_assistant(
                session.id.clone(),
                &user.id,
                reply.clone(),
                query_type,
                timestamp,
            ))
            .await
            .map_err(persistence)?;

        Ok(TurnOutcome { session_id: session.id, reply, is_new_session, query_type, timestamp })
    }

    async fn open_session(&self, user: &User, first_message: &str) -> Result<Session, ApplicationError> {
        let title = self.titles.generate(first_message).await.into_title();
        self.rate_limiter.consume(user, AGENT_CALL_POINTS).await;

        let session = Session::open(user.id.clone(), Some(title), self.clock.now());
        self.sessions.create(session.clone()).await.map_err(persistence)?;
        tracing::info!(
            parent: &self.span,
            event_name = "chat.session.created",
            user_id = %user.id,
            session_id = %session.id
        );
        Ok(session)
    }

    async fn answer_from_database(&self, turn: &TurnContext<'_>) -> Result<String, ApplicationError> {
        let Some(policy) = self.context.access_policy(turn.user.role_code()).await? else {
            tracing::info!(
                parent: &self.span,
                event_name = "chat.database.no_policy",
                user_id = %turn.user.id,
                role_code = turn.user.role_code()
            );
            return Ok(NO_DATABASE_ACCESS_REPLY.to_string());
        };

        let generation = self.database_agent.generate_sql(turn.message, &policy).await;
        self.rate_limiter.consume(turn.user, AGENT_CALL_POINTS).await;
        let sql = match generation {
            SqlGeneration::Generated { sql } => sql,
            other => {
                return Ok(other.message().unwrap_or(PERMISSION_DENIED_MESSAGE).to_string());
            }
        };

        let (rows, truncated) = match self.database_agent.execute(&sql, &policy.query_limits).await {
            ExecutionOutcome::Rows { rows, truncated } => (rows, truncated),
            _ => return Ok(QUERY_UNAVAILABLE_REPLY.to_string()),
        };

        let reply = self
            .synthesizer
            .database_reply(turn.message, turn.user, QueryResults { rows: &rows, truncated }, turn.history)
            .await;
        self.rate_limiter.consume(turn.user, AGENT_CALL_POINTS).await;
        Ok(reply.into_text())
    }

    async fn answer_from_knowledge(&self, turn: &TurnContext<'_>) -> String {
        let reply = self
            .synthesizer
            .system_reply(turn.message, turn.user, turn.history, turn.role_context, turn.guides)
            .await;
        self.rate_limiter.consume(turn.user, AGENT_CALL_POINTS).await;
        reply.into_text()
    }
}
