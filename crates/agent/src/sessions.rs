use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::Span;

use concierge_core::domain::message::{MessageId, MessageRole};
use concierge_core::domain::session::{Session, SessionId};
use concierge_core::domain::user::UserId;
use concierge_core::errors::ApplicationError;
use concierge_db::repositories::{RepositoryError, SessionRepository};

use crate::clock::Clock;

pub const SESSION_CLOSED_MESSAGE: &str = "Sesión cerrada exitosamente";
pub const SESSION_DELETED_MESSAGE: &str = "Sesión eliminada exitosamente";

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHistory {
    pub success: bool,
    pub session_id: SessionId,
    pub title: String,
    pub messages: Vec<HistoryEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListing {
    pub id: SessionId,
    pub title: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionList {
    pub success: bool,
    pub sessions: Vec<SessionListing>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommandAck {
    pub success: bool,
    pub message: String,
}

impl CommandAck {
    fn ok(message: &str) -> Self {
        Self { success: true, message: message.to_string() }
    }
}

/// Read and lifecycle operations on a user's sessions.
pub struct SessionService {
    sessions: Arc<dyn SessionRepository>,
    clock: Arc<dyn Clock>,
    span: Span,
}

impl SessionService {
    pub fn new(sessions: Arc<dyn SessionRepository>, clock: Arc<dyn Clock>, span: Span) -> Self {
        Self { sessions, clock, span }
    }

    /// Resolves a session the caller may keep writing to: it must exist, be theirs and be active.
    pub async fn open_session_for(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> Result<Session, ApplicationError> {
        let session = self.owned_session(session_id, user_id).await?;
        if !session.is_active {
            return Err(ApplicationError::SessionNotOpen { session_id: session_id.0.clone() });
        }
        Ok(session)
    }

    /// Full transcript, oldest first.
    pub async fn history(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> Result<SessionHistory, ApplicationError> {
        let session = self
            .sessions
            .find_active_for_user(session_id, user_id)
            .await
            .map_err(persistence)?;
        let Some(session) = session else {
            // Foreign sessions come back as SessionMismatch.
            self.owned_session(session_id, user_id).await?;
            return Err(ApplicationError::SessionNotFound { session_id: session_id.0.clone() });
        };

        let messages = self
            .sessions
            .transcript(&session.id)
            .await
            .map_err(persistence)?
            .into_iter()
            .map(|message| HistoryEntry {
                id: message.id,
                role: message.role,
                content: message.content,
                timestamp: message.created_at,
                metadata: message.metadata,
            })
            .collect();

        Ok(SessionHistory {
            success: true,
            session_id: session.id.clone(),
            title: session.display_title().to_string(),
            messages,
        })
    }

    /// Every session the user owns, closed ones included, most recently updated first.
    pub async fn list(&self, user_id: &UserId) -> Result<SessionList, ApplicationError> {
        let sessions = self
            .sessions
            .list_for_user(user_id)
            .await
            .map_err(persistence)?
            .into_iter()
            .map(|summary| SessionListing {
                title: summary.display_title().to_string(),
                id: summary.id,
                is_active: summary.is_active,
                created_at: summary.created_at,
                updated_at: summary.updated_at,
            })
            .collect();
        Ok(SessionList { success: true, sessions })
    }

    pub async fn close(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> Result<CommandAck, ApplicationError> {
        let closed = self
            .sessions
            .close(session_id, user_id, self.clock.now())
            .await
            .map_err(persistence)?;
        if !closed {
            return Err(ApplicationError::SessionNotOpen { session_id: session_id.0.clone() });
        }
        tracing::info!(
            parent: &self.span,
            event_name = "chat.session.closed",
            session_id = %session_id,
            user_id = %user_id
        );
        Ok(CommandAck::ok(SESSION_CLOSED_MESSAGE))
    }

    /// Removes the session and every message in it.
    pub async fn delete(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> Result<CommandAck, ApplicationError> {
        self.owned_session(session_id, user_id).await?;
        let deleted = self.sessions.delete(session_id, user_id).await.map_err(persistence)?;
        if !deleted {
            return Err(ApplicationError::SessionNotFound { session_id: session_id.0.clone() });
        }
        tracing::info!(
            parent: &self.span,
            event_name = "chat.session.deleted",
            session_id = %session_id,
            user_id = %user_id
        );
        Ok(CommandAck::ok(SESSION_DELETED_MESSAGE))
    }

    async fn owned_session(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> Result<Session, ApplicationError> {
        let session = self.sessions.find_by_id(session_id).await.map_err(persistence)?;
        match session {
            None => Err(ApplicationError::SessionNotFound { session_id: session_id.0.clone() }),
            Some(session) if !session.is_owned_by(user_id) => {
                tracing::warn!(
                    parent: &self.span,
                    event_name = "chat.session.foreign_access",
                    session_id = %session_id,
                    user_id = %user_id,
                    "session requested by a user who does not own it"
                );
                Err(ApplicationError::SessionMismatch {
                    session_id: session_id.0.clone(),
                    user_id: user_id.0.clone(),
                })
            }
            Some(session) => Ok(session),
        }
    }
}

pub(crate) fn persistence(error: RepositoryError) -> ApplicationError {
    ApplicationError::Persistence(error.to_string())
}
