use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::session::SessionId;
use crate::domain::user::UserId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(DomainError::UnknownMessageRole(other.to_string())),
        }
    }
}

/// Which branch of the pipeline produced an assistant reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    System,
    Database,
}

impl QueryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Database => "database",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: MessageRole,
    pub content: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn from_user(
        session_id: SessionId,
        user_id: &UserId,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            session_id,
            role: MessageRole::User,
            content: content.into(),
            metadata: Some(serde_json::json!({ "userId": user_id.0 })),
            created_at: now,
        }
    }

    pub fn from_assistant(
        session_id: SessionId,
        user_id: &UserId,
        content: impl Into<String>,
        query_type: QueryType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            session_id,
            role: MessageRole::Assistant,
            content: content.into(),
            metadata: Some(serde_json::json!({
                "userId": user_id.0,
                "queryType": query_type.as_str(),
            })),
            created_at: now,
        }
    }

    pub fn query_type(&self) -> Option<&str> {
        self.metadata.as_ref()?.get("queryType")?.as_str()
    }
}

/// Turns a newest-first fetch of up to `2 * window` records into the trailing `window` entries in
/// chronological order.
pub fn chronological_window(mut newest_first: Vec<ChatMessage>, window: usize) -> Vec<ChatMessage> {
    newest_first.reverse();
    let skip = newest_first.len().saturating_sub(window);
    newest_first.split_off(skip)
}
