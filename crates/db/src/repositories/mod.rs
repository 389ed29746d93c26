use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use concierge_core::domain::context::{
    ContextBaseEntry, DatabaseAccessPolicy, QuickHelpItem, QuickHelpSet, RoleContext, SystemGuide,
    UpsertAction,
};
use concierge_core::domain::message::ChatMessage;
use concierge_core::domain::session::{Session, SessionId, SessionSummary};
use concierge_core::domain::user::UserId;
use concierge_core::rate_limit::{ConsumeOutcome, RateWindow, RoleRateLimit};

pub mod context;
pub mod memory;
pub mod rate_limit;
pub mod session;

pub use context::SqlContextRepository;
pub use memory::{InMemoryContextRepository, InMemoryRateWindowRepository, InMemorySessionRepository};
pub use rate_limit::SqlRateWindowRepository;
pub use session::SqlSessionRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Sessions and their append-only message log.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: Session) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError>;

    /// Read path: only an active session owned by `user_id`.
    async fn find_active_for_user(
        &self,
        id: &SessionId,
        user_id: &UserId,
    ) -> Result<Option<Session>, RepositoryError>;

    /// Most recently updated first. Closed sessions are included.
    async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<SessionSummary>, RepositoryError>;

    /// Persists the message and advances the session's `updated_at` in one unit.
    async fn append_message(&self, message: ChatMessage) -> Result<(), RepositoryError>;

    /// Trailing `window` messages in chronological order, for prompt context.
    async fn recent_window(
        &self,
        session_id: &SessionId,
        window: usize,
    ) -> Result<Vec<ChatMessage>, RepositoryError>;

    /// Every message in chronological order, for transcript export.
    async fn transcript(&self, session_id: &SessionId) -> Result<Vec<ChatMessage>, RepositoryError>;

    /// Returns false when no active session owned by `user_id` matched.
    async fn close(
        &self,
        id: &SessionId,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Deletes the session's messages, then the session. Returns false when not owned or absent.
    async fn delete(&self, id: &SessionId, user_id: &UserId) -> Result<bool, RepositoryError>;
}

/// Hour-aligned usage windows keyed by (user, window start).
#[async_trait]
pub trait RateWindowRepository: Send + Sync {
    async fn find(
        &self,
        user_id: &UserId,
        window_start: DateTime<Utc>,
    ) -> Result<Option<RateWindow>, RepositoryError>;

    async fn save(&self, window: RateWindow) -> Result<(), RepositoryError>;

    /// Releases an elapsed block and applies `points` to the current window as a single unit.
    async fn consume(
        &self,
        user_id: &UserId,
        points: u32,
        limits: &RoleRateLimit,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, RepositoryError>;

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError>;

    async fn delete_for_user(&self, user_id: &UserId) -> Result<u64, RepositoryError>;
}

/// Role contexts, guides, access policies, base instructions and quick help. Lookups return
/// active records only; upserts create or replace by the entity's unique key.
#[async_trait]
pub trait ContextRepository: Send + Sync {
    async fn role_context(&self, role_code: &str) -> Result<Option<RoleContext>, RepositoryError>;

    /// Guides applicable to `role_code` or to every role, priority desc then title asc.
    async fn guides_for_role(&self, role_code: &str) -> Result<Vec<SystemGuide>, RepositoryError>;

    async fn guide_by_key(&self, key: &str) -> Result<Option<SystemGuide>, RepositoryError>;

    async fn access_policy(
        &self,
        role_code: &str,
    ) -> Result<Option<DatabaseAccessPolicy>, RepositoryError>;

    async fn context_base(&self, key: &str) -> Result<Option<ContextBaseEntry>, RepositoryError>;

    /// Every active entry, ordered by key.
    async fn active_context_base(&self) -> Result<Vec<ContextBaseEntry>, RepositoryError>;

    /// Active items for `role_code`, ascending `order`.
    async fn quick_help_for_role(&self, role_code: &str)
        -> Result<Vec<QuickHelpItem>, RepositoryError>;

    async fn upsert_role_context(&self, context: RoleContext)
        -> Result<UpsertAction, RepositoryError>;

    async fn upsert_guide(&self, guide: SystemGuide) -> Result<UpsertAction, RepositoryError>;

    async fn upsert_access_policy(
        &self,
        policy: DatabaseAccessPolicy,
    ) -> Result<UpsertAction, RepositoryError>;

    async fn upsert_context_base(
        &self,
        entry: ContextBaseEntry,
    ) -> Result<UpsertAction, RepositoryError>;

    /// Drops every item of the role, then stores `set` as active items numbered from 1.
    async fn replace_quick_help(&self, set: QuickHelpSet)
        -> Result<Vec<QuickHelpItem>, RepositoryError>;
}

/// Fixed-width UTC encoding so lexical order matches chronological order.
pub(crate) fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("invalid timestamp `{value}`: {error}")))
}

pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}

pub(crate) fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|error| RepositoryError::Decode(error.to_string()))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{decode_timestamp, encode_timestamp};

    #[test]
    fn timestamps_sort_lexically() {
        let earlier = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single().expect("timestamp");
        let later = earlier + chrono::Duration::microseconds(1);

        let earlier_text = encode_timestamp(earlier);
        let later_text = encode_timestamp(later);
        assert_eq!(earlier_text, "2024-01-02T03:04:05.000000Z");
        assert!(earlier_text < later_text);
        assert_eq!(decode_timestamp(&later_text).expect("decode"), later);
        assert!(decode_timestamp("yesterday").is_err());
    }
}
