use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use concierge_core::domain::message::{chronological_window, ChatMessage, MessageId, MessageRole};
use concierge_core::domain::session::{Session, SessionId, SessionSummary};
use concierge_core::domain::user::UserId;

use super::{decode_json, decode_timestamp, encode_timestamp, RepositoryError, SessionRepository};
use crate::DbPool;

pub struct SqlSessionRepository {
    pool: DbPool,
}

impl SqlSessionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn message_ids(&self, session_id: &SessionId) -> Result<Vec<MessageId>, RepositoryError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM chat_messages WHERE session_id = ? ORDER BY created_at ASC, seq ASC",
        )
        .bind(&session_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(MessageId).collect())
    }

    async fn hydrate(&self, row: Option<SqliteRow>) -> Result<Option<Session>, RepositoryError> {
        let Some(row) = row else {
            return Ok(None);
        };
        let mut session = row_to_session(&row)?;
        session.message_ids = self.message_ids(&session.id).await?;
        Ok(Some(session))
    }
}

fn decode_err(error: sqlx::Error) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

fn row_to_session(row: &SqliteRow) -> Result<Session, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode_err)?;
    let user_id: String = row.try_get("user_id").map_err(decode_err)?;
    let title: Option<String> = row.try_get("title").map_err(decode_err)?;
    let is_active: bool = row.try_get("is_active").map_err(decode_err)?;
    let created_at: String = row.try_get("created_at").map_err(decode_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_err)?;

    Ok(Session {
        id: SessionId(id),
        user_id: UserId(user_id),
        title,
        is_active,
        message_ids: Vec::new(),
        created_at: decode_timestamp(&created_at)?,
        updated_at: decode_timestamp(&updated_at)?,
    })
}

fn row_to_summary(row: &SqliteRow) -> Result<SessionSummary, RepositoryError> {
    let session = row_to_session(row)?;
    Ok(SessionSummary::from(&session))
}

fn row_to_message(row: &SqliteRow) -> Result<ChatMessage, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode_err)?;
    let session_id: String = row.try_get("session_id").map_err(decode_err)?;
    let role: String = row.try_get("role").map_err(decode_err)?;
    let content: String = row.try_get("content").map_err(decode_err)?;
    let metadata_json: Option<String> = row.try_get("metadata_json").map_err(decode_err)?;
    let created_at: String = row.try_get("created_at").map_err(decode_err)?;

    let role = role
        .parse::<MessageRole>()
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;
    let metadata = metadata_json.map(|raw| decode_json("metadata_json", &raw)).transpose()?;

    Ok(ChatMessage {
        id: MessageId(id),
        session_id: SessionId(session_id),
        role,
        content,
        metadata,
        created_at: decode_timestamp(&created_at)?,
    })
}

const SESSION_COLUMNS: &str = "id, user_id, title, is_active, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, session_id, role, content, metadata_json, created_at";

#[async_trait::async_trait]
impl SessionRepository for SqlSessionRepository {
    async fn create(&self, session: Session) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO chat_sessions (id, user_id, title, is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id.0)
        .bind(&session.user_id.0)
        .bind(&session.title)
        .bind(session.is_active)
        .bind(encode_timestamp(session.created_at))
        .bind(encode_timestamp(session.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        self.hydrate(row).await
    }

    async fn find_active_for_user(
        &self,
        id: &SessionId,
        user_id: &UserId,
    ) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions
             WHERE id = ? AND user_id = ? AND is_active = 1"
        ))
        .bind(&id.0)
        .bind(&user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        self.hydrate(row).await
    }

    async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<SessionSummary>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions
             WHERE user_id = ?
             ORDER BY updated_at DESC, created_at DESC"
        ))
        .bind(&user_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_summary).collect()
    }

    async fn append_message(&self, message: ChatMessage) -> Result<(), RepositoryError> {
        let metadata_json = message.metadata.as_ref().map(|value| value.to_string());
        let created_at = encode_timestamp(message.created_at);
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE id = ?")
            .bind(&created_at)
            .bind(&message.session_id.0)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("session {}", message.session_id.0)));
        }

        sqlx::query(
            "INSERT INTO chat_messages (id, session_id, role, content, metadata_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id.0)
        .bind(&message.session_id.0)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&metadata_json)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn recent_window(
        &self,
        session_id: &SessionId,
        window: usize,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let fetch_limit = i64::try_from(window.saturating_mul(2)).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages
             WHERE session_id = ?
             ORDER BY created_at DESC, seq DESC
             LIMIT ?"
        ))
        .bind(&session_id.0)
        .bind(fetch_limit)
        .fetch_all(&self.pool)
        .await?;

        let newest_first = rows.iter().map(row_to_message).collect::<Result<Vec<_>, _>>()?;
        Ok(chronological_window(newest_first, window))
    }

    async fn transcript(&self, session_id: &SessionId) -> Result<Vec<ChatMessage>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages
             WHERE session_id = ?
             ORDER BY created_at ASC, seq ASC"
        ))
        .bind(&session_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    async fn close(
        &self,
        id: &SessionId,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE chat_sessions SET is_active = 0, updated_at = ?
             WHERE id = ? AND user_id = ? AND is_active = 1",
        )
        .bind(encode_timestamp(now))
        .bind(&id.0)
        .bind(&user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: &SessionId, user_id: &UserId) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let owned: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM chat_sessions WHERE id = ? AND user_id = ?)",
        )
        .bind(&id.0)
        .bind(&user_id.0)
        .fetch_one(&mut *tx)
        .await?;
        if owned == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
            .bind(&id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chat_sessions WHERE id = ?").bind(&id.0).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use concierge_core::domain::message::{ChatMessage, MessageRole, QueryType};
    use concierge_core::domain::session::{Session, SessionId};
    use concierge_core::domain::user::UserId;

    use super::SqlSessionRepository;
    use crate::migrations;
    use crate::repositories::{RepositoryError, SessionRepository};
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn sql_session_repo_appends_and_hydrates_message_references() {
        let pool = setup_pool().await;
        let repo = SqlSessionRepository::new(pool.clone());
        let owner = UserId("U-1".to_string());
        let start = parse_ts("2024-03-01T09:00:00Z");

        let session = Session::open(owner.clone(), Some("Ventas".to_string()), start);
        repo.create(session.clone()).await.expect("create session");

        let question = ChatMessage::from_user(session.id.clone(), &owner, "hola", start);
        let answer = ChatMessage::from_assistant(
            session.id.clone(),
            &owner,
            "buenos días",
            QueryType::System,
            start + Duration::seconds(2),
        );
        repo.append_message(question.clone()).await.expect("append user turn");
        repo.append_message(answer.clone()).await.expect("append assistant turn");

        let found = repo.find_by_id(&session.id).await.expect("find").expect("session exists");
        assert_eq!(found.message_ids, vec![question.id.clone(), answer.id.clone()]);
        assert_eq!(found.updated_at, start + Duration::seconds(2));
        assert_eq!(found.title.as_deref(), Some("Ventas"));

        let transcript = repo.transcript(&session.id).await.expect("transcript");
        assert_eq!(transcript, vec![question, answer.clone()]);
        assert_eq!(transcript[1].query_type(), Some("system"));
        assert_eq!(transcript[1].role, MessageRole::Assistant);

        pool.close().await;
    }

    #[tokio::test]
    async fn sql_session_repo_window_returns_trailing_turns_in_order() {
        let pool = setup_pool().await;
        let repo = SqlSessionRepository::new(pool.clone());
        let owner = UserId("U-2".to_string());
        let start = parse_ts("2024-03-01T10:00:00Z");
        let session = Session::open(owner.clone(), None, start);
        repo.create(session.clone()).await.expect("create session");

        for index in 0..12 {
            let message = ChatMessage::from_user(
                session.id.clone(),
                &owner,
                format!("m{index}"),
                start + Duration::seconds(index),
            );
            repo.append_message(message).await.expect("append");
        }

        let window = repo.recent_window(&session.id, 5).await.expect("window");
        let contents: Vec<&str> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m7", "m8", "m9", "m10", "m11"]);

        let wide = repo.recent_window(&session.id, 20).await.expect("wide window");
        assert_eq!(wide.len(), 12);
        assert_eq!(wide.first().map(|m| m.content.as_str()), Some("m0"));

        pool.close().await;
    }

    #[tokio::test]
    async fn sql_session_repo_orders_same_instant_messages_by_insertion() {
        let pool = setup_pool().await;
        let repo = SqlSessionRepository::new(pool.clone());
        let owner = UserId("U-3".to_string());
        let instant = parse_ts("2024-03-01T11:00:00Z");
        let session = Session::open(owner.clone(), None, instant);
        repo.create(session.clone()).await.expect("create session");

        for label in ["first", "second", "third"] {
            repo.append_message(ChatMessage::from_user(session.id.clone(), &owner, label, instant))
                .await
                .expect("append");
        }

        let window = repo.recent_window(&session.id, 2).await.expect("window");
        let contents: Vec<&str> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["second", "third"]);

        pool.close().await;
    }

    #[tokio::test]
    async fn sql_session_repo_scopes_reads_close_and_delete_to_owner() {
        let pool = setup_pool().await;
        let repo = SqlSessionRepository::new(pool.clone());
        let owner = UserId("U-4".to_string());
        let stranger = UserId("U-5".to_string());
        let start = parse_ts("2024-03-02T08:00:00Z");

        let older = Session::open(owner.clone(), Some("Primera".to_string()), start);
        let newer = Session::open(owner.clone(), None, start + Duration::minutes(5));
        repo.create(older.clone()).await.expect("create older");
        repo.create(newer.clone()).await.expect("create newer");
        repo.append_message(ChatMessage::from_user(
            older.id.clone(),
            &owner,
            "reactivar",
            start + Duration::minutes(10),
        ))
        .await
        .expect("append to older");

        let listed = repo.list_for_user(&owner).await.expect("list");
        let ids: Vec<&SessionId> = listed.iter().map(|s| &s.id).collect();
        assert_eq!(ids, vec![&older.id, &newer.id]);
        assert_eq!(listed[1].display_title(), "Conversación");

        assert!(repo.find_active_for_user(&older.id, &stranger).await.expect("find").is_none());
        assert!(!repo.close(&older.id, &stranger, start).await.expect("close as stranger"));
        assert!(repo.close(&older.id, &owner, start + Duration::hours(1)).await.expect("close"));
        assert!(!repo.close(&older.id, &owner, start).await.expect("close twice"));
        assert!(repo.find_active_for_user(&older.id, &owner).await.expect("find").is_none());

        let still_listed = repo.list_for_user(&owner).await.expect("list after close");
        assert_eq!(still_listed.len(), 2);
        assert!(still_listed.iter().any(|s| s.id == older.id && !s.is_active));

        assert!(!repo.delete(&older.id, &stranger).await.expect("delete as stranger"));
        assert!(repo.delete(&older.id, &owner).await.expect("delete"));
        assert!(repo.find_by_id(&older.id).await.expect("find deleted").is_none());
        assert!(repo.transcript(&older.id).await.expect("transcript").is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn sql_session_repo_rejects_append_to_missing_session() {
        let pool = setup_pool().await;
        let repo = SqlSessionRepository::new(pool.clone());
        let message = ChatMessage::from_user(
            SessionId("missing".to_string()),
            &UserId("U-6".to_string()),
            "hola",
            Utc::now(),
        );

        let error = repo.append_message(message).await.expect_err("append should fail");
        assert!(matches!(error, RepositoryError::NotFound(_)));

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
