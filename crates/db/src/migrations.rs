use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Number of embedded migrations that have been applied to `pool`.
pub async fn applied_count(pool: &DbPool) -> Result<i64, sqlx::Error> {
    let table_exists: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations'",
    )
    .fetch_one(pool)
    .await?;
    if table_exists == 0 {
        return Ok(0);
    }
    sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
        .fetch_one(pool)
        .await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::{applied_count, run_pending};
    use crate::{connect_with_settings, migrations::MIGRATOR};

    const MANAGED_SCHEMA_OBJECTS: &[&str] = &[
        "chat_sessions",
        "chat_messages",
        "chat_rate_limits",
        "role_contexts",
        "system_guides",
        "database_access_policies",
        "context_base",
        "quick_help",
        "idx_chat_sessions_user_updated",
        "idx_chat_messages_session_created",
        "idx_chat_rate_limits_window_start",
        "idx_system_guides_priority",
        "idx_quick_help_role_active",
    ];

    #[tokio::test]
    async fn migrations_create_chat_and_context_tables() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        assert_eq!(applied_count(&pool).await.expect("count before"), 0);
        run_pending(&pool).await.expect("run migrations");

        for table in [
            "chat_sessions",
            "chat_messages",
            "chat_rate_limits",
            "role_contexts",
            "system_guides",
            "database_access_policies",
            "context_base",
            "quick_help",
        ] {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .expect("check table");
            assert_eq!(count, 1, "missing table {table}");
        }

        assert_eq!(applied_count(&pool).await.expect("count after"), 4);
    }

    #[tokio::test]
    async fn message_role_and_session_reference_are_enforced() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let orphan = sqlx::query(
            "INSERT INTO chat_messages (id, session_id, role, content, created_at)
             VALUES ('m-1', 'missing', 'user', 'hola', '2024-01-01T00:00:00.000000Z')",
        )
        .execute(&pool)
        .await;
        assert!(orphan.is_err(), "messages must reference an existing session");

        sqlx::query(
            "INSERT INTO chat_sessions (id, user_id, title, is_active, created_at, updated_at)
             VALUES ('s-1', 'u-1', NULL, 1, '2024-01-01T00:00:00.000000Z', '2024-01-01T00:00:00.000000Z')",
        )
        .execute(&pool)
        .await
        .expect("insert session");

        let bad_role = sqlx::query(
            "INSERT INTO chat_messages (id, session_id, role, content, created_at)
             VALUES ('m-2', 's-1', 'robot', 'hola', '2024-01-01T00:00:00.000000Z')",
        )
        .execute(&pool)
        .await;
        assert!(bad_role.is_err(), "role outside user/assistant/system must be rejected");
    }

    #[tokio::test]
    async fn migrations_are_reversible() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        let remaining = sqlx::query(
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name LIKE 'chat_%'",
        )
        .fetch_one(&pool)
        .await
        .expect("check chat tables removed")
        .get::<i64, _>("count");

        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn migrations_up_down_up_preserves_schema_signature() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let initial_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            initial_signature.len(),
            MANAGED_SCHEMA_OBJECTS.len(),
            "initial migration pass should create all managed schema objects",
        );

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");
        assert!(
            managed_schema_signature(&pool).await.is_empty(),
            "managed schema objects should be removed after full undo",
        );

        run_pending(&pool).await.expect("re-run migrations");
        assert_eq!(
            managed_schema_signature(&pool).await,
            initial_signature,
            "up/down/up should preserve migration-managed schema signature",
        );
    }

    async fn managed_schema_signature(pool: &sqlx::SqlitePool) -> Vec<(String, String, String)> {
        let mut signature: Vec<(String, String, String)> = sqlx::query(
            "SELECT type, name, IFNULL(sql, '') AS sql
             FROM sqlite_master
             WHERE type IN ('table', 'index')",
        )
        .fetch_all(pool)
        .await
        .expect("load schema objects")
        .into_iter()
        .filter_map(|row| {
            let name = row.get::<String, _>("name");
            if MANAGED_SCHEMA_OBJECTS.contains(&name.as_str()) {
                Some((row.get::<String, _>("type"), name, row.get::<String, _>("sql")))
            } else {
                None
            }
        })
        .collect();
        signature.sort();
        signature
    }
}
