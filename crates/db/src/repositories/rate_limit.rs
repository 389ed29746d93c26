use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use concierge_core::domain::user::UserId;
use concierge_core::rate_limit::{window_start, ConsumeOutcome, RateWindow, RoleRateLimit};

use super::{decode_timestamp, encode_timestamp, RateWindowRepository, RepositoryError};
use crate::DbPool;

pub struct SqlRateWindowRepository {
    pool: DbPool,
}

impl SqlRateWindowRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_window(row: &SqliteRow) -> Result<RateWindow, RepositoryError> {
    let decode = |error: sqlx::Error| RepositoryError::Decode(error.to_string());
    let user_id: String = row.try_get("user_id").map_err(decode)?;
    let window_start: String = row.try_get("window_start").map_err(decode)?;
    let request_count: i64 = row.try_get("request_count").map_err(decode)?;
    let is_blocked: bool = row.try_get("is_blocked").map_err(decode)?;
    let blocked_until: Option<String> = row.try_get("blocked_until").map_err(decode)?;

    Ok(RateWindow {
        user_id: UserId(user_id),
        window_start: decode_timestamp(&window_start)?,
        request_count: u32::try_from(request_count).map_err(|_| {
            RepositoryError::Decode(format!("request_count out of range: {request_count}"))
        })?,
        is_blocked,
        blocked_until: blocked_until.as_deref().map(decode_timestamp).transpose()?,
    })
}

#[async_trait::async_trait]
impl RateWindowRepository for SqlRateWindowRepository {
    async fn find(
        &self,
        user_id: &UserId,
        window_start: DateTime<Utc>,
    ) -> Result<Option<RateWindow>, RepositoryError> {
        let row = sqlx::query(
            "SELECT user_id, window_start, request_count, is_blocked, blocked_until
             FROM chat_rate_limits
             WHERE user_id = ? AND window_start = ?",
        )
        .bind(&user_id.0)
        .bind(encode_timestamp(window_start))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_window).transpose()
    }

    async fn save(&self, window: RateWindow) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO chat_rate_limits
                (user_id, window_start, request_count, is_blocked, blocked_until)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id, window_start) DO UPDATE SET
                request_count = excluded.request_count,
                is_blocked = excluded.is_blocked,
                blocked_until = excluded.blocked_until",
        )
        .bind(&window.user_id.0)
        .bind(encode_timestamp(window.window_start))
        .bind(i64::from(window.request_count))
        .bind(window.is_blocked)
        .bind(window.blocked_until.map(encode_timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume(
        &self,
        user_id: &UserId,
        points: u32,
        limits: &RoleRateLimit,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, RepositoryError> {
        let start = encode_timestamp(window_start(now));
        let now_text = encode_timestamp(now);
        let limit = i64::from(limits.max_requests_per_hour);
        let points = i64::from(points);
        let blocked_until =
            encode_timestamp(now + Duration::minutes(i64::from(limits.block_duration_minutes)));

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE chat_rate_limits
             SET is_blocked = 0, blocked_until = NULL
             WHERE user_id = ? AND window_start = ? AND is_blocked = 1
               AND (blocked_until IS NULL OR blocked_until <= ?)",
        )
        .bind(&user_id.0)
        .bind(&start)
        .bind(&now_text)
        .execute(&mut *tx)
        .await?;

        // The conflict branch only fires for unblocked windows; a blocked window yields no row.
        let counted = sqlx::query(
            "INSERT INTO chat_rate_limits
                (user_id, window_start, request_count, is_blocked, blocked_until)
             VALUES (
                ?, ?, ?,
                CASE WHEN ? >= ? THEN 1 ELSE 0 END,
                CASE WHEN ? >= ? THEN ? ELSE NULL END
             )
             ON CONFLICT(user_id, window_start) DO UPDATE SET
                request_count = request_count + excluded.request_count,
                is_blocked = CASE WHEN request_count + excluded.request_count >= ? THEN 1 ELSE 0 END,
                blocked_until = CASE WHEN request_count + excluded.request_count >= ? THEN ? ELSE NULL END
             WHERE is_blocked = 0
             RETURNING request_count, is_blocked",
        )
        .bind(&user_id.0)
        .bind(&start)
        .bind(points)
        .bind(points)
        .bind(limit)
        .bind(points)
        .bind(limit)
        .bind(&blocked_until)
        .bind(limit)
        .bind(limit)
        .bind(&blocked_until)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match counted {
            Some(row) => {
                let request_count: i64 = row
                    .try_get("request_count")
                    .map_err(|e| RepositoryError::Decode(e.to_string()))?;
                let blocked: bool =
                    row.try_get("is_blocked").map_err(|e| RepositoryError::Decode(e.to_string()))?;
                ConsumeOutcome::Counted {
                    request_count: u32::try_from(request_count).unwrap_or(u32::MAX),
                    blocked,
                }
            }
            None => {
                let blocked_until = sqlx::query_scalar::<_, Option<String>>(
                    "SELECT blocked_until FROM chat_rate_limits
                     WHERE user_id = ? AND window_start = ?",
                )
                .bind(&user_id.0)
                .bind(&start)
                .fetch_optional(&mut *tx)
                .await?
                .flatten();
                ConsumeOutcome::Ignored {
                    blocked_until: blocked_until.as_deref().map(decode_timestamp).transpose()?,
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM chat_rate_limits WHERE window_start < ?")
            .bind(encode_timestamp(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_for_user(&self, user_id: &UserId) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM chat_rate_limits WHERE user_id = ?")
            .bind(&user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
