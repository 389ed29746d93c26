use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use concierge_core::domain::context::{
    ContextBaseEntry, DatabaseAccessPolicy, QueryLimits, QuickHelpItem, QuickHelpSet, RoleContext,
    SystemGuide, UpsertAction, ALL_ROLES,
};

use super::{decode_json, encode_json, encode_timestamp, ContextRepository, RepositoryError};
use crate::DbPool;

pub struct SqlContextRepository {
    pool: DbPool,
}

impl SqlContextRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn decode_err(error: sqlx::Error) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &SqliteRow,
    column: &str,
) -> Result<T, RepositoryError> {
    let raw: String = row.try_get(column).map_err(decode_err)?;
    decode_json(column, &raw)
}

fn row_to_role_context(row: &SqliteRow) -> Result<RoleContext, RepositoryError> {
    let metadata_json: Option<String> = row.try_get("metadata_json").map_err(decode_err)?;
    Ok(RoleContext {
        role_code: row.try_get("role_code").map_err(decode_err)?,
        name: row.try_get("name").map_err(decode_err)?,
        description: row.try_get("description").map_err(decode_err)?,
        capabilities: json_column(row, "capabilities_json")?,
        common_queries: json_column(row, "common_queries_json")?,
        workflows: json_column(row, "workflows_json")?,
        metadata: metadata_json.map(|raw| decode_json("metadata_json", &raw)).transpose()?,
        is_active: row.try_get("is_active").map_err(decode_err)?,
    })
}

fn row_to_guide(row: &SqliteRow) -> Result<SystemGuide, RepositoryError> {
    let priority: i64 = row.try_get("priority").map_err(decode_err)?;
    Ok(SystemGuide {
        key: row.try_get("guide_key").map_err(decode_err)?,
        title: row.try_get("title").map_err(decode_err)?,
        applicable_roles: json_column(row, "applicable_roles_json")?,
        steps: json_column(row, "steps_json")?,
        description: row.try_get("description").map_err(decode_err)?,
        priority: i32::try_from(priority)
            .map_err(|_| RepositoryError::Decode(format!("priority out of range: {priority}")))?,
        is_active: row.try_get("is_active").map_err(decode_err)?,
    })
}

fn row_to_policy(row: &SqliteRow) -> Result<DatabaseAccessPolicy, RepositoryError> {
    let max_rows: i64 = row.try_get("max_rows").map_err(decode_err)?;
    let max_joins: i64 = row.try_get("max_joins").map_err(decode_err)?;
    let timeout_seconds: Option<i64> = row.try_get("timeout_seconds").map_err(decode_err)?;
    let out_of_range = |column: &str| RepositoryError::Decode(format!("{column} out of range"));

    Ok(DatabaseAccessPolicy {
        role_code: row.try_get("role_code").map_err(decode_err)?,
        allowed_tables: json_column(row, "allowed_tables_json")?,
        schema_description: row.try_get("schema_description").map_err(decode_err)?,
        restricted_columns: json_column(row, "restricted_columns_json")?,
        allowed_operations: json_column(row, "allowed_operations_json")?,
        query_limits: QueryLimits {
            max_rows: u32::try_from(max_rows).map_err(|_| out_of_range("max_rows"))?,
            max_joins: u32::try_from(max_joins).map_err(|_| out_of_range("max_joins"))?,
            timeout_seconds: timeout_seconds
                .map(|value| u64::try_from(value).map_err(|_| out_of_range("timeout_seconds")))
                .transpose()?,
        },
        is_active: row.try_get("is_active").map_err(decode_err)?,
    })
}

fn row_to_context_base(row: &SqliteRow) -> Result<ContextBaseEntry, RepositoryError> {
    Ok(ContextBaseEntry {
        key: row.try_get("context_key").map_err(decode_err)?,
        value: json_column(row, "value_json")?,
        description: row.try_get("description").map_err(decode_err)?,
        is_active: row.try_get("is_active").map_err(decode_err)?,
    })
}

fn row_to_quick_help(row: &SqliteRow) -> Result<QuickHelpItem, RepositoryError> {
    let order: i64 = row.try_get("sort_order").map_err(decode_err)?;
    Ok(QuickHelpItem {
        id: row.try_get("id").map_err(decode_err)?,
        role_code: row.try_get("role_code").map_err(decode_err)?,
        question: row.try_get("question").map_err(decode_err)?,
        order: u32::try_from(order)
            .map_err(|_| RepositoryError::Decode(format!("sort_order out of range: {order}")))?,
        keywords: json_column(row, "keywords_json")?,
        is_active: row.try_get("is_active").map_err(decode_err)?,
    })
}

/// True when `table` already holds a row whose `column` equals `key`.
async fn key_exists(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    table: &str,
    column: &str,
    key: &str,
) -> Result<bool, RepositoryError> {
    let found: Option<i64> =
        sqlx::query_scalar(&format!("SELECT 1 FROM {table} WHERE {column} = ?"))
            .bind(key)
            .fetch_optional(&mut **tx)
            .await?;
    Ok(found.is_some())
}

const GUIDE_COLUMNS: &str =
    "guide_key, title, applicable_roles_json, steps_json, description, priority, is_active";

#[async_trait::async_trait]
impl ContextRepository for SqlContextRepository {
    async fn role_context(&self, role_code: &str) -> Result<Option<RoleContext>, RepositoryError> {
        let row = sqlx::query(
            "SELECT role_code, name, description, capabilities_json, common_queries_json,
                    workflows_json, metadata_json, is_active
             FROM role_contexts
             WHERE role_code = ? AND is_active = 1",
        )
        .bind(role_code)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_role_context).transpose()
    }

    async fn guides_for_role(&self, role_code: &str) -> Result<Vec<SystemGuide>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {GUIDE_COLUMNS}
             FROM system_guides g
             WHERE g.is_active = 1
               AND EXISTS (
                   SELECT 1 FROM json_each(g.applicable_roles_json) r
                   WHERE r.value = ? OR r.value = ?
               )
             ORDER BY g.priority DESC, g.title ASC"
        ))
        .bind(role_code)
        .bind(ALL_ROLES)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_guide).collect()
    }

    async fn guide_by_key(&self, key: &str) -> Result<Option<SystemGuide>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {GUIDE_COLUMNS} FROM system_guides WHERE guide_key = ? AND is_active = 1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_guide).transpose()
    }

    async fn access_policy(
        &self,
        role_code: &str,
    ) -> Result<Option<DatabaseAccessPolicy>, RepositoryError> {
        let row = sqlx::query(
            "SELECT role_code, allowed_tables_json, schema_description, restricted_columns_json,
                    allowed_operations_json, max_rows, max_joins, timeout_seconds, is_active
             FROM database_access_policies
             WHERE role_code = ? AND is_active = 1",
        )
        .bind(role_code)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_policy).transpose()
    }

    async fn context_base(&self, key: &str) -> Result<Option<ContextBaseEntry>, RepositoryError> {
        let row = sqlx::query(
            "SELECT context_key, value_json, description, is_active
             FROM context_base
             WHERE context_key = ? AND is_active = 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_context_base).transpose()
    }

    async fn active_context_base(&self) -> Result<Vec<ContextBaseEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT context_key, value_json, description, is_active
             FROM context_base
             WHERE is_active = 1
             ORDER BY context_key ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_context_base).collect()
    }

    async fn quick_help_for_role(
        &self,
        role_code: &str,
    ) -> Result<Vec<QuickHelpItem>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, role_code, question, sort_order, keywords_json, is_active
             FROM quick_help
             WHERE role_code = ? AND is_active = 1
             ORDER BY sort_order ASC, id ASC",
        )
        .bind(role_code)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_quick_help).collect()
    }

    async fn upsert_role_context(
        &self,
        context: RoleContext,
    ) -> Result<UpsertAction, RepositoryError> {
        let metadata_json = context.metadata.as_ref().map(encode_json).transpose()?;
        let mut tx = self.pool.begin().await?;
        let existed = key_exists(&mut tx, "role_contexts", "role_code", &context.role_code).await?;
        sqlx::query(
            "INSERT INTO role_contexts
                (role_code, name, description, capabilities_json, common_queries_json,
                 workflows_json, metadata_json, is_active, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(role_code) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                capabilities_json = excluded.capabilities_json,
                common_queries_json = excluded.common_queries_json,
                workflows_json = excluded.workflows_json,
                metadata_json = excluded.metadata_json,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at",
        )
        .bind(&context.role_code)
        .bind(&context.name)
        .bind(&context.description)
        .bind(encode_json(&context.capabilities)?)
        .bind(encode_json(&context.common_queries)?)
        .bind(encode_json(&context.workflows)?)
        .bind(metadata_json)
        .bind(context.is_active)
        .bind(encode_timestamp(Utc::now()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(UpsertAction::from_existing(existed))
    }

    async fn upsert_guide(&self, guide: SystemGuide) -> Result<UpsertAction, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let existed = key_exists(&mut tx, "system_guides", "guide_key", &guide.key).await?;
        sqlx::query(
            "INSERT INTO system_guides
                (guide_key, title, applicable_roles_json, steps_json, description, priority,
                 is_active, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(guide_key) DO UPDATE SET
                title = excluded.title,
                applicable_roles_json = excluded.applicable_roles_json,
                steps_json = excluded.steps_json,
                description = excluded.description,
                priority = excluded.priority,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at",
        )
        .bind(&guide.key)
        .bind(&guide.title)
        .bind(encode_json(&guide.applicable_roles)?)
        .bind(encode_json(&guide.steps)?)
        .bind(&guide.description)
        .bind(i64::from(guide.priority))
        .bind(guide.is_active)
        .bind(encode_timestamp(Utc::now()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(UpsertAction::from_existing(existed))
    }

    async fn upsert_access_policy(
        &self,
        policy: DatabaseAccessPolicy,
    ) -> Result<UpsertAction, RepositoryError> {
        let timeout_seconds = policy
            .query_limits
            .timeout_seconds
            .map(|value| i64::try_from(value).unwrap_or(i64::MAX));
        let mut tx = self.pool.begin().await?;
        let existed =
            key_exists(&mut tx, "database_access_policies", "role_code", &policy.role_code).await?;
        sqlx::query(
            "INSERT INTO database_access_policies
                (role_code, allowed_tables_json, schema_description, restricted_columns_json,
                 allowed_operations_json, max_rows, max_joins, timeout_seconds, is_active,
                 updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(role_code) DO UPDATE SET
                allowed_tables_json = excluded.allowed_tables_json,
                schema_description = excluded.schema_description,
                restricted_columns_json = excluded.restricted_columns_json,
                allowed_operations_json = excluded.allowed_operations_json,
                max_rows = excluded.max_rows,
                max_joins = excluded.max_joins,
                timeout_seconds = excluded.timeout_seconds,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at",
        )
        .bind(&policy.role_code)
        .bind(encode_json(&policy.allowed_tables)?)
        .bind(&policy.schema_description)
        .bind(encode_json(&policy.restricted_columns)?)
        .bind(encode_json(&policy.allowed_operations)?)
        .bind(i64::from(policy.query_limits.max_rows))
        .bind(i64::from(policy.query_limits.max_joins))
        .bind(timeout_seconds)
        .bind(policy.is_active)
        .bind(encode_timestamp(Utc::now()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(UpsertAction::from_existing(existed))
    }

    async fn upsert_context_base(
        &self,
        entry: ContextBaseEntry,
    ) -> Result<UpsertAction, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let existed = key_exists(&mut tx, "context_base", "context_key", &entry.key).await?;
        // An omitted description keeps the stored one.
        sqlx::query(
            "INSERT INTO context_base (context_key, value_json, description, is_active, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(context_key) DO UPDATE SET
                value_json = excluded.value_json,
                description = COALESCE(excluded.description, context_base.description),
                is_active = excluded.is_active,
                updated_at = excluded.updated_at",
        )
        .bind(&entry.key)
        .bind(encode_json(&entry.value)?)
        .bind(&entry.description)
        .bind(entry.is_active)
        .bind(encode_timestamp(Utc::now()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(UpsertAction::from_existing(existed))
    }

    async fn replace_quick_help(
        &self,
        set: QuickHelpSet,
    ) -> Result<Vec<QuickHelpItem>, RepositoryError> {
        let keywords_json = encode_json(&set.keywords)?;
        let updated_at = encode_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM quick_help WHERE role_code = ?")
            .bind(&set.role_code)
            .execute(&mut *tx)
            .await?;

        let mut items = Vec::with_capacity(set.questions.len());
        for (index, question) in set.questions.into_iter().enumerate() {
            let order = u32::try_from(index + 1).unwrap_or(u32::MAX);
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO quick_help
                    (role_code, question, sort_order, keywords_json, is_active, updated_at)
                 VALUES (?, ?, ?, ?, 1, ?)
                 RETURNING id",
            )
            .bind(&set.role_code)
            .bind(&question)
            .bind(i64::from(order))
            .bind(&keywords_json)
            .bind(&updated_at)
            .fetch_one(&mut *tx)
            .await?;
            items.push(QuickHelpItem {
                id,
                role_code: set.role_code.clone(),
                question,
                order,
                keywords: set.keywords.clone(),
                is_active: true,
            });
        }

        tx.commit().await?;
        Ok(items)
    }
}
