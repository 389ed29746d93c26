//! Read-only access to the relational store that generated SQL runs against.
//!
//! Each call opens its own connection and closes it before returning, whatever the outcome.
//! Rows come back as column-name keyed JSON objects so they can be handed verbatim to a prompt.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection, Row, TypeInfo, ValueRef};
use thiserror::Error;

pub type ResultRow = Map<String, Value>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryRows {
    pub rows: Vec<ResultRow>,
    /// True when the statement produced more rows than the cap.
    pub truncated: bool,
}

#[derive(Debug, Error)]
pub enum ReportingError {
    #[error("invalid reporting store url: {0}")]
    InvalidUrl(#[source] sqlx::Error),
    #[error("could not connect to reporting store: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("query exceeded {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn fetch_rows(
        &self,
        sql: &str,
        max_rows: usize,
        timeout: Duration,
    ) -> Result<QueryRows, ReportingError>;
}

pub struct SqliteRelationalStore {
    options: SqliteConnectOptions,
}

impl SqliteRelationalStore {
    pub fn new(url: &str) -> Result<Self, ReportingError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(ReportingError::InvalidUrl)?
            .read_only(true);
        Ok(Self { options })
    }

    /// Opens and closes one connection to prove the store is reachable.
    pub async fn ping(&self) -> Result<(), ReportingError> {
        let connection = self.options.connect().await.map_err(ReportingError::Connect)?;
        connection.close().await.map_err(ReportingError::Connect)
    }
}

#[async_trait]
impl RelationalStore for SqliteRelationalStore {
    async fn fetch_rows(
        &self,
        sql: &str,
        max_rows: usize,
        timeout: Duration,
    ) -> Result<QueryRows, ReportingError> {
        let mut connection: SqliteConnection =
            self.options.connect().await.map_err(ReportingError::Connect)?;

        let fetched =
            tokio::time::timeout(timeout, collect_capped(&mut connection, sql, max_rows)).await;
        let closed = connection.close().await;

        let (rows, truncated) = match fetched {
            Err(_) => return Err(ReportingError::Timeout(timeout)),
            Ok(Err(error)) => return Err(ReportingError::Query(error)),
            Ok(Ok(collected)) => collected,
        };
        if let Err(error) = closed {
            tracing::warn!(
                event_name = "reporting.connection.close_failed",
                error = %error,
                "reporting connection did not close cleanly"
            );
        }

        Ok(QueryRows { rows, truncated })
    }
}

/// Streams at most `max_rows + 1` rows; the extra row only marks the result as truncated.
async fn collect_capped(
    connection: &mut SqliteConnection,
    sql: &str,
    max_rows: usize,
) -> Result<(Vec<ResultRow>, bool), sqlx::Error> {
    let mut stream = sqlx::query(sql).fetch(connection);
    let mut rows = Vec::new();
    while let Some(row) = stream.try_next().await? {
        if rows.len() == max_rows {
            return Ok((rows, true));
        }
        rows.push(row_to_json(&row)?);
    }
    Ok((rows, false))
}

fn row_to_json(row: &SqliteRow) -> Result<ResultRow, sqlx::Error> {
    let mut record = Map::new();
    for column in row.columns() {
        let value = column_value(row, column.ordinal())?;
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

fn column_value(row: &SqliteRow, index: usize) -> Result<Value, sqlx::Error> {
    let type_name = {
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        raw.type_info().name().to_ascii_uppercase()
    };

    let value = match type_name.as_str() {
        "INTEGER" | "INT" | "INT8" | "BIGINT" => Value::from(row.try_get::<i64, _>(index)?),
        "BOOLEAN" => Value::Bool(row.try_get::<bool, _>(index)?),
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
            let number = row.try_get::<f64, _>(index)?;
            serde_json::Number::from_f64(number).map(Value::Number).unwrap_or(Value::Null)
        }
        "BLOB" => {
            let bytes = row.try_get::<Vec<u8>, _>(index)?;
            Value::String(format!("<{} bytes>", bytes.len()))
        }
        _ => Value::String(row.try_get::<String, _>(index)?),
    };
    Ok(value)
}
