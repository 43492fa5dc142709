//! Query Executor
//!
//! Runs a validated query against a `QueryBackend` with a hard timeout and
//! hands the raw rows to the normalizer.

use crate::error::{EngineError, Result};
use crate::execution::result::{RawTable, RawValue};
use crate::normalizer::{normalize, Normalized};
use crate::translator::TranslatedQuery;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Row, TypeInfo};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Relational store capability: one query string in, rows out
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn fetch(&self, sql: &str, row_cap: u64) -> Result<RawTable>;
}

pub struct QueryExecutor {
    backend: Arc<dyn QueryBackend>,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(backend: Arc<dyn QueryBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Execute and normalize. Backend failures are never turned into an empty result.
    pub async fn execute(&self, query: &TranslatedQuery, row_cap: u64) -> Result<Normalized> {
        let cap = row_cap.min(query.row_limit);
        let start = Instant::now();

        let raw = match tokio::time::timeout(self.timeout, self.backend.fetch(&query.sql, cap)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                let e = match e {
                    timeout @ EngineError::QueryTimeout { .. } => timeout,
                    execution @ EngineError::QueryExecution { .. } => execution,
                    other => EngineError::QueryExecution {
                        query: query.sql.clone(),
                        message: other.to_string(),
                    },
                };
                error!(query = %query.sql, error = %e, "Query failed");
                return Err(e);
            }
            Err(_) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                error!(query = %query.sql, timeout_ms, "Query timed out");
                return Err(EngineError::QueryTimeout {
                    timeout_ms,
                    query: query.sql.clone(),
                });
            }
        };

        debug!(
            rows = raw.row_count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Query executed"
        );
        Ok(normalize(raw))
    }
}

/// PostgreSQL backend over a read-only pool
pub struct PgBackend {
    pool: PgPool,
    statement_timeout_ms: u64,
}

impl PgBackend {
    pub fn new(pool: PgPool, statement_timeout_ms: u64) -> Self {
        Self {
            pool,
            statement_timeout_ms,
        }
    }
}

#[async_trait]
impl QueryBackend for PgBackend {
    async fn fetch(&self, sql: &str, row_cap: u64) -> Result<RawTable> {
        let db_error = |e: sqlx::Error| EngineError::QueryExecution {
            query: sql.to_string(),
            message: e.to_string(),
        };

        let mut tx = self.pool.begin().await.map_err(db_error)?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", self.statement_timeout_ms))
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        let rows = sqlx::query(sql).fetch_all(&mut *tx).await.map_err(|e| {
            if is_statement_timeout(&e) {
                EngineError::QueryTimeout {
                    timeout_ms: self.statement_timeout_ms,
                    query: sql.to_string(),
                }
            } else {
                db_error(e)
            }
        })?;
        tx.rollback().await.map_err(db_error)?;

        let mut table = RawTable::new(
            rows.first()
                .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
                .unwrap_or_default(),
        );
        for row in rows.iter().take(row_cap as usize) {
            table.push_row(decode_row(row));
        }
        Ok(table)
    }
}

/// SQLSTATE 57014 is query_canceled, raised when statement_timeout fires
fn is_statement_timeout(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("57014"),
        _ => false,
    }
}

fn decode_row(row: &PgRow) -> Vec<RawValue> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(index, column)| decode_cell(row, index, column.type_info().name()))
        .collect()
}

fn decode_cell(row: &PgRow, index: usize, type_name: &str) -> RawValue {
    fn get<'r, T, W>(row: &'r PgRow, index: usize, wrap: W, type_name: &str) -> RawValue
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
        W: FnOnce(T) -> RawValue,
    {
        match row.try_get::<Option<T>, _>(index) {
            Ok(Some(value)) => wrap(value),
            Ok(None) => RawValue::Null,
            Err(_) => RawValue::Undecodable {
                type_name: type_name.to_string(),
            },
        }
    }

    match type_name {
        "BOOL" => get::<bool, _>(row, index, RawValue::Bool, type_name),
        "INT2" => get::<i16, _>(row, index, |v| RawValue::Int(v as i64), type_name),
        "INT4" => get::<i32, _>(row, index, |v| RawValue::Int(v as i64), type_name),
        "INT8" => get::<i64, _>(row, index, RawValue::Int, type_name),
        "FLOAT4" => get::<f32, _>(row, index, |v| RawValue::Float(v as f64), type_name),
        "FLOAT8" => get::<f64, _>(row, index, RawValue::Float, type_name),
        "NUMERIC" => get::<rust_decimal::Decimal, _>(row, index, |v| RawValue::Decimal(v.to_string()), type_name),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" => get::<String, _>(row, index, RawValue::Text, type_name),
        "UUID" => get::<uuid::Uuid, _>(row, index, |v| RawValue::Text(v.to_string()), type_name),
        "BYTEA" => get::<Vec<u8>, _>(row, index, RawValue::Bytes, type_name),
        "TIMESTAMP" => get::<NaiveDateTime, _>(row, index, RawValue::Timestamp, type_name),
        "TIMESTAMPTZ" => get::<DateTime<Utc>, _>(row, index, RawValue::TimestampTz, type_name),
        "DATE" => get::<NaiveDate, _>(row, index, RawValue::Date, type_name),
        "JSON" | "JSONB" => get::<serde_json::Value, _>(row, index, RawValue::Json, type_name),
        other => RawValue::Undecodable {
            type_name: other.to_string(),
        },
    }
}
