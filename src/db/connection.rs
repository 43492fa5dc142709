//! Database connection management using sqlx

use crate::config::DatabaseConfig;
use crate::error::{EngineError, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Open a pool whose sessions default to read-only transactions and carry
/// the configured statement timeout.
pub async fn connect_read_only(config: &DatabaseConfig) -> Result<PgPool> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| EngineError::Config("DATABASE_URL is not set".to_string()))?;

    let options = read_only_options(url, config.statement_timeout_ms)?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await
        .map_err(|e| EngineError::Config(format!("Failed to connect to database: {}", e)))?;

    // Test the connection
    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| EngineError::Config(format!("Database connection check failed: {}", e)))?;

    info!(max_connections = config.max_connections, "Connected to relational store (read-only)");
    Ok(pool)
}

fn read_only_options(url: &str, statement_timeout_ms: u64) -> Result<PgConnectOptions> {
    let options = PgConnectOptions::from_str(url)
        .map_err(|e| EngineError::Config(format!("Invalid DATABASE_URL: {}", e)))?
        .options([
            ("default_transaction_read_only", "on".to_string()),
            ("statement_timeout", statement_timeout_ms.to_string()),
        ]);
    Ok(options)
}
