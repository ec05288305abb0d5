//! SQLite pool setup and the embedded schema migration.

use anyhow::{Context, Result};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr};

const MIGRATION_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Open a pool for `database_url`, creating the database file and its parent
/// directory when missing.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let db_path = db_path.split('?').next().unwrap_or(db_path);
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if db_path != ":memory:" {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url `{database_url}`"))?
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {database_url}"))
}

/// Apply the embedded schema. Statements are idempotent.
pub async fn run_migrations(db: &SqlitePool) -> Result<()> {
    let statements = MIGRATION_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}
