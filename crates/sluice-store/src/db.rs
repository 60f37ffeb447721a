use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::warn;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ingested_events (
    event_id TEXT PRIMARY KEY,
    timestamp_ms BIGINT NOT NULL,
    payload JSONB NOT NULL,
    ingested_at TIMESTAMPTZ DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS worker_checkpoints (
    worker_id INT PRIMARY KEY,
    chunk_start_ts BIGINT,
    chunk_end_ts BIGINT,
    cursor TEXT NULL,
    last_ts BIGINT NULL,
    fetched_count BIGINT DEFAULT 0,
    inserted_count BIGINT DEFAULT 0,
    status TEXT DEFAULT 'running',
    updated_at TIMESTAMPTZ DEFAULT NOW()
);
"#;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Session-level `synchronous_commit` value, `on` or `off`.
    pub synchronous_commit: String,
}

/// Build the shared pool. Every pooled connection applies the session
/// settings on connect; a failure there is logged and tolerated so an
/// unusual Postgres configuration cannot take the whole run down.
pub async fn connect_pool(cfg: &StoreConfig) -> Result<PgPool> {
    let session_stmt = format!(
        "SET synchronous_commit = '{}'",
        if cfg.synchronous_commit == "on" { "on" } else { "off" }
    );

    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections.max(1))
        .after_connect(move |conn, _meta| {
            let stmt = session_stmt.clone();
            Box::pin(async move {
                if let Err(err) = conn.execute(stmt.as_str()).await {
                    warn!("failed to apply session settings ({stmt}): {err}");
                }
                Ok(())
            })
        })
        .connect(&cfg.database_url)
        .await
        .context("failed to connect to postgres")?;

    Ok(pool)
}

/// Create both tables if they do not exist. Safe to run on every start.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    // Postgres prepares one statement at a time, so split on ';'.
    for stmt in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .with_context(|| format!("failed schema statement: {}", first_line(stmt)))?;
    }
    Ok(())
}

fn first_line(stmt: &str) -> &str {
    stmt.lines().next().unwrap_or(stmt)
}

#[cfg(test)]
mod tests {
    use super::{first_line, SCHEMA};

    #[test]
    fn schema_splits_into_two_statements() {
        let statements: Vec<&str> = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("ingested_events"));
        assert!(statements[1].contains("worker_checkpoints"));
    }

    #[test]
    fn first_line_trims_to_the_create_clause() {
        assert_eq!(
            first_line("CREATE TABLE IF NOT EXISTS x (\n  y INT\n)"),
            "CREATE TABLE IF NOT EXISTS x ("
        );
    }
}
