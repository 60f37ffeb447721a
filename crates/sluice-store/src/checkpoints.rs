use crate::domain::{CheckpointStatus, WorkerCheckpoint};
use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};

/// Load every checkpoint, ordered by worker id.
pub async fn load_all(pool: &PgPool) -> Result<Vec<WorkerCheckpoint>> {
    let rows = sqlx::query(
        "SELECT worker_id, chunk_start_ts, chunk_end_ts, cursor, last_ts, \
                fetched_count, inserted_count, status \
         FROM worker_checkpoints ORDER BY worker_id",
    )
    .fetch_all(pool)
    .await
    .context("failed to load checkpoints")?;

    rows.iter().map(checkpoint_from_row).collect()
}

/// Seed one row per chunk. Existing rows are left untouched so a restart
/// resumes rather than resets.
pub async fn initialize(pool: &PgPool, chunks: &[(i32, i64, i64)]) -> Result<()> {
    for &(worker_id, start_ts, end_ts) in chunks {
        sqlx::query(
            "INSERT INTO worker_checkpoints (worker_id, chunk_start_ts, chunk_end_ts) \
             VALUES ($1, $2, $3) ON CONFLICT (worker_id) DO NOTHING",
        )
        .bind(worker_id)
        .bind(start_ts)
        .bind(end_ts)
        .execute(pool)
        .await
        .with_context(|| format!("failed to initialize checkpoint {worker_id}"))?;
    }
    Ok(())
}

/// Discard all checkpoints. Used when the partition count changed and prior
/// chunk boundaries no longer line up.
pub async fn reset_all(pool: &PgPool) -> Result<()> {
    sqlx::query("TRUNCATE worker_checkpoints")
        .execute(pool)
        .await
        .context("failed to reset checkpoints")?;
    Ok(())
}

/// Write every mutable column. Runs on the caller's connection so the update
/// commits atomically with the batch it describes.
pub async fn upsert(conn: &mut PgConnection, checkpoint: &WorkerCheckpoint) -> Result<()> {
    sqlx::query(
        "INSERT INTO worker_checkpoints \
            (worker_id, chunk_start_ts, chunk_end_ts, cursor, last_ts, \
             fetched_count, inserted_count, status, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW()) \
         ON CONFLICT (worker_id) DO UPDATE SET \
            cursor = EXCLUDED.cursor, \
            last_ts = EXCLUDED.last_ts, \
            fetched_count = EXCLUDED.fetched_count, \
            inserted_count = EXCLUDED.inserted_count, \
            status = EXCLUDED.status, \
            updated_at = NOW()",
    )
    .bind(checkpoint.worker_id)
    .bind(checkpoint.chunk_start_ts)
    .bind(checkpoint.chunk_end_ts)
    .bind(&checkpoint.cursor)
    .bind(checkpoint.last_ts)
    .bind(checkpoint.fetched_count)
    .bind(checkpoint.inserted_count)
    .bind(checkpoint.status.as_str())
    .execute(&mut *conn)
    .await
    .with_context(|| format!("failed to upsert checkpoint {}", checkpoint.worker_id))?;
    Ok(())
}

fn checkpoint_from_row(row: &PgRow) -> Result<WorkerCheckpoint> {
    let status_raw: String = row.try_get("status").context("checkpoint status")?;
    Ok(WorkerCheckpoint {
        worker_id: row.try_get("worker_id").context("worker_id")?,
        chunk_start_ts: row.try_get("chunk_start_ts").context("chunk_start_ts")?,
        chunk_end_ts: row.try_get("chunk_end_ts").context("chunk_end_ts")?,
        cursor: row.try_get("cursor").context("cursor")?,
        last_ts: row.try_get("last_ts").context("last_ts")?,
        fetched_count: row.try_get("fetched_count").context("fetched_count")?,
        inserted_count: row.try_get("inserted_count").context("inserted_count")?,
        status: CheckpointStatus::parse(&status_raw)?,
    })
}
