use crate::domain::NewEvent;
use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool};

const BULK_INSERT: &str = r#"
INSERT INTO ingested_events (event_id, timestamp_ms, payload)
SELECT t.event_id, t.timestamp_ms, t.payload::jsonb
FROM UNNEST($1::text[], $2::bigint[], $3::text[]) AS t(event_id, timestamp_ms, payload)
ON CONFLICT (event_id) DO NOTHING
"#;

/// Bulk insert through array unnest: three parameters regardless of batch
/// size. Duplicate ids are ignored; the return value is the number of rows
/// actually inserted. Runs on whatever connection the caller supplies, so it
/// participates in the caller's transaction.
pub async fn insert_events(conn: &mut PgConnection, events: &[NewEvent]) -> Result<u64> {
    if events.is_empty() {
        return Ok(0);
    }

    let mut ids = Vec::with_capacity(events.len());
    let mut timestamps = Vec::with_capacity(events.len());
    let mut payloads = Vec::with_capacity(events.len());
    for event in events {
        ids.push(event.event_id.clone());
        timestamps.push(event.timestamp_ms);
        payloads.push(event.payload.clone());
    }

    let result = sqlx::query(BULK_INSERT)
        .bind(&ids)
        .bind(&timestamps)
        .bind(&payloads)
        .execute(&mut *conn)
        .await
        .context("bulk insert failed")?;

    Ok(result.rows_affected())
}

pub async fn count_events(pool: &PgPool) -> Result<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM ingested_events")
        .fetch_one(pool)
        .await
        .context("failed to count events")
}

/// All ingested ids, ordered for a deterministic submission body.
pub async fn load_event_ids(pool: &PgPool) -> Result<Vec<String>> {
    sqlx::query_scalar::<_, String>("SELECT event_id FROM ingested_events ORDER BY event_id")
        .fetch_all(pool)
        .await
        .context("failed to load event ids")
}
