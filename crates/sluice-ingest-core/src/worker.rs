use crate::metrics::IngestMetrics;
use crate::write_queue::{TxWriter, WriteBatch, WriteQueue};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sluice_feed::source::EventsSource;
use sluice_feed::{cursor, FeedEvent, HttpError, Page, PageRequest};
use sluice_store::{CheckpointStatus, NewEvent, WorkerCheckpoint};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where pages come from. The engine only ever asks for the next page; the
/// seam lets tests script exact page sequences.
#[async_trait]
pub trait PageFetcher: Send + Sync + 'static {
    async fn next_page(&self, req: PageRequest) -> Result<Page, HttpError>;
}

#[async_trait]
impl PageFetcher for EventsSource {
    async fn next_page(&self, req: PageRequest) -> Result<Page, HttpError> {
        self.fetch_page(&req).await
    }
}

pub struct WorkerContext<F: PageFetcher, W: TxWriter> {
    pub fetcher: Arc<F>,
    pub queue: Arc<WriteQueue<W>>,
    pub page_limit: usize,
    pub stop: CancellationToken,
    pub metrics: Arc<IngestMetrics>,
}

/// Drain one partition. Pages arrive newest-first, so the walk starts at the
/// chunk's upper boundary and descends until a page dips below the lower
/// boundary or the server runs out.
///
/// The next fetch is started before the current batch's write is awaited, so
/// network and database time overlap; batch N+1 is still never enqueued
/// before batch N resolves.
pub async fn run_worker<F: PageFetcher, W: TxWriter>(
    ctx: WorkerContext<F, W>,
    mut cp: WorkerCheckpoint,
) -> Result<WorkerCheckpoint> {
    if cp.status == CheckpointStatus::Completed {
        debug!("worker {} already completed; skipping", cp.worker_id);
        return Ok(cp);
    }
    cp.status = CheckpointStatus::Running;

    if cp.cursor.is_none() {
        cp.cursor = Some(cursor::forge(cp.chunk_end_ts));
    }
    let first_cursor = cp.cursor.clone().unwrap_or_default();
    let mut inflight = Some(spawn_fetch(&ctx, first_cursor));

    let mut done = false;
    let mut natural_end = false;

    while !done {
        let page = match await_fetch(inflight.take().unwrap()).await {
            Ok(page) => page,
            Err(err) => {
                // A 400 mid-partition is cursor expiry: re-forge at the last
                // timestamp we saw, unless that exact cursor just failed.
                if err.status == 400 {
                    if let Some(last_ts) = cp.last_ts {
                        let recovered = cursor::forge(last_ts);
                        if cp.cursor.as_deref() != Some(recovered.as_str()) {
                            warn!(
                                "worker {}: cursor rejected, re-forging at ts {last_ts}",
                                cp.worker_id
                            );
                            cp.cursor = Some(recovered.clone());
                            inflight = Some(spawn_fetch(&ctx, recovered));
                            continue;
                        }
                    }
                }
                cp.status = CheckpointStatus::Failed;
                ctx.metrics
                    .record(cp.worker_id, cp.fetched_count, cp.inserted_count, cp.status);
                persist_best_effort(&ctx, &cp).await;
                return Err(err).with_context(|| format!("worker {} fetch failed", cp.worker_id));
            }
        };

        let events = page.events;
        cp.fetched_count += events.len() as i64;
        if let Some(min_ts) = events.iter().map(|event| event.timestamp_ms).min() {
            cp.last_ts = Some(min_ts);
        }

        // Descending order means a single event below the chunk proves every
        // later page is below it too.
        let crossed_lower_bound = events
            .iter()
            .any(|event| event.timestamp_ms < cp.chunk_start_ts);
        let filtered: Vec<FeedEvent> = events
            .into_iter()
            .filter(|event| {
                event.timestamp_ms >= cp.chunk_start_ts && event.timestamp_ms < cp.chunk_end_ts
            })
            .collect();

        cp.cursor = page.next_cursor.clone();

        let stopping = ctx.stop.is_cancelled();
        let exhausted = !page.has_more || cp.cursor.is_none();

        let next = if !crossed_lower_bound && !exhausted && !stopping {
            Some(spawn_fetch(&ctx, cp.cursor.clone().unwrap_or_default()))
        } else {
            None
        };

        if !filtered.is_empty() {
            let batch = WriteBatch {
                events: filtered.iter().map(to_new_event).collect(),
                checkpoint: cp.clone(),
            };
            let pending = ctx.queue.enqueue(batch).await;
            let inserted = match pending.wait().await {
                Ok(inserted) => inserted,
                Err(err) => {
                    if let Some(handle) = next {
                        handle.abort();
                    }
                    cp.status = CheckpointStatus::Failed;
                    ctx.metrics
                        .record(cp.worker_id, cp.fetched_count, cp.inserted_count, cp.status);
                    return Err(err)
                        .with_context(|| format!("worker {} write failed", cp.worker_id));
                }
            };
            cp.inserted_count += inserted as i64;
        }

        ctx.metrics
            .record(cp.worker_id, cp.fetched_count, cp.inserted_count, cp.status);

        match next {
            Some(handle) => inflight = Some(handle),
            None => {
                natural_end = crossed_lower_bound || exhausted;
                done = true;
            }
        }
    }

    if natural_end {
        cp.status = CheckpointStatus::Completed;
        let pending = ctx
            .queue
            .enqueue(WriteBatch {
                events: Vec::new(),
                checkpoint: cp.clone(),
            })
            .await;
        pending
            .wait()
            .await
            .with_context(|| format!("worker {} final checkpoint failed", cp.worker_id))?;
        info!(
            "worker {} completed: {} fetched, {} inserted",
            cp.worker_id, cp.fetched_count, cp.inserted_count
        );
    } else {
        info!(
            "worker {} stopping at {} fetched; progress checkpointed",
            cp.worker_id, cp.fetched_count
        );
    }

    ctx.metrics
        .record(cp.worker_id, cp.fetched_count, cp.inserted_count, cp.status);
    Ok(cp)
}

fn spawn_fetch<F: PageFetcher, W: TxWriter>(
    ctx: &WorkerContext<F, W>,
    cursor: String,
) -> JoinHandle<Result<Page, HttpError>> {
    let fetcher = ctx.fetcher.clone();
    let req = PageRequest {
        limit: ctx.page_limit,
        cursor: Some(cursor),
        since: None,
        until: None,
    };
    tokio::spawn(async move { fetcher.next_page(req).await })
}

async fn await_fetch(handle: JoinHandle<Result<Page, HttpError>>) -> Result<Page, HttpError> {
    match handle.await {
        Ok(result) => result,
        Err(err) => Err(HttpError::network("GET", "", format!("fetch task died: {err}"))),
    }
}

/// Record a terminal status without masking the error that caused it.
async fn persist_best_effort<F: PageFetcher, W: TxWriter>(
    ctx: &WorkerContext<F, W>,
    cp: &WorkerCheckpoint,
) {
    let pending = ctx
        .queue
        .enqueue(WriteBatch {
            events: Vec::new(),
            checkpoint: cp.clone(),
        })
        .await;
    if let Err(err) = pending.wait().await {
        warn!(
            "worker {}: could not persist terminal status: {err:#}",
            cp.worker_id
        );
    }
}

fn to_new_event(event: &FeedEvent) -> NewEvent {
    NewEvent {
        event_id: event.event_id.clone(),
        timestamp_ms: event.timestamp_ms,
        payload: serde_json::to_string(&event.payload).unwrap_or_else(|_| "{}".to_string()),
    }
}
