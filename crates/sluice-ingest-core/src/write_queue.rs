use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sluice_store::{checkpoints, events, NewEvent, WorkerCheckpoint};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::warn;

/// One unit of durable work: a batch of events plus the checkpoint that
/// describes having fetched them. Committed atomically.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    pub events: Vec<NewEvent>,
    pub checkpoint: WorkerCheckpoint,
}

/// Executes one batch in one transaction. The seam exists so the queue's
/// concurrency and backpressure behavior is testable without a database.
#[async_trait]
pub trait TxWriter: Send + Sync + 'static {
    async fn write(&self, batch: &WriteBatch) -> Result<u64>;
}

/// The production writer: bulk insert + checkpoint upsert, commit, and a
/// best-effort rollback on any failure.
pub struct PgTxWriter {
    pool: PgPool,
}

impl PgTxWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TxWriter for PgTxWriter {
    async fn write(&self, batch: &WriteBatch) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("begin transaction")?;

        let outcome = async {
            let inserted = events::insert_events(&mut *tx, &batch.events).await?;
            checkpoints::upsert(&mut *tx, &batch.checkpoint).await?;
            Ok::<u64, anyhow::Error>(inserted)
        }
        .await;

        match outcome {
            Ok(inserted) => {
                tx.commit().await.context("commit transaction")?;
                Ok(inserted)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("rollback failed after write error: {rollback_err}");
                }
                Err(err)
            }
        }
    }
}

/// Handle to an in-flight write; resolves to the post-conflict insert count.
pub struct PendingWrite {
    handle: JoinHandle<Result<u64>>,
}

impl PendingWrite {
    pub async fn wait(self) -> Result<u64> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("write task panicked: {err}")),
        }
    }
}

/// Cheap, cloneable view of the backlog depth for logging and health.
#[derive(Clone)]
pub struct PendingGauge {
    backlog: Arc<Semaphore>,
    max_pending: usize,
}

impl PendingGauge {
    pub fn pending(&self) -> usize {
        self.max_pending
            .saturating_sub(self.backlog.available_permits())
    }
}

/// Bounded writer pool. `writer_concurrency` transactions run at once;
/// `max_pending` tasks may be queued before `enqueue` starts blocking the
/// caller (cooperative backpressure).
pub struct WriteQueue<W: TxWriter> {
    writer: Arc<W>,
    writers: Arc<Semaphore>,
    backlog: Arc<Semaphore>,
    max_pending: usize,
}

impl<W: TxWriter> WriteQueue<W> {
    pub fn new(writer: W, writer_concurrency: usize, max_pending: usize) -> Self {
        let max_pending = max_pending.max(1);
        Self {
            writer: Arc::new(writer),
            writers: Arc::new(Semaphore::new(writer_concurrency.max(1))),
            backlog: Arc::new(Semaphore::new(max_pending)),
            max_pending,
        }
    }

    /// Queue one batch. Suspends while the backlog is full; returns as soon
    /// as a slot is claimed, with a handle the caller awaits for the result.
    pub async fn enqueue(&self, batch: WriteBatch) -> PendingWrite {
        let slot = self
            .backlog
            .clone()
            .acquire_owned()
            .await
            .expect("write queue backlog semaphore closed");
        let writers = self.writers.clone();
        let writer = self.writer.clone();

        let handle = tokio::spawn(async move {
            let _slot = slot;
            let _permit = writers
                .acquire_owned()
                .await
                .expect("write queue writer semaphore closed");
            writer.write(&batch).await
        });

        PendingWrite { handle }
    }

    pub fn gauge(&self) -> PendingGauge {
        PendingGauge {
            backlog: self.backlog.clone(),
            max_pending: self.max_pending,
        }
    }

    /// Wait for every in-flight task to finish. Callers stop enqueueing
    /// before draining.
    pub async fn drain(&self) {
        let all = self
            .backlog
            .acquire_many(self.max_pending as u32)
            .await
            .expect("write queue backlog semaphore closed");
        drop(all);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Default)]
    struct RecordingWriter {
        batches: Mutex<Vec<WriteBatch>>,
        running: AtomicU32,
        max_running: AtomicU32,
        delay: Option<Duration>,
        fail: bool,
    }

    impl RecordingWriter {
        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl TxWriter for RecordingWriter {
        async fn write(&self, batch: &WriteBatch) -> Result<u64> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                anyhow::bail!("writer exploded");
            }
            self.batches.lock().expect("batch lock").push(batch.clone());
            Ok(batch.events.len() as u64)
        }
    }

    fn sample_batch(worker_id: i32, events: usize) -> WriteBatch {
        WriteBatch {
            events: (0..events)
                .map(|i| NewEvent {
                    event_id: format!("evt-{worker_id}-{i}"),
                    timestamp_ms: 1_768_000_000_000 + i as i64,
                    payload: "{}".to_string(),
                })
                .collect(),
            checkpoint: WorkerCheckpoint::new(worker_id, 0, i64::MAX),
        }
    }

    #[tokio::test]
    async fn resolves_to_the_writers_insert_count() {
        let queue = WriteQueue::new(RecordingWriter::default(), 2, 10);
        let inserted = queue
            .enqueue(sample_batch(0, 3))
            .await
            .wait()
            .await
            .expect("write should succeed");
        assert_eq!(inserted, 3);
    }

    #[tokio::test]
    async fn writer_errors_reach_the_caller() {
        let writer = RecordingWriter {
            fail: true,
            ..RecordingWriter::default()
        };
        let queue = WriteQueue::new(writer, 2, 10);
        let err = queue
            .enqueue(sample_batch(0, 1))
            .await
            .wait()
            .await
            .expect_err("writer failure should surface");
        assert!(err.to_string().contains("writer exploded"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrency_stays_within_the_writer_bound() {
        let queue = Arc::new(WriteQueue::new(
            RecordingWriter::slow(Duration::from_millis(20)),
            2,
            50,
        ));

        let mut pending = Vec::new();
        for i in 0..10 {
            pending.push(queue.enqueue(sample_batch(i, 1)).await);
        }
        for task in pending {
            task.wait().await.expect("write should succeed");
        }

        assert!(queue.writer.max_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.writer.batches.lock().expect("lock").len(), 10);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_backlog_blocks_enqueue_until_a_slot_frees() {
        let queue = Arc::new(WriteQueue::new(
            RecordingWriter::slow(Duration::from_millis(200)),
            1,
            2,
        ));

        let _first = queue.enqueue(sample_batch(0, 1)).await;
        let _second = queue.enqueue(sample_batch(1, 1)).await;
        assert_eq!(queue.gauge().pending(), 2);

        // Both slots are taken and the writer is slow, so a third enqueue
        // must block past the short timeout.
        let blocked = timeout(Duration::from_millis(50), queue.enqueue(sample_batch(2, 1))).await;
        assert!(blocked.is_err(), "third enqueue should block on backpressure");

        // Once the first write completes, the slot frees and enqueue returns.
        let third = timeout(Duration::from_secs(2), queue.enqueue(sample_batch(2, 1)))
            .await
            .expect("enqueue should unblock after a slot frees");
        third.wait().await.expect("write should succeed");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drain_waits_for_everything_in_flight() {
        let queue = Arc::new(WriteQueue::new(
            RecordingWriter::slow(Duration::from_millis(30)),
            2,
            10,
        ));

        for i in 0..5 {
            let _ = queue.enqueue(sample_batch(i, 1)).await;
        }
        queue.drain().await;

        assert_eq!(queue.gauge().pending(), 0);
        assert_eq!(queue.writer.batches.lock().expect("lock").len(), 5);
    }
}
