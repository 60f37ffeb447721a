use serde::Serialize;
use sluice_store::{CheckpointStatus, WorkerCheckpoint};
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Fixed size of the event stream this run is chasing.
pub const TARGET_EVENTS: i64 = 3_000_000;

/// Smoothing factor for the throughput EMA.
const EMA_ALPHA: f64 = 0.2;

const STATUS_RUNNING: u8 = 0;
const STATUS_COMPLETED: u8 = 1;
const STATUS_FAILED: u8 = 2;

#[derive(Debug)]
struct WorkerProgress {
    fetched: AtomicI64,
    inserted: AtomicI64,
    status: AtomicU8,
}

#[derive(Debug)]
struct EmaState {
    last_at: Instant,
    last_inserted: i64,
    throughput_eps: f64,
    primed: bool,
}

/// Run-wide counters, written lock-free by workers and read by the progress
/// logger and the health surface.
#[derive(Debug)]
pub struct IngestMetrics {
    started_at: Instant,
    workers: Vec<WorkerProgress>,
    ema: Mutex<EmaState>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub worker_id: i32,
    pub fetched_count: i64,
    pub inserted_count: i64,
    pub status: CheckpointStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uptime_seconds: f64,
    pub total_fetched: i64,
    pub total_inserted: i64,
    pub throughput_eps: f64,
    pub eta_seconds: Option<f64>,
    pub active_workers: usize,
    pub pending_writes: usize,
    pub workers: Vec<WorkerSnapshot>,
}

impl IngestMetrics {
    /// Prime per-worker counters from the loaded checkpoints so totals and
    /// throughput resume where the previous run left off.
    pub fn new(checkpoints: &[WorkerCheckpoint]) -> Self {
        let workers = checkpoints
            .iter()
            .map(|cp| WorkerProgress {
                fetched: AtomicI64::new(cp.fetched_count),
                inserted: AtomicI64::new(cp.inserted_count),
                status: AtomicU8::new(encode_status(cp.status)),
            })
            .collect::<Vec<_>>();
        let initial_inserted = checkpoints.iter().map(|cp| cp.inserted_count).sum();

        Self {
            started_at: Instant::now(),
            workers,
            ema: Mutex::new(EmaState {
                last_at: Instant::now(),
                last_inserted: initial_inserted,
                throughput_eps: 0.0,
                primed: false,
            }),
        }
    }

    pub fn record(&self, worker_id: i32, fetched: i64, inserted: i64, status: CheckpointStatus) {
        let Some(progress) = self.workers.get(worker_id as usize) else {
            return;
        };
        progress.fetched.store(fetched, Ordering::Relaxed);
        progress.inserted.store(inserted, Ordering::Relaxed);
        progress.status.store(encode_status(status), Ordering::Relaxed);
    }

    pub fn total_inserted(&self) -> i64 {
        self.workers
            .iter()
            .map(|w| w.inserted.load(Ordering::Relaxed))
            .sum()
    }

    /// Assemble a snapshot, folding the wall-clock delta since the previous
    /// snapshot into the throughput EMA.
    pub fn snapshot(&self, pending_writes: usize) -> MetricsSnapshot {
        let workers: Vec<WorkerSnapshot> = self
            .workers
            .iter()
            .enumerate()
            .map(|(worker_id, w)| WorkerSnapshot {
                worker_id: worker_id as i32,
                fetched_count: w.fetched.load(Ordering::Relaxed),
                inserted_count: w.inserted.load(Ordering::Relaxed),
                status: decode_status(w.status.load(Ordering::Relaxed)),
            })
            .collect();

        let total_fetched = workers.iter().map(|w| w.fetched_count).sum();
        let total_inserted: i64 = workers.iter().map(|w| w.inserted_count).sum();
        let active_workers = workers
            .iter()
            .filter(|w| w.status == CheckpointStatus::Running)
            .count();

        let throughput_eps = {
            let mut ema = self.ema.lock().expect("metrics ema mutex poisoned");
            let now = Instant::now();
            let dt = now.duration_since(ema.last_at).as_secs_f64();
            if dt > 0.0 {
                let instantaneous = (total_inserted - ema.last_inserted).max(0) as f64 / dt;
                ema.throughput_eps = if ema.primed {
                    EMA_ALPHA * instantaneous + (1.0 - EMA_ALPHA) * ema.throughput_eps
                } else {
                    instantaneous
                };
                ema.primed = true;
                ema.last_at = now;
                ema.last_inserted = total_inserted;
            }
            ema.throughput_eps
        };

        let eta_seconds = (throughput_eps > 0.0)
            .then(|| (TARGET_EVENTS - total_inserted).max(0) as f64 / throughput_eps);

        MetricsSnapshot {
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            total_fetched,
            total_inserted,
            throughput_eps,
            eta_seconds,
            active_workers,
            pending_writes,
            workers,
        }
    }
}

fn encode_status(status: CheckpointStatus) -> u8 {
    match status {
        CheckpointStatus::Running => STATUS_RUNNING,
        CheckpointStatus::Completed => STATUS_COMPLETED,
        CheckpointStatus::Failed => STATUS_FAILED,
    }
}

fn decode_status(raw: u8) -> CheckpointStatus {
    match raw {
        STATUS_COMPLETED => CheckpointStatus::Completed,
        STATUS_FAILED => CheckpointStatus::Failed,
        _ => CheckpointStatus::Running,
    }
}
