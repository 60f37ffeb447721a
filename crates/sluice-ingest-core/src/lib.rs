pub mod health;
pub mod metrics;
pub mod partition;
pub mod worker;
pub mod write_queue;

use crate::health::{run_health_server, HealthState};
use crate::metrics::IngestMetrics;
use crate::worker::{run_worker, WorkerContext};
use crate::write_queue::{PendingGauge, PgTxWriter, WriteQueue};
use anyhow::{anyhow, bail, Context, Result};
use sluice_config::AppConfig;
use sluice_feed::credentials::{CredentialConfig, CredentialManager};
use sluice_feed::limiter::RateLimiter;
use sluice_feed::redact::redact;
use sluice_feed::retry::RetryPolicy;
use sluice_feed::source::{EventsSource, SourceConfig};
use sluice_feed::submit;
use sluice_feed::transport::{HttpClient, TransportConfig};
use sluice_store::db::{connect_pool, ensure_schema, StoreConfig};
use sluice_store::{checkpoints, events, CheckpointStatus, WorkerCheckpoint};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pause between worker launches, to amortize the initial credential fetch
/// and ramp the API up gently.
const WORKER_LAUNCH_STAGGER: Duration = Duration::from_millis(500);

/// Run the full ingestion: partition the timeline, resume from checkpoints,
/// drive one worker per partition, and drain everything on the way out.
pub async fn run_ingestion(config: AppConfig) -> Result<()> {
    info!(
        "starting ingestion: {} partitions over [{}, {}], batch size {}, api {}",
        config.partition_count,
        config.min_timestamp_ms,
        config.max_timestamp_ms,
        config.batch_size,
        redact(&config.api_base_url, &[&config.target_api_key]),
    );

    let pool = connect_pool(&StoreConfig {
        database_url: config.database_url.clone(),
        max_connections: (config.partition_count + config.db_write_concurrency + 2) as u32,
        synchronous_commit: config.pg_sync_commit.as_str().to_string(),
    })
    .await?;
    ensure_schema(&pool).await?;

    let transport = Arc::new(
        HttpClient::new(&TransportConfig {
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            pool_size: config.partition_count + 4,
        })
        .map_err(|err| anyhow!("failed to build http client: {err}"))?,
    );
    let source = Arc::new(build_source(&config, transport.clone()));

    let resume = reconcile_checkpoints(&config, &pool).await?;
    let completed = resume
        .iter()
        .filter(|cp| cp.status == CheckpointStatus::Completed)
        .count();
    info!(
        "checkpoints ready: {} workers, {} already completed",
        resume.len(),
        completed
    );

    let metrics = Arc::new(IngestMetrics::new(&resume));
    let queue = Arc::new(WriteQueue::new(
        PgTxWriter::new(pool.clone()),
        config.db_write_concurrency,
        config.max_pending_writes,
    ));

    let stop = CancellationToken::new();
    spawn_signal_handler(stop.clone());

    let draining = Arc::new(AtomicBool::new(false));
    let ui_shutdown = CancellationToken::new();
    let health_handle = {
        let state = HealthState {
            metrics: metrics.clone(),
            pending: queue.gauge(),
            draining: draining.clone(),
        };
        let shutdown = ui_shutdown.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(err) = run_health_server(port, state, shutdown).await {
                warn!("health server unavailable: {err:#}");
            }
        })
    };
    let progress_handle = spawn_progress_logger(
        metrics.clone(),
        queue.gauge(),
        Duration::from_millis(config.progress_log_interval_ms.max(1000)),
        ui_shutdown.clone(),
    );

    // Launch, staggered. Completed workers short-circuit inside run_worker,
    // so only the live ones pace the ramp.
    let mut handles: Vec<(i32, JoinHandle<Result<WorkerCheckpoint>>)> = Vec::new();
    for cp in resume {
        if cp.status == CheckpointStatus::Completed {
            continue;
        }
        if !handles.is_empty() {
            tokio::time::sleep(WORKER_LAUNCH_STAGGER).await;
        }
        let ctx = WorkerContext {
            fetcher: source.clone(),
            queue: queue.clone(),
            page_limit: config.batch_size,
            stop: stop.clone(),
            metrics: metrics.clone(),
        };
        handles.push((cp.worker_id, tokio::spawn(run_worker(ctx, cp))));
    }

    let mut failures: Vec<(i32, anyhow::Error)> = Vec::new();
    for (worker_id, handle) in handles {
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                error!(
                    "worker {worker_id} failed: {}",
                    redact(&format!("{err:#}"), &[&config.target_api_key])
                );
                failures.push((worker_id, err));
            }
            Err(join_err) => {
                error!("worker {worker_id} panicked: {join_err}");
                failures.push((worker_id, anyhow!("worker task panicked: {join_err}")));
            }
        }
    }

    // Whatever happened above, everything already enqueued still commits.
    draining.store(true, Ordering::Relaxed);
    queue.drain().await;

    ui_shutdown.cancel();
    progress_handle.abort();
    let _ = health_handle.await;

    let snapshot = metrics.snapshot(0);
    if !failures.is_empty() {
        let summary = failures
            .iter()
            .map(|(worker_id, err)| format!("worker {worker_id}: {err}"))
            .collect::<Vec<_>>()
            .join("; ");
        pool.close().await;
        bail!(
            "ingestion failed after draining ({} of {} workers): {}",
            failures.len(),
            config.partition_count,
            redact(&summary, &[&config.target_api_key])
        );
    }

    if stop.is_cancelled() {
        info!(
            "shutdown complete: {} inserted so far; checkpoints allow exact resume",
            snapshot.total_inserted
        );
        pool.close().await;
        return Ok(());
    }

    info!(
        "ingestion complete: {} events inserted, {} fetched in {:.0} s",
        snapshot.total_inserted, snapshot.total_fetched, snapshot.uptime_seconds
    );

    if config.auto_submit {
        match &config.github_repo_url {
            Some(repo_url) => {
                let ids = events::load_event_ids(&pool).await?;
                submit::submit_event_ids(
                    &transport,
                    &config.origin(),
                    &config.target_api_key,
                    repo_url,
                    &ids,
                )
                .await
                .map_err(|err| anyhow!("submission failed: {err}"))?;
            }
            None => warn!("AUTO_SUBMIT is set but GITHUB_REPO_URL is empty; skipping submission"),
        }
    }

    pool.close().await;
    Ok(())
}

fn build_source(config: &AppConfig, transport: Arc<HttpClient>) -> EventsSource {
    let credentials = Arc::new(CredentialManager::new(
        transport.clone(),
        CredentialConfig {
            origin: config.origin(),
            api_key: config.target_api_key.clone(),
        },
    ));
    EventsSource::new(
        transport,
        Arc::new(RateLimiter::new()),
        credentials,
        SourceConfig {
            origin: config.origin(),
            api_base_url: config.api_base_url.clone(),
            api_key: config.target_api_key.clone(),
            retry: RetryPolicy {
                max_attempts: config.max_retries,
                base_delay: Duration::from_millis(config.retry_base_ms),
                max_delay: Duration::from_millis(config.retry_max_ms),
            },
        },
    )
}

/// Bring the checkpoint table in line with the configured partitioning.
/// A different partition count invalidates prior chunk boundaries outright.
async fn reconcile_checkpoints(config: &AppConfig, pool: &sqlx::PgPool) -> Result<Vec<WorkerCheckpoint>> {
    let chunks = partition::partition_range(
        config.min_timestamp_ms,
        config.max_timestamp_ms,
        config.partition_count,
    );

    let existing = checkpoints::load_all(pool).await?;
    if !existing.is_empty() && existing.len() != chunks.len() {
        warn!(
            "partition count changed ({} -> {}); resetting all checkpoints",
            existing.len(),
            chunks.len()
        );
        checkpoints::reset_all(pool).await?;
    }

    let seed: Vec<(i32, i64, i64)> = chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| (index as i32, chunk.start_ts, chunk.end_ts))
        .collect();
    checkpoints::initialize(pool, &seed).await?;

    checkpoints::load_all(pool)
        .await
        .context("failed to reload checkpoints after initialization")
}

fn spawn_signal_handler(stop: CancellationToken) {
    tokio::spawn(async move {
        if wait_for_signal().await.is_err() {
            return;
        }
        info!("shutdown signal received; finishing in-flight batches");
        stop.cancel();

        if wait_for_signal().await.is_ok() {
            warn!("second shutdown signal; aborting immediately");
            std::process::exit(1);
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("signal handler failed"),
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("signal handler failed")
}

fn spawn_progress_logger(
    metrics: Arc<IngestMetrics>,
    gauge: PendingGauge,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let snapshot = metrics.snapshot(gauge.pending());
                    let eta = snapshot
                        .eta_seconds
                        .map(|secs| format!("{:.0} s", secs))
                        .unwrap_or_else(|| "unknown".to_string());
                    info!(
                        "progress: {}/{} inserted ({} fetched), {:.0} ev/s, eta {}, {} active workers, {} pending writes",
                        snapshot.total_inserted,
                        crate::metrics::TARGET_EVENTS,
                        snapshot.total_fetched,
                        snapshot.throughput_eps,
                        eta,
                        snapshot.active_workers,
                        snapshot.pending_writes,
                    );
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}
