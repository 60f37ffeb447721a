use anyhow::{anyhow, Result};
use sluice_config::AppConfig;
use sluice_feed::credentials::{CredentialConfig, CredentialManager};
use sluice_feed::limiter::RateLimiter;
use sluice_feed::retry::RetryPolicy;
use sluice_feed::source::{EventsSource, SourceConfig};
use sluice_feed::transport::{HttpClient, TransportConfig};
use sluice_feed::{cursor, PageRequest};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const PROBE_LIMIT: usize = 5;

/// One-off probe: fetch a single small page and describe what came back.
/// Useful for eyeballing the feed before committing to a long ingest run.
pub async fn run_probe(config: &AppConfig) -> Result<()> {
    let transport = Arc::new(
        HttpClient::new(&TransportConfig {
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            pool_size: 4,
        })
        .map_err(|err| anyhow!("failed to build http client: {err}"))?,
    );
    let credentials = Arc::new(CredentialManager::new(
        transport.clone(),
        CredentialConfig {
            origin: config.origin(),
            api_key: config.target_api_key.clone(),
        },
    ));
    let source = EventsSource::new(
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
    );

    let page = source
        .fetch_page(&PageRequest {
            limit: PROBE_LIMIT,
            cursor: None,
            since: None,
            until: None,
        })
        .await
        .map_err(|err| anyhow!("probe fetch failed: {err}"))?;

    info!(
        "probe: {} events, has_more={}, total={:?}, via {}",
        page.events.len(),
        page.has_more,
        page.total,
        if source.fallback_latched() {
            "documented endpoint"
        } else {
            "stream endpoint"
        }
    );

    if let (Some(first), Some(last)) = (page.events.first(), page.events.last()) {
        info!(
            "probe: newest ts {} .. oldest ts {}",
            first.timestamp_ms, last.timestamp_ms
        );
    }

    match page.next_cursor.as_deref() {
        Some(next) => match cursor::decode_ts(next) {
            Some(ts) => info!("probe: next cursor decodes to ts {ts}"),
            None => info!("probe: next cursor is opaque ({} chars)", next.len()),
        },
        None => info!("probe: no continuation cursor returned"),
    }

    Ok(())
}
