use crate::transport::HttpError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
        }
    }
}

/// Transient failures worth another attempt: rate limiting, server errors,
/// and anything that never produced a response.
pub fn is_retryable(err: &HttpError) -> bool {
    err.status == 0 || err.status == 429 || err.status >= 500
}

/// Parse a `Retry-After` header: positive delta-seconds, else an HTTP-date
/// with a positive delta from now.
pub fn parse_retry_after(headers: &HashMap<String, String>) -> Option<Duration> {
    let raw = headers.get("retry-after")?.trim();

    if let Ok(seconds) = raw.parse::<i64>() {
        return (seconds > 0).then(|| Duration::from_secs(seconds as u64));
    }

    let date = DateTime::parse_from_rfc2822(raw).ok()?;
    let delta_ms = date
        .with_timezone(&Utc)
        .signed_duration_since(Utc::now())
        .num_milliseconds();
    (delta_ms > 0).then(|| Duration::from_millis(delta_ms as u64))
}

/// Delay before attempt `attempt + 1`, given that `attempt` (1-indexed) just
/// failed with `err`. A parseable `Retry-After` on a 429 wins; otherwise the
/// exponential schedule applies, with jitter for 5xx/network failures.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, err: &HttpError) -> Duration {
    if err.status == 429 {
        if let Some(wait) = parse_retry_after(&err.headers) {
            return wait.min(policy.max_delay);
        }
    }

    let exp = policy
        .base_delay
        .saturating_mul(1u32 << (attempt - 1).min(16));
    let mut delay_ms = exp.as_millis() as f64;
    if err.status == 0 || err.status >= 500 {
        delay_ms *= 1.0 + 0.3 * jitter_fraction();
    }
    Duration::from_millis(delay_ms as u64).min(policy.max_delay)
}

fn jitter_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1_000_000) / 1_000_000.0
}

/// Run `op` until it succeeds, fails fatally, or exhausts the attempt budget.
/// The last error is surfaced unchanged.
pub async fn execute<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, HttpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HttpError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) && attempt < attempts => {
                let delay = backoff_delay(policy, attempt, &err);
                warn!(
                    "attempt {attempt}/{attempts} failed ({err}); retrying in {} ms",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
