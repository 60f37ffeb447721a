use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const ADAPTIVE_FLOOR_MS: f64 = 1_000.0;
const ADAPTIVE_CEILING_MS: f64 = 8_000.0;
const ADAPTIVE_GROWTH: f64 = 1.3;
const ADAPTIVE_DECAY: f64 = 0.5;
const ADAPTIVE_SNAP_MS: f64 = 100.0;
const HEADER_WAIT_SLACK_MS: i64 = 100;
const DEDUP_WINDOW_MS: i64 = 2_000;

#[derive(Debug, Default, Clone)]
struct LimiterState {
    remaining: Option<i64>,
    limit: Option<i64>,
    reset_at_ms: Option<i64>,
    adaptive_delay_ms: f64,
    consecutive_429s: u32,
    last_429_at_ms: Option<i64>,
}

/// Quota state shared by every worker. All operations are O(1) under one
/// mutex; lock scopes never cross an await point.
#[derive(Debug, Default)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

#[derive(Debug, Clone, Copy)]
pub struct LimiterSnapshot {
    pub remaining: Option<i64>,
    pub limit: Option<i64>,
    pub adaptive_delay_ms: u64,
    pub consecutive_429s: u32,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long the caller should sleep before its next request.
    pub fn pre_request_delay(&self) -> Duration {
        self.pre_request_delay_at(now_ms())
    }

    fn pre_request_delay_at(&self, now_ms: i64) -> Duration {
        let state = self.state.lock().expect("rate limiter mutex poisoned");

        let header_wait_ms = match (state.remaining, state.reset_at_ms) {
            (Some(remaining), Some(reset_at)) if remaining <= 1 && reset_at > now_ms => {
                reset_at - now_ms + HEADER_WAIT_SLACK_MS
            }
            _ => 0,
        };

        let wait_ms = header_wait_ms.max(state.adaptive_delay_ms as i64);
        Duration::from_millis(wait_ms.max(0) as u64)
    }

    /// Feed quota headers from a successful response.
    pub fn observe_headers(&self, headers: &HashMap<String, String>) {
        self.observe_headers_at(headers, now_ms());
    }

    fn observe_headers_at(&self, headers: &HashMap<String, String>, now_ms: i64) {
        let remaining = header_i64(headers, "x-ratelimit-remaining");
        let limit = header_i64(headers, "x-ratelimit-limit");
        let reset_at_ms = header_i64(headers, "x-ratelimit-reset").map(|reset| {
            // Values above 1e9 are epoch seconds; smaller ones are deltas.
            if reset > 1_000_000_000 {
                reset * 1000
            } else {
                now_ms + reset * 1000
            }
        });

        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        if remaining.is_some() {
            state.remaining = remaining;
        }
        if limit.is_some() {
            state.limit = limit;
        }
        if reset_at_ms.is_some() {
            state.reset_at_ms = reset_at_ms;
        }
    }

    /// Grow the adaptive delay. Bursts across workers are coalesced: only the
    /// first 429 inside the dedup window takes effect.
    pub fn record_429(&self) {
        self.record_429_at(now_ms());
    }

    fn record_429_at(&self, now_ms: i64) {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");

        if let Some(last) = state.last_429_at_ms {
            if now_ms - last < DEDUP_WINDOW_MS {
                debug!("429 within dedup window; adaptive delay unchanged");
                return;
            }
        }

        state.last_429_at_ms = Some(now_ms);
        state.adaptive_delay_ms = (state.adaptive_delay_ms * ADAPTIVE_GROWTH)
            .max(ADAPTIVE_FLOOR_MS)
            .min(ADAPTIVE_CEILING_MS);
        state.consecutive_429s += 1;
        warn!(
            "rate limited; adaptive delay now {} ms ({} consecutive)",
            state.adaptive_delay_ms as u64, state.consecutive_429s
        );
    }

    /// Decay the adaptive delay after a successful request.
    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        state.adaptive_delay_ms *= ADAPTIVE_DECAY;
        if state.adaptive_delay_ms < ADAPTIVE_SNAP_MS {
            state.adaptive_delay_ms = 0.0;
        }
        state.consecutive_429s = 0;
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let state = self.state.lock().expect("rate limiter mutex poisoned");
        LimiterSnapshot {
            remaining: state.remaining,
            limit: state.limit,
            adaptive_delay_ms: state.adaptive_delay_ms as u64,
            consecutive_429s: state.consecutive_429s,
        }
    }
}

fn header_i64(headers: &HashMap<String, String>, name: &str) -> Option<i64> {
    headers.get(name)?.trim().parse::<i64>().ok()
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
