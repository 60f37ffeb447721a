use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event in canonical form. `payload` keeps the raw server object
/// verbatim; only `event_id` and `timestamp_ms` are interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    pub event_id: String,
    pub timestamp_ms: i64,
    pub payload: Value,
}

/// Canonical page, regardless of which envelope the server chose.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub events: Vec<FeedEvent>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub limit: usize,
    pub cursor: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
}

/// Short-lived credentials for the stream endpoint, as returned by the
/// dashboard. Treated as opaque apart from the expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamAccess {
    pub endpoint: Option<String>,
    pub token_header: String,
    pub token: String,
    pub expires_in: u64,
}
