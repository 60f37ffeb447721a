use crate::model::{FeedEvent, Page};
use chrono::DateTime;
use serde_json::Value;

/// Below this magnitude a numeric timestamp is epoch seconds, not millis.
const MS_THRESHOLD: i64 = 1_000_000_000_000;

/// Collapse either server envelope into the canonical page. Unrecognized
/// input yields an empty terminal page rather than an error; a page the
/// engine cannot read cannot be paginated past.
pub fn normalize_page(input: Option<&Value>) -> Page {
    let Some(root) = input else {
        return Page::default();
    };

    // Nested: { data: { data: [...], pagination: {...}, meta: {...} } }
    if let Some(envelope) = root.get("data").filter(|inner| {
        inner
            .get("data")
            .is_some_and(Value::is_array)
    }) {
        return Page {
            events: collect_events(envelope.get("data")),
            has_more: bool_field(envelope, &["pagination.hasMore", "hasMore"]),
            next_cursor: string_field(envelope, &["pagination.nextCursor", "nextCursor"]),
            total: u64_field(envelope, &["meta.total", "total"]),
        };
    }

    // Flat: { data: [...], hasMore | pagination.hasMore, ... }
    if root.get("data").is_some_and(Value::is_array) {
        return Page {
            events: collect_events(root.get("data")),
            has_more: bool_field(root, &["hasMore", "pagination.hasMore"]),
            next_cursor: string_field(root, &["nextCursor", "pagination.nextCursor"]),
            total: u64_field(root, &["meta.total", "total"]),
        };
    }

    Page::default()
}

/// Normalize a raw record. `None` when the record has no string id or no
/// readable timestamp; the caller drops it and keeps the page.
pub fn normalize_event(raw: &Value) -> Option<FeedEvent> {
    let event_id = raw.get("id")?.as_str()?.to_string();
    let ts_value = raw.get("timestamp").or_else(|| raw.get("ts"))?;
    let timestamp_ms = normalize_timestamp(ts_value)?;
    Some(FeedEvent {
        event_id,
        timestamp_ms,
        payload: raw.clone(),
    })
}

/// Map any of the server's timestamp spellings to epoch milliseconds:
/// integers and digit-only strings (seconds below 1e12, millis above),
/// and ISO-8601 strings.
pub fn normalize_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => {
            let raw = number
                .as_i64()
                .or_else(|| number.as_f64().map(|float| float as i64))?;
            Some(scale_to_ms(raw))
        }
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return None;
            }
            if trimmed.chars().all(|c| c.is_ascii_digit()) {
                return trimmed.parse::<i64>().ok().map(scale_to_ms);
            }
            DateTime::parse_from_rfc3339(trimmed)
                .ok()
                .map(|date| date.timestamp_millis())
        }
        _ => None,
    }
}

fn scale_to_ms(raw: i64) -> i64 {
    if raw < MS_THRESHOLD {
        raw * 1000
    } else {
        raw
    }
}

fn collect_events(items: Option<&Value>) -> Vec<FeedEvent> {
    items
        .and_then(Value::as_array)
        .map(|array| array.iter().filter_map(normalize_event).collect())
        .unwrap_or_default()
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(root, |node, segment| node.get(segment))
}

fn bool_field(root: &Value, paths: &[&str]) -> bool {
    paths
        .iter()
        .find_map(|path| lookup(root, path).and_then(Value::as_bool))
        .unwrap_or(false)
}

fn string_field(root: &Value, paths: &[&str]) -> Option<String> {
    paths
        .iter()
        .find_map(|path| lookup(root, path).and_then(Value::as_str))
        .map(str::to_string)
}

fn u64_field(root: &Value, paths: &[&str]) -> Option<u64> {
    paths
        .iter()
        .find_map(|path| lookup(root, path).and_then(Value::as_u64))
}
