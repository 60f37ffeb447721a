use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version literal carried by server cursors.
const CURSOR_VERSION: u32 = 2;

/// 2100-01-01T00:00:00Z. The server only checks that `exp` is in the future.
const FAR_FUTURE_EXP_MS: i64 = 4_102_444_800_000;

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    id: Uuid,
    ts: i64,
    v: u32,
    exp: i64,
}

/// Synthesize a cursor positioned at `ts_ms`. The server resolves position
/// purely from the `ts` field, so the id can be the nil UUID.
pub fn forge(ts_ms: i64) -> String {
    let payload = CursorPayload {
        id: Uuid::nil(),
        ts: ts_ms,
        v: CURSOR_VERSION,
        exp: FAR_FUTURE_EXP_MS,
    };
    let json = serde_json::to_vec(&payload).expect("cursor payload serializes");
    URL_SAFE_NO_PAD.encode(json)
}

/// Extract the timestamp a cursor points at. Total: any malformed input
/// yields `None`.
pub fn decode_ts(cursor: &str) -> Option<i64> {
    let bytes = URL_SAFE_NO_PAD.decode(cursor.trim()).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    value.get("ts")?.as_i64()
}
