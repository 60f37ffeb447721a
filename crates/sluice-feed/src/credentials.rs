use crate::model::StreamAccess;
use crate::transport::{header_pairs, HttpClient, HttpError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

const STREAM_ACCESS_PATH: &str = "/internal/dashboard/stream-access";

/// Refresh this long before the stated expiry.
const EXPIRY_BUFFER_SECS: u64 = 60;

const DEFAULT_EXPIRES_IN_SECS: u64 = 300;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub origin: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
struct CachedAccess {
    access: StreamAccess,
    expires_at: Instant,
}

/// Caches the short-lived stream credentials and coalesces refreshes: the
/// cache mutex is held across the refresh await, so concurrent callers queue
/// behind the one doing the work and pick up its result from the cache.
pub struct CredentialManager {
    http: Arc<HttpClient>,
    cfg: CredentialConfig,
    cache: Mutex<Option<CachedAccess>>,
}

impl CredentialManager {
    pub fn new(http: Arc<HttpClient>, cfg: CredentialConfig) -> Self {
        Self {
            http,
            cfg,
            cache: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Result<StreamAccess, HttpError> {
        let mut guard = self.cache.lock().await;
        if let Some(cached) = guard.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.access.clone());
            }
            debug!("stream credentials expired; refreshing");
        }

        let access = self.refresh().await?;
        let ttl = access.expires_in.saturating_sub(EXPIRY_BUFFER_SECS);
        *guard = Some(CachedAccess {
            access: access.clone(),
            expires_at: Instant::now() + Duration::from_secs(ttl),
        });
        Ok(access)
    }

    /// Drop the cache so the next `get()` refreshes. Called when the stream
    /// endpoint rejects the current token.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    async fn refresh(&self) -> Result<StreamAccess, HttpError> {
        let url = format!("{}{STREAM_ACCESS_PATH}", self.cfg.origin);
        let cookie = format!("dashboard_api_key={}", self.cfg.api_key);
        let referer = format!("{}/dashboard", self.cfg.origin);
        let headers = header_pairs(&[
            ("origin", &self.cfg.origin),
            ("referer", &referer),
            ("user-agent", BROWSER_USER_AGENT),
            ("cookie", &cookie),
            ("x-api-key", &self.cfg.api_key),
        ]);

        let response = self.http.post_json(&url, &json!({}), headers).await?;
        let access = parse_stream_access(response.body.as_json(), &url)?;
        info!(
            "acquired stream credentials (header `{}`, ttl {} s)",
            access.token_header, access.expires_in
        );
        Ok(access)
    }
}

fn parse_stream_access(body: Option<&Value>, url: &str) -> Result<StreamAccess, HttpError> {
    let stream_access = body
        .and_then(|value| value.get("streamAccess"))
        .ok_or_else(|| HttpError::network("POST", url, "response missing streamAccess"))?;

    let token = stream_access
        .get("token")
        .and_then(Value::as_str)
        .ok_or_else(|| HttpError::network("POST", url, "streamAccess.token missing or not a string"))?;

    let token_header = stream_access
        .get("tokenHeader")
        .and_then(Value::as_str)
        .ok_or_else(|| HttpError::network("POST", url, "streamAccess.tokenHeader missing"))?;

    Ok(StreamAccess {
        endpoint: stream_access
            .get("endpoint")
            .and_then(Value::as_str)
            .filter(|endpoint| !endpoint.trim().is_empty())
            .map(str::to_string),
        token_header: token_header.to_string(),
        token: token.to_string(),
        expires_in: stream_access
            .get("expiresIn")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportConfig;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct MockState {
        refreshes: AtomicU32,
    }

    async fn spawn_dashboard(state: Arc<MockState>) -> String {
        async fn handler(
            State(state): State<Arc<MockState>>,
            headers: HeaderMap,
        ) -> Json<Value> {
            assert!(headers.get("cookie").is_some(), "cookie header required");
            assert!(headers.get("x-api-key").is_some(), "api key header required");
            let count = state.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Json(json!({
                "streamAccess": {
                    "endpoint": "/events/stream",
                    "tokenHeader": "X-Stream-Token",
                    "token": format!("tok-{count}"),
                    "expiresIn": 3600,
                }
            }))
        }

        let app = Router::new()
            .route("/internal/dashboard/stream-access", post(handler))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn manager(origin: String) -> Arc<CredentialManager> {
        let http = Arc::new(
            HttpClient::new(&TransportConfig {
                request_timeout: Duration::from_secs(2),
                pool_size: 4,
            })
            .expect("client should build"),
        );
        Arc::new(CredentialManager::new(
            http,
            CredentialConfig {
                origin,
                api_key: "key-123".to_string(),
            },
        ))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_caches_until_invalidated() {
        let state = Arc::new(MockState::default());
        let origin = spawn_dashboard(state.clone()).await;
        let manager = manager(origin);

        let first = manager.get().await.expect("first get");
        let second = manager.get().await.expect("second get");
        assert_eq!(first.token, second.token);
        assert_eq!(state.refreshes.load(Ordering::SeqCst), 1);

        manager.invalidate().await;
        let third = manager.get().await.expect("third get");
        assert_ne!(first.token, third.token);
        assert_eq!(state.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_callers_share_one_refresh() {
        let state = Arc::new(MockState::default());
        let origin = spawn_dashboard(state.clone()).await;
        let manager = manager(origin);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get().await })
            })
            .collect();

        for task in tasks {
            let access = task.await.expect("join").expect("get");
            assert_eq!(access.token, "tok-1");
        }
        assert_eq!(state.refreshes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parse_rejects_missing_token() {
        let body = json!({"streamAccess": {"tokenHeader": "X-Stream-Token", "expiresIn": 60}});
        let err = parse_stream_access(Some(&body), "http://test").expect_err("missing token");
        assert!(err.message.contains("token"));
    }

    #[test]
    fn parse_defaults_optional_fields() {
        let body = json!({"streamAccess": {"tokenHeader": "X-Stream-Token", "token": "tok"}});
        let access = parse_stream_access(Some(&body), "http://test").expect("parse");
        assert_eq!(access.endpoint, None);
        assert_eq!(access.expires_in, DEFAULT_EXPIRES_IN_SECS);
    }
}
