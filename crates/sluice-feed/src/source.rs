use crate::credentials::{CredentialManager, BROWSER_USER_AGENT};
use crate::limiter::RateLimiter;
use crate::model::{Page, PageRequest};
use crate::normalize::normalize_page;
use crate::retry::{self, RetryPolicy};
use crate::transport::{header_pairs, HttpClient, HttpError, HttpResponse};
use reqwest::header::HeaderMap;
use reqwest::Url;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Undocumented feed path used when the stream credentials omit an endpoint.
const FALLBACK_FEED_PATH: &str = "/events/d4ta/x7k9/feed";

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub origin: String,
    pub api_base_url: String,
    pub api_key: String,
    pub retry: RetryPolicy,
}

/// Unified page fetch. The stream endpoint is the fast path; a 401/403 that
/// survives one credential refresh latches the documented `/events` endpoint
/// for the rest of the process so the two paths never flap.
pub struct EventsSource {
    http: Arc<HttpClient>,
    limiter: Arc<RateLimiter>,
    credentials: Arc<CredentialManager>,
    cfg: SourceConfig,
    fallback_latched: AtomicBool,
}

impl EventsSource {
    pub fn new(
        http: Arc<HttpClient>,
        limiter: Arc<RateLimiter>,
        credentials: Arc<CredentialManager>,
        cfg: SourceConfig,
    ) -> Self {
        Self {
            http,
            limiter,
            credentials,
            cfg,
            fallback_latched: AtomicBool::new(false),
        }
    }

    pub fn fallback_latched(&self) -> bool {
        self.fallback_latched.load(Ordering::Acquire)
    }

    pub async fn fetch_page(&self, req: &PageRequest) -> Result<Page, HttpError> {
        let response = if self.fallback_latched() {
            self.fetch_documented(req).await?
        } else {
            match self.fetch_primary(req).await {
                Ok(response) => response,
                Err(err) if err.status == 401 || err.status == 403 => {
                    warn!(
                        "stream endpoint rejected credentials (status {}); refreshing once",
                        err.status
                    );
                    self.credentials.invalidate().await;
                    match self.fetch_primary(req).await {
                        Ok(response) => response,
                        Err(second) => {
                            warn!(
                                "stream endpoint still failing after refresh ({second}); \
                                 switching to the documented endpoint for this process"
                            );
                            self.latch_fallback();
                            self.fetch_documented(req).await?
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        };

        Ok(normalize_page(response.body.as_json()))
    }

    fn latch_fallback(&self) {
        self.fallback_latched.store(true, Ordering::Release);
    }

    async fn fetch_primary(&self, req: &PageRequest) -> Result<HttpResponse, HttpError> {
        let access = match self.credentials.get().await {
            Ok(access) => access,
            Err(err) => {
                // Without credentials there is no primary path to speak of.
                warn!("stream credential acquisition failed ({err}); latching fallback");
                self.latch_fallback();
                return self.fetch_documented(req).await;
            }
        };

        let endpoint = access.endpoint.as_deref().unwrap_or(FALLBACK_FEED_PATH);
        let url = build_url(&self.cfg.origin, endpoint, req, true)?;
        let referer = format!("{}/dashboard", self.cfg.origin);
        let headers = header_pairs(&[
            (access.token_header.as_str(), access.token.as_str()),
            ("x-api-key", &self.cfg.api_key),
            ("origin", &self.cfg.origin),
            ("referer", &referer),
            ("user-agent", BROWSER_USER_AGENT),
        ]);

        self.request_with_retry(url, headers).await
    }

    async fn fetch_documented(&self, req: &PageRequest) -> Result<HttpResponse, HttpError> {
        let url = build_url(&self.cfg.api_base_url, "/events", req, false)?;
        let headers = header_pairs(&[("x-api-key", self.cfg.api_key.as_str())]);
        self.request_with_retry(url, headers).await
    }

    async fn request_with_retry(
        &self,
        url: String,
        headers: HeaderMap,
    ) -> Result<HttpResponse, HttpError> {
        retry::execute(&self.cfg.retry, || self.request_once(&url, headers.clone())).await
    }

    /// One attempt: limiter pre-delay, the request itself, then limiter
    /// bookkeeping on the outcome.
    async fn request_once(&self, url: &str, headers: HeaderMap) -> Result<HttpResponse, HttpError> {
        let delay = self.limiter.pre_request_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.http.get(url, headers).await {
            Ok(response) => {
                self.limiter.observe_headers(&response.headers);
                self.limiter.record_success();
                Ok(response)
            }
            Err(err) => {
                if err.status == 429 {
                    self.limiter.observe_headers(&err.headers);
                    self.limiter.record_429();
                }
                Err(err)
            }
        }
    }
}

fn build_url(
    base: &str,
    path: &str,
    req: &PageRequest,
    include_window: bool,
) -> Result<String, HttpError> {
    let mut url = Url::parse(&format!("{base}{path}"))
        .map_err(|err| HttpError::network("GET", base, format!("invalid url: {err}")))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("limit", &req.limit.to_string());
        if let Some(cursor) = &req.cursor {
            pairs.append_pair("cursor", cursor);
        }
        if include_window {
            if let Some(since) = req.since {
                pairs.append_pair("since", &since.to_string());
            }
            if let Some(until) = req.until {
                pairs.append_pair("until", &until.to_string());
            }
        }
    }
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialConfig;
    use crate::transport::TransportConfig;
    use axum::extract::{Query, State};
    use axum::http::{HeaderMap as AxumHeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Copy, PartialEq)]
    enum StreamBehavior {
        Accept,
        RejectAll(StatusCode),
        RejectFirstToken,
    }

    struct MockState {
        stream_calls: AtomicU32,
        documented_calls: AtomicU32,
        refreshes: AtomicU32,
        behavior: StreamBehavior,
        cursors_seen: Mutex<Vec<Option<String>>>,
    }

    impl MockState {
        fn new(behavior: StreamBehavior) -> Arc<Self> {
            Arc::new(Self {
                stream_calls: AtomicU32::new(0),
                documented_calls: AtomicU32::new(0),
                refreshes: AtomicU32::new(0),
                behavior,
                cursors_seen: Mutex::new(Vec::new()),
            })
        }
    }

    fn page_body() -> Value {
        json!({
            "data": [{"id": "evt-1", "timestamp": 1_768_500_000_000_i64}],
            "hasMore": false,
            "meta": {"total": 1}
        })
    }

    async fn spawn_api(state: Arc<MockState>) -> String {
        async fn stream_access(State(state): State<Arc<MockState>>) -> Json<Value> {
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

        async fn stream(
            State(state): State<Arc<MockState>>,
            headers: AxumHeaderMap,
        ) -> (StatusCode, Json<Value>) {
            state.stream_calls.fetch_add(1, Ordering::SeqCst);
            let token = headers
                .get("x-stream-token")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let status = match state.behavior {
                StreamBehavior::Accept => StatusCode::OK,
                StreamBehavior::RejectAll(status) => status,
                StreamBehavior::RejectFirstToken if token == "tok-1" => StatusCode::UNAUTHORIZED,
                StreamBehavior::RejectFirstToken => StatusCode::OK,
            };
            (status, Json(page_body()))
        }

        async fn documented(
            State(state): State<Arc<MockState>>,
            Query(params): Query<HashMap<String, String>>,
        ) -> Json<Value> {
            state.documented_calls.fetch_add(1, Ordering::SeqCst);
            state
                .cursors_seen
                .lock()
                .expect("cursor lock")
                .push(params.get("cursor").cloned());
            Json(page_body())
        }

        let app = Router::new()
            .route("/internal/dashboard/stream-access", post(stream_access))
            .route("/events/stream", get(stream))
            .route("/api/v1/events", get(documented))
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

    fn source(origin: &str) -> EventsSource {
        let http = Arc::new(
            HttpClient::new(&TransportConfig {
                request_timeout: Duration::from_secs(2),
                pool_size: 4,
            })
            .expect("client should build"),
        );
        let credentials = Arc::new(CredentialManager::new(
            http.clone(),
            CredentialConfig {
                origin: origin.to_string(),
                api_key: "key-123".to_string(),
            },
        ));
        EventsSource::new(
            http,
            Arc::new(RateLimiter::new()),
            credentials,
            SourceConfig {
                origin: origin.to_string(),
                api_base_url: format!("{origin}/api/v1"),
                api_key: "key-123".to_string(),
                retry: RetryPolicy {
                    max_attempts: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                },
            },
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn happy_path_uses_the_stream_endpoint() {
        let state = MockState::new(StreamBehavior::Accept);
        let origin = spawn_api(state.clone()).await;
        let source = source(&origin);

        let page = source
            .fetch_page(&PageRequest {
                limit: 100,
                ..PageRequest::default()
            })
            .await
            .expect("fetch should succeed");

        assert_eq!(page.events.len(), 1);
        assert_eq!(state.stream_calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.documented_calls.load(Ordering::SeqCst), 0);
        assert!(!source.fallback_latched());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn persistent_auth_failure_latches_the_documented_endpoint() {
        let state = MockState::new(StreamBehavior::RejectAll(StatusCode::FORBIDDEN));
        let origin = spawn_api(state.clone()).await;
        let source = source(&origin);

        let page = source
            .fetch_page(&PageRequest {
                limit: 100,
                ..PageRequest::default()
            })
            .await
            .expect("fallback should succeed");

        assert_eq!(page.events.len(), 1);
        // One rejected call, one refresh, one more rejected call, then fallback.
        assert_eq!(state.stream_calls.load(Ordering::SeqCst), 2);
        assert_eq!(state.refreshes.load(Ordering::SeqCst), 2);
        assert_eq!(state.documented_calls.load(Ordering::SeqCst), 1);
        assert!(source.fallback_latched());

        // Latched: the stream endpoint is never consulted again.
        source
            .fetch_page(&PageRequest {
                limit: 100,
                cursor: Some("abc".to_string()),
                ..PageRequest::default()
            })
            .await
            .expect("second fetch");
        assert_eq!(state.stream_calls.load(Ordering::SeqCst), 2);
        assert_eq!(state.documented_calls.load(Ordering::SeqCst), 2);
        let cursors = state.cursors_seen.lock().expect("cursor lock").clone();
        assert_eq!(cursors, vec![None, Some("abc".to_string())]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn auth_recovery_after_refresh_does_not_latch() {
        // The first token is rejected; the refreshed one is accepted.
        let state = MockState::new(StreamBehavior::RejectFirstToken);
        let origin = spawn_api(state.clone()).await;
        let source = source(&origin);

        let page = source
            .fetch_page(&PageRequest {
                limit: 100,
                ..PageRequest::default()
            })
            .await
            .expect("fetch should succeed");

        assert_eq!(page.events.len(), 1);
        assert!(!source.fallback_latched());
        assert_eq!(state.documented_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn build_url_encodes_the_query() {
        let url = build_url(
            "https://api.test",
            "/events/stream",
            &PageRequest {
                limit: 500,
                cursor: Some("c_ur-sor".to_string()),
                since: Some(1),
                until: Some(2),
            },
            true,
        )
        .expect("url builds");
        assert_eq!(
            url,
            "https://api.test/events/stream?limit=500&cursor=c_ur-sor&since=1&until=2"
        );
    }

    #[test]
    fn documented_url_omits_the_window() {
        let url = build_url(
            "https://api.test/api/v1",
            "/events",
            &PageRequest {
                limit: 100,
                cursor: None,
                since: Some(1),
                until: Some(2),
            },
            false,
        )
        .expect("url builds");
        assert_eq!(url, "https://api.test/api/v1/events?limit=100");
    }
}
