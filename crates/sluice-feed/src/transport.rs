use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const ERROR_BODY_LIMIT: usize = 500;

/// Typed transport failure. `status == 0` means the request never produced an
/// HTTP response (connect failure, timeout, abort); every other value is the
/// server's status code.
#[derive(Debug, Clone, Error)]
#[error("{method} {url} failed with status {status}: {message}")]
pub struct HttpError {
    pub status: u16,
    pub method: &'static str,
    pub url: String,
    pub message: String,
    /// Response headers, lowercased. Empty for network-level failures.
    pub headers: HashMap<String, String>,
}

impl HttpError {
    pub fn network(method: &'static str, url: &str, message: impl ToString) -> Self {
        Self {
            status: 0,
            method,
            url: url.to_string(),
            message: message.to_string(),
            headers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Body {
    Json(Value),
    Text(String),
}

impl Body {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(value) => Some(value),
            Body::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Body,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub request_timeout: Duration,
    /// Keep-alive pool width; sized to partitions + headroom by the caller.
    pub pool_size: usize,
}

/// Thin reqwest wrapper: keep-alive pool, gzip/deflate, JSON-or-text body
/// decoding, and non-2xx translated into [`HttpError`].
#[derive(Clone)]
pub struct HttpClient {
    http: Client,
}

impl HttpClient {
    pub fn new(cfg: &TransportConfig) -> Result<Self, HttpError> {
        let http = Client::builder()
            .timeout(cfg.request_timeout)
            .pool_max_idle_per_host(cfg.pool_size.max(1))
            .gzip(true)
            .deflate(true)
            .build()
            .map_err(|err| HttpError::network("INIT", "", err))?;
        Ok(Self { http })
    }

    pub async fn get(&self, url: &str, headers: HeaderMap) -> Result<HttpResponse, HttpError> {
        let request = self.http.get(url).headers(headers);
        self.execute("GET", url, request).await
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
        headers: HeaderMap,
    ) -> Result<HttpResponse, HttpError> {
        let request = self.http.post(url).headers(headers).json(body);
        self.execute("POST", url, request).await
    }

    pub async fn post_text(
        &self,
        url: &str,
        body: String,
        headers: HeaderMap,
    ) -> Result<HttpResponse, HttpError> {
        let request = self
            .http
            .post(url)
            .headers(headers)
            .header(CONTENT_TYPE, "text/plain")
            .body(body);
        self.execute("POST", url, request).await
    }

    async fn execute(
        &self,
        method: &'static str,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<HttpResponse, HttpError> {
        let response = request
            .send()
            .await
            .map_err(|err| HttpError::network(method, url, err))?;

        let status = response.status().as_u16();
        let headers = flatten_headers(response.headers());
        let is_json = headers
            .get("content-type")
            .is_some_and(|value| value.contains("json"));

        let text = response
            .text()
            .await
            .map_err(|err| HttpError::network(method, url, err))?;

        if !(200..300).contains(&status) {
            return Err(HttpError {
                status,
                method,
                url: url.to_string(),
                message: truncate(&text, ERROR_BODY_LIMIT),
                headers,
            });
        }

        let body = if is_json {
            match serde_json::from_str::<Value>(&text) {
                Ok(value) => Body::Json(value),
                // A JSON content type with an unparseable body is a broken
                // response, not a recognizable page shape.
                Err(err) => {
                    return Err(HttpError::network(
                        method,
                        url,
                        format!("invalid JSON body: {err}"),
                    ))
                }
            }
        } else {
            Body::Text(text)
        };

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Build a HeaderMap from string pairs. Pairs the HTTP layer rejects are
/// skipped with a warning rather than failing the request outright.
pub fn header_pairs(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!("skipping unrepresentable header `{name}`"),
        }
    }
    map
}

fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}

fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        input.to_string()
    } else {
        input.chars().take(max_chars).collect()
    }
}
