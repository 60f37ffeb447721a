use anyhow::{bail, Context, Result};

/// Ingestion run mode. `Explore` performs a single probing fetch and exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Ingest,
    Explore,
}

impl Mode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ingest" => Ok(Self::Ingest),
            "explore" => Ok(Self::Explore),
            other => bail!("unsupported MODE `{other}`; expected one of: ingest, explore"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Explore => "explore",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommit {
    On,
    Off,
}

impl SyncCommit {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            other => bail!("unsupported PG_SYNC_COMMIT `{other}`; expected one of: on, off"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub api_base_url: String,
    pub target_api_key: String,
    pub mode: Mode,
    pub partition_count: usize,
    pub batch_size: usize,
    pub db_write_concurrency: usize,
    pub max_pending_writes: usize,
    pub pg_sync_commit: SyncCommit,
    pub health_port: u16,
    pub auto_submit: bool,
    pub github_repo_url: Option<String>,
    pub min_timestamp_ms: i64,
    pub max_timestamp_ms: i64,
    pub progress_log_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an injected lookup. Tests use this to avoid
    /// mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = required(&lookup, "DATABASE_URL")?;
        let api_base_url = normalize_api_base_url(&required(&lookup, "API_BASE_URL")?);
        let target_api_key = required(&lookup, "TARGET_API_KEY")?;

        let mode = match lookup("MODE") {
            Some(raw) => Mode::parse(&raw)?,
            None => Mode::Ingest,
        };

        let pg_sync_commit = match lookup("PG_SYNC_COMMIT") {
            Some(raw) => SyncCommit::parse(&raw)?,
            None => SyncCommit::Off,
        };

        let min_timestamp_ms = parse_or(&lookup, "MIN_TIMESTAMP_MS", default_min_timestamp_ms())?;
        let max_timestamp_ms = parse_or(&lookup, "MAX_TIMESTAMP_MS", default_max_timestamp_ms())?;
        if min_timestamp_ms >= max_timestamp_ms {
            bail!(
                "MIN_TIMESTAMP_MS ({min_timestamp_ms}) must be below MAX_TIMESTAMP_MS ({max_timestamp_ms})"
            );
        }

        Ok(Self {
            database_url,
            api_base_url,
            target_api_key,
            mode,
            partition_count: parse_or(&lookup, "PARTITION_COUNT", default_partition_count())?
                .max(1),
            batch_size: parse_or(&lookup, "BATCH_SIZE", default_batch_size())?
                .clamp(1, default_batch_size()),
            db_write_concurrency: parse_or(
                &lookup,
                "DB_WRITE_CONCURRENCY",
                default_db_write_concurrency(),
            )?
            .max(1),
            max_pending_writes: parse_or(&lookup, "MAX_PENDING_WRITES", default_max_pending_writes())?
                .max(1),
            pg_sync_commit,
            health_port: parse_or(&lookup, "HEALTH_PORT", default_health_port())?,
            auto_submit: parse_bool_or(&lookup, "AUTO_SUBMIT", false)?,
            github_repo_url: lookup("GITHUB_REPO_URL").filter(|value| !value.trim().is_empty()),
            min_timestamp_ms,
            max_timestamp_ms,
            progress_log_interval_ms: parse_or(
                &lookup,
                "PROGRESS_LOG_INTERVAL_MS",
                default_progress_log_interval_ms(),
            )?,
            request_timeout_ms: parse_or(&lookup, "REQUEST_TIMEOUT_MS", default_request_timeout_ms())?,
            max_retries: parse_or(&lookup, "MAX_RETRIES", default_max_retries())?,
            retry_base_ms: parse_or(&lookup, "RETRY_BASE_MS", default_retry_base_ms())?,
            retry_max_ms: parse_or(&lookup, "RETRY_MAX_MS", default_retry_max_ms())?,
        })
    }

    /// Scheme + host of the API, without the `/api/v1` suffix. Dashboard
    /// endpoints (stream access, submissions) hang off the origin.
    pub fn origin(&self) -> String {
        self.api_base_url
            .strip_suffix("/api/v1")
            .unwrap_or(&self.api_base_url)
            .to_string()
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => bail!("missing required environment variable {key}"),
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: `{raw}`")),
        _ => Ok(default),
    }
}

fn parse_bool_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => bail!("invalid value for {key}: `{other}`"),
        },
        _ => Ok(default),
    }
}

/// Ensure the base URL points at the versioned API root regardless of how the
/// operator wrote it (`https://host`, `https://host/`, `https://host/api/v1/`).
fn normalize_api_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.ends_with("/api/v1") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/api/v1")
    }
}

fn default_partition_count() -> usize {
    8
}

fn default_batch_size() -> usize {
    5000
}

fn default_db_write_concurrency() -> usize {
    2
}

fn default_max_pending_writes() -> usize {
    100
}

fn default_health_port() -> u16 {
    8080
}

fn default_min_timestamp_ms() -> i64 {
    1_766_700_000_000
}

fn default_max_timestamp_ms() -> i64 {
    1_769_900_000_000
}

fn default_progress_log_interval_ms() -> u64 {
    15_000
}

fn default_request_timeout_ms() -> u64 {
    45_000
}

fn default_max_retries() -> u32 {
    8
}

fn default_retry_base_ms() -> u64 {
    250
}

fn default_retry_max_ms() -> u64 {
    15_000
}
