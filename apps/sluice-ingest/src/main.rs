mod cli;
mod explore;

use anyhow::{Context, Result};
use sluice_config::{AppConfig, Mode};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = cli::parse_args();
    let mut config = AppConfig::load().context("failed to load configuration")?;
    if let Some(mode) = args.mode {
        config.mode = mode;
    }

    match config.mode {
        Mode::Ingest => sluice_ingest_core::run_ingestion(config).await,
        Mode::Explore => explore::run_probe(&config).await,
    }
}
