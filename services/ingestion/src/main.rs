//! Quote publisher binary
//!
//! # Environment Variables
//! - `PIPELINE_CONFIG`: config file (default: pipeline.yaml)
//! - API keys referenced from the config as `${VAR}`; a `.env` file is loaded first
//! - `RUST_LOG`: log filter (default: info)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use ingestion::fetcher::ResilientFetcher;
use ingestion::key_pool::RateLimitedKeyPool;
use ingestion::metrics::AlertThresholds;
use ingestion::publish::PublishLoop;
use ingestion::upstream::AlphaVantageClient;
use persistence::archive::FsArchive;
use persistence::topic::TopicPublisher;
use persistence::watermark::WatermarkStore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use types::clock::{Clock, SystemClock};
use types::config::load_config;

const WATERMARK_NAME: &str = "publisher";

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var("PIPELINE_CONFIG").ok().map(PathBuf::from);
    let config = load_config(config_path.as_deref()).context("loading pipeline config")?;
    tracing::info!(
        symbols = config.symbols.len(),
        credentials = config.credentials.len(),
        "Starting quote publisher"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pool = Arc::new(RateLimitedKeyPool::from_config(&config, clock.clone())?);
    let source = Arc::new(AlphaVantageClient::new(&config.upstream)?);
    let fetcher = Arc::new(ResilientFetcher::from_config(&config, source, clock.clone()));
    let sink = Arc::new(
        TopicPublisher::open(&config.storage.topic_dir)
            .with_context(|| format!("opening topic {}", config.storage.topic_dir.display()))?,
    );
    let archive = Arc::new(FsArchive::new(&config.storage.archive_dir));

    // Resume after what this publisher itself got onto the topic.
    let watermarks = WatermarkStore::new(&config.storage.topic_dir, WATERMARK_NAME)?;
    let publisher = Arc::new(
        PublishLoop::new(pool, fetcher, sink, archive, clock)
            .with_config(&config)
            .with_watermark_store(watermarks)
            .context("restoring publish watermarks")?,
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            signal_token.cancel();
        }
    });

    let metrics = publisher.metrics();
    publisher.run(shutdown).await;

    for alert in metrics.check_thresholds(&AlertThresholds::default()) {
        tracing::warn!(metric = %alert.metric, level = ?alert.level, "{}", alert.message);
    }
    tracing::info!(counters = ?metrics.export(), "Quote publisher stopped");
    Ok(())
}
