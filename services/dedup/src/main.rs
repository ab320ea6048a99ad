//! Dedup worker binary
//!
//! ```text
//! dedup                       stream from the topic (default)
//! dedup backfill              replay the whole topic journal
//! dedup backfill-archive      replay the raw archive of every symbol
//! ```
//!
//! `PIPELINE_CONFIG` selects the config file (default: pipeline.yaml);
//! `RUST_LOG` the log filter (default: info).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use dedup::backfill::{backfill_archive, backfill_journal};
use dedup::engine::DedupEngine;
use dedup::worker::{DedupWorker, WorkerConfig};
use persistence::archive::FsArchive;
use persistence::canonical::CanonicalStore;
use persistence::topic::TopicSubscriber;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use types::clock::SystemClock;
use types::config::load_config;
use types::ids::Symbol;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "stream".to_string());
    let config_path = std::env::var("PIPELINE_CONFIG").ok().map(PathBuf::from);
    let config = load_config(config_path.as_deref()).context("loading pipeline config")?;

    let store = CanonicalStore::open(&config.storage.canonical_db, config.table_names())
        .context("opening canonical store")?;
    let engine = Arc::new(DedupEngine::from_config(
        &config,
        Arc::new(store),
        Arc::new(SystemClock),
    ));
    tracing::info!(mode = %mode, key_mode = ?engine.key_mode(), "Starting dedup worker");

    let report = match mode.as_str() {
        "stream" => {
            let subscriber = TopicSubscriber::open(
                &config.storage.topic_dir,
                &config.dedup.consumer,
                config.dedup.poll_interval(),
            )
            .context("opening topic subscriber")?;

            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown requested");
                    signal_token.cancel();
                }
            });

            DedupWorker::new(engine, subscriber, WorkerConfig::from_config(&config.dedup))
                .run(shutdown)
                .await?
        }
        "backfill" => {
            let topic_dir = config.storage.topic_dir.clone();
            tokio::task::spawn_blocking(move || backfill_journal(&engine, &topic_dir)).await??
        }
        "backfill-archive" => {
            let archive = FsArchive::new(&config.storage.archive_dir);
            let symbols: Vec<Symbol> = config.symbols.keys().cloned().collect();
            backfill_archive(&engine, &archive, &symbols).await?
        }
        other => bail!("unknown mode {other:?}; expected stream, backfill or backfill-archive"),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
