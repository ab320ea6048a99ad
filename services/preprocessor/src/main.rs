//! Preprocessor binary
//!
//! ```text
//! preprocess <SYMBOL> [--from <date|rfc3339>] [--to <date|rfc3339>] [--report]
//! ```
//!
//! Reads the symbol's canonical series, writes the processed table and
//! prints summary statistics as JSON. `--report` adds the per-day missing
//! slot report. `PIPELINE_CONFIG` selects the config file.

use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate, Utc};
use persistence::canonical::CanonicalStore;
use preprocessor::missing::missing_data_report;
use preprocessor::pipeline::{preprocess_symbol, PreprocessOptions};
use preprocessor::session::TradingSession;
use serde_json::json;
use tracing_subscriber::EnvFilter;
use types::config::load_config;

struct Args {
    ticker: String,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    report: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut ticker = None;
    let mut from = None;
    let mut to = None;
    let mut report = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--from" => from = Some(parse_bound(args.next(), false)?),
            "--to" => to = Some(parse_bound(args.next(), true)?),
            "--report" => report = true,
            flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
            _ if ticker.is_none() => ticker = Some(arg),
            _ => bail!("unexpected argument {arg:?}"),
        }
    }

    let Some(ticker) = ticker else {
        bail!("usage: preprocess <SYMBOL> [--from <date>] [--to <date>] [--report]");
    };
    Ok(Args { ticker, from, to, report })
}

/// A bare date covers the whole UTC day.
fn parse_bound(value: Option<String>, end_of_day: bool) -> anyhow::Result<DateTime<Utc>> {
    let value = value.context("missing value for range flag")?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(&value, "%Y-%m-%d")
        .with_context(|| format!("invalid date {value:?}"))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    Ok(time.context("invalid time of day")?.and_utc())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;
    let config_path = std::env::var("PIPELINE_CONFIG").ok().map(PathBuf::from);
    let config = load_config(config_path.as_deref()).context("loading pipeline config")?;
    let symbol = config.resolve_symbol(&args.ticker)?;
    let options = PreprocessOptions::from_config(&config, &symbol)?;

    let store = CanonicalStore::open(&config.storage.canonical_db, config.table_names())
        .context("opening canonical store")?;
    tracing::info!(symbol = %symbol, period = %options.output_period(), "Preprocessing");

    let job_symbol = symbol.clone();
    let job_options = options.clone();
    let (from, to) = (args.from, args.to);
    let processed = tokio::task::spawn_blocking(move || {
        preprocess_symbol(&store, &job_symbol, &job_options, from, to, Utc::now())
    })
    .await??;

    let mut output = json!({
        "symbol": symbol,
        "period": processed.period,
        "bars": processed.bars.len(),
        "filled": processed.filled_count(),
        "missing_slots": processed.missing.len(),
        "dropped": processed.drops,
        "summary": processed.summary(),
    });
    if args.report {
        let session = options
            .session
            .clone()
            .unwrap_or_else(|| TradingSession::from_config(&config.session));
        let timestamps: Vec<DateTime<Utc>> = processed
            .bars
            .iter()
            .filter(|bar| !bar.filled)
            .map(|bar| bar.timestamp)
            .collect();
        let report = missing_data_report(&timestamps, &session, processed.period);
        output["missing_days"] = json!(report);
    }

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
