//! Upstream market-data source
//!
//! `QuoteSource` is the seam the fetcher retries against. The production
//! implementation talks to an Alpha Vantage-style `TIME_SERIES_INTRADAY`
//! endpoint; tests plug in scripted sources.

use crate::key_pool::CredentialHandle;
use async_trait::async_trait;
use chrono_tz::Tz;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use types::config::UpstreamConfig;
use types::ids::Symbol;
use types::period::BarPeriod;
use types::quote::QuoteDraft;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("throttled by upstream: {0}")]
    Throttled(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Unknown symbol or invalid call; retrying cannot help
    #[error("rejected by upstream: {0}")]
    Rejected(String),
}

impl UpstreamError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, UpstreamError::Rejected(_))
    }
}

/// One intraday response
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamSeries {
    pub symbol: Symbol,
    /// Zone the naive bar timestamps are expressed in, when reported
    pub time_zone: Option<Tz>,
    pub bars: Vec<QuoteDraft>,
}

#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn intraday(
        &self,
        symbol: &Symbol,
        period: BarPeriod,
        credential: &CredentialHandle,
    ) -> Result<UpstreamSeries, UpstreamError>;
}

// ── Alpha Vantage client ────────────────────────────────────────────

pub struct AlphaVantageClient {
    client: Client,
    base_url: String,
    output_size: String,
}

impl AlphaVantageClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            output_size: config.output_size.clone(),
        })
    }
}

#[async_trait]
impl QuoteSource for AlphaVantageClient {
    async fn intraday(
        &self,
        symbol: &Symbol,
        period: BarPeriod,
        credential: &CredentialHandle,
    ) -> Result<UpstreamSeries, UpstreamError> {
        let interval = period
            .upstream_interval()
            .ok_or_else(|| UpstreamError::Rejected(format!("no intraday series for {period}")))?;

        let url = Url::parse_with_params(
            &self.base_url,
            &[
                ("function", "TIME_SERIES_INTRADAY"),
                ("symbol", symbol.as_str()),
                ("interval", interval),
                ("outputsize", self.output_size.as_str()),
                ("apikey", credential.api_key.expose()),
            ],
        )
        .map_err(|e| UpstreamError::Rejected(format!("bad base url: {e}")))?;

        debug!(
            symbol = %symbol,
            interval,
            credential = %credential.label(),
            "Requesting intraday series"
        );

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(UpstreamError::Throttled(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| UpstreamError::Transport(e.without_url().to_string()))?;
        parse_intraday(&body, symbol, period)
    }
}

/// Parse a `TIME_SERIES_INTRADAY` body.
///
/// Bars come back newest first; order is left to the caller.
pub fn parse_intraday(
    body: &str,
    symbol: &Symbol,
    period: BarPeriod,
) -> Result<UpstreamSeries, UpstreamError> {
    let json: Value =
        serde_json::from_str(body).map_err(|e| UpstreamError::Malformed(e.to_string()))?;

    if let Some(message) = json.get("Error Message").and_then(Value::as_str) {
        return Err(UpstreamError::Rejected(message.to_string()));
    }
    for notice in ["Note", "Information"] {
        if let Some(message) = json.get(notice).and_then(Value::as_str) {
            return Err(UpstreamError::Throttled(message.to_string()));
        }
    }

    let interval = period
        .upstream_interval()
        .ok_or_else(|| UpstreamError::Rejected(format!("no intraday series for {period}")))?;
    let series_key = format!("Time Series ({interval})");
    let series = json
        .get(&series_key)
        .and_then(Value::as_object)
        .ok_or_else(|| UpstreamError::Malformed(format!("missing {series_key:?}")))?;

    let time_zone = json
        .get("Meta Data")
        .and_then(|meta| meta.get("6. Time Zone"))
        .and_then(Value::as_str)
        .and_then(|name| match name.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                warn!(symbol = %symbol, zone = name, "Unknown upstream time zone");
                None
            }
        });

    let bars = series
        .iter()
        .map(|(timestamp, fields)| {
            let field = |name: &str| {
                fields
                    .get(name)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            QuoteDraft {
                timestamp: timestamp.clone(),
                open: field("1. open"),
                high: field("2. high"),
                low: field("3. low"),
                close: field("4. close"),
                volume: field("5. volume"),
            }
        })
        .collect();

    Ok(UpstreamSeries {
        symbol: symbol.clone(),
        time_zone,
        bars,
    })
}
