//! Scripted quote source for tests and offline runs

use crate::key_pool::CredentialHandle;
use crate::upstream::{QuoteSource, UpstreamError, UpstreamSeries};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use types::ids::Symbol;
use types::period::BarPeriod;
use types::quote::QuoteDraft;

/// Replays queued responses in order; once drained, repeats `fallback`.
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<Vec<QuoteDraft>, UpstreamError>>>,
    fallback: Result<Vec<QuoteDraft>, UpstreamError>,
    calls: AtomicU32,
}

impl ScriptedSource {
    pub fn new(fallback: Result<Vec<QuoteDraft>, UpstreamError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicU32::new(0),
        }
    }

    pub fn push(&self, response: Result<Vec<QuoteDraft>, UpstreamError>) -> &Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuoteSource for ScriptedSource {
    async fn intraday(
        &self,
        symbol: &Symbol,
        _period: BarPeriod,
        _credential: &CredentialHandle,
    ) -> Result<UpstreamSeries, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        next.map(|bars| UpstreamSeries {
            symbol: symbol.clone(),
            time_zone: None,
            bars,
        })
    }
}

/// Draft with the given local timestamp and prices, as upstream sends it
pub fn draft(
    timestamp: &str,
    open: &str,
    high: &str,
    low: &str,
    close: &str,
    volume: &str,
) -> QuoteDraft {
    QuoteDraft {
        timestamp: timestamp.to_string(),
        open: open.to_string(),
        high: high.to_string(),
        low: low.to_string(),
        close: close.to_string(),
        volume: volume.to_string(),
    }
}
