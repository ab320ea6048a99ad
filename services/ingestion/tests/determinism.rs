//! Publisher determinism
//!
//! Identical upstream responses must yield identical published quotes and
//! archive contents, whatever the publisher instance, and overlapping
//! upstream windows must not republish bars already sent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use ingestion::fetcher::{ResilientFetcher, RetryPolicy};
use ingestion::key_pool::RateLimitedKeyPool;
use ingestion::publish::PublishLoop;
use ingestion::scripted::{draft, ScriptedSource};
use persistence::archive::{ArchiveStore, FsArchive};
use persistence::channel::{memory_channel, EnvelopeSource, MemorySource};
use tempfile::TempDir;
use types::clock::{Clock, ManualClock};
use types::ids::{ApiKey, CredentialId, Symbol};
use types::quote::{Quote, QuoteDraft};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 21, 10, 0).unwrap()
}

fn window(first_minute: u32, count: u32) -> Vec<QuoteDraft> {
    (0..count)
        .map(|i| {
            let minute = first_minute + i * 5;
            let ts = format!("2024-03-01 15:{minute:02}:00");
            let close = format!("{}.50", 170 + minute);
            let price = |base: u32| (base + minute).to_string();
            draft(&ts, &price(170), &price(171), &price(169), &close, "1000")
        })
        .rev()
        .collect()
}

struct Harness {
    publisher: PublishLoop,
    source: MemorySource,
    clock: Arc<ManualClock>,
}

fn harness(upstream: Arc<ScriptedSource>, archive_root: &std::path::Path) -> Harness {
    let clock = Arc::new(ManualClock::new(start()));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let pool = Arc::new(
        RateLimitedKeyPool::new(
            vec![(
                CredentialId::new("primary"),
                ApiKey::new("KEYPRIMARY"),
                Duration::from_secs(12),
            )],
            BTreeMap::from([(Symbol::new("AAPL"), CredentialId::new("primary"))]),
            dyn_clock.clone(),
        )
        .unwrap(),
    );
    let fetcher = Arc::new(ResilientFetcher::new(
        upstream,
        dyn_clock.clone(),
        RetryPolicy::default(),
        chrono::Duration::seconds(60),
        chrono_tz::America::New_York,
    ));
    let (sink, source) = memory_channel(256);
    Harness {
        publisher: PublishLoop::new(
            pool,
            fetcher,
            Arc::new(sink),
            Arc::new(FsArchive::new(archive_root)),
            dyn_clock,
        ),
        source,
        clock,
    }
}

async fn drain(source: &mut MemorySource, expected: usize) -> Vec<Quote> {
    let mut quotes = Vec::new();
    while quotes.len() < expected {
        let batch = source.next_batch(expected).await.unwrap();
        quotes.extend(batch.into_iter().map(|d| d.envelope.quote));
    }
    quotes
}

#[tokio::test]
async fn test_identical_upstream_identical_output() {
    let tmp = TempDir::new().unwrap();
    let symbol = Symbol::new("AAPL");
    let mut runs = Vec::new();

    for run in ["a", "b"] {
        let root = tmp.path().join(run);
        let mut h = harness(Arc::new(ScriptedSource::new(Ok(window(0, 6)))), &root);
        let report = h.publisher.tick(&symbol).await;
        assert_eq!(report.published, 6);

        let published = drain(&mut h.source, 6).await;
        let archive = FsArchive::new(&root);
        let keys = archive.list(&symbol).await.unwrap();
        assert_eq!(keys.len(), 1);
        let archived: Vec<Quote> = archive
            .get(&keys[0])
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.quote)
            .collect();
        assert_eq!(published, archived);
        runs.push(published);
    }

    assert_eq!(runs[0], runs[1]);
    assert!(runs[0].windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[tokio::test]
async fn test_overlapping_windows_publish_each_bar_once() {
    let tmp = TempDir::new().unwrap();
    let symbol = Symbol::new("AAPL");
    let upstream = Arc::new(ScriptedSource::new(Ok(window(10, 6))));
    upstream.push(Ok(window(0, 6)));
    let mut h = harness(upstream, tmp.path());

    assert_eq!(h.publisher.tick(&symbol).await.published, 6);
    h.clock.advance(Duration::from_secs(300));
    // 15:10 .. 15:35 overlaps the first window by four bars
    assert_eq!(h.publisher.tick(&symbol).await.published, 2);

    let quotes = drain(&mut h.source, 8).await;
    let mut stamps: Vec<DateTime<Utc>> = quotes.iter().map(|q| q.timestamp).collect();
    stamps.dedup();
    assert_eq!(stamps.len(), 8);
    assert_eq!(h.publisher.watermark(&symbol), stamps.last().copied());
}
