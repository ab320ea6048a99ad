//! Publisher counters and alert thresholds
//!
//! Tracks ticks, fetch failures, validation drops, publish and archive
//! outcomes, plus tick latency, and raises alerts when a counter crosses
//! its configured threshold.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::publish::TickReport;

/// Core metrics for the publisher.
pub struct PublisherMetrics {
    // Scheduling
    pub ticks: AtomicU64,
    pub degraded_ticks: AtomicU64,
    pub tick_duration_ms: Mutex<LatencyTracker>,

    // Fetching
    pub fetch_failures: AtomicU64,
    pub validation_drops: AtomicU64,

    // Side effects
    pub published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub archive_failures: AtomicU64,

    // Alerts
    pub alerts: Mutex<Vec<Alert>>,
}

impl PublisherMetrics {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            degraded_ticks: AtomicU64::new(0),
            tick_duration_ms: Mutex::new(LatencyTracker::new(500)),
            fetch_failures: AtomicU64::new(0),
            validation_drops: AtomicU64::new(0),
            published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            archive_failures: AtomicU64::new(0),
            alerts: Mutex::new(Vec::new()),
        }
    }

    /// Fold one tick's report into the counters.
    pub fn record_tick(&self, report: &TickReport, duration_ms: u64) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        if report.is_degraded() {
            self.degraded_ticks.fetch_add(1, Ordering::Relaxed);
        }
        if report.fetch_failure.is_some() {
            self.fetch_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.validation_drops
            .fetch_add(report.rejected as u64, Ordering::Relaxed);
        self.published
            .fetch_add(report.published as u64, Ordering::Relaxed);
        self.publish_failures
            .fetch_add(report.publish_failures as u64, Ordering::Relaxed);
        if matches!(report.archive, Some(Err(_))) {
            self.archive_failures.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut tracker) = self.tick_duration_ms.lock() {
            tracker.record(duration_ms);
        }
    }

    /// Check alert thresholds and generate alerts.
    pub fn check_thresholds(&self, thresholds: &AlertThresholds) -> Vec<Alert> {
        let mut alerts = Vec::new();

        let fetch_failures = self.fetch_failures.load(Ordering::Relaxed);
        if fetch_failures > thresholds.max_fetch_failures {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                metric: "fetch_failures".to_string(),
                message: format!(
                    "Fetch failures: {} > threshold {}",
                    fetch_failures, thresholds.max_fetch_failures
                ),
            });
        }

        let publish_failures = self.publish_failures.load(Ordering::Relaxed);
        if publish_failures > thresholds.max_publish_failures {
            alerts.push(Alert {
                level: AlertLevel::Critical,
                metric: "publish_failures".to_string(),
                message: format!(
                    "Publish failures: {} > threshold {}",
                    publish_failures, thresholds.max_publish_failures
                ),
            });
        }

        let archive_failures = self.archive_failures.load(Ordering::Relaxed);
        if archive_failures > thresholds.max_archive_failures {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                metric: "archive_failures".to_string(),
                message: format!(
                    "Archive failures: {} > threshold {}",
                    archive_failures, thresholds.max_archive_failures
                ),
            });
        }

        if let Ok(tracker) = self.tick_duration_ms.lock() {
            if let Some(p99) = tracker.percentile(99) {
                if p99 > thresholds.max_tick_p99_ms {
                    alerts.push(Alert {
                        level: AlertLevel::Info,
                        metric: "tick_duration_p99".to_string(),
                        message: format!(
                            "Tick duration p99: {}ms > threshold {}ms",
                            p99, thresholds.max_tick_p99_ms
                        ),
                    });
                }
            }
        }

        if let Ok(mut alert_store) = self.alerts.lock() {
            alert_store.extend(alerts.clone());
        }

        alerts
    }

    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("ticks".to_string(), self.ticks.load(Ordering::Relaxed));
        m.insert("degraded_ticks".to_string(), self.degraded_ticks.load(Ordering::Relaxed));
        m.insert("fetch_failures".to_string(), self.fetch_failures.load(Ordering::Relaxed));
        m.insert("validation_drops".to_string(), self.validation_drops.load(Ordering::Relaxed));
        m.insert("published".to_string(), self.published.load(Ordering::Relaxed));
        m.insert("publish_failures".to_string(), self.publish_failures.load(Ordering::Relaxed));
        m.insert("archive_failures".to_string(), self.archive_failures.load(Ordering::Relaxed));
        m
    }
}

impl Default for PublisherMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded window of samples for percentile queries.
pub struct LatencyTracker {
    samples: std::collections::VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: std::collections::VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
        }
    }

    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Nearest-rank percentile (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = (p.min(100) as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub level: AlertLevel,
    pub metric: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct AlertThresholds {
    pub max_fetch_failures: u64,
    pub max_publish_failures: u64,
    pub max_archive_failures: u64,
    pub max_tick_p99_ms: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_fetch_failures: 20,
            max_publish_failures: 0,
            max_archive_failures: 5,
            max_tick_p99_ms: 120_000,
        }
    }
}
