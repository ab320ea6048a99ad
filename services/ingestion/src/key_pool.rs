//! API-key rotation and per-key call spacing
//!
//! Every symbol is bound to one credential for the life of the process.
//! Two calls on the same credential are at least `min_interval` apart;
//! symbols sharing a credential queue on its async mutex, which is held
//! across the wait so their combined rate respects the shared interval.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use types::clock::Clock;
use types::config::PipelineConfig;
use types::errors::ConfigurationError;
use types::ids::{ApiKey, CredentialId, Symbol};

/// Credential granted for one upstream call
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialHandle {
    pub id: CredentialId,
    pub api_key: ApiKey,
}

impl CredentialHandle {
    /// Loggable label; never the key itself.
    pub fn label(&self) -> String {
        format!("{}({})", self.id, self.api_key.masked())
    }
}

struct KeySlot {
    handle: CredentialHandle,
    min_interval: Duration,
    last_used: Mutex<Option<DateTime<Utc>>>,
}

pub struct RateLimitedKeyPool {
    clock: Arc<dyn Clock>,
    slots: Vec<KeySlot>,
    assignments: BTreeMap<Symbol, usize>,
}

impl RateLimitedKeyPool {
    /// Build the pool from validated configuration.
    pub fn from_config(
        config: &PipelineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigurationError> {
        let credentials = config
            .credentials
            .iter()
            .map(|(name, cfg)| {
                (
                    CredentialId::new(name.clone()),
                    cfg.api_key.clone(),
                    cfg.min_interval(),
                )
            })
            .collect();
        Self::new(credentials, config.credential_assignments()?, clock)
    }

    pub fn new(
        credentials: Vec<(CredentialId, ApiKey, Duration)>,
        assignments: BTreeMap<Symbol, CredentialId>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigurationError> {
        if credentials.is_empty() {
            return Err(ConfigurationError::NoCredentials);
        }
        let slots: Vec<KeySlot> = credentials
            .into_iter()
            .map(|(id, api_key, min_interval)| KeySlot {
                handle: CredentialHandle { id, api_key },
                min_interval,
                last_used: Mutex::new(None),
            })
            .collect();

        let mut index = BTreeMap::new();
        for (symbol, credential) in assignments {
            let slot = slots
                .iter()
                .position(|s| s.handle.id == credential)
                .ok_or_else(|| ConfigurationError::UnknownCredential {
                    symbol: symbol.clone(),
                    credential: credential.to_string(),
                })?;
            index.insert(symbol, slot);
        }

        Ok(Self {
            clock,
            slots,
            assignments: index,
        })
    }

    /// Wait until the symbol's credential may be used, then claim it.
    pub async fn acquire(&self, symbol: &Symbol) -> Result<CredentialHandle, ConfigurationError> {
        let slot = self.slot_for(symbol)?;

        let mut last_used = slot.last_used.lock().await;
        let mut waited = Duration::ZERO;
        if let Some(previous) = *last_used {
            let elapsed = (self.clock.now() - previous).to_std().unwrap_or(Duration::ZERO);
            if elapsed < slot.min_interval {
                waited = slot.min_interval - elapsed;
                self.clock.sleep(waited).await;
            }
        }
        *last_used = Some(self.clock.now());

        debug!(
            symbol = %symbol,
            credential = %slot.handle.id,
            wait_ms = waited.as_millis() as u64,
            "Credential acquired"
        );
        Ok(slot.handle.clone())
    }

    /// Credential statically bound to `symbol`
    pub fn assignment(&self, symbol: &Symbol) -> Option<&CredentialId> {
        self.assignments.get(symbol).map(|&i| &self.slots[i].handle.id)
    }

    pub async fn last_used(&self, credential: &CredentialId) -> Option<DateTime<Utc>> {
        let slot = self.slots.iter().find(|s| &s.handle.id == credential)?;
        *slot.last_used.lock().await
    }

    fn slot_for(&self, symbol: &Symbol) -> Result<&KeySlot, ConfigurationError> {
        self.assignments
            .get(symbol)
            .map(|&i| &self.slots[i])
            .ok_or_else(|| ConfigurationError::UnassignedSymbol(symbol.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use types::clock::ManualClock;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap()
    }

    fn pool(clock: Arc<ManualClock>, symbols: &[(&str, &str)]) -> RateLimitedKeyPool {
        let credentials = vec![
            (CredentialId::new("primary"), ApiKey::new("KEYPRIMARY"), Duration::from_secs(12)),
            (CredentialId::new("secondary"), ApiKey::new("KEYSECONDARY"), Duration::from_secs(12)),
        ];
        let assignments = symbols
            .iter()
            .map(|(s, c)| (Symbol::new(*s), CredentialId::new(*c)))
            .collect();
        RateLimitedKeyPool::new(credentials, assignments, clock).unwrap()
    }

    #[tokio::test]
    async fn test_shared_credential_spacing() {
        let clock = Arc::new(ManualClock::new(start()));
        let pool = pool(clock.clone(), &[("AAPL", "primary"), ("MSFT", "primary")]);

        let mut calls = Vec::new();
        for symbol in ["AAPL", "MSFT", "AAPL", "MSFT", "MSFT"] {
            pool.acquire(&Symbol::new(symbol)).await.unwrap();
            calls.push(clock.now());
        }

        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= chrono::Duration::seconds(12));
        }
        assert_eq!(clock.total_slept(), Duration::from_secs(48));
    }

    #[tokio::test]
    async fn test_separate_credentials_do_not_wait() {
        let clock = Arc::new(ManualClock::new(start()));
        let pool = pool(clock.clone(), &[("AAPL", "primary"), ("MSFT", "secondary")]);

        pool.acquire(&Symbol::new("AAPL")).await.unwrap();
        pool.acquire(&Symbol::new("MSFT")).await.unwrap();
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_elapsed_time_counts_toward_interval() {
        let clock = Arc::new(ManualClock::new(start()));
        let pool = pool(clock.clone(), &[("AAPL", "primary")]);

        pool.acquire(&Symbol::new("AAPL")).await.unwrap();
        clock.advance(Duration::from_secs(5));
        pool.acquire(&Symbol::new("AAPL")).await.unwrap();
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(7)]);
        assert_eq!(
            pool.last_used(&CredentialId::new("primary")).await,
            Some(start() + chrono::Duration::seconds(12))
        );
    }

    #[tokio::test]
    async fn test_concurrent_acquires_serialize() {
        let clock = Arc::new(ManualClock::new(start()));
        let pool = Arc::new(pool(clock.clone(), &[("AAPL", "primary"), ("MSFT", "primary")]));

        let tasks: Vec<_> = ["AAPL", "MSFT", "AAPL"]
            .into_iter()
            .map(|s| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.acquire(&Symbol::new(s)).await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(clock.total_slept(), Duration::from_secs(24));
    }

    #[tokio::test]
    async fn test_unassigned_symbol_rejected() {
        let clock = Arc::new(ManualClock::new(start()));
        let pool = pool(clock, &[("AAPL", "primary")]);
        let err = pool.acquire(&Symbol::new("TSLA")).await.unwrap_err();
        assert!(matches!(err, ConfigurationError::UnassignedSymbol(_)));
    }

    #[test]
    fn test_assignment_and_masked_label() {
        let clock = Arc::new(ManualClock::new(start()));
        let pool = pool(clock, &[("AAPL", "secondary")]);
        assert_eq!(
            pool.assignment(&Symbol::new("AAPL")),
            Some(&CredentialId::new("secondary"))
        );

        let handle = CredentialHandle {
            id: CredentialId::new("secondary"),
            api_key: ApiKey::new("KEYSECONDARY"),
        };
        assert_eq!(handle.label(), "secondary(KEYS...)");
    }

    #[test]
    fn test_unknown_credential_in_assignment() {
        let clock = Arc::new(ManualClock::new(start()));
        let result = RateLimitedKeyPool::new(
            vec![(CredentialId::new("primary"), ApiKey::new("K1234"), Duration::from_secs(1))],
            BTreeMap::from([(Symbol::new("AAPL"), CredentialId::new("missing"))]),
            clock,
        );
        assert!(matches!(result, Err(ConfigurationError::UnknownCredential { .. })));
    }
}
