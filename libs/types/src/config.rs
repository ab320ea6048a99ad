//! Pipeline configuration
//!
//! Loaded once at startup from YAML, with `${VAR}` and `${VAR:-default}`
//! environment interpolation so API keys stay out of the file. Every field
//! other than `credentials` and `symbols` has a default. `validate` rejects
//! anything the workers could only discover later at runtime.
//!
//! ```yaml
//! credentials:
//!   primary:
//!     api_key: ${ALPHAVANTAGE_KEY_1}
//!   secondary:
//!     api_key: ${ALPHAVANTAGE_KEY_2}
//!     min_interval_secs: 12
//! symbols:
//!   AAPL:
//!     credential: primary
//!     table_name: apple_stock
//!   GOOGL:
//!     table_name: google_stock
//!     poll_interval_secs: 300
//!     interval: 5min
//! ```

use crate::errors::ConfigurationError;
use crate::ids::{ApiKey, CredentialId, IdentityKeyMode, Symbol};
use crate::period::BarPeriod;
use chrono::{NaiveDate, NaiveTime, Weekday};
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Default config file looked up by the binaries
pub const DEFAULT_CONFIG_PATH: &str = "pipeline.yaml";

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Named API credentials
    pub credentials: BTreeMap<String, CredentialConfig>,
    /// Tracked symbols
    pub symbols: BTreeMap<Symbol, SymbolConfig>,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub preprocessing: PreprocessingConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub api_key: ApiKey,
    /// Minimum spacing between two calls on this key (12 s = 5 calls/min)
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
}

impl CredentialConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    /// Explicit credential; unassigned symbols are spread round-robin
    #[serde(default)]
    pub credential: Option<String>,
    /// Base name of the symbol's tables in the canonical store
    pub table_name: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Upstream bar interval
    #[serde(default)]
    pub interval: BarPeriod,
}

impl SymbolConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// "compact" (latest 100 bars) or "full"
    #[serde(default = "default_output_size")]
    pub output_size: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            output_size: default_output_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random (0.0 = none)
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_factor: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// How far past "now" a bar timestamp may lie
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,
}

impl ValidationConfig {
    pub fn clock_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.clock_skew_secs as i64)
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            clock_skew_secs: default_clock_skew_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    #[serde(default = "default_open", with = "hhmm")]
    pub open: NaiveTime,
    #[serde(default = "default_close", with = "hhmm")]
    pub close: NaiveTime,
    #[serde(default = "default_weekdays")]
    pub weekdays: Vec<Weekday>,
    /// Additional closed dates
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
    /// Also close on US federal holidays (with weekend observance)
    #[serde(default = "default_true")]
    pub us_federal_holidays: bool,
}

impl SessionConfig {
    pub fn weekday_set(&self) -> BTreeSet<u32> {
        self.weekdays
            .iter()
            .map(|day| day.num_days_from_monday())
            .collect()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            open: default_open(),
            close: default_close(),
            weekdays: default_weekdays(),
            holidays: Vec::new(),
            us_federal_holidays: true,
        }
    }
}

/// How gap-filled rows get their volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeFill {
    #[default]
    Zero,
    Carry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorWindows {
    #[serde(default = "default_ma_short")]
    pub ma_short: usize,
    #[serde(default = "default_ma_long")]
    pub ma_long: usize,
    #[serde(default = "default_volatility")]
    pub volatility: usize,
    #[serde(default = "default_volume_ma")]
    pub volume_ma: usize,
    #[serde(default = "default_momentum")]
    pub momentum: usize,
    /// In trading days
    #[serde(default = "default_eod_ma")]
    pub eod_ma: usize,
}

impl Default for IndicatorWindows {
    fn default() -> Self {
        Self {
            ma_short: default_ma_short(),
            ma_long: default_ma_long(),
            volatility: default_volatility(),
            volume_ma: default_volume_ma(),
            momentum: default_momentum(),
            eod_ma: default_eod_ma(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    #[serde(default = "default_true")]
    pub session_filter: bool,
    /// Target period; `None` keeps the upstream interval
    #[serde(default)]
    pub resample: Option<BarPeriod>,
    #[serde(default = "default_true")]
    pub gap_fill: bool,
    /// Maximum consecutive synthesized bars per gap
    #[serde(default = "default_gap_fill_cap")]
    pub gap_fill_cap: usize,
    #[serde(default)]
    pub volume_fill: VolumeFill,
    #[serde(default = "default_true")]
    pub indicators: bool,
    #[serde(default)]
    pub windows: IndicatorWindows,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            session_filter: true,
            resample: None,
            gap_fill: true,
            gap_fill_cap: default_gap_fill_cap(),
            volume_fill: VolumeFill::Zero,
            indicators: true,
            windows: IndicatorWindows::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default)]
    pub key_mode: IdentityKeyMode,
    /// Envelopes per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_dedup_poll_ms")]
    pub poll_interval_ms: u64,
    /// Recently committed keys kept in memory
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,
    /// Cursor name in the topic directory
    #[serde(default = "default_consumer")]
    pub consumer: String,
}

impl DedupConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            key_mode: IdentityKeyMode::default(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_dedup_poll_ms(),
            recent_window: default_recent_window(),
            consumer: default_consumer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_topic_dir")]
    pub topic_dir: PathBuf,
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    #[serde(default = "default_canonical_db")]
    pub canonical_db: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            topic_dir: default_topic_dir(),
            archive_dir: default_archive_dir(),
            canonical_db: default_canonical_db(),
        }
    }
}

fn default_min_interval_secs() -> u64 {
    12
}
fn default_poll_interval_secs() -> u64 {
    300
}
fn default_base_url() -> String {
    "https://www.alphavantage.co/query".to_string()
}
fn default_output_size() -> String {
    "compact".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_clock_skew_secs() -> u64 {
    60
}
fn default_timezone() -> Tz {
    chrono_tz::America::New_York
}
fn default_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN)
}
fn default_close() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN)
}
fn default_weekdays() -> Vec<Weekday> {
    vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
    ]
}
fn default_true() -> bool {
    true
}
fn default_gap_fill_cap() -> usize {
    12
}
fn default_ma_short() -> usize {
    7
}
fn default_ma_long() -> usize {
    20
}
fn default_volatility() -> usize {
    20
}
fn default_volume_ma() -> usize {
    5
}
fn default_momentum() -> usize {
    14
}
fn default_eod_ma() -> usize {
    5
}
fn default_batch_size() -> usize {
    500
}
fn default_dedup_poll_ms() -> u64 {
    1_000
}
fn default_recent_window() -> usize {
    10_000
}
fn default_consumer() -> String {
    "dedup".to_string()
}
fn default_topic_dir() -> PathBuf {
    PathBuf::from("data/topic")
}
fn default_archive_dir() -> PathBuf {
    PathBuf::from("data/archive")
}
fn default_canonical_db() -> PathBuf {
    PathBuf::from("data/canonical.db")
}

/// Session times written as "09:30" or "09:30:00"
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}

impl PipelineConfig {
    /// Configuration for a tracked symbol
    pub fn symbol(&self, symbol: &Symbol) -> Result<&SymbolConfig, ConfigurationError> {
        self.symbols
            .get(symbol)
            .ok_or_else(|| ConfigurationError::UnknownSymbol(symbol.to_string()))
    }

    /// Resolve a ticker given on a command line
    pub fn resolve_symbol(&self, ticker: &str) -> Result<Symbol, ConfigurationError> {
        Symbol::try_new(ticker)
            .filter(|symbol| self.symbols.contains_key(symbol))
            .ok_or_else(|| ConfigurationError::UnknownSymbol(ticker.to_string()))
    }

    /// Canonical table base name per symbol
    pub fn table_names(&self) -> BTreeMap<Symbol, String> {
        self.symbols
            .iter()
            .map(|(symbol, cfg)| (symbol.clone(), cfg.table_name.clone()))
            .collect()
    }

    /// Static symbol-to-credential assignment
    ///
    /// Explicit mappings win; the remaining symbols, in sorted order, are
    /// spread round-robin over the credentials sorted by name.
    pub fn credential_assignments(
        &self,
    ) -> Result<BTreeMap<Symbol, CredentialId>, ConfigurationError> {
        let names: Vec<&String> = self.credentials.keys().collect();
        let mut assignments = BTreeMap::new();
        let mut next = 0usize;

        for (symbol, cfg) in &self.symbols {
            let credential = match &cfg.credential {
                Some(name) if self.credentials.contains_key(name) => name.clone(),
                Some(name) => {
                    return Err(ConfigurationError::UnknownCredential {
                        symbol: symbol.clone(),
                        credential: name.clone(),
                    })
                }
                None => {
                    if names.is_empty() {
                        return Err(ConfigurationError::UnassignedSymbol(symbol.clone()));
                    }
                    let name = names[next % names.len()].clone();
                    next += 1;
                    name
                }
            };
            assignments.insert(symbol.clone(), CredentialId::new(credential));
        }

        Ok(assignments)
    }
}

/// Load configuration from a YAML file.
///
/// `path` defaults to [`DEFAULT_CONFIG_PATH`].
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig, ConfigurationError> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    load_config_from_str(&contents)
}

/// Load configuration from a YAML string (useful for testing).
pub fn load_config_from_str(yaml: &str) -> Result<PipelineConfig, ConfigurationError> {
    let interpolated = interpolate_env_vars(yaml, |name| std::env::var(name).ok())?;
    let config: PipelineConfig = serde_yaml_bw::from_str(&interpolated)?;
    validate_config(&config)?;
    Ok(config)
}

/// Replace `${VAR}` and `${VAR:-default}` using `lookup`.
///
/// An unset or empty variable without a default is an error. References
/// inside YAML comments are left as written.
fn interpolate_env_vars(
    input: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigurationError> {
    static ENV_VAR_REGEX: OnceLock<Option<Regex>> = OnceLock::new();

    let re = ENV_VAR_REGEX
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").ok())
        .as_ref()
        .ok_or_else(|| ConfigurationError::invalid("interpolation", "pattern failed to compile"))?;

    let mut result = String::with_capacity(input.len());
    for line in input.split_inclusive('\n') {
        let (content, comment) = line.split_at(comment_start(line).unwrap_or(line.len()));
        let mut last = 0;
        for cap in re.captures_iter(content) {
            let (Some(full), Some(name)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            let value = match lookup(name.as_str()) {
                Some(v) if !v.is_empty() => v,
                _ => match cap.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => {
                        return Err(ConfigurationError::MissingEnvVar(name.as_str().to_string()))
                    }
                },
            };
            result.push_str(&content[last..full.start()]);
            result.push_str(&value);
            last = full.end();
        }
        result.push_str(&content[last..]);
        result.push_str(comment);
    }
    Ok(result)
}

/// Byte offset of a YAML comment on `line`: a `#` at the start or after
/// whitespace, outside quotes.
fn comment_start(line: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut prev: Option<char> = None;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (Some('"'), '"') if prev == Some('\\') => {}
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'')
                if prev.map_or(true, |p| p.is_whitespace() || "[{,:".contains(p)) =>
            {
                quote = Some(c)
            }
            (None, '#') if prev.map_or(true, char::is_whitespace) => return Some(i),
            (None, _) => {}
        }
        prev = Some(c);
    }
    None
}

fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => {}
        _ => return false,
    }
    name.len() <= 48 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn physical_tables(base: &str) -> [String; 3] {
    [base.to_string(), format!("{base}_raw"), format!("{base}_processed")]
}

/// Validate configuration values.
fn validate_config(config: &PipelineConfig) -> Result<(), ConfigurationError> {
    if config.credentials.is_empty() {
        return Err(ConfigurationError::NoCredentials);
    }
    for (name, credential) in &config.credentials {
        if credential.api_key.is_empty() {
            return Err(ConfigurationError::invalid(
                format!("credentials.{name}.api_key"),
                "must not be empty",
            ));
        }
        if credential.min_interval_secs == 0 {
            return Err(ConfigurationError::invalid(
                format!("credentials.{name}.min_interval_secs"),
                "must be at least 1",
            ));
        }
    }

    if config.symbols.is_empty() {
        return Err(ConfigurationError::NoSymbols);
    }
    let mut tables: BTreeMap<String, &Symbol> = BTreeMap::new();
    for (symbol, cfg) in &config.symbols {
        if !is_valid_table_name(&cfg.table_name) {
            return Err(ConfigurationError::invalid(
                format!("symbols.{symbol}.table_name"),
                format!("{:?} must match [a-z_][a-z0-9_]*", cfg.table_name),
            ));
        }
        // Each symbol owns its base table plus the raw mirror and processed tables.
        for physical in physical_tables(&cfg.table_name) {
            if let Some(owner) = tables.insert(physical.clone(), symbol) {
                return Err(ConfigurationError::invalid(
                    format!("symbols.{symbol}.table_name"),
                    format!("{:?} collides with table {physical:?} of {owner}", cfg.table_name),
                ));
            }
        }
        if cfg.poll_interval_secs == 0 {
            return Err(ConfigurationError::invalid(
                format!("symbols.{symbol}.poll_interval_secs"),
                "must be at least 1",
            ));
        }
        if cfg.interval.upstream_interval().is_none() {
            return Err(ConfigurationError::invalid(
                format!("symbols.{symbol}.interval"),
                format!("{} is not an intraday interval", cfg.interval),
            ));
        }
        if let Some(target) = config.preprocessing.resample {
            if target < cfg.interval {
                return Err(ConfigurationError::invalid(
                    "preprocessing.resample",
                    format!("{target} is finer than the {symbol} interval {}", cfg.interval),
                ));
            }
        }
    }
    config.credential_assignments()?;

    let retry = &config.retry;
    if retry.max_attempts == 0 {
        return Err(ConfigurationError::invalid("retry.max_attempts", "must be at least 1"));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        return Err(ConfigurationError::invalid(
            "retry.base_delay_ms",
            "must not exceed retry.max_delay_ms",
        ));
    }
    if !(retry.multiplier >= 1.0) {
        return Err(ConfigurationError::invalid("retry.multiplier", "must be >= 1.0"));
    }
    if !(0.0..1.0).contains(&retry.jitter_factor) {
        return Err(ConfigurationError::invalid("retry.jitter_factor", "must be in [0, 1)"));
    }

    let session = &config.session;
    if session.open >= session.close {
        return Err(ConfigurationError::invalid("session.open", "must be before session.close"));
    }
    if session.weekdays.is_empty() {
        return Err(ConfigurationError::invalid("session.weekdays", "must not be empty"));
    }

    let windows = &config.preprocessing.windows;
    let sizes = [
        windows.ma_short,
        windows.ma_long,
        windows.volume_ma,
        windows.momentum,
        windows.eod_ma,
    ];
    if sizes.contains(&0) {
        return Err(ConfigurationError::invalid("preprocessing.windows", "must be at least 1"));
    }
    if windows.volatility < 2 {
        return Err(ConfigurationError::invalid(
            "preprocessing.windows.volatility",
            "must be at least 2",
        ));
    }

    if config.dedup.batch_size == 0 {
        return Err(ConfigurationError::invalid("dedup.batch_size", "must be at least 1"));
    }

    Ok(())
}
