//! Fixed-width bar periods
//!
//! A `BarPeriod` names the upstream intraday interval, the resampling
//! target and the gap-fill grid. Boundaries are aligned to the calendar of
//! the session timezone: a 1h bucket starts on the local hour, a 1d bucket
//! at local midnight, a 1w bucket at local midnight on Monday.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported bar periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BarPeriod {
    /// 1 minute
    M1,
    /// 5 minutes
    #[default]
    M5,
    /// 15 minutes
    M15,
    /// 30 minutes
    M30,
    /// 1 hour
    H1,
    /// 4 hours
    H4,
    /// 1 day
    D1,
    /// 1 week
    W1,
}

impl BarPeriod {
    /// Length of this period in seconds.
    pub fn seconds(&self) -> i64 {
        match self {
            BarPeriod::M1 => 60,
            BarPeriod::M5 => 5 * 60,
            BarPeriod::M15 => 15 * 60,
            BarPeriod::M30 => 30 * 60,
            BarPeriod::H1 => 3600,
            BarPeriod::H4 => 4 * 3600,
            BarPeriod::D1 => 86400,
            BarPeriod::W1 => 7 * 86400,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// All supported periods, finest first.
    pub fn all() -> &'static [BarPeriod] {
        &[
            BarPeriod::M1,
            BarPeriod::M5,
            BarPeriod::M15,
            BarPeriod::M30,
            BarPeriod::H1,
            BarPeriod::H4,
            BarPeriod::D1,
            BarPeriod::W1,
        ]
    }

    /// Interval name understood by the intraday endpoint, if any.
    pub fn upstream_interval(&self) -> Option<&'static str> {
        match self {
            BarPeriod::M1 => Some("1min"),
            BarPeriod::M5 => Some("5min"),
            BarPeriod::M15 => Some("15min"),
            BarPeriod::M30 => Some("30min"),
            BarPeriod::H1 => Some("60min"),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BarPeriod::M1 => "1min",
            BarPeriod::M5 => "5min",
            BarPeriod::M15 => "15min",
            BarPeriod::M30 => "30min",
            BarPeriod::H1 => "1h",
            BarPeriod::H4 => "4h",
            BarPeriod::D1 => "1d",
            BarPeriod::W1 => "1w",
        }
    }

    /// Floor a timestamp to the start of its bucket in `tz`.
    ///
    /// When the local bucket start does not exist (DST gap) the bucket is
    /// floored in UTC instead.
    pub fn align(&self, timestamp: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let local = timestamp.with_timezone(&tz);
        let date = match self {
            BarPeriod::W1 => {
                local.date_naive() - Duration::days(local.weekday().num_days_from_monday() as i64)
            }
            _ => local.date_naive(),
        };

        let start_secs = match self {
            BarPeriod::D1 | BarPeriod::W1 => 0,
            _ => {
                let secs = local.time().num_seconds_from_midnight() as i64;
                secs - secs.rem_euclid(self.seconds())
            }
        };

        let bucket = date.and_time(NaiveTime::MIN) + Duration::seconds(start_secs);
        match tz.from_local_datetime(&bucket).earliest() {
            Some(start) => start.with_timezone(&Utc),
            None => {
                // Skipped local hour: fall back to the UTC floor
                let secs = timestamp.timestamp();
                let floored = secs - secs.rem_euclid(self.seconds());
                DateTime::from_timestamp(floored, 0).unwrap_or(timestamp)
            }
        }
    }
}

impl FromStr for BarPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1min" | "1m" => Ok(BarPeriod::M1),
            "5min" | "5m" => Ok(BarPeriod::M5),
            "15min" | "15m" => Ok(BarPeriod::M15),
            "30min" | "30m" => Ok(BarPeriod::M30),
            "60min" | "1h" => Ok(BarPeriod::H1),
            "4h" | "240min" => Ok(BarPeriod::H4),
            "1d" | "daily" => Ok(BarPeriod::D1),
            "1w" | "weekly" => Ok(BarPeriod::W1),
            other => Err(format!("unknown bar period: {other:?}")),
        }
    }
}

impl TryFrom<String> for BarPeriod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BarPeriod> for String {
    fn from(period: BarPeriod) -> Self {
        period.label().to_string()
    }
}

impl fmt::Display for BarPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("5min".parse::<BarPeriod>().unwrap(), BarPeriod::M5);
        assert_eq!("60min".parse::<BarPeriod>().unwrap(), BarPeriod::H1);
        assert_eq!("1H".parse::<BarPeriod>().unwrap(), BarPeriod::H1);
        assert!("7min".parse::<BarPeriod>().is_err());
    }

    #[test]
    fn test_upstream_interval_only_intraday() {
        assert_eq!(BarPeriod::H1.upstream_interval(), Some("60min"));
        assert_eq!(BarPeriod::D1.upstream_interval(), None);
    }

    #[test]
    fn test_align_hour_in_new_york() {
        // 10:47 EDT -> 10:00 EDT
        let aligned = BarPeriod::H1.align(ts("2024-06-03T14:47:00Z"), New_York);
        assert_eq!(aligned, ts("2024-06-03T14:00:00Z"));
    }

    #[test]
    fn test_align_day_uses_local_midnight() {
        // 21:00 EDT on June 3 is already June 4 in UTC
        let aligned = BarPeriod::D1.align(ts("2024-06-04T01:00:00Z"), New_York);
        assert_eq!(aligned, ts("2024-06-03T04:00:00Z"));
    }

    #[test]
    fn test_align_week_starts_monday() {
        // Thursday June 6 -> Monday June 3
        let aligned = BarPeriod::W1.align(ts("2024-06-06T15:00:00Z"), New_York);
        assert_eq!(aligned, ts("2024-06-03T04:00:00Z"));
    }

    #[test]
    fn test_align_is_idempotent() {
        for period in BarPeriod::all() {
            let once = period.align(ts("2024-11-05T18:23:41Z"), New_York);
            assert_eq!(period.align(once, New_York), once, "{period}");
        }
    }

    #[test]
    fn test_serde_uses_labels() {
        let json = serde_json::to_string(&BarPeriod::M15).unwrap();
        assert_eq!(json, "\"15min\"");
        let period: BarPeriod = serde_json::from_str("\"4h\"").unwrap();
        assert_eq!(period, BarPeriod::H4);
    }
}
