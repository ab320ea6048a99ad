//! Trading session: hours, weekdays and closed dates in a local timezone

use crate::calendar::is_us_federal_holiday;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::BTreeSet;
use types::config::SessionConfig;
use types::period::BarPeriod;

#[derive(Debug, Clone, PartialEq)]
pub struct TradingSession {
    timezone: Tz,
    open: NaiveTime,
    close: NaiveTime,
    /// Days from Monday
    weekdays: BTreeSet<u32>,
    holidays: BTreeSet<NaiveDate>,
    us_federal_holidays: bool,
}

impl TradingSession {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            timezone: config.timezone,
            open: config.open,
            close: config.close,
            weekdays: config.weekday_set(),
            holidays: config.holidays.iter().copied().collect(),
            us_federal_holidays: config.us_federal_holidays,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Whether the market opens at all on `date`.
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.weekdays.contains(&date.weekday().num_days_from_monday())
            && !self.holidays.contains(&date)
            && !(self.us_federal_holidays && is_us_federal_holiday(date))
    }

    /// Local calendar date of `timestamp`.
    pub fn trading_date(&self, timestamp: DateTime<Utc>) -> NaiveDate {
        timestamp.with_timezone(&self.timezone).date_naive()
    }

    /// True when `timestamp` falls within `[open, close]` on a trading day.
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        let local = timestamp.with_timezone(&self.timezone);
        let time = local.time();
        self.is_trading_day(local.date_naive()) && self.open <= time && time <= self.close
    }

    /// Bucket starts of `period` that overlap the session on `date`.
    ///
    /// The first slot is the bucket holding the open, so a 1h grid on a
    /// 09:30 open starts at 09:00. Empty on non-trading days.
    pub fn slots(&self, date: NaiveDate, period: BarPeriod) -> Vec<DateTime<Utc>> {
        if !self.is_trading_day(date) {
            return Vec::new();
        }
        let (Some(open), Some(close)) = (self.local(date, self.open), self.local(date, self.close))
        else {
            return Vec::new();
        };

        let mut slots = Vec::new();
        let mut slot = period.align(open, self.timezone);
        while slot <= close {
            slots.push(slot);
            slot += period.duration();
        }
        slots
    }

    fn local(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        self.timezone
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|t| t.with_timezone(&Utc))
    }
}

impl Default for TradingSession {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}
