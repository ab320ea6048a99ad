//! Missing-slot report per trading day

use crate::session::TradingSession;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use types::period::BarPeriod;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingDay {
    pub date: NaiveDate,
    /// Local slot start times with no bar
    pub missing: Vec<NaiveTime>,
}

/// For each trading day from the first to the last timestamp, the session
/// slots of `period` that have no bar. Days with nothing missing are omitted.
pub fn missing_data_report(
    timestamps: &[DateTime<Utc>],
    session: &TradingSession,
    period: BarPeriod,
) -> Vec<MissingDay> {
    let (Some(first), Some(last)) = (timestamps.iter().min(), timestamps.iter().max()) else {
        return Vec::new();
    };
    let present: BTreeSet<DateTime<Utc>> = timestamps.iter().copied().collect();
    let tz = session.timezone();

    let mut report = Vec::new();
    let mut date = session.trading_date(*first);
    let end = session.trading_date(*last);
    while date <= end {
        let missing: Vec<NaiveTime> = session
            .slots(date, period)
            .into_iter()
            .filter(|slot| !present.contains(slot))
            .map(|slot| slot.with_timezone(&tz).time())
            .collect();
        if !missing.is_empty() {
            report.push(MissingDay { date, missing });
        }
        date += Duration::days(1);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_reports_only_missing_slots() {
        let session = TradingSession::default();
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut timestamps = session.slots(date, BarPeriod::M5);
        // drop 10:00 and 15:55
        timestamps.retain(|t| {
            *t != Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap()
                && *t != Utc.with_ymd_and_hms(2024, 3, 1, 20, 55, 0).unwrap()
        });

        let report = missing_data_report(&timestamps, &session, BarPeriod::M5);
        assert_eq!(
            report,
            vec![MissingDay {
                date,
                missing: vec![time(10, 0), time(15, 55)],
            }]
        );
    }

    #[test]
    fn test_whole_missing_day_and_skipped_weekend() {
        let session = TradingSession::default();
        // Friday March 1 and Tuesday March 5, each with only the open
        let timestamps = vec![
            Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap(),
        ];
        let report = missing_data_report(&timestamps, &session, BarPeriod::H1);
        let dates: Vec<NaiveDate> = report.iter().map(|d| d.date).collect();
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            ]
        );
        assert_eq!(report[1].missing.len(), 8);
    }

    #[test]
    fn test_empty_input() {
        assert!(missing_data_report(&[], &TradingSession::default(), BarPeriod::M5).is_empty());
    }
}
