//! US federal holiday calendar
//!
//! Fixed-date holidays falling on a Saturday are observed the Friday
//! before, those on a Sunday the Monday after. New Year's Day can therefore
//! be observed on December 31 of the previous year.

use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Observed US federal holidays whose nominal date lies in `year`.
pub fn us_federal_holidays(year: i32) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(11);

    let fixed = |month: u32, day: u32| NaiveDate::from_ymd_opt(year, month, day).map(observed);
    let nth = |month: u32, weekday: Weekday, n: u8| {
        NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
    };

    days.extend(fixed(1, 1));
    if year >= 1986 {
        days.extend(nth(1, Weekday::Mon, 3));
    }
    days.extend(nth(2, Weekday::Mon, 3));
    days.extend(last_weekday_of_month(year, 5, Weekday::Mon));
    if year >= 2021 {
        days.extend(fixed(6, 19));
    }
    days.extend(fixed(7, 4));
    days.extend(nth(9, Weekday::Mon, 1));
    days.extend(nth(10, Weekday::Mon, 2));
    days.extend(fixed(11, 11));
    days.extend(nth(11, Weekday::Thu, 4));
    days.extend(fixed(12, 25));

    days.sort();
    days
}

pub fn is_us_federal_holiday(date: NaiveDate) -> bool {
    us_federal_holidays(date.year()).contains(&date)
        || us_federal_holidays(date.year() + 1).contains(&date)
}

fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn last_weekday_of_month(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, 5)
        .or_else(|| NaiveDate::from_weekday_of_month_opt(year, month, weekday, 4))
}
