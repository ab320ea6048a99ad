//! Rolling indicators over close and volume
//!
//! Every window needs a full set of defined inputs; anything short of that
//! yields `None`, never zero.

use crate::gap_fill::FilledBar;
use chrono::NaiveDate;
use chrono_tz::Tz;
use types::config::IndicatorWindows;
use types::numeric::to_f64;
use types::processed::Indicators;

/// Percent change against the previous value, times 100.
pub fn pct_change(values: &[f64]) -> Vec<Option<f64>> {
    let mut out: Vec<Option<f64>> = Vec::with_capacity(values.len());
    if !values.is_empty() {
        out.push(None);
    }
    out.extend(values.windows(2).map(|w| {
        if w[0] == 0.0 {
            None
        } else {
            finite((w[1] - w[0]) / w[0] * 100.0)
        }
    }));
    out
}

pub fn rolling_mean(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    rolling(values, window, |w| Some(w.iter().sum::<f64>() / w.len() as f64))
}

/// Rolling sample standard deviation (n - 1 denominator).
pub fn rolling_std(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    rolling(values, window, sample_std)
}

/// `values[i] - values[i - lag]`
pub fn momentum(values: &[f64], lag: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if lag == 0 || i < lag {
                None
            } else {
                finite(values[i] - values[i - lag])
            }
        })
        .collect()
}

/// Running mean from the first value.
pub fn cumulative_mean(values: &[f64]) -> Vec<Option<f64>> {
    let mut sum = 0.0;
    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            sum += v;
            finite(sum / (i + 1) as f64)
        })
        .collect()
}

/// Moving average of each date's last value, repeated over that date's
/// entries. `dates` must be non-decreasing.
pub fn eod_moving_average(dates: &[NaiveDate], values: &[f64], window: usize) -> Vec<Option<f64>> {
    // (entries on the date, last value)
    let mut days: Vec<(usize, f64)> = Vec::new();
    let mut current: Option<NaiveDate> = None;
    for (date, value) in dates.iter().zip(values) {
        match days.last_mut() {
            Some((len, last)) if current == Some(*date) => {
                *len += 1;
                *last = *value;
            }
            _ => days.push((1, *value)),
        }
        current = Some(*date);
    }

    let closes: Vec<Option<f64>> = days.iter().map(|(_, last)| finite(*last)).collect();
    days.iter()
        .zip(rolling_mean(&closes, window))
        .flat_map(|((len, _), average)| std::iter::repeat(average).take(*len))
        .collect()
}

pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    finite(variance.sqrt())
}

/// All indicator columns for a timeline, in bar order. Trading dates for
/// the end-of-day average are local to `tz`.
pub fn compute(bars: &[FilledBar], windows: &IndicatorWindows, tz: Tz) -> Vec<Indicators> {
    let closes: Vec<f64> = bars.iter().map(|b| to_f64(b.quote.close)).collect();
    let dates: Vec<NaiveDate> = bars
        .iter()
        .map(|b| b.quote.timestamp.with_timezone(&tz).date_naive())
        .collect();
    let defined_closes: Vec<Option<f64>> = closes.iter().copied().map(finite).collect();
    let volumes: Vec<Option<f64>> = bars.iter().map(|b| Some(b.quote.volume as f64)).collect();

    let returns = pct_change(&closes);
    let ma_short = rolling_mean(&defined_closes, windows.ma_short);
    let ma_long = rolling_mean(&defined_closes, windows.ma_long);
    let volatility = rolling_std(&returns, windows.volatility);
    let volume_ma = rolling_mean(&volumes, windows.volume_ma);
    let momentum = momentum(&closes, windows.momentum);
    let cumulative = cumulative_mean(&closes);
    let eod_ma = eod_moving_average(&dates, &closes, windows.eod_ma);

    (0..bars.len())
        .map(|i| Indicators {
            daily_return: returns[i],
            ma_short: ma_short[i],
            ma_long: ma_long[i],
            volatility: volatility[i],
            volume_ma: volume_ma[i],
            momentum: momentum[i],
            cumulative_average: cumulative[i],
            eod_ma: eod_ma[i],
        })
        .collect()
}

fn rolling(
    values: &[Option<f64>],
    window: usize,
    f: impl Fn(&[f64]) -> Option<f64>,
) -> Vec<Option<f64>> {
    let mut buf = Vec::with_capacity(window);
    (0..values.len())
        .map(|i| {
            if window == 0 || i + 1 < window {
                return None;
            }
            buf.clear();
            for value in &values[i + 1 - window..=i] {
                buf.push((*value)?);
            }
            f(&buf)
        })
        .collect()
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use chrono_tz::America::New_York;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use types::ids::Symbol;
    use types::quote::Quote;

    fn approx(a: Option<f64>, b: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() < 1e-9)
    }

    fn series(closes: &[i64]) -> Vec<FilledBar> {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let price = Decimal::from(*c);
                FilledBar::observed(Quote::new(
                    Symbol::new("AAPL"),
                    start + Duration::minutes(5 * i as i64),
                    price,
                    price,
                    price,
                    price,
                    100 * (i as u64 + 1),
                ))
            })
            .collect()
    }

    #[test]
    fn test_moving_average_needs_full_window() {
        let values: Vec<Option<f64>> = (10..=16).map(|v| Some(v as f64)).collect();
        let ma = rolling_mean(&values, 5);
        assert!(ma[..4].iter().all(Option::is_none));
        assert_eq!(ma[4], Some(12.0));
        assert_eq!(ma[6], Some(14.0));
    }

    #[test]
    fn test_undefined_input_poisons_window() {
        let values = vec![Some(1.0), None, Some(3.0), Some(4.0), Some(5.0)];
        let ma = rolling_mean(&values, 3);
        assert_eq!(ma, vec![None, None, None, None, Some(4.0)]);
    }

    #[test]
    fn test_pct_change() {
        let returns = pct_change(&[100.0, 110.0, 99.0]);
        assert_eq!(returns[0], None);
        assert!(approx(returns[1], 10.0));
        assert!(approx(returns[2], -10.0));
        assert_eq!(pct_change(&[0.0, 1.0])[1], None);
    }

    #[test]
    fn test_sample_std() {
        assert!(approx(sample_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]), 2.138089935299395));
        assert_eq!(sample_std(&[1.0]), None);
    }

    #[test]
    fn test_momentum_and_cumulative() {
        let values = [10.0, 11.0, 13.0, 16.0];
        assert_eq!(momentum(&values, 2), vec![None, None, Some(3.0), Some(5.0)]);
        assert_eq!(
            cumulative_mean(&values),
            vec![Some(10.0), Some(10.5), Some(34.0 / 3.0), Some(12.5)]
        );
    }

    #[test]
    fn test_compute_with_small_windows() {
        let windows = IndicatorWindows {
            ma_short: 5,
            ma_long: 7,
            volatility: 3,
            volume_ma: 2,
            momentum: 3,
            eod_ma: 2,
        };
        let rows = compute(&series(&[10, 11, 12, 13, 14, 15, 16]), &windows, New_York);

        assert_eq!(rows[3].ma_short, None);
        assert_eq!(rows[4].ma_short, Some(12.0));
        assert_eq!(rows[6].ma_long, Some(13.0));
        assert_eq!(rows[0].daily_return, None);
        // returns start at index 1, so a 3-wide window first fills at 3
        assert_eq!(rows[2].volatility, None);
        assert!(rows[3].volatility.is_some());
        assert_eq!(rows[1].volume_ma, Some(150.0));
        assert_eq!(rows[3].momentum, Some(3.0));
        assert_eq!(rows[0].cumulative_average, Some(10.0));
        // one trading day is short of a 2-day window
        assert!(rows.iter().all(|r| r.eod_ma.is_none()));
    }

    #[test]
    fn test_eod_moving_average_over_six_days() {
        // Two bars a day (10:00 and 15:55 New York), Mon 2024-03-04 to Mon 2024-03-11
        let monday = Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap();
        let mut bars = Vec::new();
        for (day, calendar_offset) in [0i64, 1, 2, 3, 4, 7].into_iter().enumerate() {
            let day = day as i64;
            for (offset, close) in [(0, 100 + day), (355, 10 + day)] {
                let price = Decimal::from(close);
                bars.push(FilledBar::observed(Quote::new(
                    Symbol::new("AAPL"),
                    monday + Duration::days(calendar_offset) + Duration::minutes(offset),
                    price,
                    price,
                    price,
                    price,
                    100,
                )));
            }
        }
        let windows = IndicatorWindows {
            eod_ma: 5,
            ..IndicatorWindows::default()
        };
        let eod: Vec<Option<f64>> =
            compute(&bars, &windows, New_York).iter().map(|r| r.eod_ma).collect();

        assert!(eod[..8].iter().all(Option::is_none));
        // day 5 averages the closes 10..=14, day 6 the closes 11..=15
        assert_eq!(&eod[8..], &[Some(12.0), Some(12.0), Some(13.0), Some(13.0)]);
    }

    #[test]
    fn test_eod_dates_are_local() {
        // 23:00 and 01:00 UTC fall on the same New York evening
        let dates: Vec<NaiveDate> = [
            Utc.with_ymd_and_hms(2024, 3, 4, 23, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 5, 1, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 5, 15, 0, 0).unwrap(),
        ]
        .iter()
        .map(|ts| ts.with_timezone(&New_York).date_naive())
        .collect();
        assert_eq!(eod_moving_average(&dates, &[1.0, 3.0, 5.0], 2), vec![None, None, Some(4.0)]);
    }

    #[test]
    fn test_default_windows_leave_short_series_undefined() {
        let rows = compute(&series(&[10, 11, 12]), &IndicatorWindows::default(), New_York);
        assert!(rows.iter().all(|r| r.ma_long.is_none() && r.momentum.is_none()));
    }

    proptest! {
        #[test]
        fn prop_defined_only_after_window(len in 0usize..40, window in 1usize..10) {
            let values: Vec<Option<f64>> = (0..len).map(|i| Some(i as f64)).collect();
            let ma = rolling_mean(&values, window);
            prop_assert_eq!(ma.len(), len);
            for (i, v) in ma.iter().enumerate() {
                prop_assert_eq!(v.is_some(), i + 1 >= window);
            }
        }
    }
}
