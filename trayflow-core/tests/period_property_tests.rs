//! Property-Based Tests for Reporting Periods
//!
//! Property: For any two dates and any granularity, period keys SHALL sort
//! in the same order as the dates they bucket, and a date's own period SHALL
//! overlap any window containing that date.
//!
//! This validates:
//! - Lexical key order is chronological order
//! - Weekly buckets start on Sunday and span seven days
//! - `overlaps` never drops the period of an in-window date

use chrono::{Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use proptest::prelude::*;
use trayflow_core::{week_start, Granularity};

// ============================================================================
// ARBITRATORS
// ============================================================================

fn arb_date() -> impl Strategy<Value = NaiveDate> {
    (0i64..3650).prop_map(|offset| {
        NaiveDate::from_ymd_opt(2020, 1, 1).unwrap() + Duration::days(offset)
    })
}

fn arb_granularity() -> impl Strategy<Value = Granularity> {
    prop_oneof![
        Just(Granularity::Hourly),
        Just(Granularity::Daily),
        Just(Granularity::Weekly),
        Just(Granularity::Monthly),
    ]
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #[test]
    fn prop_keys_sort_chronologically(a in arb_date(), b in arb_date(), g in arb_granularity()) {
        let (early, late) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(g.key_for_date(early) <= g.key_for_date(late));
    }

    #[test]
    fn prop_week_starts_on_sunday(d in arb_date()) {
        let start = week_start(d);
        prop_assert_eq!(start.weekday(), Weekday::Sun);
        prop_assert!(start <= d && d < start + Duration::days(7));
    }

    #[test]
    fn prop_own_period_overlaps_window(
        d in arb_date(),
        before in 0i64..40,
        after in 0i64..40,
        g in arb_granularity(),
    ) {
        let key = g.key_for_date(d);
        prop_assert!(g.overlaps(&key, d - Duration::days(before), d + Duration::days(after)));
    }

    #[test]
    fn prop_hourly_key_extends_daily(hours in 0i64..(24 * 400)) {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::hours(hours);
        let tz = chrono_tz::America::Los_Angeles;
        let hourly = Granularity::Hourly.key_for(ts, tz);
        let daily = Granularity::Daily.key_for(ts, tz);
        prop_assert!(hourly.starts_with(&daily));
    }
}

#[test]
fn test_window_excludes_distant_month() {
    let start = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
    assert!(!Granularity::Monthly.overlaps("2026-01", start, end));
    assert!(Granularity::Monthly.overlaps("2026-03", start, end));
    assert!(!Granularity::Weekly.overlaps("2026-02-22~2026-02-28", start, end));
    assert!(Granularity::Weekly.overlaps("2026-03-01~2026-03-07", start, end));
}
