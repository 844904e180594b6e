use anyhow::Context;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use std::collections::HashSet;

const TW_OFFSET_SECS: i32 = 8 * 3600;

// Before this local time the latest complete session is the previous trading day.
// TWSE closes at 13:30; closing prices are published shortly after.
const CLOSE_CUTOFF_HOUR_TW: u32 = 14;
const CLOSE_CUTOFF_MINUTE_TW: u32 = 0;

/// Calendar date in Taiwan at `at`.
pub fn local_date(at: DateTime<Utc>) -> NaiveDate {
    (at + Duration::seconds(i64::from(TW_OFFSET_SECS))).date_naive()
}

/// Last second of `date` in Taiwan, as UTC.
pub fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    let last_second = date.and_time(chrono::NaiveTime::MIN) + Duration::seconds(86_399);
    last_second.and_utc() - Duration::seconds(i64::from(TW_OFFSET_SECS))
}

/// Latest Taiwan trading date with a published close, or the explicit `YYYY-MM-DD` argument.
pub fn resolve_market_date(
    date_arg: Option<&str>,
    now_utc: DateTime<Utc>,
) -> anyhow::Result<NaiveDate> {
    if let Some(s) = date_arg {
        return NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .with_context(|| format!("invalid date {s:?}, expected YYYY-MM-DD"));
    }
    resolve_with_holidays(now_utc, &configured_holidays())
}

pub fn resolve_with_holidays(
    now_utc: DateTime<Utc>,
    holidays: &HashSet<NaiveDate>,
) -> anyhow::Result<NaiveDate> {
    let tst = chrono::FixedOffset::east_opt(TW_OFFSET_SECS).context("invalid Taiwan offset")?;
    let now_tw = now_utc.with_timezone(&tst);

    let cutoff_reached =
        (now_tw.hour(), now_tw.minute()) >= (CLOSE_CUTOFF_HOUR_TW, CLOSE_CUTOFF_MINUTE_TW);
    let mut date = now_tw.date_naive();
    if !cutoff_reached {
        date -= Duration::days(1);
    }

    while is_weekend(date) || holidays.contains(&date) {
        date -= Duration::days(1);
    }
    Ok(date)
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun)
}

/// Fixed-date closures plus `TW_MARKET_HOLIDAYS="YYYY-MM-DD,YYYY-MM-DD"`.
/// Lunar holidays move every year and have to come from the env var.
pub fn configured_holidays() -> HashSet<NaiveDate> {
    let mut out = HashSet::new();
    for y in 2024..=2030 {
        for (m, d) in [(1, 1), (2, 28), (10, 10)] {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                out.insert(date);
            }
        }
    }

    if let Ok(s) = std::env::var("TW_MARKET_HOLIDAYS") {
        out.extend(parse_holidays(&s));
    }
    out
}

fn parse_holidays(s: &str) -> impl Iterator<Item = NaiveDate> + '_ {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| NaiveDate::parse_from_str(p, "%Y-%m-%d").ok())
}
