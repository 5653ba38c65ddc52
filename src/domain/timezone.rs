use chrono::{DateTime, Datelike, Duration, Offset, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;

pub const DEFAULT_TIMEZONE: &str = "Pacific/Auckland";

// 1970-01-01 counted from 0001-01-01 (proleptic Gregorian, day 1 = CE epoch).
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;

pub fn parse_timezone(name: &str) -> Option<Tz> {
    name.parse::<Tz>().ok()
}

pub fn is_valid_time_zone(name: &str) -> bool {
    parse_timezone(name).is_some()
}

pub fn resolve_timezone(candidate: &str, fallback: &str) -> String {
    resolve_tz(candidate, fallback).name().to_string()
}

pub(crate) fn resolve_tz(candidate: &str, fallback: &str) -> Tz {
    parse_timezone(candidate)
        .or_else(|| parse_timezone(fallback))
        .unwrap_or(chrono_tz::Pacific::Auckland)
}

pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn utc_offset_seconds(instant: DateTime<Utc>, timezone: &str) -> Option<i32> {
    parse_timezone(timezone).map(|tz| offset_seconds_in(instant, tz))
}

pub fn local_day_index(instant: DateTime<Utc>, timezone: &str) -> Option<i64> {
    parse_timezone(timezone).map(|tz| local_day_index_in(instant, tz))
}

pub fn add_days_in_timezone(
    instant: DateTime<Utc>,
    days: i64,
    timezone: &str,
) -> Option<DateTime<Utc>> {
    parse_timezone(timezone).and_then(|tz| add_days_in(instant, days, tz))
}

pub(crate) fn offset_seconds_in(instant: DateTime<Utc>, tz: Tz) -> i32 {
    tz.offset_from_utc_datetime(&instant.naive_utc())
        .fix()
        .local_minus_utc()
}

pub(crate) fn local_day_index_in(instant: DateTime<Utc>, tz: Tz) -> i64 {
    let local_date = instant.with_timezone(&tz).date_naive();
    i64::from(local_date.num_days_from_ce()) - UNIX_EPOCH_DAYS_FROM_CE
}

pub(crate) fn add_days_in(instant: DateTime<Utc>, days: i64, tz: Tz) -> Option<DateTime<Utc>> {
    let local = instant.with_timezone(&tz).naive_local();
    let shifted = local.checked_add_signed(Duration::try_days(days)?)?;

    // Read the shifted wall clock as if it were UTC, then pull it back by the
    // zone offset. A second lookup catches the case where the first offset
    // belongs to the other side of a transition.
    let guess = shifted.and_utc();
    let initial_offset = offset_seconds_in(guess, tz);
    let mut adjusted =
        guess.checked_sub_signed(Duration::seconds(i64::from(initial_offset)))?;
    let adjusted_offset = offset_seconds_in(adjusted, tz);
    if adjusted_offset != initial_offset {
        adjusted = guess.checked_sub_signed(Duration::seconds(i64::from(adjusted_offset)))?;
    }
    Some(adjusted)
}
