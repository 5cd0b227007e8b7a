//! Lightweight time parsing for poll options.
//!
//! Option text like "Friday 6pm" resolves to concrete timestamps via
//! next-occurrence-of-weekday semantics: the named weekday is the next one
//! strictly in the future (a matching weekday whose time already passed
//! rolls over a week). Calendar dates ("March 14") resolve within the next
//! year. Each option gets a fixed two-hour window unless an end is implied.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use regex::Regex;
use std::sync::OnceLock;

/// Window length when the option names only a start.
pub const DEFAULT_WINDOW_HOURS: i64 = 2;

/// Start time assumed when the option names only a day.
const DEFAULT_HOUR: u32 = 18;

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b").expect("static regex")
    })
}

fn month_day_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december|jan|feb|mar|apr|jun|jul|aug|sep|sept|oct|nov|dec)\s+(\d{1,2})\b",
        )
        .expect("static regex")
    })
}

/// Resolve one option's start/end timestamps relative to `now`.
/// Returns `None` when no day reference is recognizable.
pub fn parse_option(text: &str, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let date = parse_day(text, now)?;
    let time = parse_time(text).unwrap_or_else(|| {
        NaiveTime::from_hms_opt(DEFAULT_HOUR, 0, 0).unwrap_or_default()
    });

    let mut start = Utc
        .from_local_datetime(&date.and_time(time))
        .single()
        .unwrap_or(now);
    // Weekday matches today but the time already passed: roll a week.
    if start <= now && is_weekday_reference(text) {
        start += Duration::days(7);
    }
    let end = start + Duration::hours(DEFAULT_WINDOW_HOURS);
    Some((start, end))
}

fn parse_day(text: &str, now: DateTime<Utc>) -> Option<NaiveDate> {
    let lower = text.to_lowercase();
    let today = now.date_naive();

    if lower.contains("today") {
        return Some(today);
    }
    if lower.contains("tomorrow") {
        return Some(today + Duration::days(1));
    }

    if let Some(weekday) = find_weekday(&lower) {
        let ahead =
            (weekday.num_days_from_monday() + 7 - today.weekday().num_days_from_monday()) % 7;
        return Some(today + Duration::days(ahead as i64));
    }

    if let Some(caps) = month_day_re().captures(&lower) {
        let month = month_number(&caps[1])?;
        let day: u32 = caps[2].parse().ok()?;
        let mut date = NaiveDate::from_ymd_opt(today.year(), month, day)?;
        if date < today {
            date = NaiveDate::from_ymd_opt(today.year() + 1, month, day)?;
        }
        return Some(date);
    }

    None
}

fn month_number(name: &str) -> Option<u32> {
    let n = match &name[..3.min(name.len())] {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(n)
}

fn find_weekday(lower: &str) -> Option<Weekday> {
    const DAYS: [(&str, Weekday); 7] = [
        ("monday", Weekday::Mon),
        ("tuesday", Weekday::Tue),
        ("wednesday", Weekday::Wed),
        ("thursday", Weekday::Thu),
        ("friday", Weekday::Fri),
        ("saturday", Weekday::Sat),
        ("sunday", Weekday::Sun),
    ];
    DAYS.iter()
        .find(|(name, _)| lower.contains(name) || lower.contains(&name[..3]))
        .map(|(_, day)| *day)
}

fn is_weekday_reference(text: &str) -> bool {
    let lower = text.to_lowercase();
    find_weekday(&lower).is_some() || lower.contains("today")
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    for caps in time_re().captures_iter(text) {
        let hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps
            .get(2)
            .map(|m| m.as_str().parse().unwrap_or(0))
            .unwrap_or(0);
        let meridiem = caps.get(3).map(|m| m.as_str().to_lowercase());
        // A bare number without am/pm or minutes is too ambiguous
        // ("March 14" would read 14 as a time).
        if meridiem.is_none() && caps.get(2).is_none() {
            continue;
        }
        let hour = match meridiem.as_deref() {
            Some("pm") if hour < 12 => hour + 12,
            Some("am") if hour == 12 => 0,
            _ => hour,
        };
        return NaiveTime::from_hms_opt(hour, minute, 0);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn wednesday_noon() -> DateTime<Utc> {
        // 2026-01-07 is a Wednesday.
        Utc.with_ymd_and_hms(2026, 1, 7, 12, 0, 0).unwrap()
    }

    #[test]
    fn friday_6pm_resolves_to_next_friday() {
        let (start, end) = parse_option("Friday 6pm", wednesday_noon()).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 1, 9, 18, 0, 0).unwrap());
        assert_eq!(end - start, Duration::hours(DEFAULT_WINDOW_HOURS));
    }

    #[test]
    fn same_weekday_past_time_rolls_a_week() {
        // Wednesday 10am has already passed at Wednesday noon.
        let (start, _) = parse_option("Wednesday 10am", wednesday_noon()).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 1, 14, 10, 0, 0).unwrap());
    }

    #[test]
    fn calendar_date_resolves_within_a_year() {
        let (start, _) = parse_option("March 14 7pm", wednesday_noon()).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 14, 19, 0, 0).unwrap());
        // A date earlier in the year lands in the next one.
        let (start, _) = parse_option("Jan 2 9am", wednesday_noon()).unwrap();
        assert_eq!(start.year(), 2027);
    }

    #[test]
    fn minutes_and_defaults() {
        let (start, _) = parse_option("sat 10:30am", wednesday_noon()).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 1, 10, 10, 30, 0).unwrap());
        // No time at all falls back to the default evening hour.
        let (start, _) = parse_option("Saturday", wednesday_noon()).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 1, 10, 18, 0, 0).unwrap());
    }

    #[test]
    fn unrecognizable_day_is_none() {
        assert!(parse_option("whenever works", wednesday_noon()).is_none());
    }
}
