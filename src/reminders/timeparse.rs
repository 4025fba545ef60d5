//! Natural-language trigger time parsing
//!
//! Deliberately small: relative offsets ("in 2 hours"), clock times
//! ("at 17:30", "at 9am", "noon"), "today"/"tomorrow" phrases, and weekday
//! names, always resolved to the next future instant in UTC. Anything else
//! is a parse failure, reported as `None` rather than a guess.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use regex::Regex;

/// Parse a time expression relative to `now`, returning a strictly future
/// instant or `None`.
pub fn parse_future(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let text = text.trim().to_lowercase();
    if text.is_empty() {
        return None;
    }

    let candidate = parse_relative(&text, now)
        .or_else(|| parse_day_phrase(&text, now))
        .or_else(|| parse_weekday(&text, now))
        .or_else(|| parse_clock(&text, now))?;

    (candidate > now).then_some(candidate)
}

/// "in 2 hours", "in 30 minutes", "in a day", "in 3 weeks"
fn parse_relative(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let re = Regex::new(r"^in\s+(an?|\d+)\s+(minutes?|mins?|hours?|hrs?|days?|weeks?)$").unwrap();
    let caps = re.captures(text)?;

    let amount: i64 = match &caps[1] {
        "a" | "an" => 1,
        digits => digits.parse().ok()?,
    };
    let unit = caps[2].trim_end_matches('s');
    let offset = match unit {
        "minute" | "min" => Duration::minutes(amount),
        "hour" | "hr" => Duration::hours(amount),
        "day" => Duration::days(amount),
        "week" => Duration::weeks(amount),
        _ => return None,
    };
    now.checked_add_signed(offset)
}

/// "tomorrow", "tomorrow at 9am", "today at 17:30"
fn parse_day_phrase(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let re = Regex::new(r"^(today|tomorrow)(?:\s+at\s+(.+))?$").unwrap();
    let caps = re.captures(text)?;

    let time = match caps.get(2) {
        Some(clock) => parse_clock_time(clock.as_str())?,
        // Bare "today" is meaningless for a future trigger.
        None if &caps[1] == "today" => return None,
        None => NaiveTime::from_hms_opt(9, 0, 0)?,
    };

    let mut date = now.date_naive();
    if &caps[1] == "tomorrow" {
        date = date.succ_opt()?;
    }
    Utc.from_local_datetime(&date.and_time(time)).single()
}

/// "at 5pm", "at 17:30", "9:15am", "noon", "midnight"
fn parse_clock(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let clock = text.strip_prefix("at ").unwrap_or(text);
    let time = parse_clock_time(clock)?;
    let today = Utc.from_local_datetime(&now.date_naive().and_time(time)).single()?;
    if today > now {
        Some(today)
    } else {
        today.checked_add_signed(Duration::days(1))
    }
}

/// "monday", "next friday at 3pm"
fn parse_weekday(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let re = Regex::new(
        r"^(?:next\s+)?(monday|tuesday|wednesday|thursday|friday|saturday|sunday)(?:\s+at\s+(.+))?$",
    )
    .unwrap();
    let caps = re.captures(text)?;

    let target = match &caps[1] {
        "monday" => Weekday::Mon,
        "tuesday" => Weekday::Tue,
        "wednesday" => Weekday::Wed,
        "thursday" => Weekday::Thu,
        "friday" => Weekday::Fri,
        "saturday" => Weekday::Sat,
        "sunday" => Weekday::Sun,
        _ => return None,
    };
    let time = match caps.get(2) {
        Some(clock) => parse_clock_time(clock.as_str())?,
        None => NaiveTime::from_hms_opt(9, 0, 0)?,
    };

    let today = now.date_naive();
    let days_ahead =
        (target.num_days_from_monday() + 7 - today.weekday().num_days_from_monday()) % 7;
    let date = today.checked_add_signed(Duration::days(days_ahead as i64))?;
    let candidate = Utc.from_local_datetime(&date.and_time(time)).single()?;
    if candidate > now {
        Some(candidate)
    } else {
        // Same weekday but the time already passed: next week.
        candidate.checked_add_signed(Duration::weeks(1))
    }
}

/// "5pm", "17:30", "9:15am", "noon", "midnight", bare "9"
fn parse_clock_time(text: &str) -> Option<NaiveTime> {
    let text = text.trim();
    match text {
        "noon" => return NaiveTime::from_hms_opt(12, 0, 0),
        "midnight" => return NaiveTime::from_hms_opt(0, 0, 0),
        _ => {}
    }

    let re = Regex::new(r"^(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$").unwrap();
    let caps = re.captures(text)?;

    let mut hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps.get(2).map_or(Some(0), |m| m.as_str().parse().ok())?;

    match caps.get(3).map(|m| m.as_str()) {
        Some("pm") if hour < 12 => hour += 12,
        Some("am") if hour == 12 => hour = 0,
        Some(_) if hour > 12 => return None,
        _ => {}
    }

    NaiveTime::from_hms_opt(hour, minute, 0)
}
