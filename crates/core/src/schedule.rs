//! Recurrence rules for scheduled fetches.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::CoreError;

/// How often a dataset is fetched.
#[derive(Debug, Clone)]
pub enum Recurrence {
    /// Fixed period between ticks.
    Every(Duration),
    /// Cron schedule, evaluated in UTC.
    Cron(Box<Schedule>),
}

impl Recurrence {
    /// Parse an `every` duration string such as `"6h"` or `"1d12h"`.
    pub fn every(expr: &str) -> Result<Self, CoreError> {
        match parse_duration(expr) {
            Some(d) if !d.is_zero() => Ok(Self::Every(d)),
            _ => Err(CoreError::InvalidRecurrence {
                expr: expr.to_string(),
                reason: "expected a non-zero duration like 30m, 6h or 1d".into(),
            }),
        }
    }

    /// Parse a 5- or 6-field cron expression.
    pub fn cron(expr: &str) -> Result<Self, CoreError> {
        Schedule::from_str(&normalize_cron(expr))
            .map(|s| Self::Cron(Box::new(s)))
            .map_err(|e| CoreError::InvalidRecurrence {
                expr: expr.to_string(),
                reason: e.to_string(),
            })
    }

    /// Delay from `now` until the next tick.
    pub fn delay_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Self::Every(period) => Some(*period),
            Self::Cron(schedule) => schedule
                .after(&now)
                .next()
                .and_then(|next| (next - now).to_std().ok()),
        }
    }
}

/// Normalize a 5-field cron expression to 6-field by prepending "0 " for seconds.
///
/// The `cron` crate requires `sec min hour day-of-month month day-of-week`.
pub fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Parse a human-readable duration string into a [`Duration`].
///
/// Supports components `Xd`, `Xh`, `Xm`, `Xs`, combinable as in "2h30m".
/// A bare number is seconds. Returns `None` if unparseable.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();
    let mut found_unit = false;

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            num_buf.push(ch);
        } else {
            let n: u64 = num_buf.parse().ok()?;
            num_buf.clear();
            match ch {
                'd' => total_secs += n * 86_400,
                'h' => total_secs += n * 3_600,
                'm' => total_secs += n * 60,
                's' => total_secs += n,
                _ => return None,
            }
            found_unit = true;
        }
    }

    if !num_buf.is_empty() {
        if found_unit {
            // "30m15" is ambiguous
            return None;
        }
        total_secs += num_buf.parse::<u64>().ok()?;
    }

    Some(Duration::from_secs(total_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("2h30m"), Some(Duration::from_secs(9_000)));
        assert_eq!(parse_duration("1d12h"), Some(Duration::from_secs(129_600)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("30m15"), None);
        assert_eq!(parse_duration("5w"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn every_rejects_zero() {
        assert!(Recurrence::every("0s").is_err());
        assert!(matches!(Recurrence::every("6h"), Ok(Recurrence::Every(d)) if d.as_secs() == 21_600));
    }

    #[test]
    fn five_field_cron_is_normalized() {
        assert_eq!(normalize_cron("0 6 * * *"), "0 0 6 * * *");
        assert_eq!(normalize_cron("0 0 6 * * *"), "0 0 6 * * *");
        assert!(Recurrence::cron("not a cron").is_err());
    }

    #[test]
    fn cron_delay_points_at_next_fire() {
        let r = Recurrence::cron("0 6 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 5, 0, 0).unwrap();
        assert_eq!(r.delay_after(now), Some(Duration::from_secs(3_600)));
    }
}
