//! Schedule expressions.
//!
//! [`StandardParser`] accepts:
//! - classic 5-field crontab lines (`min hour dom month dow`, minute precision,
//!   day-of-week `0-7` with both `0` and `7` meaning Sunday),
//! - 6- or 7-field lines with a leading seconds field (and optional year),
//!   passed through to the `cron` crate unchanged,
//! - descriptors `@yearly @annually @monthly @weekly @daily @midnight @hourly`,
//! - `@every <duration>` for fixed intervals (`@every 1h30m`).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Timelike};
use keel_core::parse_duration;

/// Errors from parsing a schedule spec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("empty schedule spec")]
    Empty,
    #[error("invalid schedule {spec:?}: {message}")]
    Parse { spec: String, message: String },
}

/// Produces the next fire time strictly after a given instant.
///
/// `None` means the schedule never fires again.
pub trait Schedule: Send + Sync {
    fn next(&self, after: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>>;
}

/// Turns a spec string into a schedule.
pub trait ScheduleParser: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ScheduleError`] when `spec` is not understood.
    fn parse(&self, spec: &str) -> Result<Arc<dyn Schedule>, ScheduleError>;
}

// ---------------------------------------------------------------------------
// CronSchedule
// ---------------------------------------------------------------------------

/// Calendar schedule backed by the `cron` crate.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    inner: cron::Schedule,
}

impl Schedule for CronSchedule {
    fn next(&self, after: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        self.inner.after(&after).next()
    }
}

// ---------------------------------------------------------------------------
// Every
// ---------------------------------------------------------------------------

/// Fixed-interval schedule.
///
/// Intervals of a second or more are aligned to whole seconds, so `@every 1m`
/// started at `10:00:00.400` fires at `10:01:00`.
#[derive(Debug, Clone, Copy)]
pub struct Every {
    interval: Duration,
}

impl Every {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Schedule for Every {
    fn next(&self, after: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let step = chrono::Duration::from_std(self.interval).ok()?;
        let base = if self.interval >= Duration::from_secs(1) {
            after.with_nanosecond(0)?
        } else {
            after
        };
        base.checked_add_signed(step)
    }
}

// ---------------------------------------------------------------------------
// StandardParser
// ---------------------------------------------------------------------------

/// Default parser; see the module docs for the accepted grammar.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardParser;

impl ScheduleParser for StandardParser {
    fn parse(&self, spec: &str) -> Result<Arc<dyn Schedule>, ScheduleError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(ScheduleError::Empty);
        }
        let fail = |message: String| ScheduleError::Parse {
            spec: spec.to_string(),
            message,
        };

        if let Some(rest) = spec.strip_prefix("@every") {
            let interval = parse_duration(rest.trim()).map_err(|e| fail(e.to_string()))?;
            if interval.is_zero() {
                return Err(fail("interval must be positive".to_string()));
            }
            return Ok(Arc::new(Every::new(interval)));
        }

        let expression = match spec {
            "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
            "@monthly" => "0 0 0 1 * *".to_string(),
            "@weekly" => "0 0 0 * * SUN".to_string(),
            "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
            "@hourly" => "0 0 * * * *".to_string(),
            s if s.starts_with('@') => return Err(fail("unknown descriptor".to_string())),
            s => {
                let fields: Vec<&str> = s.split_whitespace().collect();
                match fields.len() {
                    5 => format!(
                        "0 {} {} {} {} {}",
                        fields[0],
                        fields[1],
                        fields[2],
                        fields[3],
                        translate_weekday(fields[4]).map_err(fail)?
                    ),
                    6 | 7 => fields.join(" "),
                    n => return Err(fail(format!("expected 5, 6 or 7 fields, found {n}"))),
                }
            }
        };

        let inner = cron::Schedule::from_str(&expression).map_err(|e| fail(e.to_string()))?;
        Ok(Arc::new(CronSchedule { inner }))
    }
}

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Rewrites crontab day-of-week numbers (`0-7`, Sunday = 0 or 7) as names,
/// which the `cron` crate reads unambiguously.
fn translate_weekday(field: &str) -> Result<String, String> {
    let name = |token: &str| -> Result<String, String> {
        match token.parse::<usize>() {
            Ok(n) if n < WEEKDAYS.len() => Ok(WEEKDAYS[n].to_string()),
            Ok(n) => Err(format!("day-of-week {n} out of range")),
            Err(_) => Ok(token.to_string()),
        }
    };

    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((r, s)) => (r, Some(s)),
            None => (item, None),
        };
        let translated = match range.split_once('-') {
            Some((lo, "7")) if step.is_none() && lo != "0" && lo != "7" => {
                format!("{}-SAT,SUN", name(lo)?)
            }
            Some((lo, hi)) => format!("{}-{}", name(lo)?, name(hi)?),
            None => name(range)?,
        };
        items.push(match step {
            Some(s) => format!("{translated}/{s}"),
            None => translated,
        });
    }
    Ok(items.join(","))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 1, h, m, s)
            .unwrap()
    }

    fn next(spec: &str, after: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        StandardParser.parse(spec).unwrap().next(after).unwrap()
    }

    #[test]
    fn five_fields_have_minute_precision() {
        assert_eq!(next("*/15 * * * *", at(10, 7, 30)), at(10, 15, 0));
        assert_eq!(next("0 12 * * *", at(10, 0, 0)), at(12, 0, 0));
    }

    #[test]
    fn six_fields_include_seconds() {
        assert_eq!(next("*/10 * * * * *", at(10, 0, 3)), at(10, 0, 10));
    }

    #[test]
    fn descriptors() {
        assert_eq!(next("@hourly", at(10, 30, 0)), at(11, 0, 0));
        assert_eq!(next("@daily", at(10, 30, 0)).format("%H:%M").to_string(), "00:00");
        assert!(StandardParser.parse("@fortnightly").is_err());
    }

    #[test]
    fn every_aligns_to_seconds() {
        let start = at(10, 0, 0) + chrono::Duration::milliseconds(400);
        assert_eq!(next("@every 1m", start), at(10, 1, 0));
        assert_eq!(next("@every 1h30m", at(10, 0, 0)), at(11, 30, 0));
        assert!(StandardParser.parse("@every 0s").is_err());
        assert!(StandardParser.parse("@every soon").is_err());
    }

    #[test]
    fn sub_second_every_is_not_aligned() {
        let start = at(10, 0, 0) + chrono::Duration::milliseconds(400);
        assert_eq!(
            next("@every 250ms", start),
            at(10, 0, 0) + chrono::Duration::milliseconds(650)
        );
    }

    #[test]
    fn crontab_weekdays_are_translated() {
        assert_eq!(translate_weekday("0").unwrap(), "SUN");
        assert_eq!(translate_weekday("7").unwrap(), "SUN");
        assert_eq!(translate_weekday("1-5").unwrap(), "MON-FRI");
        assert_eq!(translate_weekday("5-7").unwrap(), "FRI-SAT,SUN");
        assert_eq!(translate_weekday("*").unwrap(), "*");
        assert_eq!(translate_weekday("*/2").unwrap(), "*/2");
        assert!(translate_weekday("9").is_err());
        // 2024-01-01 is a Monday.
        assert_eq!(next("0 9 * * 1", at(10, 0, 0)).format("%a %H:%M").to_string(), "Mon 09:00");
    }

    #[test]
    fn bad_specs_fail() {
        assert_eq!(StandardParser.parse("  ").err(), Some(ScheduleError::Empty));
        assert!(StandardParser.parse("* * *").is_err());
        assert!(StandardParser.parse("61 * * * *").is_err());
    }
}
