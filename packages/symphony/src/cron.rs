//! Five-field cron evaluation.
//!
//! Grammar: `minute hour day month weekday`, each field `*` or a single
//! integer (minute 0-59, hour 0-23, day 1-31, month 1-12, weekday 0-6 with
//! 0 = Sunday). Ranges, lists and steps are deliberately not supported;
//! accepting them would silently change schedule semantics.
//!
//! Next-occurrence search advances field by field (month, then day/weekday,
//! then hour, then minute) and fails after 10 000 steps rather than looping
//! forever on an unsatisfiable expression.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::MessengerError;

/// Upper bound on advance steps during next-occurrence search.
const MAX_SEARCH_STEPS: u32 = 10_000;

/// One cron field: wildcard or an exact value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    /// `*` — any value.
    Any,
    /// A single exact value.
    Exact(u32),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(v) => *v == value,
        }
    }
}

/// A parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    /// Minute field, 0-59.
    pub minute: CronField,
    /// Hour field, 0-23.
    pub hour: CronField,
    /// Day-of-month field, 1-31.
    pub day: CronField,
    /// Month field, 1-12.
    pub month: CronField,
    /// Weekday field, 0-6, 0 = Sunday.
    pub weekday: CronField,
}

impl CronExpr {
    /// Parse a five-field expression.
    pub fn parse(expr: &str) -> Result<Self, MessengerError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(MessengerError::Validation(format!(
                "cron expression must have 5 fields, got {}: {expr:?}",
                fields.len()
            )));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59, "minute")?,
            hour: parse_field(fields[1], 0, 23, "hour")?,
            day: parse_field(fields[2], 1, 31, "day")?,
            month: parse_field(fields[3], 1, 12, "month")?,
            weekday: parse_field(fields[4], 0, 6, "weekday")?,
        })
    }

    /// Whether the given local time matches the expression.
    pub fn matches(&self, t: &NaiveDateTime) -> bool {
        self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day.matches(t.day())
            && self.month.matches(t.month())
            && self.weekday.matches(t.weekday().num_days_from_sunday())
    }

    /// The first matching instant strictly after `after`, evaluated in `tz`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>, MessengerError> {
        let local = after.with_timezone(&tz).naive_local();
        let mut candidate = truncate_to_minute(local) + Duration::minutes(1);

        for _ in 0..MAX_SEARCH_STEPS {
            if !self.month.matches(candidate.month()) {
                candidate = first_of_next_month(candidate)?;
                continue;
            }
            if !self.day.matches(candidate.day())
                || !self.weekday.matches(candidate.weekday().num_days_from_sunday())
            {
                candidate = start_of_next_day(candidate);
                continue;
            }
            if !self.hour.matches(candidate.hour()) {
                candidate = start_of_next_hour(candidate);
                continue;
            }
            if !self.minute.matches(candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }

            match tz.from_local_datetime(&candidate) {
                LocalResult::Single(t) => return Ok(t.with_timezone(&Utc)),
                LocalResult::Ambiguous(earliest, _) => return Ok(earliest.with_timezone(&Utc)),
                // The local time falls in a DST gap; keep searching.
                LocalResult::None => candidate += Duration::minutes(1),
            }
        }

        Err(MessengerError::Scheduler(format!(
            "no matching time within {MAX_SEARCH_STEPS} steps of cron search"
        )))
    }
}

fn parse_field(raw: &str, min: u32, max: u32, name: &str) -> Result<CronField, MessengerError> {
    if raw == "*" {
        return Ok(CronField::Any);
    }
    let value: u32 = raw.parse().map_err(|_| {
        MessengerError::Validation(format!(
            "cron {name} field must be '*' or an integer, got {raw:?}"
        ))
    })?;
    if !(min..=max).contains(&value) {
        return Err(MessengerError::Validation(format!(
            "cron {name} field out of range {min}-{max}: {value}"
        )));
    }
    Ok(CronField::Exact(value))
}

fn truncate_to_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.date().and_hms_opt(t.hour(), t.minute(), 0).unwrap_or(t)
}

fn start_of_next_day(t: NaiveDateTime) -> NaiveDateTime {
    let next = t.date() + Duration::days(1);
    next.and_hms_opt(0, 0, 0).unwrap_or(t)
}

fn start_of_next_hour(t: NaiveDateTime) -> NaiveDateTime {
    truncate_to_minute(t) + Duration::minutes(60 - i64::from(t.minute()))
}

fn first_of_next_month(t: NaiveDateTime) -> Result<NaiveDateTime, MessengerError> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| MessengerError::Scheduler("cron search ran past representable dates".to_string()))
}
