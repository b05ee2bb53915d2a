//! Next-fire computation for job schedules.
//!
//! Everything here is a pure function of `(schedule, now)` so it can be
//! tested without timers.

use std::str::FromStr;

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;

use aion_types::CronSchedule;

use crate::{CronError, Result};

/// Current wall-clock time in unix millis.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Check that a schedule can ever be evaluated.
pub fn validate(schedule: &CronSchedule) -> Result<()> {
    match schedule {
        CronSchedule::At { at_ms } => {
            if *at_ms <= 0 {
                return Err(CronError::validation("atMs must be a positive timestamp"));
            }
        }
        CronSchedule::Every { every_ms } => {
            if *every_ms == 0 {
                return Err(CronError::validation("everyMs must be greater than zero"));
            }
            if i64::try_from(*every_ms).is_err() {
                return Err(CronError::validation("everyMs is too large"));
            }
        }
        CronSchedule::Cron { expr, tz, .. } => {
            parse_expr(expr)?;
            parse_tz(tz.as_deref())?;
        }
    }
    Ok(())
}

/// Next fire time strictly after `now`.
///
/// `Ok(None)` means the schedule will never fire again (a one-shot whose
/// timestamp is not in the future, or a cron expression with no later match).
pub fn next_run_after(schedule: &CronSchedule, now: i64) -> Result<Option<i64>> {
    match schedule {
        CronSchedule::At { at_ms } => Ok((*at_ms > now).then_some(*at_ms)),
        CronSchedule::Every { every_ms } => {
            let every = i64::try_from(*every_ms)
                .map_err(|_| CronError::validation("everyMs is too large"))?;
            if every == 0 {
                return Err(CronError::validation("everyMs must be greater than zero"));
            }
            Ok(Some(now.saturating_add(every)))
        }
        CronSchedule::Cron { expr, tz, .. } => {
            let schedule = parse_expr(expr)?;
            let tz = parse_tz(tz.as_deref())?;
            let now_dt = Utc
                .timestamp_millis_opt(now)
                .single()
                .ok_or_else(|| CronError::validation(format!("timestamp out of range: {now}")))?;
            let next = schedule
                .after(&now_dt.with_timezone(&tz))
                .map(|dt| dt.timestamp_millis())
                .find(|ts| *ts > now);
            Ok(next)
        }
    }
}

fn parse_tz(tz: Option<&str>) -> Result<Tz> {
    match tz {
        None => Ok(chrono_tz::UTC),
        Some(name) if name.trim().is_empty() => Ok(chrono_tz::UTC),
        Some(name) => name
            .trim()
            .parse::<Tz>()
            .map_err(|_| CronError::validation(format!("unknown timezone '{name}'"))),
    }
}

fn parse_expr(expr: &str) -> Result<cron::Schedule> {
    let normalized = normalize_expr(expr)?;
    cron::Schedule::from_str(&normalized)
        .map_err(|e| CronError::validation(format!("invalid cron expression '{expr}': {e}")))
}

/// Convert a standard expression into the seconds-first dialect of the `cron` crate.
///
/// Five-field (minute-first) expressions get a `0` seconds field. In every
/// form the numeric day-of-week values are remapped from `0-7` (Sunday = 0
/// or 7, Monday = 1) to the crate's `1-7` (Sunday = 1). `@` shortcuts are
/// passed through unchanged.
pub fn normalize_expr(expr: &str) -> Result<String> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(CronError::validation("cron expression is empty"));
    }
    if trimmed.starts_with('@') {
        return Ok(trimmed.to_string());
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = remap_day_of_week(fields[4])?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            ))
        }
        6 | 7 => {
            let mut fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
            fields[5] = remap_day_of_week(&fields[5])?;
            Ok(fields.join(" "))
        }
        n => Err(CronError::validation(format!(
            "cron expression '{trimmed}' has {n} fields, expected 5, 6 or 7"
        ))),
    }
}

fn remap_day_of_week(field: &str) -> Result<String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let suffix = step.map(|s| format!("/{s}")).unwrap_or_default();

        match range.split_once('-') {
            Some((start, end)) if is_numeric(start) && is_numeric(end) => {
                let (start, end) = (day_number(start)?, day_number(end)?);
                match (start, end) {
                    (7, 7) => items.push(format!("1{suffix}")),
                    // 0-6 and 0-7 both cover the whole week.
                    (0, 6..=7) => items.push(format!("1-7{suffix}")),
                    // Range ending on Sunday written as 7, e.g. `5-7`.
                    (_, 7) => {
                        items.push(format!("{}-7{suffix}", start + 1));
                        items.push("1".to_string());
                    }
                    _ => items.push(format!("{}-{}{suffix}", start + 1, end + 1)),
                }
            }
            None if is_numeric(range) => {
                items.push(format!("{}{suffix}", shift_day(range)?));
            }
            _ => items.push(item.to_string()),
        }
    }
    Ok(items.join(","))
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

fn day_number(s: &str) -> Result<u8> {
    match s.parse::<u8>() {
        Ok(day @ 0..=7) => Ok(day),
        _ => Err(CronError::validation(format!(
            "day-of-week value '{s}' is out of range 0-7"
        ))),
    }
}

fn shift_day(s: &str) -> Result<u8> {
    Ok(match day_number(s)? {
        7 => 1,
        day => day + 1,
    })
}
