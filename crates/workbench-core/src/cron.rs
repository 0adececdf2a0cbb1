use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("cron must have 5 fields: min hour dom month dow")]
    FieldCount,
    #[error("invalid cron value: {0}")]
    InvalidValue(String),
    #[error("invalid cron range: {0}")]
    InvalidRange(String),
    #[error("invalid cron step: {0}")]
    InvalidStep(String),
    #[error("no matching time found within lookahead window")]
    NoMatch,
}

/// Standard 5-field cron expression at 1-minute resolution.
/// Day-of-week 0 and 7 both mean Sunday; values are stored 0-6, 0=Sunday.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cron {
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    dom: BTreeSet<u32>,
    months: BTreeSet<u32>,
    dow: BTreeSet<u32>,
}

const MAX_LOOKAHEAD_DAYS: i64 = 366;

fn parse_field(field: &str, min_v: u32, max_v: u32) -> Result<BTreeSet<u32>, CronError> {
    let field = field.trim();
    let mut values = BTreeSet::new();
    if field == "*" {
        values.extend(min_v..=max_v);
        return Ok(values);
    }

    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(CronError::InvalidValue(field.to_string()));
        }
        if part == "*" {
            values.extend(min_v..=max_v);
            continue;
        }

        let (range_part, step) = match part.split_once('/') {
            Some((range, step_s)) => {
                let step: u32 = step_s
                    .parse()
                    .map_err(|_| CronError::InvalidStep(part.to_string()))?;
                if step == 0 {
                    return Err(CronError::InvalidStep(part.to_string()));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range_part == "*" {
            (min_v, max_v)
        } else if let Some((a_s, b_s)) = range_part.split_once('-') {
            let a: u32 = a_s
                .trim()
                .parse()
                .map_err(|_| CronError::InvalidRange(part.to_string()))?;
            let b: u32 = b_s
                .trim()
                .parse()
                .map_err(|_| CronError::InvalidRange(part.to_string()))?;
            (a, b)
        } else {
            let v: u32 = range_part
                .trim()
                .parse()
                .map_err(|_| CronError::InvalidValue(part.to_string()))?;
            // A bare value with a step means "from v to max".
            if step > 1 {
                (v, max_v)
            } else {
                (v, v)
            }
        };

        if start < min_v || end > max_v || start > end {
            return Err(CronError::InvalidRange(part.to_string()));
        }
        values.extend((start..=end).step_by(step as usize));
    }

    Ok(values)
}

impl Cron {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount);
        }
        let minutes = parse_field(parts[0], 0, 59)?;
        let hours = parse_field(parts[1], 0, 23)?;
        let dom = parse_field(parts[2], 1, 31)?;
        let months = parse_field(parts[3], 1, 12)?;
        let dow_raw = parse_field(parts[4], 0, 7)?;
        let dow = dow_raw.into_iter().map(|v| if v == 7 { 0 } else { v }).collect();
        Ok(Self {
            minutes,
            hours,
            dom,
            months,
            dow,
        })
    }

    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        let dow = t.weekday().num_days_from_sunday();
        self.minutes.contains(&t.minute())
            && self.hours.contains(&t.hour())
            && self.dom.contains(&t.day())
            && self.months.contains(&t.month())
            && self.dow.contains(&dow)
    }

    /// Brute-force minute-by-minute search, bounded to a year.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        let mut t = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after)
            + Duration::minutes(1);
        let end = after + Duration::days(MAX_LOOKAHEAD_DAYS);
        while t <= end {
            if self.matches(t) {
                return Ok(t);
            }
            t += Duration::minutes(1);
        }
        Err(CronError::NoMatch)
    }
}
