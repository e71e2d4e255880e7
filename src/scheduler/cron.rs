use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike, Utc};

use crate::error::{NightshiftError, Result};

/// Parsed 5-field cron expression (minute hour day-of-month month weekday).
///
/// Field syntax: `*`, single values, `a-b` ranges, `*/n` and `a-b/n` steps,
/// and comma lists. Weekday accepts 0-7 with both 0 and 7 meaning Sunday.
/// When both day fields are restricted, a day matches if either does, as in
/// classic cron.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(cron_err(format!(
                "expected 5 fields (minute hour day month weekday), got {}",
                fields.len()
            )));
        }

        let minutes = parse_field(fields[0], 0, 59, "minute")?;
        let hours = parse_field(fields[1], 0, 23, "hour")? as u32;
        let days_of_month = parse_field(fields[2], 1, 31, "day")? as u32;
        let months = parse_field(fields[3], 1, 12, "month")? as u16;
        let dow_raw = parse_field(fields[4], 0, 7, "weekday")?;
        let mut days_of_week = (dow_raw & 0xff) as u8;
        // 7 is an alias for Sunday.
        if days_of_week & (1 << 7) != 0 {
            days_of_week |= 1;
        }

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week: days_of_week & 0x7f,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    /// Next instant matching the expression at or after `after`, at minute
    /// granularity. Returns None if nothing matches within four years
    /// (e.g. a day/month combination that never exists).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut floor = after.with_second(0)?.with_nanosecond(0)?;
        if floor < after {
            floor += chrono::Duration::minutes(1);
        }

        let mut day = floor.date_naive();
        let mut time_floor = Some(floor.time());
        for _ in 0..(4 * 366) {
            if self.day_matches(day) {
                if let Some(time) = self.first_time_at_or_after(time_floor) {
                    return Some(day.and_time(time).and_utc());
                }
            }
            day = day.succ_opt()?;
            time_floor = None;
        }
        None
    }

    fn day_matches(&self, day: NaiveDate) -> bool {
        if self.months & (1 << day.month()) == 0 {
            return false;
        }
        let dom_hit = self.days_of_month & (1 << day.day()) != 0;
        let dow_hit = self.days_of_week & (1 << day.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_hit || dow_hit,
            (true, false) => dom_hit,
            (false, true) => dow_hit,
            (false, false) => true,
        }
    }

    fn first_time_at_or_after(&self, floor: Option<NaiveTime>) -> Option<NaiveTime> {
        let (floor_hour, floor_minute) = match floor {
            Some(t) => (t.hour(), t.minute()),
            None => (0, 0),
        };
        for hour in floor_hour..24 {
            if self.hours & (1 << hour) == 0 {
                continue;
            }
            let start = if hour == floor_hour { floor_minute } else { 0 };
            for minute in start..60 {
                if self.minutes & (1 << minute) != 0 {
                    return NaiveTime::from_hms_opt(hour, minute, 0);
                }
            }
        }
        None
    }
}

fn cron_err(msg: impl Into<String>) -> NightshiftError {
    NightshiftError::Validation(format!("invalid cron expression: {}", msg.into()))
}

/// Parse one field into a bitmask over [min, max].
fn parse_field(field: &str, min: u32, max: u32, name: &str) -> Result<u64> {
    if field.is_empty() {
        return Err(cron_err(format!("{} field is empty", name)));
    }

    let mut mask: u64 = 0;
    for part in field.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| cron_err(format!("{} field: bad step \"{}\"", name, step)))?;
                if step == 0 {
                    return Err(cron_err(format!("{} field: step must be positive", name)));
                }
                (base, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if base == "*" {
            (min, max)
        } else if let Some((lo, hi)) = base.split_once('-') {
            (
                parse_value(lo, min, max, name)?,
                parse_value(hi, min, max, name)?,
            )
        } else {
            let v = parse_value(base, min, max, name)?;
            (v, v)
        };
        if lo > hi {
            return Err(cron_err(format!(
                "{} field: range {}-{} is reversed",
                name, lo, hi
            )));
        }

        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }
    Ok(mask)
}

fn parse_value(s: &str, min: u32, max: u32, name: &str) -> Result<u32> {
    let v: u32 = s
        .parse()
        .map_err(|_| cron_err(format!("{} field: bad value \"{}\"", name, s)))?;
    if v < min || v > max {
        return Err(cron_err(format!(
            "{} field: value {} out of range {}-{}",
            name, v, min, max
        )));
    }
    Ok(v)
}
