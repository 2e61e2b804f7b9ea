//! Interval code → schedule expression resolution.
//!
//! The `cron` crate wants a leading seconds field and numbers Sunday as 1,
//! while stored templates use classic 5-field crontab syntax with Sunday as
//! 0 or 7. [`normalize_expression`] bridges the two.

use std::collections::HashMap;
use std::str::FromStr;

use cadence_core::types::{IntervalCode, RunTemplate};
use chrono::{DateTime, TimeZone};
use cron::Schedule;

use crate::error::{Result, SchedulerError};

/// A built-in cadence with its canonical expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSchedule {
    pub interval: IntervalCode,
    /// Classic 5-field crontab form, as shown to operators.
    pub crontab: &'static str,
    /// The same schedule in the evaluator's 6-field form.
    pub evaluator_form: &'static str,
}

const FIXED_SCHEDULES: [FixedSchedule; 6] = [
    FixedSchedule {
        interval: IntervalCode::Minute,
        crontab: "* * * * *",
        evaluator_form: "0 * * * * *",
    },
    FixedSchedule {
        interval: IntervalCode::Hour,
        crontab: "0 * * * *",
        evaluator_form: "0 0 * * * *",
    },
    FixedSchedule {
        interval: IntervalCode::Day,
        crontab: "0 0 * * *",
        evaluator_form: "0 0 0 * * *",
    },
    FixedSchedule {
        interval: IntervalCode::Week,
        crontab: "0 0 * * 0",
        evaluator_form: "0 0 0 * * SUN",
    },
    FixedSchedule {
        interval: IntervalCode::Month,
        crontab: "0 0 1 * *",
        evaluator_form: "0 0 0 1 * *",
    },
    FixedSchedule {
        interval: IntervalCode::Year,
        crontab: "0 0 1 1 *",
        evaluator_form: "0 0 0 1 1 *",
    },
];

/// A parsed custom expression.
///
/// When both day-of-month and day-of-week are restricted, crontab fires on
/// days matching either field while the `cron` crate requires both. Such
/// expressions are split into a day-of-month and a day-of-week schedule and
/// the earlier occurrence wins.
#[derive(Debug, Clone)]
pub struct CustomSchedule {
    source: String,
    normalized: String,
    schedules: Vec<Schedule>,
}

impl CustomSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let normalized = normalize_expression(expression)?;
        let schedules = day_field_variants(&normalized)
            .iter()
            .map(|form| {
                Schedule::from_str(form).map_err(|e| SchedulerError::InvalidSchedule {
                    expression: expression.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            source: expression.trim().to_string(),
            normalized,
            schedules,
        })
    }

    /// The expression as stored on the template.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The expression handed to the evaluator.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// First occurrence strictly after `after`.
    pub(crate) fn next_after<Z: TimeZone>(&self, after: &DateTime<Z>) -> Option<DateTime<Z>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(after).next())
            .min()
    }
}

/// One evaluator form per day field when both are restricted, else the form itself.
fn day_field_variants(normalized: &str) -> Vec<String> {
    let fields: Vec<&str> = normalized.split_whitespace().collect();
    let restricted = |field: &str| field != "*" && field != "?";
    if fields.len() < 6 || !restricted(fields[3]) || !restricted(fields[5]) {
        return vec![normalized.to_string()];
    }

    let mut by_day_of_month = fields.clone();
    by_day_of_month[5] = "*";
    let mut by_day_of_week = fields;
    by_day_of_week[3] = "*";
    vec![by_day_of_month.join(" "), by_day_of_week.join(" ")]
}

/// What a template's interval settings resolve to.
#[derive(Debug, Clone)]
pub enum ScheduleExpression {
    /// Built-in cadence; windows are computed with calendar arithmetic.
    Fixed(FixedSchedule),
    /// Cron expression evaluated by the `cron` crate.
    Custom(CustomSchedule),
    /// `interval_code = none`: never due.
    Never,
}

impl ScheduleExpression {
    /// Human-readable form for log fields.
    pub fn describe(&self) -> &str {
        match self {
            ScheduleExpression::Fixed(f) => f.crontab,
            ScheduleExpression::Custom(c) => c.source(),
            ScheduleExpression::Never => "never",
        }
    }
}

/// Immutable interval-code lookup table. Build once and share by reference.
#[derive(Debug, Clone)]
pub struct IntervalResolver {
    table: HashMap<IntervalCode, FixedSchedule>,
}

impl Default for IntervalResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalResolver {
    pub fn new() -> Self {
        Self {
            table: FIXED_SCHEDULES.iter().map(|f| (f.interval, *f)).collect(),
        }
    }

    /// Canonical expressions for a built-in cadence; `None` for custom/none.
    pub fn fixed(&self, code: IntervalCode) -> Option<FixedSchedule> {
        self.table.get(&code).copied()
    }

    /// Resolve an interval code plus optional custom expression.
    ///
    /// `Err(EmptyCustomSchedule)` is a request to disable the template, not
    /// something to retry.
    pub fn resolve(
        &self,
        code: IntervalCode,
        custom_expression: Option<&str>,
    ) -> Result<ScheduleExpression> {
        match code {
            IntervalCode::None => Ok(ScheduleExpression::Never),
            IntervalCode::Custom => {
                let expression = custom_expression
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or(SchedulerError::EmptyCustomSchedule)?;
                Ok(ScheduleExpression::Custom(CustomSchedule::parse(
                    expression,
                )?))
            }
            fixed => self
                .fixed(fixed)
                .map(ScheduleExpression::Fixed)
                .ok_or_else(|| SchedulerError::InvalidSchedule {
                    expression: fixed.name().to_string(),
                    reason: "no canonical expression".to_string(),
                }),
        }
    }

    pub fn resolve_template(&self, template: &RunTemplate) -> Result<ScheduleExpression> {
        self.resolve(template.interval_code, template.custom_expression())
    }
}

/// Turn a stored expression into the evaluator's syntax.
///
/// - `@hourly`, `@daily`/`@midnight`, `@weekly`, `@monthly`, `@yearly`/`@annually`
///   map to their canonical forms.
/// - 5 fields: a `0` seconds field is prepended and day-of-week numbers
///   (0–7, Sunday = 0 or 7) become names.
/// - 6 or 7 fields are passed through.
pub fn normalize_expression(expression: &str) -> Result<String> {
    let invalid = |reason: String| SchedulerError::InvalidSchedule {
        expression: expression.to_string(),
        reason,
    };

    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.as_slice() {
        [] => Err(SchedulerError::EmptyCustomSchedule),
        [single] if single.starts_with('@') => macro_form(single)
            .map(str::to_string)
            .ok_or_else(|| invalid(format!("unknown macro {single}"))),
        [minute, hour, dom, month, dow] => {
            let dow = normalize_day_of_week(dow).map_err(invalid)?;
            Ok(format!("0 {minute} {hour} {dom} {month} {dow}"))
        }
        six_or_seven if six_or_seven.len() == 6 || six_or_seven.len() == 7 => {
            Ok(six_or_seven.join(" "))
        }
        other => Err(invalid(format!(
            "expected 5, 6 or 7 fields, found {}",
            other.len()
        ))),
    }
}

fn macro_form(token: &str) -> Option<&'static str> {
    let form = match token.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => "0 0 0 1 1 *",
        "@monthly" => "0 0 0 1 * *",
        "@weekly" => "0 0 0 * * SUN",
        "@daily" | "@midnight" => "0 0 0 * * *",
        "@hourly" => "0 0 * * * *",
        _ => return None,
    };
    Some(form)
}

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Expand a crontab day-of-week field into an explicit list of names.
fn normalize_day_of_week(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("bad day-of-week step in '{item}'"))?;
                if step == 0 {
                    return Err(format!("zero day-of-week step in '{item}'"));
                }
                (base, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = match base {
            "*" => (0, 6),
            _ => match base.split_once('-') {
                Some((lo, hi)) => (weekday_number(lo)?, weekday_number(hi)?),
                // "n/step" runs from n to the end of the week
                None if step.is_some() => (weekday_number(base)?, 6),
                None => {
                    let day = weekday_number(base)?;
                    (day, day)
                }
            },
        };
        if lo > hi {
            return Err(format!("descending day-of-week range '{base}'"));
        }

        let step = step.unwrap_or(1);
        let mut day = lo;
        while day <= hi {
            days[(day % 7) as usize] = true;
            day += step;
        }
    }

    let names: Vec<&str> = days
        .iter()
        .zip(WEEKDAY_NAMES)
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
    Ok(names.join(","))
}

/// 0–7 (0 and 7 are Sunday) or a three-letter English name.
fn weekday_number(token: &str) -> std::result::Result<u32, String> {
    if let Ok(n) = token.parse::<u32>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day-of-week {n} out of range"))
        };
    }
    let upper = token.to_ascii_uppercase();
    WEEKDAY_NAMES
        .iter()
        .position(|name| *name == upper)
        .map(|i| i as u32)
        .ok_or_else(|| format!("unknown day-of-week '{token}'"))
}
