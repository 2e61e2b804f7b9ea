use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub type TenantId = i64;
pub type TemplateId = i64;
pub type JobId = i64;
pub type AppId = i64;

/// Recurrence of a run template.
///
/// Persisted as a one-letter code in `runtemplate.interv`:
///
/// | Variant  | Code | Name     |
/// |----------|------|----------|
/// | `Minute` | `i`  | `minute` |
/// | `Hour`   | `h`  | `hour`   |
/// | `Day`    | `d`  | `day`    |
/// | `Week`   | `w`  | `week`   |
/// | `Month`  | `m`  | `month`  |
/// | `Year`   | `y`  | `year`   |
/// | `Custom` | `c`  | `custom` |
/// | `None`   | `n`  | `none`   |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalCode {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
    /// Cron-style expression stored alongside the template.
    Custom,
    /// Disabled. Only the scheduler itself moves a template here.
    None,
}

impl IntervalCode {
    /// The built-in cadences, shortest first.
    pub const FIXED: [IntervalCode; 6] = [
        IntervalCode::Minute,
        IntervalCode::Hour,
        IntervalCode::Day,
        IntervalCode::Week,
        IntervalCode::Month,
        IntervalCode::Year,
    ];

    /// One-letter storage code.
    pub fn code(self) -> &'static str {
        match self {
            IntervalCode::Minute => "i",
            IntervalCode::Hour => "h",
            IntervalCode::Day => "d",
            IntervalCode::Week => "w",
            IntervalCode::Month => "m",
            IntervalCode::Year => "y",
            IntervalCode::Custom => "c",
            IntervalCode::None => "n",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IntervalCode::Minute => "minute",
            IntervalCode::Hour => "hour",
            IntervalCode::Day => "day",
            IntervalCode::Week => "week",
            IntervalCode::Month => "month",
            IntervalCode::Year => "year",
            IntervalCode::Custom => "custom",
            IntervalCode::None => "none",
        }
    }

    /// Parse the one-letter storage code only.
    pub fn from_code(code: &str) -> Result<Self, CoreError> {
        Self::FIXED
            .into_iter()
            .chain([IntervalCode::Custom, IntervalCode::None])
            .find(|c| c.code() == code)
            .ok_or_else(|| CoreError::UnknownInterval(code.to_string()))
    }

    pub fn is_fixed(self) -> bool {
        !matches!(self, IntervalCode::Custom | IntervalCode::None)
    }
}

impl fmt::Display for IntervalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Accepts either the long name (`hour`) or the storage code (`h`), case-insensitively.
impl FromStr for IntervalCode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Self::FIXED
            .into_iter()
            .chain([IntervalCode::Custom, IntervalCode::None])
            .find(|c| c.name() == lowered || c.code() == lowered)
            .ok_or_else(|| CoreError::UnknownInterval(s.to_string()))
    }
}

/// What caused a job to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Cron,
    Interval,
    Adhoc,
}

impl TriggerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerSource::Cron => "cron",
            TriggerSource::Interval => "interval",
            TriggerSource::Adhoc => "adhoc",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(TriggerSource::Cron),
            "interval" => Ok(TriggerSource::Interval),
            "adhoc" => Ok(TriggerSource::Adhoc),
            other => Err(CoreError::UnknownTrigger(other.to_string())),
        }
    }
}

/// A customer scope ("company") owning run templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
}

/// A persisted recurring job definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTemplate {
    pub id: TemplateId,
    pub tenant_id: TenantId,
    pub app_id: AppId,
    pub name: String,
    /// Opaque name of the execution backend.
    pub executor: String,
    pub active: bool,
    pub interval_code: IntervalCode,
    /// Only meaningful when `interval_code` is `Custom`.
    pub custom_expression: Option<String>,
    /// Offset added to the window start before the job fires.
    pub delay_seconds: u32,
    /// Window start of the most recently enqueued occurrence.
    pub last_schedule: Option<DateTime<Utc>>,
    /// Legacy pre-commit marker; read but never written by the scheduler.
    pub next_schedule: Option<DateTime<Utc>>,
}

impl RunTemplate {
    /// The custom expression, if present and not blank.
    pub fn custom_expression(&self) -> Option<&str> {
        self.custom_expression
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn trigger_source(&self) -> TriggerSource {
        if self.interval_code == IntervalCode::Custom {
            TriggerSource::Cron
        } else {
            TriggerSource::Interval
        }
    }
}

/// One concrete enqueue request derived from a run template occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub runtemplate_id: TemplateId,
    pub tenant_id: TenantId,
    pub app_id: AppId,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub executor: String,
    pub trigger_source: TriggerSource,
    /// `None` until the execution subsystem records an outcome.
    pub exit_code: Option<i32>,
    /// Template settings captured when the job was prepared.
    pub config_snapshot: serde_json::Value,
}

impl Job {
    /// Queued or running: no outcome yet, but a scheduled time is set.
    pub fn is_pending(&self) -> bool {
        self.exit_code.is_none() && self.scheduled_time.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_code_parses_names_and_codes() {
        assert_eq!("hour".parse::<IntervalCode>().unwrap(), IntervalCode::Hour);
        assert_eq!("H".parse::<IntervalCode>().unwrap(), IntervalCode::Hour);
        assert_eq!("i".parse::<IntervalCode>().unwrap(), IntervalCode::Minute);
        assert_eq!(" Year ".parse::<IntervalCode>().unwrap(), IntervalCode::Year);
        assert!("hh".parse::<IntervalCode>().is_err());
        assert!("".parse::<IntervalCode>().is_err());
    }

    #[test]
    fn storage_codes_are_distinct_single_letters() {
        let all = IntervalCode::FIXED
            .into_iter()
            .chain([IntervalCode::Custom, IntervalCode::None]);
        let mut seen = std::collections::HashSet::new();
        for code in all {
            assert_eq!(code.code().len(), 1);
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
            assert_eq!(IntervalCode::from_code(code.code()).unwrap(), code);
        }
        assert!(IntervalCode::from_code("x").is_err());
        // long names are not storage codes
        assert!(IntervalCode::from_code("hour").is_err());
    }

    #[test]
    fn only_calendar_cadences_are_fixed() {
        assert!(IntervalCode::FIXED.iter().all(|c| c.is_fixed()));
        assert!(!IntervalCode::Custom.is_fixed());
        assert!(!IntervalCode::None.is_fixed());
    }

    #[test]
    fn blank_custom_expression_is_absent() {
        let mut template = RunTemplate {
            id: 1,
            tenant_id: 1,
            app_id: 1,
            name: "t".into(),
            executor: "Native".into(),
            active: true,
            interval_code: IntervalCode::Custom,
            custom_expression: Some("   ".into()),
            delay_seconds: 0,
            last_schedule: None,
            next_schedule: None,
        };
        assert_eq!(template.custom_expression(), None);
        assert_eq!(template.trigger_source(), TriggerSource::Cron);

        template.custom_expression = Some(" */5 * * * * ".into());
        assert_eq!(template.custom_expression(), Some("*/5 * * * *"));

        template.interval_code = IntervalCode::Day;
        assert_eq!(template.trigger_source(), TriggerSource::Interval);
    }

    #[test]
    fn trigger_source_round_trips_through_str() {
        for source in [TriggerSource::Cron, TriggerSource::Interval, TriggerSource::Adhoc] {
            assert_eq!(source.as_str().parse::<TriggerSource>().unwrap(), source);
        }
        assert!("manual".parse::<TriggerSource>().is_err());
    }
}
