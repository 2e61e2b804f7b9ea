//! Status lines shown to operators.
//!
//! These are plain formatting helpers; where a line goes is decided by the
//! sink the scheduler was built with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{IntervalCode, RunTemplate, TenantId};

/// Severity of a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

/// One operator-facing status line, optionally scoped to a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub level: StatusLevel,
    pub tenant_id: Option<TenantId>,
    pub text: String,
}

impl StatusMessage {
    pub fn new(level: StatusLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            tenant_id: None,
            text: text.into(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }
}

pub fn interval_emoji(code: IntervalCode) -> &'static str {
    match code {
        IntervalCode::Minute => "⏳",
        IntervalCode::Hour => "🕰️",
        IntervalCode::Day => "☀️",
        IntervalCode::Week => "📅",
        IntervalCode::Month => "🌛",
        IntervalCode::Year => "🎆",
        IntervalCode::Custom => "⏰",
        IntervalCode::None => "⏹️",
    }
}

/// `⏰ 🧩 #<app>\t<name> (runtemplate #<id>) - Launch <RFC 2822> for 🏣 <tenant>`
pub fn launch_message(template: &RunTemplate, tenant_name: &str, fire_at: DateTime<Utc>) -> String {
    format!(
        "{} 🧩 #{}\t{} (runtemplate #{}) - Launch {} for 🏣 {}",
        interval_emoji(template.interval_code),
        template.app_id,
        template.name,
        template.id,
        fire_at.to_rfc2822(),
        tenant_name
    )
}

pub fn disabled_message(template: &RunTemplate) -> String {
    format!(
        "Empty crontab. Disabling interval #{} ({})",
        template.id, template.name
    )
}

pub fn nothing_to_run_message(tenant_name: &str, interval: IntervalCode) -> String {
    format!(
        "{} No applications to run for {} in interval {}",
        interval_emoji(interval),
        tenant_name,
        interval
    )
}
