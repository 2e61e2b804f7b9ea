//! Per-template dedup bookkeeping.
//!
//! Two guards keep a template to at most one outstanding job per window:
//!
//! 1. **Pending job**: while a job of the template has no exit code, nothing
//!    new is queued. Survives a crash between enqueue and bookkeeping.
//! 2. **`last_schedule`**: the window start of the last enqueue. A window at or
//!    before it has already been handled. Covers back-to-back ticks inside one
//!    window before the job row is visible.
//!
//! [`ScheduleLedger::decide`] only reads, except when it disables a template
//! with an empty custom expression. Transactional stores advance `last_schedule`
//! with a compare-and-set in the job's own transaction
//! ([`crate::store::JobPreparer::enqueue_window`]); for other stores the engine
//! calls [`ScheduleLedger::record`] once the job has been enqueued.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use cadence_core::status::{disabled_message, StatusLevel, StatusMessage};
use cadence_core::types::{IntervalCode, JobId, RunTemplate};

use crate::error::{Result, SchedulerError};
use crate::interval::{IntervalResolver, ScheduleExpression};
use crate::sink::StatusSink;
use crate::store::{JobRepository, RunTemplateUpdate, TemplateRepository};
use crate::window::{Occurrence, WindowCalculator};

/// Outcome of [`ScheduleLedger::decide`] for one template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip(SkipReason),
    /// The template had an empty custom expression and is now `none`.
    Disable,
    Enqueue(Occurrence),
}

impl Decision {
    pub fn is_enqueue(&self) -> bool {
        matches!(self, Decision::Enqueue(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Inactive,
    /// `interval_code = none`.
    Disabled,
    PendingJob { job_id: JobId },
    WindowHandled { window_start: DateTime<Utc> },
    /// The expression has no occurrence after `now`.
    NoUpcomingWindow,
}

pub struct ScheduleLedger<S: ?Sized> {
    store: Arc<S>,
    resolver: IntervalResolver,
    calculator: WindowCalculator,
    sink: Arc<dyn StatusSink>,
}

impl<S> ScheduleLedger<S>
where
    S: TemplateRepository + JobRepository + ?Sized,
{
    pub fn new(
        store: Arc<S>,
        resolver: IntervalResolver,
        calculator: WindowCalculator,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            store,
            resolver,
            calculator,
            sink,
        }
    }

    /// Decide what to do with `template` at `now`.
    ///
    /// Errors are per template (bad expression, storage failure); the caller
    /// decides whether they abort the pass.
    pub fn decide(&self, template: &RunTemplate, now: DateTime<Utc>) -> Result<Decision> {
        if !template.active {
            return Ok(Decision::Skip(SkipReason::Inactive));
        }
        if template.interval_code == IntervalCode::None {
            return Ok(Decision::Skip(SkipReason::Disabled));
        }

        let expr = match self.resolver.resolve_template(template) {
            Ok(ScheduleExpression::Never) => return Ok(Decision::Skip(SkipReason::Disabled)),
            Ok(expr) => expr,
            Err(SchedulerError::EmptyCustomSchedule) => {
                self.disable(template)?;
                return Ok(Decision::Disable);
            }
            Err(e) => return Err(e),
        };

        if let Some(job) = self.store.find_pending_job(template.id)? {
            debug!(template_id = template.id, job_id = job.id, "pending job outstanding");
            return Ok(Decision::Skip(SkipReason::PendingJob { job_id: job.id }));
        }

        let Some(occurrence) = self
            .calculator
            .occurrence(&expr, now, template.delay_seconds)
        else {
            return Ok(Decision::Skip(SkipReason::NoUpcomingWindow));
        };

        if template
            .last_schedule
            .is_some_and(|last| occurrence.window_start <= last)
        {
            return Ok(Decision::Skip(SkipReason::WindowHandled {
                window_start: occurrence.window_start,
            }));
        }

        debug!(
            template_id = template.id,
            expr = expr.describe(),
            window_start = %occurrence.window_start,
            "window due"
        );
        Ok(Decision::Enqueue(occurrence))
    }

    /// Mark the occurrence's window as handled.
    pub fn record(&self, template: &RunTemplate, occurrence: &Occurrence) -> Result<()> {
        self.store.update_run_template(
            template.id,
            &RunTemplateUpdate::last_schedule(occurrence.window_start),
        )
    }

    fn disable(&self, template: &RunTemplate) -> Result<()> {
        self.store
            .update_run_template(template.id, &RunTemplateUpdate::disable())?;
        warn!(template_id = template.id, name = %template.name, "empty custom schedule, template disabled");
        self.sink.emit(
            StatusMessage::new(StatusLevel::Warning, disabled_message(template))
                .with_tenant(template.tenant_id),
        );
        Ok(())
    }
}
