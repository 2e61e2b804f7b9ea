use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use cadence_core::status::{
    interval_emoji, launch_message, nothing_to_run_message, StatusLevel, StatusMessage,
};
use cadence_core::types::{IntervalCode, RunTemplate, Tenant};

use crate::error::{Result, SchedulerError};
use crate::interval::IntervalResolver;
use crate::ledger::{Decision, ScheduleLedger, SkipReason};
use crate::sink::StatusSink;
use crate::store::{SchedulerStore, WindowClaim};
use crate::window::WindowCalculator;

/// Counters for one scheduling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub tenants: usize,
    pub considered: usize,
    pub enqueued: usize,
    pub skipped: usize,
    pub disabled: usize,
    /// Templates that errored, plus tenants whose templates could not be listed.
    pub failed: usize,
}

/// Walks every active tenant and template, asks the ledger what to do and
/// enqueues due occurrences through the store's job preparer.
///
/// Errors are contained per template and per tenant. Only connectivity errors
/// (see [`SchedulerError::is_connectivity`]) abort a pass, so the daemon can
/// switch to reconnecting.
pub struct SchedulingEngine<S: ?Sized> {
    store: Arc<S>,
    ledger: ScheduleLedger<S>,
    sink: Arc<dyn StatusSink>,
    verbose: bool,
}

impl<S> SchedulingEngine<S>
where
    S: SchedulerStore + ?Sized,
{
    pub fn new(store: Arc<S>, calculator: WindowCalculator, sink: Arc<dyn StatusSink>) -> Self {
        let ledger = ScheduleLedger::new(
            store.clone(),
            IntervalResolver::new(),
            calculator,
            sink.clone(),
        );
        Self {
            store,
            ledger,
            sink,
            verbose: false,
        }
    }

    /// Emit per-tenant begin/end status lines.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// One pass over every active template of every active tenant.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<PassReport> {
        self.pass(None, now)
    }

    /// One pass restricted to templates on the fixed interval `interval`.
    pub fn run_interval(&self, interval: IntervalCode, now: DateTime<Utc>) -> Result<PassReport> {
        if !interval.is_fixed() {
            return Err(SchedulerError::InvalidSchedule {
                expression: interval.name().to_string(),
                reason: "not a fixed interval".to_string(),
            });
        }
        self.pass(Some(interval), now)
    }

    fn pass(&self, only: Option<IntervalCode>, now: DateTime<Utc>) -> Result<PassReport> {
        let pass_id = Uuid::now_v7();
        let span = info_span!(
            "scheduling_pass",
            %pass_id,
            interval = only.map(IntervalCode::name).unwrap_or("all")
        );
        let _guard = span.enter();

        let tenants = self.store.list_active_tenants()?;
        let mut report = PassReport::default();

        for tenant in &tenants {
            report.tenants += 1;
            if let Err(e) = self.run_tenant(tenant, only, now, &mut report) {
                if e.is_connectivity() {
                    return Err(e);
                }
                report.failed += 1;
                error!(tenant_id = tenant.id, tenant = %tenant.name, err = %e, "tenant skipped this pass");
            }
        }

        debug!(?report, "scheduling pass complete");
        Ok(report)
    }

    fn run_tenant(
        &self,
        tenant: &Tenant,
        only: Option<IntervalCode>,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<()> {
        let mut templates = self.store.list_active_run_templates(tenant.id)?;
        if let Some(interval) = only {
            templates.retain(|t| t.interval_code == interval);
            if templates.is_empty() {
                if interval != IntervalCode::Minute {
                    self.status(
                        tenant,
                        StatusLevel::Debug,
                        nothing_to_run_message(&tenant.name, interval),
                    );
                }
                return Ok(());
            }
            if self.verbose {
                self.status(
                    tenant,
                    StatusLevel::Debug,
                    format!(
                        "{} {} Scheduler interval {} begin",
                        interval_emoji(interval),
                        tenant.name,
                        interval
                    ),
                );
            }
        }

        for template in &templates {
            report.considered += 1;
            match self.process(tenant, template, now) {
                Ok(Decision::Enqueue(_)) => report.enqueued += 1,
                Ok(Decision::Disable) => report.disabled += 1,
                Ok(Decision::Skip(_)) => report.skipped += 1,
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => {
                    report.failed += 1;
                    error!(template_id = template.id, tenant = %tenant.name, err = %e, "run template skipped this pass");
                    self.status(
                        tenant,
                        StatusLevel::Error,
                        format!("runtemplate #{} ({}): {e}", template.id, template.name),
                    );
                }
            }
        }

        if let (Some(interval), true) = (only, self.verbose) {
            self.status(
                tenant,
                StatusLevel::Debug,
                format!(
                    "{} {} Scheduler interval {} end",
                    interval_emoji(interval),
                    tenant.name,
                    interval
                ),
            );
        }
        Ok(())
    }

    fn process(
        &self,
        tenant: &Tenant,
        template: &RunTemplate,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let decision = self.ledger.decide(template, now)?;
        let Decision::Enqueue(occurrence) = decision else {
            return Ok(decision);
        };

        let job = match self.store.enqueue_window(
            template,
            &occurrence,
            &template.executor,
            template.trigger_source(),
        )? {
            WindowClaim::Claimed(job) => job,
            WindowClaim::Queued(job) => {
                // The job is queued at this point; a failed marker write only
                // leaves the pending-job check guarding the next tick.
                if let Err(e) = self.ledger.record(template, &occurrence) {
                    warn!(template_id = template.id, job_id = job.id, err = %e, "could not record last_schedule");
                }
                job
            }
            WindowClaim::Lost => {
                debug!(
                    template_id = template.id,
                    window_start = %occurrence.window_start,
                    "window claimed by another scheduler"
                );
                return Ok(Decision::Skip(SkipReason::WindowHandled {
                    window_start: occurrence.window_start,
                }));
            }
        };

        info!(
            template_id = template.id,
            job_id = job.id,
            tenant = %tenant.name,
            window_start = %occurrence.window_start,
            fire_at = %occurrence.fire_at,
            "job enqueued"
        );
        self.status(
            tenant,
            StatusLevel::Success,
            launch_message(template, &tenant.name, occurrence.fire_at),
        );
        Ok(decision)
    }

    fn status(&self, tenant: &Tenant, level: StatusLevel, text: String) {
        self.sink
            .emit(StatusMessage::new(level, text).with_tenant(tenant.id));
    }
}
