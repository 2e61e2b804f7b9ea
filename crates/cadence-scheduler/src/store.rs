//! Storage seams used by the ledger, the engine and the daemon loop.
//!
//! The scheduler never talks to SQLite directly; it goes through these traits
//! so the engine can be driven against any store (and against failure-injecting
//! wrappers in tests). [`crate::sqlite::SqliteStore`] implements all of them.

use std::time::Duration;

use chrono::{DateTime, Utc};

use cadence_core::types::{IntervalCode, Job, RunTemplate, Tenant, TemplateId, TenantId, TriggerSource};

use crate::error::Result;
use crate::window::Occurrence;

/// Fields the scheduler is allowed to change on a run template.
///
/// `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTemplateUpdate {
    pub interval_code: Option<IntervalCode>,
    pub last_schedule: Option<DateTime<Utc>>,
}

impl RunTemplateUpdate {
    /// Move the template to the terminal `none` interval.
    pub fn disable() -> Self {
        Self {
            interval_code: Some(IntervalCode::None),
            ..Self::default()
        }
    }

    pub fn last_schedule(at: DateTime<Utc>) -> Self {
        Self {
            last_schedule: Some(at),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.interval_code.is_none() && self.last_schedule.is_none()
    }
}

/// Read access to tenants and their templates, plus the two scheduler-owned writes.
pub trait TemplateRepository: Send + Sync {
    fn list_active_tenants(&self) -> Result<Vec<Tenant>>;

    fn list_active_run_templates(&self, tenant_id: TenantId) -> Result<Vec<RunTemplate>>;

    fn update_run_template(&self, id: TemplateId, update: &RunTemplateUpdate) -> Result<()>;
}

pub trait JobRepository: Send + Sync {
    /// A job of this template with no exit code and a scheduled time, if any.
    fn find_pending_job(&self, runtemplate_id: TemplateId) -> Result<Option<Job>>;
}

/// Outcome of [`JobPreparer::enqueue_window`].
#[derive(Debug, Clone, PartialEq)]
pub enum WindowClaim {
    /// Job queued and `last_schedule` advanced to the window start atomically.
    Claimed(Job),
    /// Job queued; `last_schedule` is left to the caller.
    Queued(Job),
    /// `last_schedule` already covered the window. Nothing was queued.
    Lost,
}

/// Creates the job row and makes it visible to the executor in one call.
pub trait JobPreparer: Send + Sync {
    fn prepare_and_enqueue(
        &self,
        template: &RunTemplate,
        fire_at: DateTime<Utc>,
        executor: &str,
        trigger_source: TriggerSource,
    ) -> Result<Job>;

    /// Queue `occurrence` and claim its window.
    ///
    /// Transactional stores override this with a compare-and-set on
    /// `last_schedule` committed together with the job, so of two schedulers
    /// racing for one window only one enqueues. The default only queues.
    fn enqueue_window(
        &self,
        template: &RunTemplate,
        occurrence: &Occurrence,
        executor: &str,
        trigger_source: TriggerSource,
    ) -> Result<WindowClaim> {
        self.prepare_and_enqueue(template, occurrence.fire_at, executor, trigger_source)
            .map(WindowClaim::Queued)
    }
}

/// Connection health and startup recovery.
pub trait StorageMaintenance: Send + Sync {
    /// Cheap round trip proving the store is reachable.
    fn health_check(&self) -> Result<()>;

    /// Drop and re-establish the underlying connection.
    fn reconnect(&self) -> Result<()>;

    /// Remove pending jobs whose template is gone, or inactive and older than `grace`.
    fn purge_orphaned_jobs(&self, now: DateTime<Utc>, grace: Duration) -> Result<usize>;

    /// Remove queue records that point at no job or carry no start time.
    fn purge_broken_queue_records(&self) -> Result<usize>;
}

/// Everything the engine and daemon need from storage.
pub trait SchedulerStore: TemplateRepository + JobRepository + JobPreparer + StorageMaintenance {}

impl<T> SchedulerStore for T where T: TemplateRepository + JobRepository + JobPreparer + StorageMaintenance {}
