#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use cadence_core::types::{Job, RunTemplate, Tenant, TemplateId, TenantId, TriggerSource};
use cadence_scheduler::{
    JobPreparer, JobRepository, Result, RunTemplateUpdate, SchedulerError, SqliteStore,
    StorageMaintenance, TemplateRepository,
};
use chrono::{DateTime, TimeZone, Utc};

pub fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

/// In-memory store with switchable failures.
///
/// Keeps the default `enqueue_window`, so it behaves like a store without
/// transactions and the engine records `last_schedule` separately.
pub struct FlakyStore {
    pub inner: SqliteStore,
    down: AtomicBool,
    fail_updates: AtomicBool,
    fail_purges: AtomicBool,
    broken_tenant: Mutex<Option<TenantId>>,
    pub health_checks: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            down: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
            fail_purges: AtomicBool::new(false),
            broken_tenant: Mutex::new(None),
            health_checks: AtomicUsize::new(0),
        }
    }

    /// Every call fails with a connectivity error while down.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// `update_run_template` fails with a non-connectivity error.
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Recovery purges fail with a non-connectivity error.
    pub fn set_fail_purges(&self, fail: bool) {
        self.fail_purges.store(fail, Ordering::SeqCst);
    }

    /// Listing `tenant_id`'s templates fails with a non-connectivity error.
    pub fn break_tenant(&self, tenant_id: Option<TenantId>) {
        *self.broken_tenant.lock().unwrap() = tenant_id;
    }

    fn check_purge(&self) -> Result<()> {
        self.check()?;
        if self.fail_purges.load(Ordering::SeqCst) {
            return Err(SchedulerError::InvalidTimestamp("injected purge failure".into()));
        }
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SchedulerError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

impl TemplateRepository for FlakyStore {
    fn list_active_tenants(&self) -> Result<Vec<Tenant>> {
        self.check()?;
        self.inner.list_active_tenants()
    }

    fn list_active_run_templates(&self, tenant_id: TenantId) -> Result<Vec<RunTemplate>> {
        self.check()?;
        if *self.broken_tenant.lock().unwrap() == Some(tenant_id) {
            return Err(SchedulerError::InvalidTimestamp("injected listing failure".into()));
        }
        self.inner.list_active_run_templates(tenant_id)
    }

    fn update_run_template(&self, id: TemplateId, update: &RunTemplateUpdate) -> Result<()> {
        self.check()?;
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(SchedulerError::TemplateNotFound { id });
        }
        self.inner.update_run_template(id, update)
    }
}

impl JobRepository for FlakyStore {
    fn find_pending_job(&self, runtemplate_id: TemplateId) -> Result<Option<Job>> {
        self.check()?;
        self.inner.find_pending_job(runtemplate_id)
    }
}

impl JobPreparer for FlakyStore {
    fn prepare_and_enqueue(
        &self,
        template: &RunTemplate,
        fire_at: DateTime<Utc>,
        executor: &str,
        trigger_source: TriggerSource,
    ) -> Result<Job> {
        self.check()?;
        self.inner
            .prepare_and_enqueue(template, fire_at, executor, trigger_source)
    }
}

impl StorageMaintenance for FlakyStore {
    fn health_check(&self) -> Result<()> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.health_check()
    }

    fn reconnect(&self) -> Result<()> {
        self.check()?;
        self.inner.reconnect()
    }

    fn purge_orphaned_jobs(&self, now: DateTime<Utc>, grace: Duration) -> Result<usize> {
        self.check_purge()?;
        self.inner.purge_orphaned_jobs(now, grace)
    }

    fn purge_broken_queue_records(&self) -> Result<usize> {
        self.check_purge()?;
        self.inner.purge_broken_queue_records()
    }
}
