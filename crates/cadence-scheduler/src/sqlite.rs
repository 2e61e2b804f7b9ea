use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info, instrument, warn};

use cadence_core::types::{
    AppId, IntervalCode, Job, JobId, RunTemplate, Tenant, TemplateId, TenantId, TriggerSource,
};

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::store::{
    JobPreparer, JobRepository, RunTemplateUpdate, StorageMaintenance, TemplateRepository,
    WindowClaim,
};
use crate::window::Occurrence;

const TEMPLATE_COLUMNS: &str = "id, company_id, app_id, name, executor, active, interv, cron,
     delay, last_schedule, next_schedule";

const JOB_COLUMNS: &str = "id, runtemplate_id, company_id, app_id, schedule, executor,
     schedule_type, exitcode, env";

/// SQLite-backed implementation of every storage trait the scheduler uses.
///
/// One connection behind a `Mutex`, as the rest of the workspace does it. A
/// poisoned mutex is reported as [`SchedulerError::Unavailable`] so the daemon
/// treats it like a dropped connection and calls [`StorageMaintenance::reconnect`].
pub struct SqliteStore {
    /// `None` for in-memory stores, which cannot be reopened.
    path: Option<PathBuf>,
    busy_timeout: Duration,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file and initialise the schema.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path, busy_timeout)?;
        info!(path = %path.display(), "scheduler store opened");
        Ok(Self {
            path: Some(path),
            busy_timeout,
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_db(&conn)?;
        Ok(Self {
            path: None,
            busy_timeout: Duration::ZERO,
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::Unavailable("connection mutex poisoned".into()))
    }

    // --- management-side helpers -------------------------------------------
    //
    // Tenants and templates are owned by the management side; these exist so
    // tests and tooling can seed a store without hand-written SQL.

    pub fn insert_tenant(&self, name: &str, enabled: bool) -> Result<TenantId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO company (name, enabled) VALUES (?1, ?2)",
            params![name, enabled],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_run_template(&self, template: &NewRunTemplate) -> Result<TemplateId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO runtemplate
             (company_id, app_id, name, executor, active, interv, cron, delay, last_schedule)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                template.tenant_id,
                template.app_id,
                template.name,
                template.executor,
                template.active,
                template.interval_code.code(),
                template.custom_expression,
                template.delay_seconds,
                template.last_schedule.map(format_ts),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(template_id = id, interval = %template.interval_code, "run template inserted");
        Ok(id)
    }

    pub fn get_run_template(&self, id: TemplateId) -> Result<Option<RunTemplate>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {TEMPLATE_COLUMNS} FROM runtemplate WHERE id = ?1"),
                [id],
                RawTemplate::from_row,
            )
            .optional()?;
        raw.map(RawTemplate::into_template).transpose()
    }

    pub fn set_template_active(&self, id: TemplateId, active: bool) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE runtemplate SET active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        if n == 0 {
            return Err(SchedulerError::TemplateNotFound { id });
        }
        Ok(())
    }

    pub fn delete_run_template(&self, id: TemplateId) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM runtemplate WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::TemplateNotFound { id });
        }
        Ok(())
    }

    /// Record an execution outcome, as the executor does when a job finishes.
    pub fn complete_job(&self, job_id: JobId, exit_code: i32) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE job SET exitcode = ?1 WHERE id = ?2",
            params![exit_code, job_id],
        )?;
        conn.execute("DELETE FROM schedule WHERE job = ?1", [job_id])?;
        Ok(())
    }

    /// All jobs of a template, oldest first.
    pub fn jobs_for_template(&self, runtemplate_id: TemplateId) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE runtemplate_id = ?1 ORDER BY id"
        ))?;
        let jobs = stmt
            .query_map([runtemplate_id], RawJob::from_row)?
            .filter_map(|row| match row {
                Ok(raw) => Some(raw),
                Err(e) => {
                    warn!(template_id = runtemplate_id, err = %e, "skipping unreadable job row");
                    None
                }
            })
            .filter_map(|raw| match raw.into_job() {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(template_id = runtemplate_id, err = %e, "skipping malformed job row");
                    None
                }
            })
            .collect();
        Ok(jobs)
    }

    /// Number of rows in the executor's queue table.
    pub fn queue_len(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM schedule", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    init_db(&conn)?;
    Ok(conn)
}

/// A run template as the management side creates it.
#[derive(Debug, Clone)]
pub struct NewRunTemplate {
    pub tenant_id: TenantId,
    pub app_id: AppId,
    pub name: String,
    pub executor: String,
    pub active: bool,
    pub interval_code: IntervalCode,
    pub custom_expression: Option<String>,
    pub delay_seconds: u32,
    pub last_schedule: Option<DateTime<Utc>>,
}

impl NewRunTemplate {
    pub fn new(tenant_id: TenantId, name: impl Into<String>, interval_code: IntervalCode) -> Self {
        Self {
            tenant_id,
            app_id: 1,
            name: name.into(),
            executor: "Native".into(),
            active: true,
            interval_code,
            custom_expression: None,
            delay_seconds: 0,
            last_schedule: None,
        }
    }

    pub fn custom(tenant_id: TenantId, name: impl Into<String>, expression: &str) -> Self {
        Self {
            custom_expression: Some(expression.to_string()),
            ..Self::new(tenant_id, name, IntervalCode::Custom)
        }
    }

    pub fn with_delay(mut self, delay_seconds: u32) -> Self {
        self.delay_seconds = delay_seconds;
        self
    }

    pub fn with_app(mut self, app_id: AppId) -> Self {
        self.app_id = app_id;
        self
    }
}

impl TemplateRepository for SqliteStore {
    fn list_active_tenants(&self) -> Result<Vec<Tenant>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT id, name FROM company WHERE enabled = 1 ORDER BY id")?;
        let tenants = stmt
            .query_map([], |row| {
                Ok(Tenant {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tenants)
    }

    #[instrument(skip(self))]
    fn list_active_run_templates(&self, tenant_id: TenantId) -> Result<Vec<RunTemplate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM runtemplate
             WHERE company_id = ?1 AND active = 1 ORDER BY id"
        ))?;
        let raws = stmt
            .query_map([tenant_id], RawTemplate::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        // A row the scheduler cannot interpret must not hide the others.
        let templates = raws
            .into_iter()
            .filter_map(|raw| {
                let id = raw.id;
                match raw.into_template() {
                    Ok(t) => Some(t),
                    Err(e) => {
                        warn!(template_id = id, tenant_id, err = %e, "skipping malformed run template row");
                        None
                    }
                }
            })
            .collect();
        Ok(templates)
    }

    fn update_run_template(&self, id: TemplateId, update: &RunTemplateUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE runtemplate
             SET interv        = COALESCE(?1, interv),
                 last_schedule = COALESCE(?2, last_schedule)
             WHERE id = ?3",
            params![
                update.interval_code.map(IntervalCode::code),
                update.last_schedule.map(format_ts),
                id
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::TemplateNotFound { id });
        }
        Ok(())
    }
}

impl JobRepository for SqliteStore {
    fn find_pending_job(&self, runtemplate_id: TemplateId) -> Result<Option<Job>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM job
                     WHERE runtemplate_id = ?1 AND exitcode IS NULL AND schedule IS NOT NULL
                     ORDER BY id LIMIT 1"
                ),
                [runtemplate_id],
                RawJob::from_row,
            )
            .optional()?;
        raw.map(RawJob::into_job).transpose()
    }
}

impl JobPreparer for SqliteStore {
    #[instrument(skip_all, fields(template_id = template.id, %fire_at))]
    fn prepare_and_enqueue(
        &self,
        template: &RunTemplate,
        fire_at: DateTime<Utc>,
        executor: &str,
        trigger_source: TriggerSource,
    ) -> Result<Job> {
        let prepared = PreparedJob::new(template, fire_at, executor, trigger_source)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let job = prepared.insert(&tx)?;
        tx.commit()?;

        debug!(job_id = job.id, "job prepared and queued");
        Ok(job)
    }

    #[instrument(skip_all, fields(template_id = template.id, window_start = %occurrence.window_start))]
    fn enqueue_window(
        &self,
        template: &RunTemplate,
        occurrence: &Occurrence,
        executor: &str,
        trigger_source: TriggerSource,
    ) -> Result<WindowClaim> {
        let prepared = PreparedJob::new(template, occurrence.fire_at, executor, trigger_source)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        // an unparseable marker reads as unset, as it does in `decide`
        let claimed = tx.execute(
            "UPDATE runtemplate SET last_schedule = ?1
             WHERE id = ?2
               AND (julianday(last_schedule) IS NULL
                    OR julianday(last_schedule) < julianday(?1))",
            params![format_ts(occurrence.window_start), template.id],
        )?;
        if claimed == 0 {
            let exists = tx
                .query_row("SELECT 1 FROM runtemplate WHERE id = ?1", [template.id], |_| Ok(()))
                .optional()?
                .is_some();
            tx.rollback()?;
            if !exists {
                return Err(SchedulerError::TemplateNotFound { id: template.id });
            }
            debug!("window already claimed");
            return Ok(WindowClaim::Lost);
        }
        let job = prepared.insert(&tx)?;
        tx.commit()?;

        debug!(job_id = job.id, "job queued and window claimed");
        Ok(WindowClaim::Claimed(job))
    }
}

/// A job ready to be written: validated, with its snapshot serialized.
struct PreparedJob<'a> {
    template: &'a RunTemplate,
    fire_at: DateTime<Utc>,
    executor: &'a str,
    trigger_source: TriggerSource,
    snapshot: serde_json::Value,
    env: String,
}

impl<'a> PreparedJob<'a> {
    fn new(
        template: &'a RunTemplate,
        fire_at: DateTime<Utc>,
        executor: &'a str,
        trigger_source: TriggerSource,
    ) -> Result<Self> {
        if executor.trim().is_empty() {
            return Err(SchedulerError::JobPreparation(format!(
                "run template #{} has no executor",
                template.id
            )));
        }
        let snapshot = config_snapshot(template);
        let env = serde_json::to_string(&snapshot)
            .map_err(|e| SchedulerError::JobPreparation(e.to_string()))?;
        Ok(Self {
            template,
            fire_at,
            executor,
            trigger_source,
            snapshot,
            env,
        })
    }

    /// Insert the job and its queue row inside `tx`.
    fn insert(self, tx: &Transaction<'_>) -> Result<Job> {
        let fire_at = format_ts(self.fire_at);
        tx.execute(
            "INSERT INTO job
             (runtemplate_id, company_id, app_id, schedule, executor, schedule_type,
              exitcode, env, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8)",
            params![
                self.template.id,
                self.template.tenant_id,
                self.template.app_id,
                fire_at,
                self.executor,
                self.trigger_source.as_str(),
                self.env,
                format_ts(Utc::now())
            ],
        )?;
        let job_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO schedule (job, after) VALUES (?1, ?2)",
            params![job_id, fire_at],
        )?;

        Ok(Job {
            id: job_id,
            runtemplate_id: self.template.id,
            tenant_id: self.template.tenant_id,
            app_id: self.template.app_id,
            scheduled_time: Some(self.fire_at),
            executor: self.executor.to_string(),
            trigger_source: self.trigger_source,
            exit_code: None,
            config_snapshot: self.snapshot,
        })
    }
}

impl StorageMaintenance for SqliteStore {
    fn health_check(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn reconnect(&self) -> Result<()> {
        // Reconnecting is also how a poisoned mutex gets healed.
        let mut guard = self.conn.lock().unwrap_or_else(|poisoned| {
            self.conn.clear_poison();
            poisoned.into_inner()
        });
        match &self.path {
            Some(path) => {
                *guard = open_connection(path, self.busy_timeout)?;
                info!(path = %path.display(), "scheduler store reconnected");
            }
            None => {
                guard.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            }
        }
        Ok(())
    }

    fn purge_orphaned_jobs(&self, now: DateTime<Utc>, grace: Duration) -> Result<usize> {
        const ORPHANED: &str = "exitcode IS NULL AND (
                 runtemplate_id NOT IN (SELECT id FROM runtemplate)
                 OR (runtemplate_id IN (SELECT id FROM runtemplate WHERE active = 0)
                     AND created_at < ?1))";

        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| SchedulerError::InvalidTimestamp(e.to_string()))?;
        let cutoff = format_ts(now - grace);

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!("DELETE FROM schedule WHERE job IN (SELECT id FROM job WHERE {ORPHANED})"),
            [&cutoff],
        )?;
        let purged = tx.execute(&format!("DELETE FROM job WHERE {ORPHANED}"), [&cutoff])?;
        tx.commit()?;
        Ok(purged)
    }

    fn purge_broken_queue_records(&self) -> Result<usize> {
        let conn = self.conn()?;
        let purged = conn.execute(
            "DELETE FROM schedule
             WHERE job IS NULL
                OR after IS NULL OR after = ''
                OR job NOT IN (SELECT id FROM job)",
            [],
        )?;
        Ok(purged)
    }
}

/// Scheduling-relevant template settings captured on the job.
fn config_snapshot(template: &RunTemplate) -> serde_json::Value {
    serde_json::json!({
        "runtemplate": template.id,
        "name": template.name,
        "interval": template.interval_code.code(),
        "cron": template.custom_expression(),
        "delay": template.delay_seconds,
    })
}

pub(crate) fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SchedulerError::InvalidTimestamp(raw.to_string()))
}

/// Columns of a `runtemplate` row before interpretation.
struct RawTemplate {
    id: TemplateId,
    tenant_id: TenantId,
    app_id: AppId,
    name: String,
    executor: String,
    active: bool,
    interv: String,
    cron: Option<String>,
    delay: i64,
    last_schedule: Option<String>,
    next_schedule: Option<String>,
}

impl RawTemplate {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            app_id: row.get(2)?,
            name: row.get(3)?,
            executor: row.get(4)?,
            active: row.get(5)?,
            interv: row.get(6)?,
            cron: row.get(7)?,
            delay: row.get(8)?,
            last_schedule: row.get(9)?,
            next_schedule: row.get(10)?,
        })
    }

    fn into_template(self) -> Result<RunTemplate> {
        let interval_code = IntervalCode::from_code(self.interv.trim())?;
        let delay_seconds = u32::try_from(self.delay)
            .map_err(|_| SchedulerError::InvalidSchedule {
                expression: self.interv.clone(),
                reason: format!("delay {} out of range", self.delay),
            })?;
        Ok(RunTemplate {
            id: self.id,
            tenant_id: self.tenant_id,
            app_id: self.app_id,
            name: self.name,
            executor: self.executor,
            active: self.active,
            interval_code,
            custom_expression: self.cron,
            delay_seconds,
            last_schedule: lenient_ts(self.id, "last_schedule", self.last_schedule),
            next_schedule: lenient_ts(self.id, "next_schedule", self.next_schedule),
        })
    }
}

/// An unreadable marker is treated as absent; the pending-job check still guards.
fn lenient_ts(id: TemplateId, column: &str, raw: Option<String>) -> Option<DateTime<Utc>> {
    let raw = raw.filter(|s| !s.trim().is_empty())?;
    match parse_ts(&raw) {
        Ok(at) => Some(at),
        Err(_) => {
            warn!(template_id = id, column, value = %raw, "ignoring unparsable timestamp");
            None
        }
    }
}

struct RawJob {
    id: JobId,
    runtemplate_id: TemplateId,
    tenant_id: TenantId,
    app_id: AppId,
    schedule: Option<String>,
    executor: String,
    schedule_type: String,
    exit_code: Option<i32>,
    env: String,
}

impl RawJob {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            runtemplate_id: row.get(1)?,
            tenant_id: row.get(2)?,
            app_id: row.get(3)?,
            schedule: row.get(4)?,
            executor: row.get(5)?,
            schedule_type: row.get(6)?,
            exit_code: row.get(7)?,
            env: row.get(8)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let scheduled_time = self.schedule.as_deref().map(parse_ts).transpose()?;
        let trigger_source: TriggerSource = self.schedule_type.parse()?;
        let config_snapshot =
            serde_json::from_str(&self.env).unwrap_or(serde_json::Value::Null);
        Ok(Job {
            id: self.id,
            runtemplate_id: self.runtemplate_id,
            tenant_id: self.tenant_id,
            app_id: self.app_id,
            scheduled_time,
            executor: self.executor,
            trigger_source,
            exit_code: self.exit_code,
            config_snapshot,
        })
    }
}
