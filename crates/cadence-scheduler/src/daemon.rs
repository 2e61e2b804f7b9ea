use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use cadence_core::config::DaemonConfig;

use crate::engine::{PassReport, SchedulingEngine};
use crate::error::{Result, SchedulerError};
use crate::store::SchedulerStore;

/// Lifecycle of the daemon loop.
///
/// `Starting → Running ⇄ ReconnectingDb → Stopping → Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Starting,
    Running,
    ReconnectingDb,
    Stopping,
    Stopped,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::ReconnectingDb => "reconnecting_db",
            DaemonState::Stopping => "stopping",
            DaemonState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub tick_interval: Duration,
    /// Failed health checks tolerated before the first connection is fatal.
    pub startup_retries: u32,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub orphan_grace: Duration,
}

impl From<&DaemonConfig> for DaemonSettings {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            startup_retries: config.startup_retries,
            reconnect_base: config.reconnect_base(),
            reconnect_cap: config.reconnect_cap(),
            orphan_grace: config.orphan_grace(),
        }
    }
}

/// What startup recovery removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub orphaned_jobs: usize,
    pub broken_queue_records: usize,
}

/// `base × attempt`, capped.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.max(1)).min(cap)
}

/// Drives [`SchedulingEngine::run_once`] on a fixed cadence and keeps the
/// storage connection alive.
///
/// Correctness comes from the ledger, not from tick granularity: a slow or
/// skipped tick only delays scheduling.
pub struct DaemonLoop<S: ?Sized> {
    engine: SchedulingEngine<S>,
    store: Arc<S>,
    settings: DaemonSettings,
    state: watch::Sender<DaemonState>,
}

impl<S> DaemonLoop<S>
where
    S: SchedulerStore + ?Sized,
{
    pub fn new(engine: SchedulingEngine<S>, store: Arc<S>, settings: DaemonSettings) -> Self {
        let (state, _) = watch::channel(DaemonState::Starting);
        Self {
            engine,
            store,
            settings,
            state,
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> DaemonState {
        *self.state.borrow()
    }

    fn set_state(&self, next: DaemonState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "daemon state");
        }
    }

    /// Wait for storage, then run one-time recovery.
    ///
    /// Fails with [`SchedulerError::StartupFailed`] when storage never answers.
    /// A failed recovery is logged and reported as nothing purged.
    pub async fn startup(&self) -> Result<RecoveryReport> {
        self.set_state(DaemonState::Starting);
        self.wait_for_database().await?;
        match self.recover() {
            Ok(report) => Ok(report),
            Err(e) => {
                error!(err = %e, "startup recovery failed, continuing without it");
                Ok(RecoveryReport::default())
            }
        }
    }

    async fn wait_for_database(&self) -> Result<()> {
        let attempts = self.settings.startup_retries.max(1);
        let mut last_err = String::new();
        for attempt in 1..=attempts {
            match self.store.health_check() {
                Ok(()) => {
                    if attempt > 1 {
                        info!(attempt, "storage reachable");
                    }
                    return Ok(());
                }
                Err(e) => {
                    last_err = e.to_string();
                    error!(attempt, attempts, err = %e, "storage unavailable");
                }
            }
            if attempt < attempts {
                let delay =
                    backoff_delay(self.settings.reconnect_base, self.settings.reconnect_cap, attempt);
                tokio::time::sleep(delay).await;
                if let Err(e) = self.store.reconnect() {
                    debug!(attempt, err = %e, "reconnect failed");
                }
            }
        }
        Err(SchedulerError::StartupFailed {
            attempts,
            reason: last_err,
        })
    }

    /// Purge orphaned pending jobs and broken queue records left by a prior run.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let report = RecoveryReport {
            orphaned_jobs: self
                .store
                .purge_orphaned_jobs(Utc::now(), self.settings.orphan_grace)?,
            broken_queue_records: self.store.purge_broken_queue_records()?,
        };
        if report != RecoveryReport::default() {
            warn!(
                orphaned_jobs = report.orphaned_jobs,
                broken_queue_records = report.broken_queue_records,
                "startup recovery purged stale records"
            );
        }
        Ok(report)
    }

    /// Startup plus exactly one pass, for non-daemonized runs.
    pub async fn run_single(&self) -> Result<PassReport> {
        self.startup().await?;
        self.set_state(DaemonState::Running);
        let result = self.engine.run_once(Utc::now());
        self.set_state(DaemonState::Stopped);
        result
    }

    /// Run until `shutdown` carries `true` or its sender is dropped.
    ///
    /// Returns an error only when storage was never reachable at startup. The
    /// current pass always finishes before shutdown is honoured.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("cadence scheduling daemon started");

        if let Err(e) = self.startup().await {
            error!(err = %e, "startup failed");
            self.set_state(DaemonState::Stopped);
            info!("cadence scheduling daemon ended");
            return Err(e);
        }
        self.set_state(DaemonState::Running);

        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.engine.run_once(Utc::now()) {
                        Ok(report) if report.enqueued > 0 || report.failed > 0 => {
                            info!(enqueued = report.enqueued, failed = report.failed, "tick");
                        }
                        Ok(report) => {
                            debug!(tenants = report.tenants, skipped = report.skipped, "tick");
                        }
                        Err(e) if e.is_connectivity() => {
                            error!(err = %e, "storage connection lost");
                            if !self.reconnect(&mut shutdown).await {
                                break;
                            }
                            ticker.reset();
                        }
                        Err(e) => error!(err = %e, "scheduling pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.set_state(DaemonState::Stopping);
        info!("cadence scheduling daemon ended");
        self.set_state(DaemonState::Stopped);
        Ok(())
    }

    /// Retry until storage answers again. `false` means shutdown was requested.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        self.set_state(DaemonState::ReconnectingDb);
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let delay =
                backoff_delay(self.settings.reconnect_base, self.settings.reconnect_cap, attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }

            match self.store.reconnect().and_then(|_| self.store.health_check()) {
                Ok(()) => {
                    info!(attempt, "storage connection recovered");
                    self.set_state(DaemonState::Running);
                    return true;
                }
                Err(e) => warn!(attempt, err = %e, "reconnect failed"),
            }
        }
    }
}
