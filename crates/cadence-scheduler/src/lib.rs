//! `cadence-scheduler`: multi-tenant run-template scheduling with SQLite persistence.
//!
//! # Overview
//!
//! Every tick the [`daemon::DaemonLoop`] asks the [`engine::SchedulingEngine`]
//! to walk all active tenants and their active run templates. For each template
//! the [`ledger::ScheduleLedger`] decides whether a new job is due, using the
//! [`interval::IntervalResolver`] and [`window::WindowCalculator`] to find the
//! current window. Due occurrences are handed to the store's job preparer,
//! which writes the `job` row and its `schedule` queue row.
//!
//! At most one job per template and window is enqueued. The guarantee rests on
//! persisted state only: the pending-job check and the `last_schedule` marker.
//!
//! # Interval codes
//!
//! | Code | Interval | Canonical crontab |
//! |------|----------|-------------------|
//! | `i`  | minute   | `* * * * *`       |
//! | `h`  | hour     | `0 * * * *`       |
//! | `d`  | day      | `0 0 * * *`       |
//! | `w`  | week     | `0 0 * * 0`       |
//! | `m`  | month    | `0 0 1 * *`       |
//! | `y`  | year     | `0 0 1 1 *`       |
//! | `c`  | custom   | stored expression |
//! | `n`  | none     | never due         |

pub mod daemon;
pub mod db;
pub mod engine;
pub mod error;
pub mod interval;
pub mod ledger;
pub mod sink;
pub mod sqlite;
pub mod store;
pub mod window;

pub use daemon::{DaemonLoop, DaemonSettings, DaemonState, RecoveryReport};
pub use engine::{PassReport, SchedulingEngine};
pub use error::{Result, SchedulerError};
pub use interval::{IntervalResolver, ScheduleExpression};
pub use ledger::{Decision, ScheduleLedger, SkipReason};
pub use sink::{MemorySink, StatusSink, TracingSink};
pub use sqlite::{NewRunTemplate, SqliteStore};
pub use store::{
    JobPreparer, JobRepository, RunTemplateUpdate, SchedulerStore, StorageMaintenance,
    TemplateRepository, WindowClaim,
};
pub use window::{Occurrence, WindowCalculator};
