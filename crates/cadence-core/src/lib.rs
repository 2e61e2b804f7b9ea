//! `cadence-core`: configuration and domain types shared by the scheduler
//! and the `cadence` binary.

pub mod config;
pub mod error;
pub mod status;
pub mod types;

pub use config::CadenceConfig;
pub use error::{CoreError, Result};
pub use status::{StatusLevel, StatusMessage};
pub use types::{IntervalCode, Job, RunTemplate, Tenant, TriggerSource};
