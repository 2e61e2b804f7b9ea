use std::sync::Mutex;

use tracing::{debug, error, info, warn};

use cadence_core::status::{StatusLevel, StatusMessage};

/// Destination for operator-facing status lines.
///
/// Fire-and-forget: implementations must not fail or panic.
pub trait StatusSink: Send + Sync {
    fn emit(&self, message: StatusMessage);
}

/// Forwards status lines to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn emit(&self, message: StatusMessage) {
        let StatusMessage {
            level,
            tenant_id,
            text,
        } = message;
        match level {
            StatusLevel::Debug => debug!(target: "cadence::status", ?tenant_id, "{text}"),
            StatusLevel::Info | StatusLevel::Success => {
                info!(target: "cadence::status", ?tenant_id, "{text}")
            }
            StatusLevel::Warning => warn!(target: "cadence::status", ?tenant_id, "{text}"),
            StatusLevel::Error => error!(target: "cadence::status", ?tenant_id, "{text}"),
        }
    }
}

/// Keeps every emitted line in memory; handy for asserting on status output.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<StatusMessage>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<StatusMessage> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, level: StatusLevel) -> usize {
        self.messages().iter().filter(|m| m.level == level).count()
    }

    pub fn clear(&self) {
        if let Ok(mut m) = self.messages.lock() {
            m.clear();
        }
    }
}

impl StatusSink for MemorySink {
    fn emit(&self, message: StatusMessage) {
        if let Ok(mut m) = self.messages.lock() {
            m.push(message);
        }
    }
}
