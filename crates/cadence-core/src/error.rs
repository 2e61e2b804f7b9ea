use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown interval code: {0}")]
    UnknownInterval(String),

    #[error("Unknown trigger source: {0}")]
    UnknownTrigger(String),
}

impl CoreError {
    /// Short error code string used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::UnknownInterval(_) => "UNKNOWN_INTERVAL",
            CoreError::UnknownTrigger(_) => "UNKNOWN_TRIGGER",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
