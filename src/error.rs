use std::time::Duration;

/// Failures raised by the backend session layer.
///
/// File/symbol lookups that find nothing are reported as structured
/// `found: false` results, not errors; cache serialization failures are
/// recovered locally as misses. Only process and protocol problems
/// propagate through this type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to start {language} backend: {reason}")]
    ProcessStart { language: String, reason: String },

    #[error("backend protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn timeout(method: &str, after: Duration) -> Self {
        Error::Protocol(format!("timeout: no reply to {method} within {after:?}"))
    }

    /// Stable machine-readable code surfaced to the tool-call layer.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ProcessStart { .. } => "process_start_error",
            Error::Protocol(_) => "protocol_error",
            Error::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
