//! Custom error types for the application.
//!
//! `DaqError` is the single error type shared by the actor runtime, the state
//! machine, axis I/O, scan composition, collation and the experiment
//! orchestrator.
//!
//! ## Error Hierarchy
//!
//! - **Recoverable orchestration errors**: `Interlock`, `AlreadyMoving` and
//!   `ScanMisconfigured` are reported to the caller (or logged by the
//!   orchestrator) and never bring an actor down on their own.
//! - **Fatal actor errors**: `UnhandledMessage` and `InvalidStartingState`
//!   indicate a broken state table or a message nobody knows how to handle.
//! - **Infrastructure errors**: `Io`, `Json` and `Config` wrap the underlying
//!   library errors via `#[from]`.
//! - **Driver errors**: device drivers and user-supplied callbacks return
//!   `anyhow::Result`; those convert into `DaqError::Other`.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application error type.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Interlock failed: {0}")]
    Interlock(String),

    #[error("Unhandled message: {0}")]
    UnhandledMessage(String),

    #[error("Starting state {0} is not declared in the state table")]
    InvalidStartingState(String),

    #[error("Mailbox closed")]
    MailboxClosed,

    #[error("Actor '{0}' has not been prepared")]
    NotPrepared(String),

    #[error("Already moving: {axis}")]
    AlreadyMoving {
        /// Name of the axis with a write in flight.
        axis: String,
    },

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Axis '{0}' is read-only")]
    ReadOnly(String),

    #[error("No axis or property at path '{0}'")]
    UnknownPath(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Scan misconfigured: {0}")]
    ScanMisconfigured(String),

    #[error("Collation error: {0}")]
    Collation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DaqError {
    /// Errors the orchestrator recovers from without stopping the actor.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DaqError::Interlock(_)
                | DaqError::AlreadyMoving { .. }
                | DaqError::ScanMisconfigured(_)
                | DaqError::Persistence(_)
                | DaqError::ReadOnly(_)
                | DaqError::NotSupported(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_moving_names_the_axis() {
        let err = DaqError::AlreadyMoving {
            axis: "stage_x".into(),
        };
        assert_eq!(err.to_string(), "Already moving: stage_x");
        assert!(err.is_recoverable());
    }

    #[test]
    fn anyhow_errors_are_transparent() {
        let err: DaqError = anyhow::anyhow!("driver timeout").into();
        assert_eq!(err.to_string(), "driver timeout");
        assert!(!err.is_recoverable());
    }
}
