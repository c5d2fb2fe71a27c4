use crate::ble::RadioError;
use crate::link::Role;

/// Errors returned synchronously to host calls.
///
/// Failures that originate in the radio after a call returned (a failed MTU
/// exchange, a lost link) are delivered as events instead.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{0} role has not been started")]
    NotStarted(Role),

    #[error("service identifiers have not been configured")]
    ServiceNotConfigured,

    #[error("service identifiers are already configured")]
    ServiceAlreadyConfigured,

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("link is not ready (currently {0})")]
    NotReady(&'static str),

    #[error("a previous message is still being sent")]
    Busy,

    #[error("invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("transport task has shut down")]
    Shutdown,
}

impl TransportError {
    /// Whether the same call may succeed later without host intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Busy)
    }
}
