use thiserror::Error;

/// Error taxonomy for every public controller operation.
///
/// Recoverable kinds (`InvalidInput`, `NotFound`, `Conflict`) are returned
/// before any state is mutated. `Persistence` and `Protocol` wrap I/O that
/// failed after logging. `Invariant` aborts a write that would corrupt
/// stored data.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("protocol failure: {0}")]
    Protocol(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl From<artnet::StreamError> for ControllerError {
    fn from(err: artnet::StreamError) -> Self {
        match err {
            // A busy port 6454 is a resource conflict the caller can retry.
            artnet::StreamError::PortInUse { .. } => ControllerError::Conflict(err.to_string()),
            artnet::StreamError::InvalidConfig(_) => ControllerError::InvalidInput(err.to_string()),
        }
    }
}
