//! Error handling for this crate
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A Result containing a SystemError with its accompanying source
pub type TypedResult<T> = Result<T, TypedError>;

/// Classification of everything that can go wrong while handling a
/// reservation request.
///
/// The kind decides how far a failure propagates: most variants are reported
/// to the requesting client and leave the daemon state untouched (or rolled
/// back), while [`SystemError::SystemInconsistent`] marks a failed rollback
/// of external effects and is fatal.
#[derive(Error, Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SystemError {
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("No free socket priority, traffic class or queue left")]
    ResourceExhausted,
    #[error("Traffic conflicts with the existing schedule")]
    Conflict,
    #[error("Device cannot implement the requested schedule or feature")]
    DeviceUnsupported,
    #[error("Link is down or its rate cannot be determined")]
    LinkDown,
    #[error("System configuration command failed")]
    SystemConfigFailed,
    #[error("Rollback of system configuration failed, state is inconsistent")]
    SystemInconsistent,
    #[error("Malformed IPC message")]
    IpcMalformed,
    #[error("Internal resource accounting violated")]
    InvariantViolation,
    #[error("Service lifecycle error")]
    Service,
}

/// Combination of a SystemError with an anyhow error
#[derive(Error, Debug)]
#[error("{err:?}: {source:?}")]
pub struct TypedError {
    err: SystemError,
    source: anyhow::Error,
}

impl TypedError {
    /// Creates a new TypedError
    pub fn new(err: SystemError, source: anyhow::Error) -> Self {
        Self { err, source }
    }
    /// Returns the SystemError of this TypedError
    pub fn err(&self) -> SystemError {
        self.err
    }
    /// Returns the anyhow error of this TypedError
    pub fn source(&self) -> &anyhow::Error {
        &self.source
    }
}

/// Converts a Result into one of our own Result types
pub trait ResultExt<T> {
    /// Converts a Result to a TypedResult
    fn typ(self, err: SystemError) -> TypedResult<T>;
}

impl<T, E: Into<anyhow::Error>> ResultExt<T> for Result<T, E> {
    fn typ(self, err: SystemError) -> TypedResult<T> {
        self.map_err(|e| TypedError {
            err,
            source: e.into(),
        })
    }
}
