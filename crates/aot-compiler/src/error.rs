//! Service error types.

use thiserror::Error;

use crate::protocol::ErrorCode;

/// Result type for compiler service operations.
pub type AotResult<T> = Result<T, AotError>;

/// Errors raised by the args handler and the compiler core.
///
/// Every variant maps onto exactly one numeric [`ErrorCode`]; the message is
/// for logs only and never crosses the IPC boundary.
#[derive(Debug, Error)]
pub enum AotError {
    /// A request field is missing or malformed.
    #[error("invalid compile arguments: {0}")]
    Param(String),

    /// The compiler could not be started or exited unsuccessfully.
    #[error("aot compiler call failed: {0}")]
    CallFailed(String),

    /// The compiler was terminated by an unexpected signal.
    #[error("aot compiler crashed with signal {signal}")]
    Crash { signal: i32 },

    /// Admission was denied, or the compiler was killed by a stop request.
    #[error("aot compiler cancelled: {0}")]
    Cancelled(String),

    /// Code signing of the produced artifact failed.
    #[error("local code sign failed: {0}")]
    Signature(String),

    /// Code signing is disabled in this build.
    #[error("local code sign is disabled")]
    SignatureDisabled,

    /// Nothing was stopped, or kill/cleanup did not fully succeed.
    #[error("stop aot compiler failed: {0}")]
    StopFailed(String),
}

impl AotError {
    pub fn param(msg: impl Into<String>) -> Self {
        Self::Param(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Param(_) => ErrorCode::ParamFailed,
            Self::CallFailed(_) => ErrorCode::CallFailed,
            Self::Crash { .. } => ErrorCode::CallCrash,
            Self::Cancelled(_) => ErrorCode::CallCancelled,
            Self::Signature(_) => ErrorCode::SignatureFailed,
            Self::SignatureDisabled => ErrorCode::SignatureDisable,
            Self::StopFailed(_) => ErrorCode::StopFailed,
        }
    }
}
