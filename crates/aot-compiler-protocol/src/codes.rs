//! Numeric command and status codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Command codes understood by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandCode {
    /// Compile an application's bytecode.
    AotCompiler = 1,
    /// Kill the in-flight compile.
    StopAotCompiler = 2,
    /// Query the AN file version produced by this service.
    GetAotVersion = 3,
    /// Ask whether artifacts of an older version must be rebuilt.
    NeedReCompile = 4,
    /// Platform notification forwarded to the service's event bus.
    SystemEvent = 100,
}

/// A command code that does not name any known operation.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("unknown command code {0}")]
pub struct UnknownCommand(pub u32);

impl CommandCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for CommandCode {
    type Error = UnknownCommand;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::AotCompiler),
            2 => Ok(Self::StopAotCompiler),
            3 => Ok(Self::GetAotVersion),
            4 => Ok(Self::NeedReCompile),
            100 => Ok(Self::SystemEvent),
            other => Err(UnknownCommand(other)),
        }
    }
}

/// Status codes returned by every operation.
///
/// `Ok` and `OkNoAotFile` are the two success codes; the latter means the
/// compiler ran fine but had nothing to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    ParamFailed = 10001,
    ConnectFailed = 10002,
    CallFailed = 10003,
    SignatureFailed = 10004,
    OkNoAotFile = 10005,
    StopFailed = 10006,
    SignatureDisable = 10007,
    CallCrash = 10008,
    CallCancelled = 10009,
}

/// A status code outside the closed set.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("unknown status code {0}")]
pub struct UnknownStatus(pub i32);

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::OkNoAotFile)
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Ok => "success",
            Self::ParamFailed => "aot compiler arguments error",
            Self::ConnectFailed => "connect aot compiler service failed",
            Self::CallFailed => "call aot compiler failed",
            Self::SignatureFailed => "local code sign failed",
            Self::OkNoAotFile => "no aot file saved",
            Self::StopFailed => "stop aot compiler failed",
            Self::SignatureDisable => "local code sign disabled",
            Self::CallCrash => "aot compiler crashed",
            Self::CallCancelled => "aot compiler cancelled",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.as_i32())
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.as_i32()
    }
}

impl TryFrom<i32> for ErrorCode {
    type Error = UnknownStatus;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        let code = match value {
            0 => Self::Ok,
            10001 => Self::ParamFailed,
            10002 => Self::ConnectFailed,
            10003 => Self::CallFailed,
            10004 => Self::SignatureFailed,
            10005 => Self::OkNoAotFile,
            10006 => Self::StopFailed,
            10007 => Self::SignatureDisable,
            10008 => Self::CallCrash,
            10009 => Self::CallCancelled,
            other => return Err(UnknownStatus(other)),
        };
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_are_fixed() {
        assert_eq!(CommandCode::AotCompiler.as_u32(), 1);
        assert_eq!(CommandCode::StopAotCompiler.as_u32(), 2);
        assert_eq!(CommandCode::GetAotVersion.as_u32(), 3);
        assert_eq!(CommandCode::NeedReCompile.as_u32(), 4);
        assert_eq!(CommandCode::try_from(100), Ok(CommandCode::SystemEvent));
        assert_eq!(CommandCode::try_from(5), Err(UnknownCommand(5)));
    }

    #[test]
    fn test_status_serializes_as_number() {
        let json = serde_json::to_string(&ErrorCode::CallCancelled).unwrap();
        assert_eq!(json, "10009");

        let parsed: ErrorCode = serde_json::from_str("10006").unwrap();
        assert_eq!(parsed, ErrorCode::StopFailed);

        assert!(serde_json::from_str::<ErrorCode>("42").is_err());
    }

    #[test]
    fn test_success_codes() {
        assert!(ErrorCode::Ok.is_success());
        assert!(ErrorCode::OkNoAotFile.is_success());
        assert!(!ErrorCode::CallCrash.is_success());
    }
}
