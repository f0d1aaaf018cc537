//! Request and response frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::codes::{CommandCode, ErrorCode};

/// Caller-supplied compile arguments.
pub type RequestArgs = BTreeMap<String, String>;

// ============================================================================
// Requests
// ============================================================================

/// A request frame: command code plus command-specific arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub code: u32,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
}

impl RequestFrame {
    /// Build a frame for a command without arguments.
    pub fn bare(code: CommandCode) -> Self {
        Self {
            code: code.as_u32(),
            args: Value::Null,
        }
    }

    /// Build a frame carrying serialized arguments.
    pub fn with_args<T: Serialize>(code: CommandCode, args: &T) -> serde_json::Result<Self> {
        Ok(Self {
            code: code.as_u32(),
            args: serde_json::to_value(args)?,
        })
    }
}

/// Arguments of [`CommandCode::AotCompiler`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompileArgs {
    pub args: RequestArgs,
}

/// Arguments of [`CommandCode::NeedReCompile`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeedRecompileArgs {
    pub old_version: String,
}

/// Arguments of [`CommandCode::SystemEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEventArgs {
    pub event: SystemEvent,
}

/// Device events that drive admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemEvent {
    PowerDisconnected,
    ScreenOn,
    ThermalLevelChanged(i32),
}

// ============================================================================
// Responses
// ============================================================================

/// A response frame.
///
/// `Rejected` is an IPC-level failure (malformed frame, unknown command,
/// capacity exceeded) and never carries an application status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFrame {
    Reply {
        status: ErrorCode,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
    },
    Rejected {
        reason: String,
    },
}

impl ResponseFrame {
    pub fn status(status: ErrorCode) -> Self {
        Self::Reply {
            status,
            data: Value::Null,
        }
    }

    pub fn with_data<T: Serialize>(status: ErrorCode, data: &T) -> serde_json::Result<Self> {
        Ok(Self::Reply {
            status,
            data: serde_json::to_value(data)?,
        })
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Reply data of [`CommandCode::AotCompiler`]. The signature is empty unless
/// the status is [`ErrorCode::Ok`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompileReply {
    #[serde(default)]
    pub signature: Vec<i16>,
}

/// Reply data of [`CommandCode::GetAotVersion`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionReply {
    pub version: String,
}

/// Reply data of [`CommandCode::NeedReCompile`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NeedRecompileReply {
    pub need: bool,
}

/// Successful result of a compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    /// Artifact produced and signed.
    Signed { signature: Vec<i16> },
    /// The compiler ran but produced nothing to sign.
    NoArtifact,
}

impl CompileOutcome {
    pub fn status(&self) -> ErrorCode {
        match self {
            Self::Signed { .. } => ErrorCode::Ok,
            Self::NoArtifact => ErrorCode::OkNoAotFile,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_request_frame() {
        let mut args = RequestArgs::new();
        args.insert("BundleUid".to_string(), "20020079".to_string());
        let frame = RequestFrame::with_args(CommandCode::AotCompiler, &CompileArgs { args }).unwrap();

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"code\":1"));
        assert!(json.contains("20020079"));

        let parsed: RequestFrame = serde_json::from_str(&json).unwrap();
        let compile: CompileArgs = serde_json::from_value(parsed.args).unwrap();
        assert_eq!(compile.args["BundleUid"], "20020079");
    }

    #[test]
    fn test_bare_frame_omits_args() {
        let json = serde_json::to_string(&RequestFrame::bare(CommandCode::StopAotCompiler)).unwrap();
        assert_eq!(json, r#"{"code":2}"#);

        let parsed: RequestFrame = serde_json::from_str(r#"{"code":3}"#).unwrap();
        assert!(parsed.args.is_null());
    }

    #[test]
    fn test_system_event_wire_format() {
        let json = serde_json::to_string(&SystemEvent::ThermalLevelChanged(3)).unwrap();
        assert_eq!(json, r#"{"thermal_level_changed":3}"#);

        let parsed: SystemEvent = serde_json::from_str(r#""screen_on""#).unwrap();
        assert_eq!(parsed, SystemEvent::ScreenOn);
    }

    #[test]
    fn test_reply_and_rejection() {
        let reply = ResponseFrame::with_data(
            ErrorCode::Ok,
            &VersionReply {
                version: "4.0.0.5".to_string(),
            },
        )
        .unwrap();
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains(r#""type":"reply""#));
        assert!(json.contains(r#""status":0"#));

        let rejected: ResponseFrame =
            serde_json::from_str(r#"{"type":"rejected","reason":"too large"}"#).unwrap();
        match rejected {
            ResponseFrame::Rejected { reason } => assert_eq!(reason, "too large"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_outcome_status() {
        assert_eq!(CompileOutcome::NoArtifact.status(), ErrorCode::OkNoAotFile);
        assert_eq!(
            CompileOutcome::Signed { signature: vec![1] }.status(),
            ErrorCode::Ok
        );
    }
}
