//! Wire protocol for the AOT compiler service.
//!
//! The service and its clients exchange newline-delimited JSON frames over a
//! Unix socket. Every request carries a fixed numeric command code, every
//! reply carries a numeric status code from [`ErrorCode`].
//!
//! ```text
//! -> {"code": 1, "args": {"args": {"BundleUid": "20020079", ...}}}
//! <- {"type": "reply", "status": 0, "data": {"signature": [12, -3, ...]}}
//! <- {"type": "rejected", "reason": "request map exceeds 102400 entries"}
//! ```

pub mod codes;
pub mod frames;

pub use codes::{CommandCode, ErrorCode};
pub use frames::*;

/// Maximum number of entries in a request map or elements in a returned
/// sequence. Exceeding it is an IPC-level failure, not an application error.
pub const MAX_IPC_SEQUENCE_LEN: usize = 102_400;

/// Maximum length in bytes of one newline-delimited frame.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;
