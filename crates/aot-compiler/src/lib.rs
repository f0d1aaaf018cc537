//! AOT Compiler Service
//!
//! A privileged, single-instance daemon that compiles application bytecode
//! ahead of time by launching an external compiler process, then code-signs
//! the produced artifact.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   Unix socket   ┌──────────────────────┐
//! │ AotCompiler  │ ──────────────▶ │  server + service    │
//! │   Client     │                 │ (call lock, unload   │
//! └──────────────┘                 │  timer, events)      │
//!                                  └──────────┬───────────┘
//!                                             ▼
//!                                  ┌──────────────────────┐
//!                                  │    CompilerCore      │──▶ CodeSigner
//!                                  │ (job slot, admission)│
//!                                  └──────────┬───────────┘
//!                                  ArgsHandler│ spawn/wait/kill
//!                                             ▼
//!                                  ┌──────────────────────┐
//!                                  │ ark_aot_compiler /   │
//!                                  │ ark_aot (as bundle)  │
//!                                  └──────────────────────┘
//! ```

pub mod args;
pub mod client;
pub mod compiler;
pub mod config;
pub mod error;
pub mod events;
pub mod server;
pub mod service;
pub mod sign;
pub mod telemetry;
pub mod version;

pub use aot_compiler_protocol as protocol;
pub use aot_compiler_protocol::{CompileOutcome, ErrorCode, RequestArgs};
pub use error::{AotError, AotResult};
