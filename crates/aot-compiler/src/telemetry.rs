//! Compile telemetry.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Reported once per successful compile, before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileEvent {
    /// Directory holding the artifact; identifies the bundle's cache.
    pub artifact_dir: PathBuf,
    pub compiler: String,
    pub finished_at: DateTime<Utc>,
}

impl CompileEvent {
    pub fn new(artifact: &Path, compiler: &str) -> Self {
        Self {
            artifact_dir: artifact.parent().map(Path::to_path_buf).unwrap_or_default(),
            compiler: compiler.to_string(),
            finished_at: Utc::now(),
        }
    }
}

pub trait CompileEventSink: Send + Sync {
    fn report(&self, event: &CompileEvent);
}

/// Emits compile events as structured tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl CompileEventSink for TracingEventSink {
    fn report(&self, event: &CompileEvent) {
        tracing::info!(
            target: "aot_compiler::event",
            artifact_dir = %event.artifact_dir.display(),
            compiler = %event.compiler,
            finished_at = %event.finished_at.to_rfc3339(),
            "aot compile finished"
        );
    }
}
