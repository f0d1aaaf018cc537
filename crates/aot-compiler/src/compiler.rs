//! Compiler core: owns the single compile-job slot.
//!
//! A compile validates the request, builds the command line, spawns the
//! compiler as the bundle's uid/gid with every capability dropped, blocks
//! until the child exits, interprets the exit status and signs the artifact.
//!
//! ```text
//!  Idle ──compile──▶ Compiling ──child exits──────────▶ Idle
//!                        │
//!                        └──stop: SIGKILL + rm artifact──▶ Idle
//! ```
//!
//! The core is not reentrant for concurrent compiles; the service serializes
//! them. `stop` may race a compile and is safe to call from any thread.

use log::{debug, error, info, warn};
use rustix::process::geteuid;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::args::{ArgsHandler, COMPILER_PKG_INFO, HapArgs, TARGET_COMPILER_MODE};
use crate::config::{AdmissionConfig, AppConfig};
use crate::error::{AotError, AotResult};
use crate::protocol::{CompileOutcome, ErrorCode, RequestArgs};
use crate::sign::{CodeSigner, SignError, default_signer, to_sig_data};
use crate::telemetry::{CompileEvent, CompileEventSink, TracingEventSink};

/// Bookkeeping for the in-flight compile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AotState {
    pub running: bool,
    pub child_pid: Option<u32>,
    /// Artifact the running child writes; removed if the job is stopped.
    pub artifact: Option<PathBuf>,
}

/// One row of the compiler exit-code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilerExit {
    pub status: ErrorCode,
    /// Whether running the same request again may succeed.
    pub retryable: bool,
    pub message: &'static str,
}

const fn exit(status: ErrorCode, retryable: bool, message: &'static str) -> CompilerExit {
    CompilerExit {
        status,
        retryable,
        message,
    }
}

/// Map the compiler's exit code through the fixed result table.
pub fn lookup_exit_code(code: i32) -> CompilerExit {
    match code {
        0 => exit(ErrorCode::Ok, false, "aot compiler success"),
        1 => exit(ErrorCode::CallFailed, false, "aot compiler printed help"),
        2 => exit(ErrorCode::OkNoAotFile, false, "no profile, nothing compiled"),
        3 => exit(ErrorCode::CallFailed, true, "merge profile failed"),
        4 => exit(ErrorCode::CallFailed, false, "check version failed"),
        5 => exit(ErrorCode::OkNoAotFile, false, "output is empty"),
        6 => exit(ErrorCode::CallFailed, true, "save an file failed"),
        7 => exit(ErrorCode::CallFailed, true, "save ai file failed"),
        _ => exit(ErrorCode::CallFailed, false, "unknown aot compiler exit code"),
    }
}

/// Interpret how the compiler terminated. Success variants come back as
/// `Ok`, everything else as the matching error.
pub fn interpret_exit_status(status: ExitStatus) -> AotResult<CompilerExit> {
    if let Some(code) = status.code() {
        let entry = lookup_exit_code(code);
        if entry.status.is_success() {
            return Ok(entry);
        }
        warn!(
            "aot compiler exited with code {code}: {} (retryable: {})",
            entry.message, entry.retryable
        );
        return Err(AotError::CallFailed(format!("{} (exit {code})", entry.message)));
    }
    if let Some(signal) = status.signal() {
        if signal == libc::SIGKILL {
            return Err(AotError::Cancelled("aot compiler killed by stop request".to_string()));
        }
        error!("aot compiler terminated by signal {signal}");
        return Err(AotError::Crash { signal });
    }
    if let Some(signal) = status.stopped_signal() {
        return Err(AotError::CallFailed(format!("aot compiler stopped by signal {signal}")));
    }
    Err(AotError::CallFailed(format!("unexpected wait status {status:?}")))
}

fn verify_compiler_mode_and_pkg_info(args: &RequestArgs) -> AotResult<()> {
    for key in [TARGET_COMPILER_MODE, COMPILER_PKG_INFO] {
        match args.get(key) {
            Some(value) if !value.is_empty() => {}
            _ => return Err(AotError::param(format!("{key} missing or empty"))),
        }
    }
    Ok(())
}

/// Child entry procedure, run between fork and exec.
///
/// Drops to the bundle's gid/uid, then clears every capability. Any failure
/// aborts the exec and the spawn reports the error to the parent.
fn drop_privileges(uid: u32, gid: u32) -> io::Result<()> {
    let is_root = geteuid().is_root();
    // SAFETY: only async-signal-safe libc calls.
    unsafe {
        if is_root && libc::setgroups(1, &gid) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setgid(gid) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setuid(uid) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    clear_capabilities()
}

#[cfg(target_os = "linux")]
fn clear_capabilities() -> io::Result<()> {
    use rustix::thread::{CapabilitySet, CapabilitySets, set_capabilities};

    set_capabilities(
        None,
        CapabilitySets {
            effective: CapabilitySet::empty(),
            permitted: CapabilitySet::empty(),
            inheritable: CapabilitySet::empty(),
        },
    )?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn clear_capabilities() -> io::Result<()> {
    Ok(())
}

fn remove_artifact(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// The compile-job slot plus admission control.
pub struct CompilerCore {
    handler: ArgsHandler,
    admission: AdmissionConfig,
    signer: Box<dyn CodeSigner>,
    event_sink: Box<dyn CompileEventSink>,
    state: Mutex<AotState>,
    /// Best-effort gate: read without the state lock, so one compile may
    /// still start right after a pause.
    allow_aot_compiler: AtomicBool,
    thermal_level: AtomicI32,
}

impl CompilerCore {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            handler: ArgsHandler::new(config.compiler.clone()),
            admission: config.admission.clone(),
            signer: default_signer(config.signing.enabled),
            event_sink: Box::new(TracingEventSink),
            state: Mutex::new(AotState::default()),
            allow_aot_compiler: AtomicBool::new(true),
            thermal_level: AtomicI32::new(0),
        }
    }

    pub fn with_signer(mut self, signer: Box<dyn CodeSigner>) -> Self {
        self.signer = signer;
        self
    }

    pub fn with_event_sink(mut self, sink: Box<dyn CompileEventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, AotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the job slot.
    pub fn state(&self) -> AotState {
        self.lock_state().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    pub fn is_allowed(&self) -> bool {
        self.allow_aot_compiler.load(Ordering::Relaxed)
    }

    pub fn thermal_level(&self) -> i32 {
        self.thermal_level.load(Ordering::Relaxed)
    }

    /// Compile one request. Blocks until the compiler process exits.
    pub fn compile(&self, args: &RequestArgs) -> AotResult<CompileOutcome> {
        if !self.is_allowed() {
            info!("aot compiler is paused, rejecting request");
            return Err(AotError::Cancelled("admission paused".to_string()));
        }
        verify_compiler_mode_and_pkg_info(args)?;
        let hap_args = self.handler.handle(args, self.thermal_level())?;

        let status = self.run_compiler(&hap_args)?;
        let exit = interpret_exit_status(status)?;
        if exit.status == ErrorCode::OkNoAotFile {
            info!("aot compiler finished without artifact: {}", exit.message);
            return Ok(CompileOutcome::NoArtifact);
        }

        self.event_sink
            .report(&CompileEvent::new(hap_args.file_path(), hap_args.program()));

        let signature = self
            .signer
            .sign_local_code(&hap_args.signature, hap_args.file_path())
            .map_err(|e| match e {
                SignError::Disabled => AotError::SignatureDisabled,
                other => AotError::Signature(other.to_string()),
            })?;
        info!("aot compile of {} signed", hap_args.file_name);
        Ok(CompileOutcome::Signed {
            signature: to_sig_data(&signature),
        })
    }

    fn run_compiler(&self, hap_args: &HapArgs) -> AotResult<ExitStatus> {
        let (uid, gid) = (hap_args.bundle_uid, hap_args.bundle_gid);
        let mut command = Command::new(hap_args.program());
        command
            .args(hap_args.argv.iter().skip(1))
            .stdin(Stdio::null());
        // SAFETY: drop_privileges only performs async-signal-safe syscalls.
        unsafe {
            command.pre_exec(move || drop_privileges(uid, gid));
        }

        let mut child = command.spawn().map_err(|e| {
            error!("failed to start {}: {e}", hap_args.program());
            AotError::CallFailed(format!("spawn {}: {e}", hap_args.program()))
        })?;
        let pid = child.id();
        info!("aot compiler started, pid {pid} as {uid}:{gid}");

        {
            let mut state = self.lock_state();
            *state = AotState {
                running: true,
                child_pid: Some(pid),
                artifact: Some(hap_args.file_path().to_path_buf()),
            };
        }

        let waited = child.wait();
        self.clear_slot(pid);

        let status = waited.map_err(|e| AotError::CallFailed(format!("wait for pid {pid}: {e}")))?;
        debug!("aot compiler pid {pid} finished: {status}");
        Ok(status)
    }

    /// Clear the slot only if it still belongs to `pid`.
    fn clear_slot(&self, pid: u32) {
        let mut state = self.lock_state();
        if state.child_pid == Some(pid) {
            *state = AotState::default();
        }
    }

    /// Kill the in-flight compiler and remove its partial artifact.
    pub fn stop(&self) -> AotResult<()> {
        let mut state = self.lock_state();
        if !state.running {
            return Err(AotError::StopFailed("no aot compiler running".to_string()));
        }

        let result = match state.child_pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) {
            Some(pid) if pid > 0 => {
                // SAFETY: plain kill(2) on a pid this core spawned and has not reaped.
                let killed = unsafe { libc::kill(pid, libc::SIGKILL) } == 0;
                if !killed {
                    warn!("failed to kill aot compiler pid {pid}: {}", io::Error::last_os_error());
                }

                let removed = match state.artifact.as_deref() {
                    Some(path) => match remove_artifact(path) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("failed to remove {}: {e}", path.display());
                            false
                        }
                    },
                    None => true,
                };

                if killed && removed {
                    info!("aot compiler pid {pid} stopped");
                    Ok(())
                } else {
                    Err(AotError::StopFailed(format!(
                        "pid {pid}: killed={killed} artifact_removed={removed}"
                    )))
                }
            }
            _ => Err(AotError::StopFailed(format!(
                "invalid child pid {:?}",
                state.child_pid
            ))),
        };

        *state = AotState::default();
        result
    }

    // ------------------------------------------------------------------
    // Admission control
    // ------------------------------------------------------------------

    pub fn pause(&self) {
        if self.allow_aot_compiler.swap(false, Ordering::Relaxed) {
            info!("aot compiler paused");
        }
    }

    pub fn allow(&self) {
        if !self.allow_aot_compiler.swap(true, Ordering::Relaxed) {
            info!("aot compiler allowed");
        }
    }

    pub fn handle_thermal_level_changed(&self, level: i32) {
        self.thermal_level.store(level, Ordering::Relaxed);
        if level >= self.admission.thermal_pause_level {
            info!("thermal level {level}, pausing aot compiler");
            self.pause();
        } else {
            self.allow();
        }
    }

    /// Temporary admission ban after the charger is unplugged.
    ///
    /// Must be called from within a tokio runtime.
    pub fn handle_power_disconnected(self: &Arc<Self>) {
        info!("power disconnected");
        self.pause();
        self.spawn_cooldown(self.admission.power_disconnected_cooldown());
    }

    /// Temporary admission ban after the screen turns on.
    ///
    /// Must be called from within a tokio runtime.
    pub fn handle_screen_on(self: &Arc<Self>) {
        info!("screen on");
        self.pause();
        self.spawn_cooldown(self.admission.screen_on_cooldown());
    }

    /// Fire-and-forget: stop the running job, wait out the cooldown, then
    /// re-open admission. Not joined on shutdown.
    fn spawn_cooldown(self: &Arc<Self>, cooldown: Duration) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = core.stop() {
                debug!("cooldown stop: {e}");
            }
            tokio::time::sleep(cooldown).await;
            core.allow();
        });
    }
}

impl std::fmt::Debug for CompilerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerCore")
            .field("state", &self.state())
            .field("allowed", &self.is_allowed())
            .field("thermal_level", &self.thermal_level())
            .finish()
    }
}
