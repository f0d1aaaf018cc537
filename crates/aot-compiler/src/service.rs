//! The IPC-facing compiler service.
//!
//! Wraps the [`CompilerCore`] with what the platform expects of a system
//! service: calls are serialized, an idle timer unloads the service when
//! nobody has called it for a while, and device events are wired into the
//! core's admission hooks for as long as the service runs.

use log::{debug, info, warn};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::compiler::CompilerCore;
use crate::error::{AotError, AotResult};
use crate::events::{EventBus, EventHandler, EventKind, SystemEvent};
use crate::protocol::{CompileOutcome, RequestArgs};
use crate::version;

/// Which event subscriptions are currently active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Subscriptions {
    pub power_disconnected: bool,
    pub screen_on: bool,
    pub thermal_level_changed: bool,
}

impl Subscriptions {
    fn flag_mut(&mut self, kind: EventKind) -> &mut bool {
        match kind {
            EventKind::PowerDisconnected => &mut self.power_disconnected,
            EventKind::ScreenOn => &mut self.screen_on,
            EventKind::ThermalLevelChanged => &mut self.thermal_level_changed,
        }
    }
}

/// Unloads the service after a period without calls.
///
/// Unloading cancels the shutdown token the daemon's accept loop watches.
/// An expiry that finds a compile still running is postponed by one delay.
struct UnloadTimer {
    delay: Duration,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UnloadTimer {
    fn new(delay: Duration, shutdown: CancellationToken) -> Self {
        Self {
            delay,
            shutdown,
            task: Mutex::new(None),
        }
    }

    fn cancel(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }

    fn schedule(&self, core: Arc<CompilerCore>) {
        let delay = self.delay;
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                if core.is_running() {
                    debug!("compile in flight, postponing unload");
                    continue;
                }
                info!("idle for {delay:?}, unloading aot compiler service");
                shutdown.cancel();
                break;
            }
        });
        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

pub struct AotCompilerService {
    core: Arc<CompilerCore>,
    /// Serializes compile and query calls into the core.
    call_lock: tokio::sync::Mutex<()>,
    unload: UnloadTimer,
    bus: Arc<dyn EventBus>,
    subscriptions: Mutex<Subscriptions>,
}

impl AotCompilerService {
    pub fn new(
        core: Arc<CompilerCore>,
        bus: Arc<dyn EventBus>,
        unload_delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            core,
            call_lock: tokio::sync::Mutex::new(()),
            unload: UnloadTimer::new(unload_delay, shutdown),
            bus,
            subscriptions: Mutex::new(Subscriptions::default()),
        }
    }

    pub fn core(&self) -> &Arc<CompilerCore> {
        &self.core
    }

    pub fn subscriptions(&self) -> Subscriptions {
        *self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to device events and arm the unload timer.
    pub fn on_start(&self) {
        info!("aot compiler service starting");
        for kind in [
            EventKind::PowerDisconnected,
            EventKind::ScreenOn,
            EventKind::ThermalLevelChanged,
        ] {
            self.subscribe(kind);
        }
        self.unload.schedule(Arc::clone(&self.core));
    }

    /// Drop event subscriptions and disarm the unload timer.
    pub fn on_stop(&self) {
        info!("aot compiler service stopping");
        self.unload.cancel();
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        for kind in [
            EventKind::PowerDisconnected,
            EventKind::ScreenOn,
            EventKind::ThermalLevelChanged,
        ] {
            let flag = subscriptions.flag_mut(kind);
            if *flag
                && let Err(e) = self.bus.unsubscribe(kind)
            {
                warn!("failed to unsubscribe {kind:?}: {e}");
            }
            *flag = false;
        }
    }

    fn subscribe(&self, kind: EventKind) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        let flag = subscriptions.flag_mut(kind);
        if *flag {
            debug!("already subscribed to {kind:?}");
            return;
        }
        *flag = match self.bus.subscribe(kind, self.handler_for(kind)) {
            Ok(()) => {
                debug!("subscribed to {kind:?}");
                true
            }
            Err(e) => {
                warn!("failed to subscribe to {kind:?}: {e}");
                false
            }
        };
    }

    fn handler_for(&self, kind: EventKind) -> EventHandler {
        let core = Arc::clone(&self.core);
        match kind {
            EventKind::PowerDisconnected => {
                Arc::new(move |_: &SystemEvent| core.handle_power_disconnected())
            }
            EventKind::ScreenOn => Arc::new(move |_: &SystemEvent| core.handle_screen_on()),
            EventKind::ThermalLevelChanged => Arc::new(move |event: &SystemEvent| {
                if let SystemEvent::ThermalLevelChanged(level) = event {
                    core.handle_thermal_level_changed(*level);
                }
            }),
        }
    }

    /// Compile one request on a blocking worker thread.
    pub async fn aot_compiler(&self, args: RequestArgs) -> AotResult<CompileOutcome> {
        self.unload.cancel();
        let result = {
            let _guard = self.call_lock.lock().await;
            let core = Arc::clone(&self.core);
            tokio::task::spawn_blocking(move || core.compile(&args))
                .await
                .unwrap_or_else(|e| Err(AotError::CallFailed(format!("compile task failed: {e}"))))
        };
        self.unload.schedule(Arc::clone(&self.core));
        result
    }

    /// Kill the in-flight compile.
    ///
    /// Does not wait for the call lock, otherwise it could never interrupt
    /// a running compile.
    pub async fn stop_aot_compiler(&self) -> AotResult<()> {
        self.unload.cancel();
        let result = self.core.stop();
        self.unload.schedule(Arc::clone(&self.core));
        result
    }

    pub async fn get_aot_version(&self) -> AotResult<String> {
        self.unload.cancel();
        let version = {
            let _guard = self.call_lock.lock().await;
            version::AOT_VERSION.to_string()
        };
        self.unload.schedule(Arc::clone(&self.core));
        Ok(version)
    }

    pub async fn need_re_compile(&self, old_version: &str) -> AotResult<bool> {
        self.unload.cancel();
        let result = {
            let _guard = self.call_lock.lock().await;
            version::need_re_compile(old_version)
        };
        self.unload.schedule(Arc::clone(&self.core));
        result
    }
}

impl Drop for AotCompilerService {
    fn drop(&mut self) {
        self.unload.cancel();
    }
}
