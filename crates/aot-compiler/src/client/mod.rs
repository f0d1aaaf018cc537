//! Client for the AOT compiler service.
//!
//! Resolving the service goes through three steps, stopping at the first
//! that yields a proxy:
//!
//! 1. the cached proxy from an earlier call,
//! 2. a registry lookup for an already running service,
//! 3. an activation request, then a bounded wait for the activation callback.
//!
//! A cached proxy is dropped when its service dies. Death notifications for
//! a proxy that has since been replaced are ignored. A call whose request
//! never reached the socket (the service unloaded itself since the last
//! call) resolves the service again once and is resent.

mod proxy;
mod registry;

pub use proxy::{AotCompilerProxy, DeathRecipient, SocketProxy, Unreachable};
pub use registry::{LoadCallback, ServiceRegistry, SocketRegistry};

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::ClientConfig;
use crate::protocol::{
    CommandCode, CompileArgs, CompileOutcome, CompileReply, ErrorCode, MAX_IPC_SEQUENCE_LEN,
    NeedRecompileArgs, NeedRecompileReply, RequestArgs, RequestFrame, ResponseFrame,
    SystemEvent, SystemEventArgs, VersionReply,
};

#[derive(Debug, Error)]
pub enum ClientError {
    /// The service answered with a failure status.
    #[error("aot compiler returned {0}")]
    Service(ErrorCode),

    /// No proxy could be obtained, or the transport failed mid-call.
    #[error("aot compiler service unreachable")]
    Connect,

    /// The request or reply violated the IPC contract.
    #[error("ipc failure: {0}")]
    Ipc(String),
}

impl ClientError {
    /// Application status carried by this error. IPC failures have none.
    pub fn status(&self) -> Option<ErrorCode> {
        match self {
            Self::Service(code) => Some(*code),
            Self::Connect => Some(ErrorCode::ConnectFailed),
            Self::Ipc(_) => None,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

struct ClientInner {
    registry: Arc<dyn ServiceRegistry>,
    activation_timeout: Duration,
    proxy: Mutex<Option<Arc<dyn AotCompilerProxy>>>,
}

impl ClientInner {
    fn cached(&self) -> Option<Arc<dyn AotCompilerProxy>> {
        self.proxy.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_cached(&self, proxy: Option<Arc<dyn AotCompilerProxy>>) {
        *self.proxy.lock().unwrap_or_else(PoisonError::into_inner) = proxy;
    }

    /// Drop `dead` from the cache unless it has been replaced already.
    fn forget(&self, dead: &Arc<dyn AotCompilerProxy>) -> bool {
        let mut cached = self.proxy.lock().unwrap_or_else(PoisonError::into_inner);
        match cached.as_ref() {
            Some(current) if std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(dead)) => {
                *cached = None;
                true
            }
            _ => false,
        }
    }

    /// Cache `proxy` and watch it for death.
    fn adopt(self: &Arc<Self>, proxy: &Arc<dyn AotCompilerProxy>) {
        proxy.add_death_recipient(Arc::new(ClientDeathRecipient {
            inner: Arc::downgrade(self),
        }));
        self.set_cached(Some(Arc::clone(proxy)));
    }
}

/// Clears the client's cache when the cached proxy dies.
struct ClientDeathRecipient {
    inner: Weak<ClientInner>,
}

impl DeathRecipient for ClientDeathRecipient {
    fn on_remote_died(&self, dead: &Arc<dyn AotCompilerProxy>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.forget(dead) {
            info!("aot compiler service died, dropping cached proxy");
        } else {
            debug!("ignoring death of a stale aot compiler proxy");
        }
    }
}

/// Delivers the activation outcome to the waiting resolver.
struct ClientLoadCallback {
    inner: Weak<ClientInner>,
    waiter: Mutex<Option<oneshot::Sender<Option<Arc<dyn AotCompilerProxy>>>>>,
}

impl ClientLoadCallback {
    fn finish(&self, proxy: Option<Arc<dyn AotCompilerProxy>>) {
        let waiter = self.waiter.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(waiter) = waiter {
            // The resolver may have timed out already
            let _ = waiter.send(proxy);
        }
    }
}

impl LoadCallback for ClientLoadCallback {
    fn on_load_success(&self, proxy: Arc<dyn AotCompilerProxy>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.adopt(&proxy);
        }
        self.finish(Some(proxy));
    }

    fn on_load_fail(&self) {
        warn!("aot compiler service failed to load");
        if let Some(inner) = self.inner.upgrade() {
            inner.set_cached(None);
        }
        self.finish(None);
    }
}

/// Process-wide handle to the service. Cheap to clone.
#[derive(Clone)]
pub struct AotCompilerClient {
    inner: Arc<ClientInner>,
}

impl AotCompilerClient {
    pub fn new(registry: Arc<dyn ServiceRegistry>, activation_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                registry,
                activation_timeout,
                proxy: Mutex::new(None),
            }),
        }
    }

    /// Client reaching the service on `socket_path`, activated as configured.
    pub fn from_config(config: &ClientConfig, socket_path: impl Into<PathBuf>) -> Self {
        let registry = SocketRegistry::new(
            socket_path,
            config.activation_command.clone(),
            config.activation_timeout(),
        );
        Self::new(Arc::new(registry), config.activation_timeout())
    }

    /// Resolve a proxy to the service, activating it if needed.
    pub async fn proxy(&self) -> Option<Arc<dyn AotCompilerProxy>> {
        if let Some(proxy) = self.inner.cached() {
            return Some(proxy);
        }

        if let Some(proxy) = self.inner.registry.check().await {
            debug!("aot compiler service already running");
            self.inner.adopt(&proxy);
            return Some(proxy);
        }

        let (tx, rx) = oneshot::channel();
        let callback = Arc::new(ClientLoadCallback {
            inner: Arc::downgrade(&self.inner),
            waiter: Mutex::new(Some(tx)),
        });
        if let Err(e) = self.inner.registry.load(callback).await {
            warn!("failed to request aot compiler activation: {e:#}");
            return None;
        }

        match tokio::time::timeout(self.inner.activation_timeout, rx).await {
            Ok(Ok(proxy)) => proxy,
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(
                    "aot compiler service not loaded within {:?}",
                    self.inner.activation_timeout
                );
                None
            }
        }
    }

    async fn call(&self, frame: RequestFrame) -> ClientResult<(ErrorCode, Value)> {
        let proxy = self.proxy().await.ok_or(ClientError::Connect)?;
        match proxy.call(&frame).await {
            Err(e) if e.is::<Unreachable>() => {
                info!("{e:#}, resolving the service again");
                self.inner.forget(&proxy);
                let proxy = self.proxy().await.ok_or(ClientError::Connect)?;
                into_reply(proxy.call(&frame).await)
            }
            result => into_reply(result),
        }
    }

    /// Compile one application. `NoArtifact` is a success.
    pub async fn aot_compiler(&self, args: &RequestArgs) -> ClientResult<CompileOutcome> {
        if args.len() > MAX_IPC_SEQUENCE_LEN {
            return Err(ClientError::Ipc(format!(
                "request map exceeds {MAX_IPC_SEQUENCE_LEN} entries"
            )));
        }
        let frame = RequestFrame::with_args(
            CommandCode::AotCompiler,
            &CompileArgs { args: args.clone() },
        )
        .map_err(|e| ClientError::Ipc(e.to_string()))?;

        let (status, data) = self.call(frame).await?;
        match status {
            ErrorCode::Ok => {
                let CompileReply { signature } = decode(data)?;
                if signature.len() > MAX_IPC_SEQUENCE_LEN {
                    return Err(ClientError::Ipc(format!(
                        "signature exceeds {MAX_IPC_SEQUENCE_LEN} elements"
                    )));
                }
                Ok(CompileOutcome::Signed { signature })
            }
            ErrorCode::OkNoAotFile => Ok(CompileOutcome::NoArtifact),
            other => Err(ClientError::Service(other)),
        }
    }

    pub async fn stop_aot_compiler(&self) -> ClientResult<()> {
        let (status, _) = self.call(RequestFrame::bare(CommandCode::StopAotCompiler)).await?;
        expect_ok(status)
    }

    pub async fn get_aot_version(&self) -> ClientResult<String> {
        let (status, data) = self.call(RequestFrame::bare(CommandCode::GetAotVersion)).await?;
        expect_ok(status)?;
        let VersionReply { version } = decode(data)?;
        Ok(version)
    }

    pub async fn need_re_compile(&self, old_version: &str) -> ClientResult<bool> {
        let frame = RequestFrame::with_args(
            CommandCode::NeedReCompile,
            &NeedRecompileArgs {
                old_version: old_version.to_string(),
            },
        )
        .map_err(|e| ClientError::Ipc(e.to_string()))?;
        let (status, data) = self.call(frame).await?;
        expect_ok(status)?;
        let NeedRecompileReply { need } = decode(data)?;
        Ok(need)
    }

    /// Forward a device event to the service's event bus.
    pub async fn send_event(&self, event: SystemEvent) -> ClientResult<()> {
        let frame = RequestFrame::with_args(CommandCode::SystemEvent, &SystemEventArgs { event })
            .map_err(|e| ClientError::Ipc(e.to_string()))?;
        let (status, _) = self.call(frame).await?;
        expect_ok(status)
    }
}

fn into_reply(result: anyhow::Result<ResponseFrame>) -> ClientResult<(ErrorCode, Value)> {
    match result {
        Ok(ResponseFrame::Reply { status, data }) => Ok((status, data)),
        Ok(ResponseFrame::Rejected { reason }) => Err(ClientError::Ipc(reason)),
        Err(e) => {
            warn!("aot compiler transport failure: {e:#}");
            Err(ClientError::Connect)
        }
    }
}

fn expect_ok(status: ErrorCode) -> ClientResult<()> {
    if status == ErrorCode::Ok {
        Ok(())
    } else {
        Err(ClientError::Service(status))
    }
}

fn decode<T: DeserializeOwned>(data: Value) -> ClientResult<T> {
    serde_json::from_value(data).map_err(|e| ClientError::Ipc(format!("malformed reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Answers every call with a fixed version. Fails mid-call once `dead`
    /// is set, and cannot be reached at all once `gone` is set.
    #[derive(Default)]
    struct FakeProxy {
        dead: AtomicBool,
        gone: AtomicBool,
        calls: AtomicUsize,
        recipients: Mutex<Vec<Arc<dyn DeathRecipient>>>,
    }

    impl FakeProxy {
        fn kill(self: &Arc<Self>) {
            self.dead.store(true, Ordering::SeqCst);
            let proxy: Arc<dyn AotCompilerProxy> = self.clone();
            for recipient in self.recipients.lock().unwrap().drain(..) {
                recipient.on_remote_died(&proxy);
            }
        }
    }

    #[async_trait]
    impl AotCompilerProxy for FakeProxy {
        async fn call(&self, frame: &RequestFrame) -> Result<ResponseFrame> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.gone.load(Ordering::SeqCst) {
                return Err(Unreachable {
                    path: PathBuf::from("/run/aot_compiler.sock"),
                    source: std::io::ErrorKind::NotFound.into(),
                }
                .into());
            }
            if self.dead.load(Ordering::SeqCst) {
                anyhow::bail!("broken pipe");
            }
            match CommandCode::try_from(frame.code)? {
                CommandCode::GetAotVersion => Ok(ResponseFrame::with_data(
                    ErrorCode::Ok,
                    &VersionReply {
                        version: "4.0.0.5".to_string(),
                    },
                )?),
                CommandCode::StopAotCompiler => Ok(ResponseFrame::status(ErrorCode::StopFailed)),
                _ => Ok(ResponseFrame::rejected("unsupported")),
            }
        }

        fn add_death_recipient(&self, recipient: Arc<dyn DeathRecipient>) {
            self.recipients.lock().unwrap().push(recipient);
        }
    }

    /// Registry whose activation answers with the queued proxies in order,
    /// or never answers once the queue is empty.
    #[derive(Default)]
    struct FakeRegistry {
        running: Mutex<Option<Arc<FakeProxy>>>,
        activations: Mutex<Vec<Arc<FakeProxy>>>,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl ServiceRegistry for FakeRegistry {
        async fn check(&self) -> Option<Arc<dyn AotCompilerProxy>> {
            self.running
                .lock()
                .unwrap()
                .clone()
                .map(|p| p as Arc<dyn AotCompilerProxy>)
        }

        async fn load(&self, callback: Arc<dyn LoadCallback>) -> Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut activations = self.activations.lock().unwrap();
                (!activations.is_empty()).then(|| activations.remove(0))
            };
            if let Some(proxy) = next {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    callback.on_load_success(proxy);
                });
            }
            Ok(())
        }
    }

    fn client(registry: &Arc<FakeRegistry>, timeout: Duration) -> AotCompilerClient {
        AotCompilerClient::new(registry.clone(), timeout)
    }

    #[tokio::test]
    async fn test_activation_timeout_is_connect_failed() {
        let registry = Arc::new(FakeRegistry::default());
        let client = client(&registry, Duration::from_millis(50));

        let err = client.get_aot_version().await.unwrap_err();
        assert!(matches!(err, ClientError::Connect));
        assert_eq!(err.status(), Some(ErrorCode::ConnectFailed));
        assert_eq!(registry.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_activated_proxy_is_cached() {
        let registry = Arc::new(FakeRegistry::default());
        let proxy = Arc::new(FakeProxy::default());
        registry.activations.lock().unwrap().push(proxy.clone());
        let client = client(&registry, Duration::from_secs(5));

        assert_eq!(client.get_aot_version().await.unwrap(), "4.0.0.5");
        assert_eq!(client.get_aot_version().await.unwrap(), "4.0.0.5");
        assert_eq!(registry.loads.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_running_service_needs_no_activation() {
        let registry = Arc::new(FakeRegistry::default());
        *registry.running.lock().unwrap() = Some(Arc::new(FakeProxy::default()));
        let client = client(&registry, Duration::from_secs(5));

        assert!(client.proxy().await.is_some());
        assert!(client.inner.cached().is_some());
        assert_eq!(registry.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_death_clears_cache_and_reactivates() {
        let registry = Arc::new(FakeRegistry::default());
        let first = Arc::new(FakeProxy::default());
        let second = Arc::new(FakeProxy::default());
        registry
            .activations
            .lock()
            .unwrap()
            .extend([first.clone(), second.clone()]);
        let client = client(&registry, Duration::from_secs(5));

        client.get_aot_version().await.unwrap();
        first.kill();
        assert!(client.inner.cached().is_none());

        client.get_aot_version().await.unwrap();
        assert_eq!(registry.loads.load(Ordering::SeqCst), 2);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_death_keeps_newer_proxy() {
        let registry = Arc::new(FakeRegistry::default());
        let current = Arc::new(FakeProxy::default());
        registry.activations.lock().unwrap().push(current.clone());
        let client = client(&registry, Duration::from_secs(5));
        client.get_aot_version().await.unwrap();

        let stale: Arc<dyn AotCompilerProxy> = Arc::new(FakeProxy::default());
        let recipient = ClientDeathRecipient {
            inner: Arc::downgrade(&client.inner),
        };
        recipient.on_remote_died(&stale);

        let cached = client.inner.cached().expect("proxy still cached");
        let current: Arc<dyn AotCompilerProxy> = current;
        assert!(std::ptr::addr_eq(Arc::as_ptr(&cached), Arc::as_ptr(&current)));
    }

    #[tokio::test]
    async fn test_transport_failure_is_connect_failed() {
        let registry = Arc::new(FakeRegistry::default());
        let proxy = Arc::new(FakeProxy::default());
        proxy.dead.store(true, Ordering::SeqCst);
        *registry.running.lock().unwrap() = Some(proxy.clone());
        let client = client(&registry, Duration::from_secs(5));

        let err = client.get_aot_version().await.unwrap_err();
        assert_eq!(err.status(), Some(ErrorCode::ConnectFailed));
        // the request may have been delivered, so it is not resent
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unloaded_service_is_reactivated_by_the_next_call() {
        let registry = Arc::new(FakeRegistry::default());
        let first = Arc::new(FakeProxy::default());
        let second = Arc::new(FakeProxy::default());
        registry
            .activations
            .lock()
            .unwrap()
            .extend([first.clone(), second.clone()]);
        let client = client(&registry, Duration::from_secs(5));
        client.get_aot_version().await.unwrap();

        // no death notification: the first call after the unload finds out
        first.gone.store(true, Ordering::SeqCst);
        assert_eq!(client.get_aot_version().await.unwrap(), "4.0.0.5");
        assert_eq!(registry.loads.load(Ordering::SeqCst), 2);
        assert_eq!(first.calls.load(Ordering::SeqCst), 2);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);

        let cached = client.inner.cached().expect("new proxy cached");
        let second: Arc<dyn AotCompilerProxy> = second;
        assert!(std::ptr::addr_eq(Arc::as_ptr(&cached), Arc::as_ptr(&second)));
    }

    #[tokio::test]
    async fn test_unreachable_twice_is_connect_failed() {
        let registry = Arc::new(FakeRegistry::default());
        let proxy = Arc::new(FakeProxy::default());
        proxy.gone.store(true, Ordering::SeqCst);
        *registry.running.lock().unwrap() = Some(proxy.clone());
        let client = client(&registry, Duration::from_secs(5));

        let err = client.get_aot_version().await.unwrap_err();
        assert!(matches!(err, ClientError::Connect));
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_service_status_and_ipc_errors() {
        let registry = Arc::new(FakeRegistry::default());
        *registry.running.lock().unwrap() = Some(Arc::new(FakeProxy::default()));
        let client = client(&registry, Duration::from_secs(5));

        let err = client.stop_aot_compiler().await.unwrap_err();
        assert_eq!(err.status(), Some(ErrorCode::StopFailed));

        let err = client.need_re_compile("4.0.0.5").await.unwrap_err();
        assert!(matches!(err, ClientError::Ipc(_)));
        assert_eq!(err.status(), None);
    }

    #[tokio::test]
    async fn test_oversize_request_is_ipc_error() {
        let registry = Arc::new(FakeRegistry::default());
        let client = client(&registry, Duration::from_millis(10));
        let args: RequestArgs = (0..=MAX_IPC_SEQUENCE_LEN)
            .map(|i| (format!("k{i}"), String::new()))
            .collect();

        let err = client.aot_compiler(&args).await.unwrap_err();
        assert!(matches!(err, ClientError::Ipc(_)));
        assert_eq!(registry.loads.load(Ordering::SeqCst), 0);
    }
}
