//! End-to-end: client and server over a real Unix socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use aot_compiler::client::{
    AotCompilerClient, AotCompilerProxy, ClientError, SocketProxy, SocketRegistry,
};
use aot_compiler::compiler::CompilerCore;
use aot_compiler::config::AppConfig;
use aot_compiler::events::LocalEventBus;
use aot_compiler::protocol::{
    CommandCode, CompileArgs, MAX_IPC_SEQUENCE_LEN, RequestFrame, ResponseFrame, SystemEvent,
};
use aot_compiler::server::AotCompilerServer;
use aot_compiler::service::AotCompilerService;
use aot_compiler::version::AOT_VERSION;
use aot_compiler::{ErrorCode, RequestArgs};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Harness {
    _dir: TempDir,
    socket: PathBuf,
    shutdown: CancellationToken,
    server: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("run").join("aot_compiler.sock");
        let (shutdown, server) = spawn_server(&socket, Duration::from_secs(60));
        wait_for_socket(&socket).await;
        Self {
            _dir: dir,
            socket,
            shutdown,
            server,
        }
    }

    fn client(&self) -> AotCompilerClient {
        client_for(&self.socket, Duration::from_secs(2))
    }
}

fn spawn_server(
    socket: &Path,
    unload_delay: Duration,
) -> (CancellationToken, JoinHandle<anyhow::Result<()>>) {
    let shutdown = CancellationToken::new();
    let events = Arc::new(LocalEventBus::new());
    let core = Arc::new(CompilerCore::new(&AppConfig::default()));
    let service = Arc::new(AotCompilerService::new(
        core,
        events.clone(),
        unload_delay,
        shutdown.clone(),
    ));
    service.on_start();

    let server = AotCompilerServer::new(service, events);
    let socket = socket.to_path_buf();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { server.run(&socket, token).await });
    (shutdown, handle)
}

fn client_for(socket: &Path, timeout: Duration) -> AotCompilerClient {
    let registry = SocketRegistry::new(socket, Vec::new(), timeout);
    AotCompilerClient::new(Arc::new(registry), timeout)
}

async fn wait_for_socket(socket: &Path) {
    for _ in 0..200 {
        if UnixStream::connect(socket).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never listened on {socket:?}");
}

#[tokio::test]
async fn test_version_commands_round_trip() {
    let harness = Harness::start().await;
    let client = harness.client();

    assert_eq!(client.get_aot_version().await.unwrap(), AOT_VERSION);
    assert!(!client.need_re_compile(AOT_VERSION).await.unwrap());
    assert!(client.need_re_compile("4.0.0.4").await.unwrap());

    let err = client.need_re_compile("4.0").await.unwrap_err();
    assert!(matches!(err, ClientError::Service(ErrorCode::ParamFailed)));
}

#[tokio::test]
async fn test_compile_and_stop_statuses_round_trip() {
    let harness = Harness::start().await;
    let client = harness.client();

    let err = client.aot_compiler(&RequestArgs::new()).await.unwrap_err();
    assert_eq!(err.status(), Some(ErrorCode::ParamFailed));

    let err = client.stop_aot_compiler().await.unwrap_err();
    assert_eq!(err.status(), Some(ErrorCode::StopFailed));
}

#[tokio::test]
async fn test_thermal_event_pauses_compiles() {
    let harness = Harness::start().await;
    let client = harness.client();

    client
        .send_event(SystemEvent::ThermalLevelChanged(3))
        .await
        .unwrap();
    let err = client.aot_compiler(&RequestArgs::new()).await.unwrap_err();
    assert_eq!(err.status(), Some(ErrorCode::CallCancelled));

    client
        .send_event(SystemEvent::ThermalLevelChanged(0))
        .await
        .unwrap();
    let err = client.aot_compiler(&RequestArgs::new()).await.unwrap_err();
    assert_eq!(err.status(), Some(ErrorCode::ParamFailed));
}

#[tokio::test]
async fn test_oversize_map_rejected_by_server() {
    let harness = Harness::start().await;
    let proxy = SocketProxy::new(&harness.socket);

    let args: RequestArgs = (0..=MAX_IPC_SEQUENCE_LEN)
        .map(|i| (format!("key{i}"), "v".to_string()))
        .collect();
    let frame = RequestFrame::with_args(CommandCode::AotCompiler, &CompileArgs { args }).unwrap();
    let resp = proxy.call(&frame).await.unwrap();
    assert!(matches!(resp, ResponseFrame::Rejected { .. }));

    // the connection-level rejection does not affect later calls
    let resp = proxy
        .call(&RequestFrame::bare(CommandCode::GetAotVersion))
        .await
        .unwrap();
    assert!(matches!(resp, ResponseFrame::Reply { status: ErrorCode::Ok, .. }));
}

#[tokio::test]
async fn test_garbage_and_unknown_codes_rejected() {
    let harness = Harness::start().await;
    let stream = UnixStream::connect(&harness.socket).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    for request in ["not json\n", "{\"code\": 7}\n"] {
        writer.write_all(request.as_bytes()).await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let resp: ResponseFrame = serde_json::from_str(&line).unwrap();
        assert!(matches!(resp, ResponseFrame::Rejected { .. }), "{request:?}");
    }
}

#[tokio::test]
async fn test_client_recovers_after_service_unload() {
    let harness = Harness::start().await;
    let client = harness.client();
    assert_eq!(client.get_aot_version().await.unwrap(), AOT_VERSION);

    harness.shutdown.cancel();
    harness.server.await.unwrap().unwrap();
    assert!(!harness.socket.exists());

    let socket = harness.socket.clone();
    let restart = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        spawn_server(&socket, Duration::from_secs(60))
    });

    // the cached proxy is stale; this call goes through activation
    assert_eq!(client.get_aot_version().await.unwrap(), AOT_VERSION);
    assert_eq!(client.get_aot_version().await.unwrap(), AOT_VERSION);

    let (shutdown, server) = restart.await.unwrap();
    shutdown.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_client_without_service_fails_to_connect() {
    let harness = Harness::start().await;
    let client = client_for(&harness.socket, Duration::from_millis(200));
    client.get_aot_version().await.unwrap();

    harness.shutdown.cancel();
    harness.server.await.unwrap().unwrap();

    let err = client.get_aot_version().await.unwrap_err();
    assert!(matches!(err, ClientError::Connect));
}

#[tokio::test]
async fn test_client_waits_for_activation() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("aot_compiler.sock");
    let client = client_for(&socket, Duration::from_secs(5));

    let late_socket = socket.clone();
    let starter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        spawn_server(&late_socket, Duration::from_secs(60))
    });

    assert_eq!(client.get_aot_version().await.unwrap(), AOT_VERSION);
    let (shutdown, server) = starter.await.unwrap();
    shutdown.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_activation_timeout_is_connect_failed() {
    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&dir.path().join("never.sock"), Duration::from_millis(100));

    let err = client.get_aot_version().await.unwrap_err();
    assert_eq!(err.status(), Some(ErrorCode::ConnectFailed));
}

#[tokio::test]
async fn test_idle_server_unloads_itself() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("aot_compiler.sock");
    let (shutdown, server) = spawn_server(&socket, Duration::from_millis(50));

    tokio::time::timeout(Duration::from_secs(5), shutdown.cancelled())
        .await
        .expect("server should unload when idle");
    server.await.unwrap().unwrap();
    assert!(!socket.exists());
}
