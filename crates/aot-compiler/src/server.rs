//! Unix socket front of the service.
//!
//! One task per connection; each line is a [`RequestFrame`] and gets exactly
//! one [`ResponseFrame`] line back. Frames that cannot be decoded, unknown
//! command codes and oversize maps or sequences are rejected at this layer
//! and never reach the service. A line longer than the frame limit is
//! rejected and closes the connection.

use anyhow::{Context, Result};
use futures::StreamExt;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::events::LocalEventBus;
use crate::protocol::{
    CommandCode, CompileArgs, CompileOutcome, CompileReply, ErrorCode, MAX_FRAME_LEN,
    MAX_IPC_SEQUENCE_LEN, NeedRecompileArgs, NeedRecompileReply, RequestFrame, ResponseFrame,
    SystemEventArgs, VersionReply,
};
use crate::service::AotCompilerService;

#[derive(Clone)]
pub struct AotCompilerServer {
    service: Arc<AotCompilerService>,
    events: Arc<LocalEventBus>,
    max_frame_len: usize,
}

impl AotCompilerServer {
    pub fn new(service: Arc<AotCompilerService>, events: Arc<LocalEventBus>) -> Self {
        Self {
            service,
            events,
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Bind `socket_path` and serve until `shutdown` fires.
    pub async fn run(&self, socket_path: &Path, shutdown: CancellationToken) -> Result<()> {
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating socket directory {parent:?}"))?;
        }

        // Remove a stale socket left by a previous instance
        let _ = tokio::fs::remove_file(socket_path).await;

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("binding to {socket_path:?}"))?;
        info!("aot compiler service listening on {socket_path:?}");

        self.serve(listener, shutdown).await;

        let _ = tokio::fs::remove_file(socket_path).await;
        info!("aot compiler service stopped");
        Ok(())
    }

    /// Accept connections on an already bound listener until `shutdown` fires.
    ///
    /// A compile still running at shutdown is stopped.
    pub async fn serve(&self, listener: UnixListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            debug!("new client connection");
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream).await;
                            });
                        }
                        Err(e) => {
                            error!("accept error: {e}");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        if self.service.core().is_running() {
            info!("stopping in-flight compile on shutdown");
            if let Err(e) = self.service.stop_aot_compiler().await {
                warn!("{e}");
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let (reader, mut writer) = stream.into_split();
        let codec = LinesCodec::new_with_max_length(self.max_frame_len);
        let mut lines = FramedRead::new(reader, codec);

        while let Some(line) = lines.next().await {
            let (resp, close) = match line {
                Ok(line) => {
                    let resp = match serde_json::from_str::<RequestFrame>(&line) {
                        Ok(frame) => self.dispatch(frame).await,
                        Err(e) => ResponseFrame::rejected(format!("invalid frame: {e}")),
                    };
                    (resp, false)
                }
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!("frame exceeds {} bytes, closing connection", self.max_frame_len);
                    let reason = format!("frame exceeds {} bytes", self.max_frame_len);
                    (ResponseFrame::rejected(reason), true)
                }
                Err(LinesCodecError::Io(e)) => {
                    error!("error reading from client: {e}");
                    break;
                }
            };
            if let Err(e) = write_frame(&mut writer, &resp).await {
                error!("failed to write response: {e:#}");
                break;
            }
            if close {
                break;
            }
        }
        debug!("client disconnected");
    }

    /// Route one decoded frame to the service.
    pub async fn dispatch(&self, frame: RequestFrame) -> ResponseFrame {
        let code = match CommandCode::try_from(frame.code) {
            Ok(code) => code,
            Err(e) => {
                warn!("{e}");
                return ResponseFrame::rejected(e.to_string());
            }
        };
        debug!("received {code:?}");

        match code {
            CommandCode::AotCompiler => {
                let CompileArgs { args } = match decode(frame.args) {
                    Ok(args) => args,
                    Err(resp) => return resp,
                };
                if args.len() > MAX_IPC_SEQUENCE_LEN {
                    return ResponseFrame::rejected(format!(
                        "request map exceeds {MAX_IPC_SEQUENCE_LEN} entries"
                    ));
                }
                match self.service.aot_compiler(args).await {
                    Ok(outcome) => {
                        let status = outcome.status();
                        let signature = match outcome {
                            CompileOutcome::Signed { signature } => signature,
                            CompileOutcome::NoArtifact => Vec::new(),
                        };
                        if signature.len() > MAX_IPC_SEQUENCE_LEN {
                            return ResponseFrame::rejected(format!(
                                "signature exceeds {MAX_IPC_SEQUENCE_LEN} elements"
                            ));
                        }
                        reply(status, &CompileReply { signature })
                    }
                    Err(e) => {
                        warn!("{e}");
                        ResponseFrame::status(e.code())
                    }
                }
            }
            CommandCode::StopAotCompiler => match self.service.stop_aot_compiler().await {
                Ok(()) => ResponseFrame::status(ErrorCode::Ok),
                Err(e) => {
                    debug!("{e}");
                    ResponseFrame::status(e.code())
                }
            },
            CommandCode::GetAotVersion => match self.service.get_aot_version().await {
                Ok(version) => reply(ErrorCode::Ok, &VersionReply { version }),
                Err(e) => ResponseFrame::status(e.code()),
            },
            CommandCode::NeedReCompile => {
                let NeedRecompileArgs { old_version } = match decode(frame.args) {
                    Ok(args) => args,
                    Err(resp) => return resp,
                };
                match self.service.need_re_compile(&old_version).await {
                    Ok(need) => reply(ErrorCode::Ok, &NeedRecompileReply { need }),
                    Err(e) => {
                        warn!("{e}");
                        ResponseFrame::status(e.code())
                    }
                }
            }
            CommandCode::SystemEvent => {
                let SystemEventArgs { event } = match decode(frame.args) {
                    Ok(args) => args,
                    Err(resp) => return resp,
                };
                self.events.publish(event);
                ResponseFrame::status(ErrorCode::Ok)
            }
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, resp: &ResponseFrame) -> Result<()> {
    let mut json = serde_json::to_string(resp).context("encoding response")?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    Ok(())
}

fn decode<T: DeserializeOwned>(args: Value) -> Result<T, ResponseFrame> {
    serde_json::from_value(args).map_err(|e| ResponseFrame::rejected(format!("invalid args: {e}")))
}

fn reply<T: Serialize>(status: ErrorCode, data: &T) -> ResponseFrame {
    ResponseFrame::with_data(status, data)
        .unwrap_or_else(|e| ResponseFrame::rejected(format!("encoding reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::CompilerCore;
    use crate::config::AppConfig;
    use crate::events::EventKind;
    use crate::protocol::{RequestArgs, SystemEvent};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, Lines};
    use tokio::net::unix::OwnedReadHalf;

    fn server() -> AotCompilerServer {
        let events = Arc::new(LocalEventBus::new());
        let core = Arc::new(CompilerCore::new(&AppConfig::default()));
        let service = Arc::new(AotCompilerService::new(
            core,
            events.clone(),
            Duration::from_secs(60),
            CancellationToken::new(),
        ));
        service.on_start();
        AotCompilerServer::new(service, events)
    }

    fn reply_status(resp: &ResponseFrame) -> ErrorCode {
        match resp {
            ResponseFrame::Reply { status, .. } => *status,
            ResponseFrame::Rejected { reason } => panic!("unexpected rejection: {reason}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_code_rejected() {
        let resp = server()
            .dispatch(RequestFrame {
                code: 42,
                args: Value::Null,
            })
            .await;
        assert!(matches!(resp, ResponseFrame::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_malformed_args_rejected() {
        let server = server();
        let resp = server
            .dispatch(RequestFrame::bare(CommandCode::NeedReCompile))
            .await;
        assert!(matches!(resp, ResponseFrame::Rejected { .. }));

        let resp = server
            .dispatch(RequestFrame {
                code: CommandCode::AotCompiler.as_u32(),
                args: serde_json::json!({ "args": { "BundleUid": 7 } }),
            })
            .await;
        assert!(matches!(resp, ResponseFrame::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_oversize_map_rejected() {
        let args: RequestArgs = (0..=MAX_IPC_SEQUENCE_LEN)
            .map(|i| (format!("k{i}"), String::new()))
            .collect();
        let frame = RequestFrame::with_args(CommandCode::AotCompiler, &CompileArgs { args }).unwrap();
        let resp = server().dispatch(frame).await;
        match resp {
            ResponseFrame::Rejected { reason } => assert!(reason.contains("exceeds")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_compile_param_failure_is_a_reply() {
        let frame =
            RequestFrame::with_args(CommandCode::AotCompiler, &CompileArgs::default()).unwrap();
        let resp = server().dispatch(frame).await;
        assert_eq!(reply_status(&resp), ErrorCode::ParamFailed);
    }

    #[tokio::test]
    async fn test_system_event_reaches_core() {
        let server = server();
        assert!(server.events.is_subscribed(EventKind::ThermalLevelChanged));

        let frame = RequestFrame::with_args(
            CommandCode::SystemEvent,
            &SystemEventArgs {
                event: SystemEvent::ThermalLevelChanged(3),
            },
        )
        .unwrap();
        let resp = server.dispatch(frame).await;
        assert_eq!(reply_status(&resp), ErrorCode::Ok);
        assert_eq!(server.service.core().thermal_level(), 3);
        assert!(!server.service.core().is_allowed());
    }

    async fn read_reply(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> ResponseFrame {
        let line = lines.next_line().await.unwrap().expect("reply line");
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_overlong_frame_rejected_and_connection_closed() {
        let server = server().with_max_frame_len(256);
        let (local, remote) = UnixStream::pair().unwrap();
        let task = tokio::spawn(async move { server.handle_connection(remote).await });

        let (reader, mut writer) = local.into_split();
        let mut lines = BufReader::new(reader).lines();

        let mut frame =
            serde_json::to_string(&RequestFrame::bare(CommandCode::GetAotVersion)).unwrap();
        frame.push('\n');
        writer.write_all(frame.as_bytes()).await.unwrap();
        assert_eq!(reply_status(&read_reply(&mut lines).await), ErrorCode::Ok);

        let overlong = format!("{{\"code\": 3, \"args\": \"{}\"}}\n", "x".repeat(1024));
        writer.write_all(overlong.as_bytes()).await.unwrap();
        match read_reply(&mut lines).await {
            ResponseFrame::Rejected { reason } => assert!(reason.contains("exceeds")),
            other => panic!("expected rejection, got {other:?}"),
        }

        assert!(lines.next_line().await.unwrap().is_none());
        task.await.unwrap();
    }
}
