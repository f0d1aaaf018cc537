//! Remote handle to a running service instance.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::protocol::{RequestFrame, ResponseFrame};

/// The service socket refused or lacked a listener; nothing was sent.
#[derive(Debug, Error)]
#[error("aot compiler unreachable at {path:?}")]
pub struct Unreachable {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Notified when the service behind a proxy goes away.
pub trait DeathRecipient: Send + Sync {
    fn on_remote_died(&self, proxy: &Arc<dyn AotCompilerProxy>);
}

/// Transport to one service instance.
#[async_trait]
pub trait AotCompilerProxy: Send + Sync {
    /// Send one request and wait for its response. An `Err` is a transport
    /// failure; application and IPC-level failures come back as frames.
    async fn call(&self, frame: &RequestFrame) -> Result<ResponseFrame>;

    fn add_death_recipient(&self, recipient: Arc<dyn DeathRecipient>);
}

/// Proxy speaking newline-delimited JSON over the service socket.
///
/// Each call opens a fresh connection. Failing to reach the socket counts as
/// the remote having died: registered recipients are notified once and
/// dropped.
pub struct SocketProxy {
    socket_path: PathBuf,
    this: Weak<SocketProxy>,
    recipients: Mutex<Vec<Arc<dyn DeathRecipient>>>,
}

impl SocketProxy {
    pub fn new(socket_path: impl Into<PathBuf>) -> Arc<Self> {
        let socket_path = socket_path.into();
        Arc::new_cyclic(|this| Self {
            socket_path,
            this: this.clone(),
            recipients: Mutex::new(Vec::new()),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn request(&self, frame: &RequestFrame) -> Result<ResponseFrame> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| Unreachable {
                path: self.socket_path.clone(),
                source,
            })?;

        let mut json = serde_json::to_string(frame).context("serializing request")?;
        json.push('\n');
        stream
            .write_all(json.as_bytes())
            .await
            .context("writing request")?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .context("reading response")?;
        if read == 0 {
            anyhow::bail!("connection closed before response");
        }

        serde_json::from_str(&line).context("parsing response")
    }

    fn notify_death(&self) {
        let recipients = std::mem::take(
            &mut *self.recipients.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let Some(this) = self.this.upgrade() else {
            return;
        };
        if recipients.is_empty() {
            return;
        }
        warn!("aot compiler at {:?} died", self.socket_path);
        let proxy: Arc<dyn AotCompilerProxy> = this;
        for recipient in recipients {
            recipient.on_remote_died(&proxy);
        }
    }
}

#[async_trait]
impl AotCompilerProxy for SocketProxy {
    async fn call(&self, frame: &RequestFrame) -> Result<ResponseFrame> {
        let result = self.request(frame).await;
        if let Err(e) = &result {
            debug!("aot compiler call failed: {e:#}");
            self.notify_death();
        }
        result
    }

    fn add_death_recipient(&self, recipient: Arc<dyn DeathRecipient>) {
        self.recipients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(recipient);
    }
}
