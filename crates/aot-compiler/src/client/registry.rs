//! Locating and activating the service.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::process::Command;

use super::proxy::{AotCompilerProxy, SocketProxy};

/// Receives the outcome of an activation request.
pub trait LoadCallback: Send + Sync {
    fn on_load_success(&self, proxy: Arc<dyn AotCompilerProxy>);
    fn on_load_fail(&self);
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// A proxy to the service if it is already running.
    async fn check(&self) -> Option<Arc<dyn AotCompilerProxy>>;

    /// Ask for the service to be started. Returns once the request is
    /// accepted; the outcome arrives on `callback`.
    async fn load(&self, callback: Arc<dyn LoadCallback>) -> Result<()>;
}

/// Registry backed by the service socket.
///
/// `check` connects to the socket. `load` runs the activation command (typically
/// a `systemctl start`) and polls the socket until it accepts connections.
pub struct SocketRegistry {
    socket_path: PathBuf,
    activation_command: Vec<String>,
    activation_timeout: Duration,
    poll_interval: Duration,
}

impl SocketRegistry {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        activation_command: Vec<String>,
        activation_timeout: Duration,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            activation_command,
            activation_timeout,
            poll_interval: Duration::from_millis(50),
        }
    }

    async fn reachable(socket_path: &Path) -> bool {
        UnixStream::connect(socket_path).await.is_ok()
    }
}

#[async_trait]
impl ServiceRegistry for SocketRegistry {
    async fn check(&self) -> Option<Arc<dyn AotCompilerProxy>> {
        if Self::reachable(&self.socket_path).await {
            Some(SocketProxy::new(self.socket_path.clone()))
        } else {
            None
        }
    }

    async fn load(&self, callback: Arc<dyn LoadCallback>) -> Result<()> {
        if let Some((program, args)) = self.activation_command.split_first() {
            info!("activating aot compiler service: {}", self.activation_command.join(" "));
            let mut command = Command::new(program);
            command.args(args).kill_on_drop(true);
            let status = tokio::time::timeout(self.activation_timeout, command.status())
                .await
                .map_err(|_| {
                    anyhow::anyhow!(
                        "activation command did not finish within {:?}",
                        self.activation_timeout
                    )
                })?
                .with_context(|| format!("running activation command {program:?}"))?;
            if !status.success() {
                anyhow::bail!("activation command exited with {status}");
            }
        }

        let socket_path = self.socket_path.clone();
        let deadline = tokio::time::Instant::now() + self.activation_timeout;
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            while tokio::time::Instant::now() < deadline {
                if Self::reachable(&socket_path).await {
                    debug!("aot compiler service up at {socket_path:?}");
                    callback.on_load_success(SocketProxy::new(socket_path));
                    return;
                }
                tokio::time::sleep(poll_interval).await;
            }
            warn!("aot compiler service did not come up at {socket_path:?}");
            callback.on_load_fail();
        });
        Ok(())
    }
}
