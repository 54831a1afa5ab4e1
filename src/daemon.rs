//! Daemon Session
//!
//! Owns the aria2 child process and the RPC connection to it. In attach mode
//! no process is spawned and the session only owns the connection.

use crate::config::{DaemonConfig, PROXY_ENV_VARS};
use crate::error::{EngineError, Result};
use crate::rpc::{Notification, TransferRpc, WsRpcClient};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// How long a confirmed shutdown may take before the child is killed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Base delay between RPC connect attempts
const CONNECT_BACKOFF: Duration = Duration::from_millis(200);

/// One aria2 daemon and the RPC connection to it
pub struct DaemonSession {
    config: DaemonConfig,
    rpc_timeout: Duration,
    /// Serializes start/close; holds the child when we spawned one
    child: tokio::sync::Mutex<Option<Child>>,
    rpc: RwLock<Option<Arc<WsRpcClient>>>,
    version: RwLock<Option<String>>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
}

impl DaemonSession {
    pub fn new(config: DaemonConfig, rpc_timeout: Duration) -> Self {
        Self {
            config,
            rpc_timeout,
            child: tokio::sync::Mutex::new(None),
            rpc: RwLock::new(None),
            version: RwLock::new(None),
            notifications: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.rpc.read().is_some()
    }

    /// Version reported by the handshake
    pub fn version(&self) -> Option<String> {
        self.version.read().clone()
    }

    pub fn rpc(&self) -> Option<Arc<WsRpcClient>> {
        self.rpc.read().clone()
    }

    /// Take the notification stream of the current connection (once)
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications.lock().take()
    }

    /// Spawn (or attach to) the daemon and complete the version handshake.
    ///
    /// Calling this on a started session does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if self.is_started() {
            return Ok(());
        }

        if self.config.spawn {
            *child = Some(self.spawn().await?);
        }

        match self.handshake().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(mut process) = child.take() {
                    let _ = process.kill().await;
                }
                Err(e)
            }
        }
    }

    /// Ask the daemon to shut down.
    ///
    /// Returns true only when the daemon answered `OK`; the connection is
    /// released in that case and kept otherwise.
    pub async fn close(&self) -> bool {
        let mut child = self.child.lock().await;
        let Some(rpc) = self.rpc() else {
            return false;
        };

        match rpc.shutdown().await {
            Ok(answer) if answer == "OK" => {}
            Ok(answer) => {
                tracing::warn!("aria2 did not confirm shutdown, answered {:?}", answer);
                return false;
            }
            Err(e) => {
                tracing::warn!("aria2 shutdown call failed: {}", e);
                return false;
            }
        }

        rpc.close();
        *self.rpc.write() = None;
        *self.version.write() = None;
        self.notifications.lock().take();

        if let Some(mut process) = child.take() {
            match timeout(SHUTDOWN_GRACE, process.wait()).await {
                Ok(Ok(status)) => tracing::debug!("aria2 exited with {}", status),
                Ok(Err(e)) => tracing::warn!("Waiting for aria2 to exit failed: {}", e),
                Err(_) => {
                    tracing::warn!("aria2 still running after {:?}, killing it", SHUTDOWN_GRACE);
                    let _ = process.kill().await;
                }
            }
        }

        tracing::info!("aria2 daemon stopped");
        true
    }

    /// Daemon command line, without the binary
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--enable-rpc".to_string(),
            "--rpc-allow-origin-all".to_string(),
            format!("--rpc-listen-port={}", self.config.port),
            format!("--rpc-secret={}", self.config.secret),
        ];
        if self.config.listen_all {
            args.push("--rpc-listen-all".to_string());
        }
        if let Some(ref log) = self.config.debug.log {
            args.push(format!("--log={}", log.display()));
        }
        args.extend(self.config.args.iter().cloned());
        args
    }

    pub(crate) fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for var in PROXY_ENV_VARS {
            cmd.env_remove(var);
        }
        cmd
    }

    async fn spawn(&self) -> Result<Child> {
        if let Some(ref log) = self.config.debug.log {
            prepare_log(log)?;
            tracing::info!("aria2 debug log is written to {}", log.display());
        }

        let mut child = self.command().spawn().map_err(|e| {
            EngineError::startup(format!(
                "Failed to spawn {}: {}",
                self.config.binary.display(),
                e
            ))
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill().await;
            return Err(EngineError::Internal("aria2 output is not piped".into()));
        };
        let mut stdout = BufReader::new(stdout).lines();

        // First output line means the RPC listener is up
        let after = self.config.startup_timeout();
        match timeout(after, stdout.next_line()).await {
            Ok(Ok(Some(line))) => {
                if self.config.debug.pipe {
                    tracing::debug!(target: "aria2", "{}", line);
                }
            }
            Ok(Ok(None)) => {
                let status = child.wait().await.ok();
                return Err(EngineError::startup(match status {
                    Some(status) => format!("aria2 exited before becoming ready ({})", status),
                    None => "aria2 exited before becoming ready".to_string(),
                }));
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(EngineError::startup(format!("Reading aria2 output failed: {}", e)));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(EngineError::Timeout {
                    operation: "daemon readiness",
                    after,
                });
            }
        }

        let pipe = self.config.debug.pipe;
        tokio::spawn(drain(stdout, pipe));
        tokio::spawn(drain(BufReader::new(stderr).lines(), pipe));

        tracing::info!(
            "aria2 daemon started (pid {:?}, port {})",
            child.id(),
            self.config.port
        );
        Ok(child)
    }

    async fn handshake(&self) -> Result<()> {
        let (client, notifications) = self.connect().await?;
        let version = client.get_version().await?;
        tracing::info!("Connected to aria2 {} at {}", version, self.config.rpc_url());

        *self.version.write() = Some(version);
        *self.notifications.lock() = Some(notifications);
        *self.rpc.write() = Some(Arc::new(client));
        Ok(())
    }

    async fn connect(&self) -> Result<(WsRpcClient, mpsc::UnboundedReceiver<Notification>)> {
        let url = self.config.rpc_url();
        let mut attempt = 1;
        loop {
            match WsRpcClient::connect(&url, Some(self.config.secret.clone()), self.rpc_timeout)
                .await
            {
                Ok(connected) => return Ok(connected),
                Err(e) if e.is_retryable() && attempt < self.config.connect_attempts => {
                    tracing::debug!("RPC connect attempt {} to {} failed: {}", attempt, url, e);
                    tokio::time::sleep(CONNECT_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for DaemonSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonSession")
            .field("url", &self.config.rpc_url())
            .field("spawn", &self.config.spawn)
            .field("started", &self.is_started())
            .field("version", &self.version())
            .finish()
    }
}

/// Make room for a fresh debug log
fn prepare_log(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Keep reading daemon output so it never blocks on a full pipe
async fn drain<R: AsyncBufRead + Unpin>(mut lines: Lines<R>, pipe: bool) {
    while let Ok(Some(line)) = lines.next_line().await {
        if pipe {
            tracing::debug!(target: "aria2", "{}", line);
        }
    }
}
