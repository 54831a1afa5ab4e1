//! Engine configuration
//!
//! This module contains all configuration options for the orchestrator and
//! the aria2 daemon it drives.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Public trackers appended to every magnet via aria2's `bt-tracker` option
pub const DEFAULT_TRACKERS: &[&str] = &[
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://open.stealth.si:80/announce",
    "udp://tracker.torrent.eu.org:451/announce",
    "udp://exodus.desync.com:6969/announce",
    "udp://tracker.openbittorrent.com:6969/announce",
    "http://tracker.opentrackr.org:1337/announce",
];

/// Environment variables that would otherwise leak a proxy into the daemon
pub const PROXY_ENV_VARS: &[&str] = &[
    "all_proxy",
    "ALL_PROXY",
    "http_proxy",
    "https_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
];

/// Main configuration for the download engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory the daemon saves downloads to
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Trackers added to every magnet
    #[serde(default = "default_trackers")]
    pub trackers: Vec<String>,

    /// Transfer-level proxy
    #[serde(default)]
    pub proxy: ProxySetting,

    /// Heartbeat poll period in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Upper bound for a single RPC call in seconds
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,

    /// Daemon process and RPC endpoint
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// aria2 daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Executable to spawn
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Spawn the daemon (true) or attach to one that is already running (false)
    #[serde(default = "default_true")]
    pub spawn: bool,

    /// Host the RPC endpoint listens on
    #[serde(default = "default_host")]
    pub host: String,

    /// RPC listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// RPC shared secret
    #[serde(default = "default_secret")]
    pub secret: String,

    /// Pass `--rpc-listen-all` so the RPC port is reachable from other hosts
    #[serde(default)]
    pub listen_all: bool,

    /// Extra command line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// How long to wait for the daemon's first output line, in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// Attempts to open the RPC socket once the daemon is up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Debugging aids
    #[serde(default)]
    pub debug: DebugConfig,
}

/// Daemon debugging options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Forward daemon stdout/stderr lines to `tracing` (target `aria2`)
    #[serde(default)]
    pub pipe: bool,

    /// Daemon log file (`--log`)
    #[serde(default)]
    pub log: Option<PathBuf>,
}

/// Transfer-level proxy selection.
///
/// Deserializes from `false` (disabled), `true` (take the proxy from the
/// caller's environment) or a proxy URL string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawProxySetting", into = "RawProxySetting")]
pub enum ProxySetting {
    /// No proxy for transfers
    #[default]
    Disabled,
    /// Resolve `HTTPS_PROXY`/`HTTP_PROXY`/`ALL_PROXY` at submit time
    Environment,
    /// Fixed proxy URL
    Url(String),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawProxySetting {
    Flag(bool),
    Url(String),
}

impl From<RawProxySetting> for ProxySetting {
    fn from(raw: RawProxySetting) -> Self {
        match raw {
            RawProxySetting::Flag(false) => Self::Disabled,
            RawProxySetting::Flag(true) => Self::Environment,
            RawProxySetting::Url(url) => Self::Url(url),
        }
    }
}

impl From<ProxySetting> for RawProxySetting {
    fn from(setting: ProxySetting) -> Self {
        match setting {
            ProxySetting::Disabled => Self::Flag(false),
            ProxySetting::Environment => Self::Flag(true),
            ProxySetting::Url(url) => Self::Url(url),
        }
    }
}

impl ProxySetting {
    /// Proxy URL to hand to the daemon for one transfer, if any
    pub fn resolve(&self) -> Option<String> {
        match self {
            Self::Disabled => None,
            Self::Url(url) => Some(url.clone()),
            Self::Environment => ["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"]
                .iter()
                .filter_map(|var| std::env::var(var).ok())
                .find(|value| !value.is_empty()),
        }
    }
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("temp")
}

fn default_trackers() -> Vec<String> {
    DEFAULT_TRACKERS.iter().map(|t| t.to_string()).collect()
}

fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_rpc_timeout_secs() -> u64 {
    30
}

fn default_binary() -> PathBuf {
    PathBuf::from("aria2c")
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6800
}

fn default_secret() -> String {
    "animespace".to_string()
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_connect_attempts() -> u32 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            trackers: default_trackers(),
            proxy: ProxySetting::Disabled,
            heartbeat_interval_ms: 500,
            rpc_timeout_secs: 30,
            daemon: DaemonConfig::default(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            spawn: true,
            host: default_host(),
            port: 6800,
            secret: default_secret(),
            listen_all: false,
            args: Vec::new(),
            startup_timeout_secs: 30,
            connect_attempts: 5,
            debug: DebugConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// WebSocket JSON-RPC endpoint
    pub fn rpc_url(&self) -> String {
        format!("ws://{}:{}/jsonrpc", self.host, self.port)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

impl EngineConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the download directory
    pub fn download_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_dir = path.into();
        self
    }

    /// Replace the tracker list
    pub fn trackers(mut self, trackers: Vec<String>) -> Self {
        self.trackers = trackers;
        self
    }

    /// Set the transfer proxy
    pub fn proxy(mut self, proxy: ProxySetting) -> Self {
        self.proxy = proxy;
        self
    }

    /// Set the heartbeat poll period
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the per-call RPC timeout, rounded up to whole seconds
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout_secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        self
    }

    /// Set the RPC port
    pub fn port(mut self, port: u16) -> Self {
        self.daemon.port = port;
        self
    }

    /// Set the RPC secret
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.daemon.secret = secret.into();
        self
    }

    /// Set the daemon executable
    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.daemon.binary = binary.into();
        self
    }

    /// Add an extra daemon argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.daemon.args.push(arg.into());
        self
    }

    /// Attach to a running daemon instead of spawning one
    pub fn attach_only(mut self) -> Self {
        self.daemon.spawn = false;
        self
    }

    /// Write the daemon's debug log to `path`
    pub fn debug_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.daemon.debug.log = Some(path.into());
        self
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_call_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.daemon.port == 0 {
            return Err(EngineError::invalid_input("port", "Must be non-zero"));
        }

        if self.daemon.secret.is_empty() {
            return Err(EngineError::invalid_input("secret", "Must not be empty"));
        }

        if self.daemon.spawn && self.daemon.binary.as_os_str().is_empty() {
            return Err(EngineError::invalid_input("binary", "Must not be empty"));
        }

        if self.heartbeat_interval_ms < 10 {
            return Err(EngineError::invalid_input(
                "heartbeat_interval_ms",
                "Must be at least 10",
            ));
        }

        if self.rpc_timeout_secs == 0 {
            return Err(EngineError::invalid_input("rpc_timeout_secs", "Must be at least 1"));
        }

        if self.daemon.startup_timeout_secs == 0 {
            return Err(EngineError::invalid_input(
                "startup_timeout_secs",
                "Must be at least 1",
            ));
        }

        if self.daemon.connect_attempts == 0 {
            return Err(EngineError::invalid_input("connect_attempts", "Must be at least 1"));
        }

        if let ProxySetting::Url(ref proxy) = self.proxy {
            url::Url::parse(proxy).map_err(|e| {
                EngineError::invalid_input("proxy", format!("Invalid proxy URL: {}", e))
            })?;
        }

        Ok(())
    }
}
