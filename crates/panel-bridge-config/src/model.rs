//! Configuration data model

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize)]
pub struct Config {
    pub global: GlobalConfig,
    pub server: ServerConfig,
    pub compositor: CompositorConfig,
    pub events: EventsConfig,
}

/// Global settings
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalConfig {
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// Default socket base name (`$XDG_RUNTIME_DIR/<name>.sock`)
pub const DEFAULT_SOCKET_NAME: &str = "panel-bridge";
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// IPC server settings
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    /// Base name of the socket file, without the `.sock` suffix
    pub socket_name: String,
    /// Explicit socket path; overrides `socket_name` when set
    pub socket_path: Option<PathBuf>,
    /// Longest accepted request line, newline excluded
    pub max_request_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_name: DEFAULT_SOCKET_NAME.to_string(),
            socket_path: None,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

impl ServerConfig {
    /// Where the server socket lives
    ///
    /// An explicit `socket-path` wins; otherwise `$XDG_RUNTIME_DIR/<name>.sock`,
    /// falling back to `/tmp/<name>-$UID.sock`.
    pub fn resolve_socket_path(&self) -> PathBuf {
        if let Some(path) = &self.socket_path {
            return path.clone();
        }

        if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
            PathBuf::from(runtime_dir).join(format!("{}.sock", self.socket_name))
        } else {
            tracing::warn!("XDG_RUNTIME_DIR not set, using fallback socket path in /tmp");
            let uid = nix::unistd::getuid();
            PathBuf::from(format!("/tmp/{}-{}.sock", self.socket_name, uid))
        }
    }
}

/// Which compositor backend to talk to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Detect from the environment (Wayfire, then Sway, then niri)
    #[default]
    Auto,
    Wayfire,
    Sway,
    Niri,
}

impl std::str::FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "wayfire" => Ok(Self::Wayfire),
            "sway" => Ok(Self::Sway),
            "niri" => Ok(Self::Niri),
            _ => Err(format!(
                "Unknown compositor backend: {} (expected auto, wayfire, sway or niri)",
                s
            )),
        }
    }
}

/// Compositor connection settings
#[derive(Debug, Clone, Serialize)]
pub struct CompositorConfig {
    pub backend: BackendPreference,
    /// Interval of the periodic liveness check
    pub liveness_interval_ms: u64,
    /// Read/write timeout on the request socket
    pub request_timeout_ms: u64,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            liveness_interval_ms: 1000,
            request_timeout_ms: 2000,
        }
    }
}

impl CompositorConfig {
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// What the event pump does when the event queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackpressurePolicy {
    /// Producer waits until the distributor frees a slot; nothing is dropped
    #[default]
    Block,
    /// Discard the oldest queued event to make room
    DropOldest,
    /// Discard the incoming event
    DropNewest,
}

impl std::str::FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "drop-oldest" | "drop_oldest" => Ok(Self::DropOldest),
            "drop-newest" | "drop_newest" => Ok(Self::DropNewest),
            _ => Err(format!(
                "Unknown backpressure policy: {} (expected block, drop-oldest or drop-newest)",
                s
            )),
        }
    }
}

/// Event pipeline settings
#[derive(Debug, Clone, Serialize)]
pub struct EventsConfig {
    pub queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    /// Sleep after a failed reconnect attempt
    pub reconnect_backoff_ms: u64,
    /// Sleep after a failed event read, before reading again
    pub read_failure_backoff_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            backpressure: BackpressurePolicy::Block,
            reconnect_backoff_ms: 10_000,
            read_failure_backoff_ms: 1000,
        }
    }
}

impl EventsConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn read_failure_backoff(&self) -> Duration {
        Duration::from_millis(self.read_failure_backoff_ms)
    }
}
