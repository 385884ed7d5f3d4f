//! Compositor IPC backends and the facade over them
//!
//! This module provides communication with the running Wayland compositor
//! via its control socket. Three backends are supported:
//!
//! - Wayfire (`$WAYFIRE_SOCKET`): length-prefixed JSON `{"method", "data"}` frames
//! - Sway (`$SWAYSOCK`): i3-ipc framing (`"i3-ipc"` magic, length, type, JSON payload)
//! - niri (`$NIRI_SOCKET`): newline-delimited JSON using the `niri-ipc` types
//!
//! ## Architecture
//!
//! - `CompositorOps`: the capability set every backend adapter implements
//! - `EventSource`: blocking access to a backend's event subscription
//! - `Backend` / `EventStream`: tagged variants selected once per connection
//! - `CompositorFacade`: the single shared connection, absorbing transport
//!   errors and owning the reconnect path
//!
//! All socket I/O in this module is blocking. Data operations are expected to
//! run on a blocking-capable thread (see `tokio::task::spawn_blocking`), and
//! event reads happen exclusively on the event pump thread.

mod error;
mod facade;
mod niri;
mod sway;
mod wayfire;

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use panel_bridge_config::BackendPreference;
use serde::Serialize;
use serde_json::Value;

pub use error::CompositorError;
pub use facade::CompositorFacade;
pub use niri::{NiriAdapter, NiriEvents};
pub use sway::{SwayAdapter, SwayEvents};
pub use wayfire::{WayfireAdapter, WayfireEvents};

/// The compositor family a connection talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Wayfire,
    Sway,
    Niri,
}

impl BackendKind {
    /// Environment variable the compositor exports its socket path in
    pub fn socket_env(&self) -> &'static str {
        match self {
            Self::Wayfire => "WAYFIRE_SOCKET",
            Self::Sway => "SWAYSOCK",
            Self::Niri => "NIRI_SOCKET",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wayfire => "wayfire",
            Self::Sway => "sway",
            Self::Niri => "niri",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detection order used for `BackendPreference::Auto`
const DETECTION_ORDER: [BackendKind; 3] =
    [BackendKind::Wayfire, BackendKind::Sway, BackendKind::Niri];

/// State of the one logical compositor connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Unknown,
    Connecting,
    Connected,
    Disconnected,
}

/// Data operations every compositor backend supports
///
/// Views and outputs are returned as the compositor's own JSON objects;
/// the only field callers may rely on is the numeric `id`.
pub trait CompositorOps {
    fn get_view(&mut self, view_id: u64) -> Result<Option<Value>, CompositorError>;
    fn list_views(&mut self) -> Result<Vec<Value>, CompositorError>;
    fn get_focused_view(&mut self) -> Result<Option<Value>, CompositorError>;
    fn list_outputs(&mut self) -> Result<Vec<Value>, CompositorError>;
    fn get_focused_output(&mut self) -> Result<Option<Value>, CompositorError>;
    fn set_focus(&mut self, view_id: u64) -> Result<(), CompositorError>;
    fn close_view(&mut self, view_id: u64) -> Result<(), CompositorError>;

    /// Output by id, `None` when the compositor does not know it
    fn get_output(&mut self, output_id: u64) -> Result<Option<Value>, CompositorError>;
    /// Workspace shown on the focused output
    fn get_current_workspace(&mut self) -> Result<Option<Value>, CompositorError>;
    /// Switch the focused output to workspace `(x, y)` of its grid,
    /// taking `view_id` along when given
    fn set_workspace(
        &mut self,
        x: u32,
        y: u32,
        view_id: Option<u64>,
    ) -> Result<(), CompositorError>;
    /// Position and size of a view as `{"x", "y", "width", "height"}`
    fn get_view_geometry(&mut self, view_id: u64) -> Result<Option<Value>, CompositorError>;
    fn set_view_minimized(&mut self, view_id: u64, state: bool) -> Result<(), CompositorError>;
    fn set_view_fullscreen(&mut self, view_id: u64, state: bool) -> Result<(), CompositorError>;
}

/// A subscribed event connection
pub trait EventSource {
    /// Block until the compositor emits the next event
    fn read_next_event(&mut self) -> Result<Value, CompositorError>;
}

/// The request side of a compositor connection, one variant per backend
#[derive(Debug)]
pub enum Backend {
    Wayfire(WayfireAdapter),
    Sway(SwayAdapter),
    Niri(NiriAdapter),
}

/// The event side of a compositor connection, one variant per backend
#[derive(Debug)]
pub enum EventStream {
    Wayfire(WayfireEvents),
    Sway(SwayEvents),
    Niri(NiriEvents),
}

impl Backend {
    /// Connect the request socket for the given backend
    pub fn connect(
        kind: BackendKind,
        socket_path: &Path,
        timeout: Duration,
    ) -> Result<Self, CompositorError> {
        Ok(match kind {
            BackendKind::Wayfire => Self::Wayfire(WayfireAdapter::connect(socket_path, timeout)?),
            BackendKind::Sway => Self::Sway(SwayAdapter::connect(socket_path, timeout)?),
            BackendKind::Niri => Self::Niri(NiriAdapter::connect(socket_path, timeout)?),
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Wayfire(_) => BackendKind::Wayfire,
            Self::Sway(_) => BackendKind::Sway,
            Self::Niri(_) => BackendKind::Niri,
        }
    }

    /// Open a dedicated connection subscribed to the compositor's events
    pub fn watch(&self) -> Result<EventStream, CompositorError> {
        Ok(match self {
            Self::Wayfire(adapter) => EventStream::Wayfire(adapter.watch()?),
            Self::Sway(adapter) => EventStream::Sway(adapter.watch()?),
            Self::Niri(adapter) => EventStream::Niri(adapter.watch()?),
        })
    }

    /// Shut the request socket down
    pub fn close(&mut self) {
        match self {
            Self::Wayfire(adapter) => adapter.close(),
            Self::Sway(adapter) => adapter.close(),
            Self::Niri(adapter) => adapter.close(),
        }
    }

    fn ops(&mut self) -> &mut dyn CompositorOps {
        match self {
            Self::Wayfire(adapter) => adapter as &mut dyn CompositorOps,
            Self::Sway(adapter) => adapter as &mut dyn CompositorOps,
            Self::Niri(adapter) => adapter as &mut dyn CompositorOps,
        }
    }
}

impl CompositorOps for Backend {
    fn get_view(&mut self, view_id: u64) -> Result<Option<Value>, CompositorError> {
        self.ops().get_view(view_id)
    }

    fn list_views(&mut self) -> Result<Vec<Value>, CompositorError> {
        self.ops().list_views()
    }

    fn get_focused_view(&mut self) -> Result<Option<Value>, CompositorError> {
        self.ops().get_focused_view()
    }

    fn list_outputs(&mut self) -> Result<Vec<Value>, CompositorError> {
        self.ops().list_outputs()
    }

    fn get_focused_output(&mut self) -> Result<Option<Value>, CompositorError> {
        self.ops().get_focused_output()
    }

    fn set_focus(&mut self, view_id: u64) -> Result<(), CompositorError> {
        self.ops().set_focus(view_id)
    }

    fn close_view(&mut self, view_id: u64) -> Result<(), CompositorError> {
        self.ops().close_view(view_id)
    }

    fn get_output(&mut self, output_id: u64) -> Result<Option<Value>, CompositorError> {
        self.ops().get_output(output_id)
    }

    fn get_current_workspace(&mut self) -> Result<Option<Value>, CompositorError> {
        self.ops().get_current_workspace()
    }

    fn set_workspace(
        &mut self,
        x: u32,
        y: u32,
        view_id: Option<u64>,
    ) -> Result<(), CompositorError> {
        self.ops().set_workspace(x, y, view_id)
    }

    fn get_view_geometry(&mut self, view_id: u64) -> Result<Option<Value>, CompositorError> {
        self.ops().get_view_geometry(view_id)
    }

    fn set_view_minimized(&mut self, view_id: u64, state: bool) -> Result<(), CompositorError> {
        self.ops().set_view_minimized(view_id, state)
    }

    fn set_view_fullscreen(&mut self, view_id: u64, state: bool) -> Result<(), CompositorError> {
        self.ops().set_view_fullscreen(view_id, state)
    }
}

impl EventSource for EventStream {
    fn read_next_event(&mut self) -> Result<Value, CompositorError> {
        match self {
            Self::Wayfire(stream) => stream.read_next_event(),
            Self::Sway(stream) => stream.read_next_event(),
            Self::Niri(stream) => stream.read_next_event(),
        }
    }
}

/// Read a backend's socket path from its environment variable
///
/// # Errors
///
/// Returns `CompositorError::SocketNotSet` if the variable is not set.
/// Returns `CompositorError::SocketNotFound` if the path doesn't exist.
pub fn get_socket_path(kind: BackendKind) -> Result<PathBuf, CompositorError> {
    let var = kind.socket_env();
    let socket_path_str = std::env::var(var).map_err(|_| CompositorError::SocketNotSet { var })?;

    let socket_path = PathBuf::from(&socket_path_str);

    if !socket_path.exists() {
        return Err(CompositorError::SocketNotFound { path: socket_path });
    }

    Ok(socket_path)
}

/// Work out which compositor is running and where its socket lives
///
/// With `BackendPreference::Auto` the first backend whose environment
/// variable is set wins, in the order Wayfire, Sway, niri.
pub fn detect_backend(
    preference: BackendPreference,
) -> Result<(BackendKind, PathBuf), CompositorError> {
    let pinned = match preference {
        BackendPreference::Auto => None,
        BackendPreference::Wayfire => Some(BackendKind::Wayfire),
        BackendPreference::Sway => Some(BackendKind::Sway),
        BackendPreference::Niri => Some(BackendKind::Niri),
    };

    if let Some(kind) = pinned {
        return get_socket_path(kind).map(|path| (kind, path));
    }

    for kind in DETECTION_ORDER {
        if std::env::var_os(kind.socket_env()).is_some() {
            return get_socket_path(kind).map(|path| (kind, path));
        }
    }

    Err(CompositorError::NoBackendDetected {
        checked: DETECTION_ORDER
            .iter()
            .map(|kind| format!("${}", kind.socket_env()))
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Connect a blocking Unix socket, optionally with I/O timeouts
pub(crate) fn connect_socket(
    path: &Path,
    timeout: Option<Duration>,
) -> Result<UnixStream, CompositorError> {
    let socket = UnixStream::connect(path).map_err(|e| CompositorError::ConnectionFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    socket
        .set_read_timeout(timeout)
        .and_then(|_| socket.set_write_timeout(timeout))
        .map_err(|e| CompositorError::ConnectionFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

    Ok(socket)
}

/// Map a failed `read_exact` to the right error, treating EOF as a closed link
pub(crate) fn receive_error(err: std::io::Error) -> CompositorError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        CompositorError::ConnectionClosed
    } else {
        CompositorError::ReceiveFailed(err)
    }
}

/// Pull the numeric view id out of a view object
pub fn view_id(view: &Value) -> Option<u64> {
    view.get("id").and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Environment variables are global state, so tests modifying them must not run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: [&str; 3] = ["WAYFIRE_SOCKET", "SWAYSOCK", "NIRI_SOCKET"];

    fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved: Vec<_> = ALL_VARS.iter().map(|v| (*v, env::var(v).ok())).collect();
        for var in ALL_VARS {
            env::remove_var(var);
        }
        for (var, value) in vars {
            env::set_var(var, value);
        }

        let result = f();

        for (var, value) in saved {
            match value {
                Some(value) => env::set_var(var, value),
                None => env::remove_var(var),
            }
        }
        result
    }

    #[test]
    fn test_no_backend_detected() {
        let result = with_env(&[], || detect_backend(BackendPreference::Auto));
        match result {
            Err(CompositorError::NoBackendDetected { checked }) => {
                assert!(checked.contains("$WAYFIRE_SOCKET"));
                assert!(checked.contains("$SWAYSOCK"));
                assert!(checked.contains("$NIRI_SOCKET"));
            }
            other => panic!("Expected NoBackendDetected, got: {:?}", other),
        }
    }

    #[test]
    fn test_wayfire_preferred_over_sway() {
        let result = with_env(&[("WAYFIRE_SOCKET", "/tmp"), ("SWAYSOCK", "/tmp")], || {
            detect_backend(BackendPreference::Auto)
        });
        let (kind, path) = result.unwrap();
        assert_eq!(kind, BackendKind::Wayfire);
        assert_eq!(path, PathBuf::from("/tmp"));
    }

    #[test]
    fn test_sway_detected_when_alone() {
        let result = with_env(&[("SWAYSOCK", "/tmp")], || detect_backend(BackendPreference::Auto));
        assert_eq!(result.unwrap().0, BackendKind::Sway);
    }

    #[test]
    fn test_pinned_backend_requires_its_variable() {
        let result = with_env(&[("WAYFIRE_SOCKET", "/tmp")], || {
            detect_backend(BackendPreference::Niri)
        });
        assert!(
            matches!(result, Err(CompositorError::SocketNotSet { var: "NIRI_SOCKET" })),
            "Expected SocketNotSet for NIRI_SOCKET, got: {:?}",
            result
        );
    }

    #[test]
    fn test_detected_socket_must_exist() {
        let fake_path = "/tmp/nonexistent-compositor-socket-12345";
        let result = with_env(&[("SWAYSOCK", fake_path)], || {
            detect_backend(BackendPreference::Auto)
        });
        match result {
            Err(CompositorError::SocketNotFound { path }) => {
                assert_eq!(path, PathBuf::from(fake_path));
            }
            other => panic!("Expected SocketNotFound, got: {:?}", other),
        }
    }

    #[test]
    fn test_connect_to_regular_file_fails() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let socket_path = temp_dir.path().join("compositor.sock");
        std::fs::write(&socket_path, "").expect("Failed to create dummy file");

        match connect_socket(&socket_path, None) {
            Err(CompositorError::ConnectionFailed { path, .. }) => assert_eq!(path, socket_path),
            other => panic!("Expected ConnectionFailed, got: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_view_id_extraction() {
        assert_eq!(view_id(&serde_json::json!({"id": 7, "title": "x"})), Some(7));
        assert_eq!(view_id(&serde_json::json!({"title": "x"})), None);
    }
}
