//! The single logical compositor connection
//!
//! `CompositorFacade` owns the request socket and the event-watch socket of
//! whichever backend is running. Transport failures never escape it: the
//! facade marks itself disconnected, drops its handles, and callers see
//! `None`. Reconnection is driven from outside (the event pump and the
//! liveness monitor) through [`CompositorFacade::reconnect`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use panel_bridge_config::{BackendPreference, CompositorConfig};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{
    detect_backend, view_id, Backend, BackendKind, CompositorError, CompositorOps,
    ConnectionState, EventSource, EventStream,
};

/// The event stream tagged with the connection generation it belongs to
struct WatchedStream {
    generation: u64,
    stream: EventStream,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CompositorFacade {
    preference: BackendPreference,
    /// Fixed endpoint that bypasses environment detection
    endpoint: Option<(BackendKind, PathBuf)>,
    request_timeout: Duration,
    backend: Mutex<Option<Backend>>,
    events: Mutex<Option<WatchedStream>>,
    state: Mutex<ConnectionState>,
    kind: Mutex<Option<BackendKind>>,
    /// Bumped on every successful connect; stale event streams are discarded
    generation: AtomicU64,
    reconnect_lock: Mutex<()>,
}

impl CompositorFacade {
    /// Create a disconnected facade; call [`reconnect`](Self::reconnect) to connect
    pub fn new(config: &CompositorConfig) -> Self {
        Self {
            preference: config.backend,
            endpoint: None,
            request_timeout: config.request_timeout(),
            backend: Mutex::new(None),
            events: Mutex::new(None),
            state: Mutex::new(ConnectionState::Unknown),
            kind: Mutex::new(None),
            generation: AtomicU64::new(0),
            reconnect_lock: Mutex::new(()),
        }
    }

    /// Create a facade that always connects to `socket_path` as `kind`
    pub fn with_endpoint(config: &CompositorConfig, kind: BackendKind, socket_path: PathBuf) -> Self {
        Self {
            endpoint: Some((kind, socket_path)),
            ..Self::new(config)
        }
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The backend of the current (or most recent) connection
    pub fn backend_kind(&self) -> Option<BackendKind> {
        *lock(&self.kind)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!(from = ?*current, to = ?state, "Compositor connection state changed");
            *current = state;
        }
    }

    /// Re-detect the backend and re-establish both sockets
    ///
    /// Concurrent callers are serialized; a caller arriving after another
    /// one already reconnected returns immediately.
    pub fn reconnect(&self) -> Result<(), CompositorError> {
        let _guard = lock(&self.reconnect_lock);

        if self.is_connected() {
            return Ok(());
        }

        self.close_handles();
        self.set_state(ConnectionState::Connecting);

        match self.establish() {
            Ok((backend, stream)) => {
                let kind = backend.kind();
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

                *lock(&self.backend) = Some(backend);
                *lock(&self.events) = Some(WatchedStream { generation, stream });
                *lock(&self.kind) = Some(kind);
                self.set_state(ConnectionState::Connected);

                info!(backend = %kind, generation, "Connected to compositor");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    fn establish(&self) -> Result<(Backend, EventStream), CompositorError> {
        let (kind, socket_path) = match &self.endpoint {
            Some((kind, path)) => (*kind, path.clone()),
            None => detect_backend(self.preference)?,
        };

        debug!(backend = %kind, path = %socket_path.display(), "Connecting to compositor");

        let mut backend = Backend::connect(kind, &socket_path, self.request_timeout)?;
        match backend.watch() {
            Ok(stream) => Ok((backend, stream)),
            Err(e) => {
                backend.close();
                Err(e)
            }
        }
    }

    /// Replace the event subscription on the current connection
    pub fn watch(&self) -> Result<(), CompositorError> {
        let stream = {
            let backend = lock(&self.backend);
            backend.as_ref().ok_or(CompositorError::NotConnected)?.watch()?
        };

        let generation = self.generation.load(Ordering::SeqCst);
        *lock(&self.events) = Some(WatchedStream { generation, stream });
        Ok(())
    }

    /// Drop both sockets and mark the connection down
    pub fn close(&self) {
        self.close_handles();
        self.set_state(ConnectionState::Disconnected);
    }

    fn close_handles(&self) {
        if let Some(mut backend) = lock(&self.backend).take() {
            backend.close();
        }
        lock(&self.events).take();
    }

    /// Block until the compositor emits an event
    ///
    /// Returns `None` when there is no event stream or it failed; in the
    /// latter case the facade is marked disconnected.
    pub fn read_next_event(&self) -> Option<Value> {
        // The stream is taken out of its slot so that the blocking read does
        // not hold the lock; data operations and reconnects stay responsive.
        let mut watched = lock(&self.events).take()?;

        match watched.stream.read_next_event() {
            Ok(event) => {
                let mut slot = lock(&self.events);
                if slot.is_none() && watched.generation == self.generation.load(Ordering::SeqCst) {
                    *slot = Some(watched);
                }
                Some(event)
            }
            Err(e) => {
                if watched.generation == self.generation.load(Ordering::SeqCst) {
                    warn!(error = %e, "Compositor event stream failed");
                    if let Some(mut backend) = lock(&self.backend).take() {
                        backend.close();
                    }
                    self.set_state(ConnectionState::Disconnected);
                } else {
                    debug!(error = %e, "Stale compositor event stream closed");
                }
                None
            }
        }
    }

    /// Run a data operation against the request socket
    ///
    /// Transport errors disconnect the facade; any error yields `None`.
    fn with_backend<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut Backend) -> Result<T, CompositorError>,
    ) -> Option<T> {
        let mut guard = lock(&self.backend);
        let Some(backend) = guard.as_mut() else {
            debug!(operation, "Compositor not connected");
            return None;
        };

        match f(backend) {
            Ok(value) => Some(value),
            Err(e) if e.is_transport() => {
                warn!(operation, error = %e, "Compositor connection lost");
                if let Some(mut backend) = guard.take() {
                    backend.close();
                }
                drop(guard);
                self.set_state(ConnectionState::Disconnected);
                None
            }
            Err(e) => {
                warn!(operation, error = %e, "Compositor request failed");
                None
            }
        }
    }

    pub fn get_view(&self, id: u64) -> Option<Value> {
        self.with_backend("get_view", |backend| backend.get_view(id))
            .flatten()
    }

    pub fn list_views(&self) -> Option<Vec<Value>> {
        self.with_backend("list_views", |backend| backend.list_views())
    }

    pub fn get_focused_view(&self) -> Option<Value> {
        self.with_backend("get_focused_view", |backend| backend.get_focused_view())
            .flatten()
    }

    pub fn list_outputs(&self) -> Option<Vec<Value>> {
        self.with_backend("list_outputs", |backend| backend.list_outputs())
    }

    pub fn get_focused_output(&self) -> Option<Value> {
        self.with_backend("get_focused_output", |backend| backend.get_focused_output())
            .flatten()
    }

    /// Returns whether the compositor accepted the request
    pub fn set_focus(&self, id: u64) -> bool {
        self.with_backend("set_focus", |backend| backend.set_focus(id))
            .is_some()
    }

    /// Returns whether the compositor accepted the request
    pub fn close_view(&self, id: u64) -> bool {
        self.with_backend("close_view", |backend| backend.close_view(id))
            .is_some()
    }

    pub fn get_output(&self, id: u64) -> Option<Value> {
        self.with_backend("get_output", |backend| backend.get_output(id))
            .flatten()
    }

    pub fn get_current_workspace(&self) -> Option<Value> {
        self.with_backend("get_current_workspace", |backend| {
            backend.get_current_workspace()
        })
        .flatten()
    }

    /// Switch workspace on the focused output, optionally moving a view along
    pub fn set_workspace(&self, x: u32, y: u32, view_id: Option<u64>) -> bool {
        self.with_backend("set_workspace", |backend| backend.set_workspace(x, y, view_id))
            .is_some()
    }

    pub fn get_view_geometry(&self, id: u64) -> Option<Value> {
        self.with_backend("get_view_geometry", |backend| backend.get_view_geometry(id))
            .flatten()
    }

    /// Returns whether the compositor accepted the request
    pub fn set_view_minimized(&self, id: u64, state: bool) -> bool {
        self.with_backend("set_view_minimized", |backend| {
            backend.set_view_minimized(id, state)
        })
        .is_some()
    }

    /// Returns whether the compositor accepted the request
    pub fn set_view_fullscreen(&self, id: u64, state: bool) -> bool {
        self.with_backend("set_view_fullscreen", |backend| {
            backend.set_view_fullscreen(id, state)
        })
        .is_some()
    }

    /// Ids of every current view
    pub fn list_ids(&self) -> Option<Vec<u64>> {
        self.list_views()
            .map(|views| views.iter().filter_map(view_id).collect())
    }
}

impl std::fmt::Debug for CompositorFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositorFacade")
            .field("preference", &self.preference)
            .field("state", &self.state())
            .field("backend", &self.backend_kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::thread;

    fn send(socket: &mut UnixStream, message: &Value) -> std::io::Result<()> {
        let payload = serde_json::to_vec(message).unwrap();
        socket.write_all(&(payload.len() as u32).to_le_bytes())?;
        socket.write_all(&payload)
    }

    fn recv(socket: &mut UnixStream) -> std::io::Result<Value> {
        let mut header = [0u8; 4];
        socket.read_exact(&mut header)?;
        let mut payload = vec![0u8; u32::from_le_bytes(header) as usize];
        socket.read_exact(&mut payload)?;
        Ok(serde_json::from_slice(&payload).unwrap())
    }

    /// Fake Wayfire: the watch connection gets `events` and is then closed;
    /// request connections are answered until the client hangs up.
    fn fake_wayfire(events: Vec<Value>) -> (tempfile::TempDir, PathBuf) {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("wayfire.sock");
        let listener = UnixListener::bind(&path).unwrap();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut socket) = stream else { break };
                let events = events.clone();
                thread::spawn(move || {
                    while let Ok(request) = recv(&mut socket) {
                        match request["method"].as_str() {
                            Some("window-rules/events/watch") => {
                                let _ = send(&mut socket, &json!({"result": "ok"}));
                                for event in &events {
                                    let _ = send(&mut socket, event);
                                }
                                return;
                            }
                            Some("window-rules/list-views") => {
                                let _ = send(&mut socket, &json!([{"id": 4}, {"id": 9}]));
                            }
                            Some("window-rules/view-info") => {
                                let view = json!({"info": {
                                    "id": 4,
                                    "geometry": {"x": 0, "y": 0, "width": 300, "height": 200}
                                }});
                                let _ = send(&mut socket, &view);
                            }
                            _ => {
                                let _ = send(&mut socket, &json!({"error": "unsupported"}));
                            }
                        }
                    }
                });
            }
        });

        (temp_dir, path)
    }

    #[test]
    fn test_disconnected_facade_returns_none() {
        let facade = CompositorFacade::new(&CompositorConfig::default());
        assert_eq!(facade.state(), ConnectionState::Unknown);
        assert!(!facade.is_connected());
        assert_eq!(facade.list_views(), None);
        assert_eq!(facade.get_focused_view(), None);
        assert!(!facade.set_focus(1));
        assert_eq!(facade.read_next_event(), None);
    }

    #[test]
    fn test_reconnect_failure_marks_disconnected() {
        let facade = CompositorFacade::with_endpoint(
            &CompositorConfig::default(),
            BackendKind::Wayfire,
            PathBuf::from("/nonexistent/wayfire.sock"),
        );

        let result = facade.reconnect();
        assert!(
            matches!(result, Err(CompositorError::ConnectionFailed { .. })),
            "Expected ConnectionFailed, got: {:?}",
            result
        );
        assert_eq!(facade.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connect_query_and_read_events() {
        let (_dir, path) = fake_wayfire(vec![json!({"event": "view-focused", "view": {"id": 4}})]);
        let facade =
            CompositorFacade::with_endpoint(&CompositorConfig::default(), BackendKind::Wayfire, path);

        facade.reconnect().unwrap();
        assert!(facade.is_connected());
        assert_eq!(facade.backend_kind(), Some(BackendKind::Wayfire));
        assert_eq!(facade.list_ids(), Some(vec![4, 9]));

        let event = facade.read_next_event().unwrap();
        assert_eq!(event["event"], "view-focused");

        // The fake closes the watch socket after its scripted events
        assert_eq!(facade.read_next_event(), None);
        assert_eq!(facade.state(), ConnectionState::Disconnected);
        assert_eq!(facade.list_views(), None);
    }

    #[test]
    fn test_compositor_error_keeps_connection() {
        let (_dir, path) = fake_wayfire(vec![]);
        let facade =
            CompositorFacade::with_endpoint(&CompositorConfig::default(), BackendKind::Wayfire, path);

        facade.reconnect().unwrap();
        assert!(!facade.close_view(3));
        assert!(facade.is_connected());
    }

    #[test]
    fn test_close_disconnects() {
        let (_dir, path) = fake_wayfire(vec![]);
        let facade =
            CompositorFacade::with_endpoint(&CompositorConfig::default(), BackendKind::Wayfire, path);

        facade.reconnect().unwrap();
        facade.close();
        assert_eq!(facade.state(), ConnectionState::Disconnected);
        assert_eq!(facade.list_ids(), None);
    }

    #[test]
    fn test_view_state_operations_absorb_refusals() {
        let (_dir, path) = fake_wayfire(vec![]);
        let facade =
            CompositorFacade::with_endpoint(&CompositorConfig::default(), BackendKind::Wayfire, path);

        assert_eq!(facade.get_view_geometry(4), None);
        facade.reconnect().unwrap();

        let geometry = facade.get_view_geometry(4).unwrap();
        assert_eq!(geometry["width"], 300);

        assert!(!facade.set_view_minimized(4, true));
        assert!(!facade.set_view_fullscreen(4, true));
        assert!(!facade.set_workspace(1, 0, None));
        assert_eq!(facade.get_current_workspace(), None);
        assert_eq!(facade.get_output(1), None);
        assert!(facade.is_connected());
    }
}
