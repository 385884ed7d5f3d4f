//! niri IPC backend
//!
//! niri exposes a Unix socket at `$NIRI_SOCKET`. Clients send a JSON
//! `Request` (one per line) and receive a JSON `Reply`. niri answers a single
//! request per connection, so every data operation dials a fresh socket.
//!
//! For event streaming, `Request::EventStream` is sent on a dedicated
//! connection; after the initial `Ok(Handled)` reply the socket only carries
//! events, one JSON object per line.

use std::io::{BufRead, BufReader, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, trace};

use super::{connect_socket, CompositorError, CompositorOps, EventSource};

/// Send one request on an already-connected socket and read the reply
fn exchange(
    socket: &mut UnixStream,
    reader: &mut BufReader<UnixStream>,
    request: &niri_ipc::Request,
) -> Result<niri_ipc::Response, CompositorError> {
    let request_json = serde_json::to_string(request).map_err(CompositorError::SerializeFailed)?;

    socket
        .write_all(request_json.as_bytes())
        .and_then(|_| socket.write_all(b"\n"))
        .and_then(|_| socket.flush())
        .map_err(CompositorError::SendFailed)?;

    let mut response_line = String::new();
    let bytes_read = reader
        .read_line(&mut response_line)
        .map_err(CompositorError::ReceiveFailed)?;

    if bytes_read == 0 {
        return Err(CompositorError::ConnectionClosed);
    }

    let reply: niri_ipc::Reply =
        serde_json::from_str(&response_line).map_err(CompositorError::DeserializeFailed)?;

    reply.map_err(|message| CompositorError::Compositor { message })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, CompositorError> {
    serde_json::to_value(value).map_err(CompositorError::SerializeFailed)
}

/// Request side of a niri connection
#[derive(Debug)]
pub struct NiriAdapter {
    socket_path: PathBuf,
    timeout: Duration,
    closed: bool,
}

impl NiriAdapter {
    /// Verify niri is reachable and remember where it lives
    pub fn connect(socket_path: &Path, timeout: Duration) -> Result<Self, CompositorError> {
        let mut adapter = Self {
            socket_path: socket_path.to_path_buf(),
            timeout,
            closed: false,
        };

        match adapter.send(niri_ipc::Request::Version)? {
            niri_ipc::Response::Version(version) => {
                debug!(path = %socket_path.display(), %version, "Connected to niri IPC");
            }
            _ => return Err(CompositorError::UnexpectedReply { request: "Version" }),
        }

        Ok(adapter)
    }

    fn send(&mut self, request: niri_ipc::Request) -> Result<niri_ipc::Response, CompositorError> {
        if self.closed {
            return Err(CompositorError::NotConnected);
        }

        trace!(?request, "niri request");
        let mut socket = connect_socket(&self.socket_path, Some(self.timeout))?;
        let read_half = socket.try_clone().map_err(CompositorError::ReceiveFailed)?;
        let mut reader = BufReader::new(read_half);
        exchange(&mut socket, &mut reader, &request)
    }

    fn windows(&mut self) -> Result<Vec<niri_ipc::Window>, CompositorError> {
        match self.send(niri_ipc::Request::Windows)? {
            niri_ipc::Response::Windows(windows) => Ok(windows),
            _ => Err(CompositorError::UnexpectedReply { request: "Windows" }),
        }
    }

    fn workspaces(&mut self) -> Result<Vec<niri_ipc::Workspace>, CompositorError> {
        match self.send(niri_ipc::Request::Workspaces)? {
            niri_ipc::Response::Workspaces(workspaces) => Ok(workspaces),
            _ => Err(CompositorError::UnexpectedReply { request: "Workspaces" }),
        }
    }

    fn action(&mut self, action: niri_ipc::Action) -> Result<(), CompositorError> {
        match self.send(niri_ipc::Request::Action(action))? {
            niri_ipc::Response::Handled => Ok(()),
            _ => Err(CompositorError::UnexpectedReply { request: "Action" }),
        }
    }

    /// Open a connection subscribed to niri's event stream
    pub fn watch(&self) -> Result<NiriEvents, CompositorError> {
        let mut socket = connect_socket(&self.socket_path, None)?;
        let read_half = socket.try_clone().map_err(CompositorError::ReceiveFailed)?;
        let mut reader = BufReader::new(read_half);

        match exchange(&mut socket, &mut reader, &niri_ipc::Request::EventStream)? {
            niri_ipc::Response::Handled => {}
            _ => return Err(CompositorError::UnexpectedReply { request: "EventStream" }),
        }

        debug!("niri event stream established");
        Ok(NiriEvents {
            reader,
            _socket: socket,
        })
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

impl CompositorOps for NiriAdapter {
    fn get_view(&mut self, view_id: u64) -> Result<Option<Value>, CompositorError> {
        self.windows()?
            .iter()
            .find(|window| window.id == view_id)
            .map(to_json)
            .transpose()
    }

    fn list_views(&mut self) -> Result<Vec<Value>, CompositorError> {
        self.windows()?.iter().map(to_json).collect()
    }

    fn get_focused_view(&mut self) -> Result<Option<Value>, CompositorError> {
        match self.send(niri_ipc::Request::FocusedWindow)? {
            niri_ipc::Response::FocusedWindow(window) => window.as_ref().map(to_json).transpose(),
            _ => Err(CompositorError::UnexpectedReply { request: "FocusedWindow" }),
        }
    }

    fn list_outputs(&mut self) -> Result<Vec<Value>, CompositorError> {
        match self.send(niri_ipc::Request::Outputs)? {
            niri_ipc::Response::Outputs(outputs) => {
                let mut names: Vec<_> = outputs.keys().cloned().collect();
                names.sort();
                names.iter().map(|name| to_json(&outputs[name])).collect()
            }
            _ => Err(CompositorError::UnexpectedReply { request: "Outputs" }),
        }
    }

    fn get_focused_output(&mut self) -> Result<Option<Value>, CompositorError> {
        match self.send(niri_ipc::Request::FocusedOutput)? {
            niri_ipc::Response::FocusedOutput(output) => output.as_ref().map(to_json).transpose(),
            _ => Err(CompositorError::UnexpectedReply { request: "FocusedOutput" }),
        }
    }

    fn set_focus(&mut self, view_id: u64) -> Result<(), CompositorError> {
        self.action(niri_ipc::Action::FocusWindow { id: view_id })
    }

    fn close_view(&mut self, view_id: u64) -> Result<(), CompositorError> {
        self.action(niri_ipc::Action::CloseWindow { id: Some(view_id) })
    }

    /// niri outputs carry no numeric id; they are addressed by their
    /// position in `list_outputs`
    fn get_output(&mut self, output_id: u64) -> Result<Option<Value>, CompositorError> {
        let outputs = self.list_outputs()?;
        Ok(usize::try_from(output_id)
            .ok()
            .and_then(|index| outputs.into_iter().nth(index)))
    }

    fn get_current_workspace(&mut self) -> Result<Option<Value>, CompositorError> {
        self.workspaces()?
            .iter()
            .find(|workspace| workspace.is_focused)
            .map(to_json)
            .transpose()
    }

    /// niri stacks workspaces in one column: row `y` is workspace index `y + 1`
    fn set_workspace(
        &mut self,
        x: u32,
        y: u32,
        view_id: Option<u64>,
    ) -> Result<(), CompositorError> {
        if x != 0 {
            return Err(CompositorError::InvalidRequest {
                message: format!("niri workspaces have a single column, got column {}", x),
            });
        }
        let index = y
            .checked_add(1)
            .and_then(|index| u8::try_from(index).ok())
            .ok_or_else(|| CompositorError::InvalidRequest {
                message: format!("workspace row {} is out of range", y),
            })?;
        let reference = niri_ipc::WorkspaceReferenceArg::Index(index);

        match view_id {
            Some(id) => self.action(niri_ipc::Action::MoveWindowToWorkspace {
                window_id: Some(id),
                reference,
                focus: true,
            }),
            None => self.action(niri_ipc::Action::FocusWorkspace { reference }),
        }
    }

    /// Window geometry in workspace view coordinates; `x`/`y` are null
    /// while the window is off screen
    fn get_view_geometry(&mut self, view_id: u64) -> Result<Option<Value>, CompositorError> {
        let windows = self.windows()?;
        let Some(window) = windows.iter().find(|window| window.id == view_id) else {
            return Ok(None);
        };

        let layout = &window.layout;
        let (offset_x, offset_y) = layout.window_offset_in_tile;
        let (width, height) = layout.window_size;
        let position = layout
            .tile_pos_in_workspace_view
            .map(|(x, y)| (x + offset_x, y + offset_y));

        Ok(Some(json!({
            "x": position.map(|(x, _)| x),
            "y": position.map(|(_, y)| y),
            "width": width,
            "height": height,
        })))
    }

    fn set_view_minimized(&mut self, _view_id: u64, _state: bool) -> Result<(), CompositorError> {
        Err(CompositorError::Unsupported {
            backend: "niri",
            operation: "set_view_minimized",
        })
    }

    /// niri only offers a fullscreen toggle and does not report the current
    /// state, so an absolute set cannot be expressed
    fn set_view_fullscreen(&mut self, _view_id: u64, _state: bool) -> Result<(), CompositorError> {
        Err(CompositorError::Unsupported {
            backend: "niri",
            operation: "set_view_fullscreen",
        })
    }
}

/// Event stream connection to niri
///
/// Events are kept as raw JSON (`{"WindowFocusChanged": {"id": 7}}`) so that
/// event kinds added by newer niri releases still flow through.
#[derive(Debug)]
pub struct NiriEvents {
    reader: BufReader<UnixStream>,
    _socket: UnixStream,
}

impl EventSource for NiriEvents {
    fn read_next_event(&mut self) -> Result<Value, CompositorError> {
        let mut line = String::new();

        let bytes_read = self
            .reader
            .read_line(&mut line)
            .map_err(CompositorError::ReceiveFailed)?;

        if bytes_read == 0 {
            return Err(CompositorError::ConnectionClosed);
        }

        serde_json::from_str(&line).map_err(CompositorError::DeserializeFailed)
    }
}

impl Drop for NiriEvents {
    fn drop(&mut self) {
        let _ = self._socket.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;

    /// Fake niri serving `connections` single-request connections
    fn fake_niri(
        connections: usize,
        respond: fn(&str) -> String,
    ) -> (tempfile::TempDir, PathBuf, thread::JoinHandle<Vec<String>>) {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("niri.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for _ in 0..connections {
                let (mut socket, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(socket.try_clone().unwrap());
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let reply = respond(line.trim());
                socket.write_all(reply.as_bytes()).unwrap();
                socket.write_all(b"\n").unwrap();
                requests.push(line.trim().to_string());
            }
            requests
        });

        (temp_dir, path, handle)
    }

    #[test]
    fn test_connect_checks_version() {
        let (_dir, path, server) = fake_niri(1, |_| r#"{"Ok":{"Version":"25.08"}}"#.to_string());

        let adapter = NiriAdapter::connect(&path, Duration::from_secs(2));
        assert!(adapter.is_ok(), "connect failed: {:?}", adapter.err());

        let requests = server.join().unwrap();
        assert_eq!(requests, vec![r#""Version""#.to_string()]);
    }

    #[test]
    fn test_error_reply_is_compositor_error() {
        let (_dir, path, server) = fake_niri(2, |request| {
            if request.contains("Version") {
                r#"{"Ok":{"Version":"25.08"}}"#.to_string()
            } else {
                r#"{"Err":"window not found"}"#.to_string()
            }
        });

        let mut adapter = NiriAdapter::connect(&path, Duration::from_secs(2)).unwrap();
        match adapter.set_focus(42) {
            Err(CompositorError::Compositor { message }) => assert_eq!(message, "window not found"),
            other => panic!("Expected Compositor error, got: {:?}", other),
        }

        let requests = server.join().unwrap();
        assert!(requests[1].contains("FocusWindow"));
    }

    #[test]
    fn test_closed_adapter_refuses_requests() {
        let (_dir, path, server) = fake_niri(1, |_| r#"{"Ok":{"Version":"25.08"}}"#.to_string());

        let mut adapter = NiriAdapter::connect(&path, Duration::from_secs(2)).unwrap();
        server.join().unwrap();

        adapter.close();
        assert!(matches!(
            adapter.list_views(),
            Err(CompositorError::NotConnected)
        ));
    }

    #[test]
    fn test_event_stream_reads_lines() {
        let (mut compositor, client) = UnixStream::pair().unwrap();
        let mut events = NiriEvents {
            reader: BufReader::new(client.try_clone().unwrap()),
            _socket: client,
        };

        compositor
            .write_all(b"{\"WindowFocusChanged\":{\"id\":7}}\n")
            .unwrap();
        let event = events.read_next_event().unwrap();
        assert_eq!(event["WindowFocusChanged"]["id"], 7);

        drop(compositor);
        assert!(matches!(
            events.read_next_event(),
            Err(CompositorError::ConnectionClosed)
        ));
    }

    const VERSION_REPLY: &str = r#"{"Ok":{"Version":"25.11"}}"#;

    #[test]
    fn test_set_workspace_uses_one_based_index() {
        let (_dir, path, server) = fake_niri(3, |request| {
            if request.contains("Version") {
                VERSION_REPLY.to_string()
            } else {
                r#"{"Ok":"Handled"}"#.to_string()
            }
        });

        let mut adapter = NiriAdapter::connect(&path, Duration::from_secs(2)).unwrap();
        adapter.set_workspace(0, 2, None).unwrap();
        adapter.set_workspace(0, 0, Some(7)).unwrap();
        assert!(matches!(
            adapter.set_workspace(1, 0, None),
            Err(CompositorError::InvalidRequest { .. })
        ));
        assert!(matches!(
            adapter.set_workspace(0, 255, None),
            Err(CompositorError::InvalidRequest { .. })
        ));

        let requests = server.join().unwrap();
        assert!(requests[1].contains("FocusWorkspace"));
        assert!(requests[1].contains(r#"{"Index":3}"#));
        assert!(requests[2].contains("MoveWindowToWorkspace"));
        assert!(requests[2].contains(r#""window_id":7"#));
        assert!(requests[2].contains(r#"{"Index":1}"#));
    }

    #[test]
    fn test_geometry_and_current_workspace() {
        let (_dir, path, server) = fake_niri(4, |request| {
            if request.contains("Version") {
                VERSION_REPLY.to_string()
            } else if request.contains("Workspaces") {
                r#"{"Ok":{"Workspaces":[
                    {"id":1,"idx":1,"name":null,"output":"DP-1","is_urgent":false,"is_active":true,"is_focused":false,"active_window_id":null},
                    {"id":2,"idx":2,"name":"web","output":"DP-1","is_urgent":false,"is_active":false,"is_focused":true,"active_window_id":5}
                ]}}"#
                    .replace('\n', "")
            } else {
                r#"{"Ok":{"Windows":[
                    {"id":5,"title":"term","app_id":"foot","pid":100,"workspace_id":2,"is_focused":true,
                     "is_floating":false,"is_urgent":false,"layout":{"pos_in_scrolling_layout":[1,1],
                     "tile_size":[800.0,600.0],"window_size":[796,596],
                     "tile_pos_in_workspace_view":[10.0,20.0],"window_offset_in_tile":[2.0,2.0]}}
                ]}}"#
                    .replace('\n', "")
            }
        });

        let mut adapter = NiriAdapter::connect(&path, Duration::from_secs(2)).unwrap();
        let workspace = adapter.get_current_workspace().unwrap().unwrap();
        assert_eq!(workspace["name"], "web");

        let geometry = adapter.get_view_geometry(5).unwrap().unwrap();
        assert_eq!(geometry, json!({"x": 12.0, "y": 22.0, "width": 796, "height": 596}));
        assert_eq!(adapter.get_view_geometry(6).unwrap(), None);
        server.join().unwrap();
    }

    #[test]
    fn test_minimize_and_fullscreen_are_unsupported() {
        let (_dir, path, server) = fake_niri(1, |_| VERSION_REPLY.to_string());

        let mut adapter = NiriAdapter::connect(&path, Duration::from_secs(2)).unwrap();
        server.join().unwrap();

        assert!(matches!(
            adapter.set_view_minimized(5, true),
            Err(CompositorError::Unsupported { operation: "set_view_minimized", .. })
        ));
        assert!(matches!(
            adapter.set_view_fullscreen(5, true),
            Err(CompositorError::Unsupported { operation: "set_view_fullscreen", .. })
        ));
    }
}
