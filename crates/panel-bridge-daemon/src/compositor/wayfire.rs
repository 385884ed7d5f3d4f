//! Wayfire IPC backend
//!
//! Wayfire's `ipc` plugin speaks length-prefixed JSON: every message is a
//! 4-byte little-endian length followed by that many bytes of JSON.
//! Requests have the shape `{"method": "...", "data": {...}}`; replies are
//! arbitrary JSON values, with failures reported as `{"error": "..."}`.
//!
//! Once `window-rules/events/watch` has been sent on a connection, the
//! compositor pushes every event on it as a JSON object carrying an `event`
//! key. The watch therefore runs on its own connection.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, trace};

use super::{connect_socket, receive_error, CompositorError, CompositorOps, EventSource};

/// Refuse frames larger than this; a bigger header means a desynced stream
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Write one length-prefixed JSON frame
fn write_frame(socket: &mut UnixStream, message: &Value) -> Result<(), CompositorError> {
    let payload = serde_json::to_vec(message).map_err(CompositorError::SerializeFailed)?;
    let len = u32::try_from(payload.len()).map_err(|_| CompositorError::MalformedFrame {
        message: format!("request of {} bytes is too large", payload.len()),
    })?;

    socket
        .write_all(&len.to_le_bytes())
        .and_then(|_| socket.write_all(&payload))
        .and_then(|_| socket.flush())
        .map_err(CompositorError::SendFailed)
}

/// Read one length-prefixed JSON frame
fn read_frame(socket: &mut UnixStream) -> Result<Value, CompositorError> {
    let mut header = [0u8; 4];
    socket.read_exact(&mut header).map_err(receive_error)?;

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CompositorError::MalformedFrame {
            message: format!("frame length {} exceeds limit", len),
        });
    }

    let mut payload = vec![0u8; len];
    socket.read_exact(&mut payload).map_err(receive_error)?;

    serde_json::from_slice(&payload).map_err(CompositorError::DeserializeFailed)
}

fn check_error(reply: Value) -> Result<Value, CompositorError> {
    if let Some(message) = reply.get("error") {
        return Err(CompositorError::Compositor {
            message: message
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| message.to_string()),
        });
    }
    Ok(reply)
}

/// Request connection to Wayfire
#[derive(Debug)]
pub struct WayfireAdapter {
    socket: UnixStream,
    socket_path: PathBuf,
}

impl WayfireAdapter {
    pub fn connect(socket_path: &Path, timeout: Duration) -> Result<Self, CompositorError> {
        let socket = connect_socket(socket_path, Some(timeout))?;
        debug!(path = %socket_path.display(), "Connected to Wayfire IPC");
        Ok(Self {
            socket,
            socket_path: socket_path.to_path_buf(),
        })
    }

    /// Send one method call and wait for its reply
    fn call(&mut self, method: &str, data: Value) -> Result<Value, CompositorError> {
        trace!(method, "Wayfire request");
        write_frame(&mut self.socket, &json!({ "method": method, "data": data }))?;

        loop {
            let reply = read_frame(&mut self.socket)?;
            // A stray event on the request socket is not the reply we are waiting for
            if reply.get("event").is_some() {
                continue;
            }
            return check_error(reply);
        }
    }

    /// Subscribe a fresh connection to all compositor events
    pub fn watch(&self) -> Result<WayfireEvents, CompositorError> {
        let mut socket = connect_socket(&self.socket_path, None)?;
        write_frame(
            &mut socket,
            &json!({ "method": "window-rules/events/watch", "data": {} }),
        )?;
        check_error(read_frame(&mut socket)?)?;
        debug!("Wayfire event watch established");
        Ok(WayfireEvents { socket })
    }

    pub fn close(&mut self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

/// `{"info": {...}}` replies carry their payload under `info`
fn take_info(reply: Value) -> Option<Value> {
    match reply {
        Value::Object(mut map) => map.remove("info").filter(|info| !info.is_null()),
        _ => None,
    }
}

fn into_list(reply: Value, request: &'static str) -> Result<Vec<Value>, CompositorError> {
    match reply {
        Value::Array(items) => Ok(items),
        _ => Err(CompositorError::UnexpectedReply { request }),
    }
}

impl CompositorOps for WayfireAdapter {
    fn get_view(&mut self, view_id: u64) -> Result<Option<Value>, CompositorError> {
        match self.call("window-rules/view-info", json!({ "id": view_id })) {
            Ok(reply) => Ok(take_info(reply)),
            // Wayfire reports an unknown id as an error reply
            Err(CompositorError::Compositor { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list_views(&mut self) -> Result<Vec<Value>, CompositorError> {
        let reply = self.call("window-rules/list-views", json!({}))?;
        into_list(reply, "window-rules/list-views")
    }

    fn get_focused_view(&mut self) -> Result<Option<Value>, CompositorError> {
        let reply = self.call("window-rules/get-focused-view", json!({}))?;
        Ok(take_info(reply))
    }

    fn list_outputs(&mut self) -> Result<Vec<Value>, CompositorError> {
        let reply = self.call("window-rules/list-outputs", json!({}))?;
        into_list(reply, "window-rules/list-outputs")
    }

    fn get_focused_output(&mut self) -> Result<Option<Value>, CompositorError> {
        let reply = self.call("window-rules/get-focused-output", json!({}))?;
        Ok(take_info(reply))
    }

    fn set_focus(&mut self, view_id: u64) -> Result<(), CompositorError> {
        self.call("window-rules/focus-view", json!({ "id": view_id }))
            .map(|_| ())
    }

    fn close_view(&mut self, view_id: u64) -> Result<(), CompositorError> {
        self.call("window-rules/close-view", json!({ "id": view_id }))
            .map(|_| ())
    }

    fn get_output(&mut self, output_id: u64) -> Result<Option<Value>, CompositorError> {
        match self.call("window-rules/output-info", json!({ "id": output_id })) {
            Ok(reply) if reply.get("info").is_some() => Ok(take_info(reply)),
            Ok(reply) => Ok(Some(reply)),
            Err(CompositorError::Compositor { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn get_current_workspace(&mut self) -> Result<Option<Value>, CompositorError> {
        Ok(self
            .get_focused_output()?
            .and_then(|mut output| output.get_mut("workspace").map(Value::take)))
    }

    fn set_workspace(
        &mut self,
        x: u32,
        y: u32,
        view_id: Option<u64>,
    ) -> Result<(), CompositorError> {
        let output_id = self
            .get_focused_output()?
            .as_ref()
            .and_then(super::view_id)
            .ok_or(CompositorError::UnexpectedReply {
                request: "window-rules/get-focused-output",
            })?;

        let mut data = json!({ "x": x, "y": y, "output-id": output_id });
        if let Some(view_id) = view_id {
            data["view-id"] = json!(view_id);
        }
        self.call("vswitch/set-workspace", data).map(|_| ())
    }

    fn get_view_geometry(&mut self, view_id: u64) -> Result<Option<Value>, CompositorError> {
        Ok(self
            .get_view(view_id)?
            .and_then(|mut view| view.get_mut("geometry").map(Value::take)))
    }

    fn set_view_minimized(&mut self, view_id: u64, state: bool) -> Result<(), CompositorError> {
        self.call(
            "wm-actions/set-minimized",
            json!({ "view_id": view_id, "state": state }),
        )
        .map(|_| ())
    }

    fn set_view_fullscreen(&mut self, view_id: u64, state: bool) -> Result<(), CompositorError> {
        self.call(
            "wm-actions/set-fullscreen",
            json!({ "view_id": view_id, "state": state }),
        )
        .map(|_| ())
    }
}

/// Watch connection to Wayfire; yields events as-is
#[derive(Debug)]
pub struct WayfireEvents {
    socket: UnixStream,
}

impl EventSource for WayfireEvents {
    fn read_next_event(&mut self) -> Result<Value, CompositorError> {
        loop {
            let message = read_frame(&mut self.socket)?;
            if message.get("event").is_some() {
                return Ok(message);
            }
            trace!(?message, "Ignoring non-event message on Wayfire watch socket");
        }
    }
}
