//! Sway IPC backend (i3-ipc protocol)
//!
//! Every message is framed as `"i3-ipc"` + u32 payload length + u32 message
//! type (both native endian) followed by a JSON payload. Event messages have
//! the high bit of the type set.
//!
//! Sway has no flat view list: views are the leaf containers of the layout
//! tree (`GET_TREE`) that belong to a client, i.e. carry a `pid`.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace};

use super::{connect_socket, receive_error, CompositorError, CompositorOps, EventSource};

const MAGIC: &[u8; 6] = b"i3-ipc";
const HEADER_LEN: usize = 14;
const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

const RUN_COMMAND: u32 = 0;
const GET_WORKSPACES: u32 = 1;
const SUBSCRIBE: u32 = 2;
const GET_OUTPUTS: u32 = 3;
const GET_TREE: u32 = 4;

/// Set on the message type of every event
const EVENT_BIT: u32 = 0x8000_0000;

/// Event families the bridge subscribes to
const SUBSCRIBED_EVENTS: [&str; 3] = ["window", "workspace", "output"];

fn write_message(socket: &mut UnixStream, kind: u32, payload: &[u8]) -> Result<(), CompositorError> {
    let len = u32::try_from(payload.len()).map_err(|_| CompositorError::MalformedFrame {
        message: format!("request of {} bytes is too large", payload.len()),
    })?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(MAGIC);
    frame.extend_from_slice(&len.to_ne_bytes());
    frame.extend_from_slice(&kind.to_ne_bytes());
    frame.extend_from_slice(payload);

    socket
        .write_all(&frame)
        .and_then(|_| socket.flush())
        .map_err(CompositorError::SendFailed)
}

/// Read one frame, leaving the payload undecoded
fn read_frame(socket: &mut UnixStream) -> Result<(u32, Vec<u8>), CompositorError> {
    let mut header = [0u8; HEADER_LEN];
    socket.read_exact(&mut header).map_err(receive_error)?;

    if &header[..6] != MAGIC {
        return Err(CompositorError::MalformedFrame {
            message: "missing i3-ipc magic".to_string(),
        });
    }

    let len = u32::from_ne_bytes([header[6], header[7], header[8], header[9]]) as usize;
    let kind = u32::from_ne_bytes([header[10], header[11], header[12], header[13]]);

    if len > MAX_PAYLOAD_LEN {
        return Err(CompositorError::MalformedFrame {
            message: format!("payload length {} exceeds limit", len),
        });
    }

    let mut payload = vec![0u8; len];
    socket.read_exact(&mut payload).map_err(receive_error)?;
    Ok((kind, payload))
}

/// Read one frame and decode its JSON payload
fn read_message(socket: &mut UnixStream) -> Result<(u32, Value), CompositorError> {
    let (kind, payload) = read_frame(socket)?;
    let value = serde_json::from_slice(&payload).map_err(CompositorError::DeserializeFailed)?;
    Ok((kind, value))
}

/// Request connection to Sway
#[derive(Debug)]
pub struct SwayAdapter {
    socket: UnixStream,
    socket_path: PathBuf,
}

impl SwayAdapter {
    pub fn connect(socket_path: &Path, timeout: Duration) -> Result<Self, CompositorError> {
        let socket = connect_socket(socket_path, Some(timeout))?;
        debug!(path = %socket_path.display(), "Connected to Sway IPC");
        Ok(Self {
            socket,
            socket_path: socket_path.to_path_buf(),
        })
    }

    fn call(&mut self, kind: u32, payload: &str) -> Result<Value, CompositorError> {
        trace!(kind, payload, "Sway request");
        write_message(&mut self.socket, kind, payload.as_bytes())?;

        loop {
            let (reply_kind, reply) = read_message(&mut self.socket)?;
            if reply_kind & EVENT_BIT != 0 {
                continue;
            }
            if reply_kind != kind {
                return Err(CompositorError::MalformedFrame {
                    message: format!("reply type {} does not match request type {}", reply_kind, kind),
                });
            }
            return Ok(reply);
        }
    }

    /// Run a sway command and check every per-command result
    fn run_command(&mut self, command: &str) -> Result<(), CompositorError> {
        let reply = self.call(RUN_COMMAND, command)?;
        let results = reply
            .as_array()
            .ok_or(CompositorError::UnexpectedReply { request: "RUN_COMMAND" })?;

        for result in results {
            if result.get("success").and_then(Value::as_bool) != Some(true) {
                let message = result
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("command failed")
                    .to_string();
                return Err(CompositorError::Compositor { message });
            }
        }
        Ok(())
    }

    fn tree(&mut self) -> Result<Value, CompositorError> {
        self.call(GET_TREE, "")
    }

    /// Subscribe a fresh connection to window, workspace and output events
    pub fn watch(&self) -> Result<SwayEvents, CompositorError> {
        let mut socket = connect_socket(&self.socket_path, None)?;
        let payload = serde_json::to_vec(&SUBSCRIBED_EVENTS).map_err(CompositorError::SerializeFailed)?;
        write_message(&mut socket, SUBSCRIBE, &payload)?;

        let (_, reply) = read_message(&mut socket)?;
        if reply.get("success").and_then(Value::as_bool) != Some(true) {
            return Err(CompositorError::Compositor {
                message: format!("subscribe rejected: {}", reply),
            });
        }

        debug!(events = ?SUBSCRIBED_EVENTS, "Sway event subscription established");
        Ok(SwayEvents { socket })
    }

    pub fn close(&mut self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

/// A tree node is a view when it is a (floating) container owned by a client
fn is_view(node: &Value) -> bool {
    let kind = node.get("type").and_then(Value::as_str);
    matches!(kind, Some("con") | Some("floating_con"))
        && node.get("pid").map_or(false, |pid| !pid.is_null())
}

/// Collect every view in the tree, depth first
fn collect_views(node: &Value, views: &mut Vec<Value>) {
    if is_view(node) {
        views.push(node.clone());
    }
    for key in ["nodes", "floating_nodes"] {
        if let Some(children) = node.get(key).and_then(Value::as_array) {
            for child in children {
                collect_views(child, views);
            }
        }
    }
}

fn views_in(tree: &Value) -> Vec<Value> {
    let mut views = Vec::new();
    collect_views(tree, &mut views);
    views
}

impl CompositorOps for SwayAdapter {
    fn get_view(&mut self, view_id: u64) -> Result<Option<Value>, CompositorError> {
        let tree = self.tree()?;
        Ok(views_in(&tree)
            .into_iter()
            .find(|view| super::view_id(view) == Some(view_id)))
    }

    fn list_views(&mut self) -> Result<Vec<Value>, CompositorError> {
        let tree = self.tree()?;
        Ok(views_in(&tree))
    }

    fn get_focused_view(&mut self) -> Result<Option<Value>, CompositorError> {
        let tree = self.tree()?;
        Ok(views_in(&tree)
            .into_iter()
            .find(|view| view.get("focused").and_then(Value::as_bool) == Some(true)))
    }

    fn list_outputs(&mut self) -> Result<Vec<Value>, CompositorError> {
        match self.call(GET_OUTPUTS, "")? {
            Value::Array(outputs) => Ok(outputs),
            _ => Err(CompositorError::UnexpectedReply { request: "GET_OUTPUTS" }),
        }
    }

    fn get_focused_output(&mut self) -> Result<Option<Value>, CompositorError> {
        Ok(self
            .list_outputs()?
            .into_iter()
            .find(|output| output.get("focused").and_then(Value::as_bool) == Some(true)))
    }

    fn set_focus(&mut self, view_id: u64) -> Result<(), CompositorError> {
        self.run_command(&format!("[con_id={}] focus", view_id))
    }

    fn close_view(&mut self, view_id: u64) -> Result<(), CompositorError> {
        self.run_command(&format!("[con_id={}] kill", view_id))
    }

    fn get_output(&mut self, output_id: u64) -> Result<Option<Value>, CompositorError> {
        Ok(self
            .list_outputs()?
            .into_iter()
            .find(|output| super::view_id(output) == Some(output_id)))
    }

    fn get_current_workspace(&mut self) -> Result<Option<Value>, CompositorError> {
        match self.call(GET_WORKSPACES, "")? {
            Value::Array(workspaces) => Ok(workspaces
                .into_iter()
                .find(|ws| ws.get("focused").and_then(Value::as_bool) == Some(true))),
            _ => Err(CompositorError::UnexpectedReply { request: "GET_WORKSPACES" }),
        }
    }

    /// Sway workspaces form a single row: column `x` is workspace number `x + 1`
    fn set_workspace(
        &mut self,
        x: u32,
        y: u32,
        view_id: Option<u64>,
    ) -> Result<(), CompositorError> {
        if y != 0 {
            return Err(CompositorError::InvalidRequest {
                message: format!("sway workspaces have a single row, got row {}", y),
            });
        }

        let number = u64::from(x) + 1;
        let command = match view_id {
            Some(id) => format!(
                "[con_id={}] move container to workspace number {}; workspace number {}",
                id, number, number
            ),
            None => format!("workspace number {}", number),
        };
        self.run_command(&command)
    }

    fn get_view_geometry(&mut self, view_id: u64) -> Result<Option<Value>, CompositorError> {
        Ok(self
            .get_view(view_id)?
            .and_then(|mut view| view.get_mut("rect").map(Value::take)))
    }

    /// Minimized views live in the scratchpad
    fn set_view_minimized(&mut self, view_id: u64, state: bool) -> Result<(), CompositorError> {
        let action = if state { "move scratchpad" } else { "scratchpad show" };
        self.run_command(&format!("[con_id={}] {}", view_id, action))
    }

    fn set_view_fullscreen(&mut self, view_id: u64, state: bool) -> Result<(), CompositorError> {
        let mode = if state { "enable" } else { "disable" };
        self.run_command(&format!("[con_id={}] fullscreen {}", view_id, mode))
    }
}

/// Subscribed connection to Sway; yields raw event payloads
#[derive(Debug)]
pub struct SwayEvents {
    socket: UnixStream,
}

impl EventSource for SwayEvents {
    fn read_next_event(&mut self) -> Result<Value, CompositorError> {
        loop {
            let (kind, payload) = read_message(&mut self.socket)?;
            if kind & EVENT_BIT != 0 {
                return Ok(payload);
            }
            trace!(kind, "Ignoring reply on Sway event socket");
        }
    }
}
