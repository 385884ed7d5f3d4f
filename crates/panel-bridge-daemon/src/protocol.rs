//! Command/response protocol
//!
//! Clients send one JSON object per line: `{"command": "name", "args": [...]}`.
//! Every request carrying a `command` gets exactly one reply object with a
//! `status` of `"ok"` or `"error"`.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::registry::CommandRegistry;

pub const INVALID_JSON: &str = "Invalid JSON format.";
pub const INVALID_REQUEST: &str = "Invalid request format.";
pub const INVALID_HANDLER_REPLY: &str = "Server error: Handler did not return valid format.";
pub const REQUEST_TOO_LONG: &str = "Request too long.";

/// A parsed client request
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub command: String,
    pub args: Vec<Value>,
}

/// What one input line asks the server to do
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// Blank line or a request without `command`; nothing is sent back
    Ignore,
    /// A protocol error reply to send as-is
    Reject(Value),
    Command(CommandRequest),
}

pub fn error_reply(message: &str) -> Value {
    json!({ "status": "error", "message": message })
}

fn command_error(command: &str, message: impl Into<String>) -> Value {
    json!({ "status": "error", "command": command, "message": message.into() })
}

/// Parse one raw request line
///
/// Bytes that are not UTF-8 are malformed JSON like any other.
pub fn parse_line(line: &[u8]) -> ParsedLine {
    let line = line.trim_ascii();
    if line.is_empty() {
        return ParsedLine::Ignore;
    }

    let request: Value = match serde_json::from_slice(line) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Malformed client request");
            return ParsedLine::Reject(error_reply(INVALID_JSON));
        }
    };

    let Value::Object(mut request) = request else {
        return ParsedLine::Reject(error_reply(INVALID_REQUEST));
    };

    let command = match request.remove("command") {
        None | Some(Value::Null) => return ParsedLine::Ignore,
        Some(Value::String(command)) => command,
        Some(_) => return ParsedLine::Reject(error_reply(INVALID_REQUEST)),
    };

    // A single non-list argument is treated as a one-element list
    let args = match request.remove("args") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(args)) => args,
        Some(arg) => vec![arg],
    };

    ParsedLine::Command(CommandRequest { command, args })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Run a command handler, turning every failure into an error reply
pub async fn dispatch(commands: &CommandRegistry, request: CommandRequest) -> Value {
    let CommandRequest { command, args } = request;

    let Some(handler) = commands.get(&command) else {
        debug!(command = %command, "Unknown command");
        return command_error(&command, format!("Unknown command: {}", command));
    };

    debug!(command = %command, args = args.len(), "Dispatching command");

    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(args))) {
        Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
        Err(panic) => Err(panic),
    };

    match outcome {
        Ok(Ok(reply @ Value::Object(_))) => reply,
        Ok(Ok(other)) => {
            warn!(command = %command, reply = %other, "Handler returned a non-object reply");
            command_error(&command, INVALID_HANDLER_REPLY)
        }
        Ok(Err(e)) => {
            warn!(command = %command, error = %e, "Command handler failed");
            command_error(&command, format!("Handler error: {}", e))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(command = %command, panic = %message, "Command handler panicked");
            command_error(&command, format!("Handler error: {}", message))
        }
    }
}

/// Process one input line; `None` means no reply is sent
pub async fn handle_line(commands: &CommandRegistry, line: &[u8]) -> Option<Value> {
    match parse_line(line) {
        ParsedLine::Ignore => None,
        ParsedLine::Reject(reply) => Some(reply),
        ParsedLine::Command(request) => Some(dispatch(commands, request).await),
    }
}
