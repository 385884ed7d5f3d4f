//! Blocking client for the daemon socket

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use miette::{miette, IntoDiagnostic, Result, WrapErr};
use serde_json::{json, Value};

pub struct BridgeClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl BridgeClient {
    pub fn connect(socket_path: &Path) -> Result<Self> {
        tracing::debug!("Connecting to {}", socket_path.display());
        let writer = UnixStream::connect(socket_path)
            .into_diagnostic()
            .wrap_err_with(|| {
                format!(
                    "Could not connect to panel-bridge at {} (is panel-bridged running?)",
                    socket_path.display()
                )
            })?;
        let reader = BufReader::new(writer.try_clone().into_diagnostic()?);
        Ok(Self { reader, writer })
    }

    /// Read the next JSON line; `None` on EOF
    pub fn next_message(&mut self) -> Result<Option<Value>> {
        let mut line = String::new();
        loop {
            line.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .into_diagnostic()
                .wrap_err("Failed to read from daemon")?;
            if bytes_read == 0 {
                return Ok(None);
            }
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(line.trim())
                .into_diagnostic()
                .wrap_err("Daemon sent invalid JSON")
                .map(Some);
        }
    }

    /// Send a command and wait for its reply
    ///
    /// Events broadcast while waiting are skipped; replies are the messages
    /// carrying a `status`.
    pub fn request(&mut self, command: &str, args: Vec<Value>) -> Result<Value> {
        let mut line = serde_json::to_vec(&json!({ "command": command, "args": args }))
            .into_diagnostic()?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .and_then(|_| self.writer.flush())
            .into_diagnostic()
            .wrap_err("Failed to send request")?;

        while let Some(message) = self.next_message()? {
            if message.get("status").is_some() {
                return Ok(message);
            }
        }
        Err(miette!("Daemon closed the connection before replying"))
    }
}

/// Command-line arguments are JSON when they parse as JSON, strings otherwise
pub fn parse_arg(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}

/// Turn an error reply into an error
pub fn check_reply(reply: Value) -> Result<Value> {
    if reply.get("status").and_then(Value::as_str) == Some("error") {
        let message = reply
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(miette!("{}", message));
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("42"), json!(42));
        assert_eq!(parse_arg("true"), json!(true));
        assert_eq!(parse_arg(r#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(parse_arg("firefox"), json!("firefox"));
        assert_eq!(parse_arg(r#""quoted""#), json!("quoted"));
    }

    #[test]
    fn test_check_reply() {
        assert!(check_reply(json!({"status": "ok"})).is_ok());
        let err = check_reply(json!({"status": "error", "message": "Unknown command: x"})).unwrap_err();
        assert_eq!(err.to_string(), "Unknown command: x");
    }

    #[test]
    fn test_request_skips_broadcast_events() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("bridge.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(socket.try_clone().unwrap());
            let mut request = String::new();
            reader.read_line(&mut request).unwrap();
            socket
                .write_all(b"{\"event\":\"view-focused\",\"view\":{\"id\":1}}\n")
                .unwrap();
            socket.write_all(b"{\"status\":\"ok\",\"pong\":true}\n").unwrap();
            request
        });

        let mut client = BridgeClient::connect(&path).unwrap();
        let reply = client.request("ping", vec![]).unwrap();
        assert_eq!(reply, json!({"status": "ok", "pong": true}));

        let request: Value = serde_json::from_str(&server.join().unwrap()).unwrap();
        assert_eq!(request, json!({"command": "ping", "args": []}));
    }

    #[test]
    fn test_connect_failure_is_reported() {
        let result = BridgeClient::connect(Path::new("/nonexistent/panel-bridge.sock"));
        assert!(result.is_err());
    }
}
