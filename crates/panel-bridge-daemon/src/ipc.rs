//! IPC server for shell components
//!
//! Provides the Unix domain socket panels, widgets and the CLI connect to.
//! Each connection is both a command channel (request/response) and a
//! broadcast target for compositor events.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::context::BridgeContext;
use crate::distributor::encode_line;
use crate::protocol;

/// IPC server for shell communication via Unix domain socket
///
/// The socket is created at `$XDG_RUNTIME_DIR/<name>.sock` if available,
/// or falls back to `/tmp/<name>-$UID.sock` if XDG_RUNTIME_DIR is not set,
/// unless the configuration names an explicit path.
///
/// The socket file is automatically removed when the server is dropped.
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind the server at the given path
    ///
    /// This will:
    /// 1. Remove any existing socket file (stale from previous run)
    /// 2. Create and bind the UnixListener
    /// 3. Restrict the socket to the owning user
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - An existing socket file cannot be removed
    /// - The socket cannot be created or bound
    /// - The socket permissions cannot be set
    pub fn bind(socket_path: PathBuf) -> Result<Self> {
        info!("IPC socket path: {}", socket_path.display());

        if socket_path.exists() {
            debug!("Removing stale socket file: {}", socket_path.display());
            std::fs::remove_file(&socket_path).with_context(|| {
                format!("Failed to remove stale socket file: {}", socket_path.display())
            })?;
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to create IPC socket at {}", socket_path.display()))?;

        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| {
                format!("Failed to set permissions on {}", socket_path.display())
            })?;

        info!("IPC server listening on {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path,
        })
    }

    /// Accept an incoming connection
    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .context("Failed to accept IPC connection")?;

        debug!("Accepted IPC connection");

        Ok(stream)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections forever, running one session task per client
    pub async fn serve(self, ctx: Arc<BridgeContext>) -> Result<()> {
        loop {
            let stream = self.accept().await?;
            tokio::spawn(run_session(ctx.clone(), stream));
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!("Failed to remove IPC socket file on shutdown: {}", e);
            } else {
                debug!("Removed IPC socket file: {}", self.socket_path.display());
            }
        }
    }
}

/// Result of reading one request line
#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    /// `buf` holds the line, newline stripped
    Line,
    /// The line exceeded the limit; the rest of it is still unread
    TooLong,
    Eof,
}

/// Read one newline-terminated line into `buf` without buffering more than
/// `limit` bytes of it
async fn read_request_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = (&mut *reader)
        .take(limit as u64 + 1)
        .read_until(b'\n', buf)
        .await?;

    if read == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        return Ok(LineRead::Line);
    }
    if buf.len() > limit {
        buf.clear();
        return Ok(LineRead::TooLong);
    }
    // Final line of a stream that ended without a newline
    Ok(LineRead::Line)
}

/// Skip input up to and including the next newline
async fn discard_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|&byte| byte == b'\n') {
            Some(newline) => {
                reader.consume(newline + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

/// Serve one client until it disconnects
///
/// The client is registered for broadcasts before its first request is
/// read, and deregistered on EOF or the first read or write failure.
pub async fn run_session(ctx: Arc<BridgeContext>, stream: UnixStream) {
    let (read_half, write_half) = stream.into_split();
    let client = ctx.clients.register(Box::new(write_half));
    let client_id = client.id();

    let limit = ctx.config.server.max_request_bytes;
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        let read = match read_request_line(&mut reader, &mut line, limit).await {
            Ok(LineRead::Eof) => {
                debug!(client = client_id, "Client closed connection");
                break;
            }
            Ok(read) => read,
            Err(e) => {
                debug!(client = client_id, error = %e, "Client read failed");
                break;
            }
        };

        let reply = if read == LineRead::TooLong {
            warn!(client = client_id, limit, "Client request exceeds size limit");
            Some(protocol::error_reply(protocol::REQUEST_TOO_LONG))
        } else {
            protocol::handle_line(&ctx.commands, &line).await
        };

        if let Some(reply) = reply {
            // A failed broadcast may already have dropped this client
            if !ctx.clients.contains(client_id) {
                break;
            }

            match encode_line(&reply) {
                Ok(encoded) => {
                    if let Err(e) = client.send_line(&encoded).await {
                        debug!(client = client_id, error = %e, "Client write failed");
                        break;
                    }
                }
                Err(e) => {
                    warn!(client = client_id, error = %e, "Failed to serialize reply");
                }
            }
        }

        if read == LineRead::TooLong {
            if let Err(e) = discard_line(&mut reader).await {
                debug!(client = client_id, error = %e, "Client read failed");
                break;
            }
        }
    }

    ctx.clients.remove(client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ipc_server_creation_and_cleanup() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("panel-bridge.sock");

        let server = IpcServer::bind(socket_path.clone()).unwrap();
        assert_eq!(server.socket_path(), socket_path.as_path());
        assert!(socket_path.exists());

        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        drop(server);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_ipc_server_removes_stale_socket() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("panel-bridge.sock");

        std::fs::write(&socket_path, "stale").unwrap();
        assert!(socket_path.exists());

        let server = IpcServer::bind(socket_path.clone()).unwrap();
        assert!(socket_path.exists());

        drop(server);
    }

    #[tokio::test]
    async fn test_read_request_line_splits_lines() {
        let mut reader = BufReader::new(&b"first\n\nlast"[..]);
        let mut line = Vec::new();

        assert_eq!(read_request_line(&mut reader, &mut line, 64).await.unwrap(), LineRead::Line);
        assert_eq!(line, b"first");
        assert_eq!(read_request_line(&mut reader, &mut line, 64).await.unwrap(), LineRead::Line);
        assert!(line.is_empty());
        assert_eq!(read_request_line(&mut reader, &mut line, 64).await.unwrap(), LineRead::Line);
        assert_eq!(line, b"last");
        assert_eq!(read_request_line(&mut reader, &mut line, 64).await.unwrap(), LineRead::Eof);
    }

    #[tokio::test]
    async fn test_read_request_line_keeps_non_utf8_bytes() {
        let mut reader = BufReader::new(&b"\xff\xfe{}\n"[..]);
        let mut line = Vec::new();

        assert_eq!(read_request_line(&mut reader, &mut line, 64).await.unwrap(), LineRead::Line);
        assert_eq!(line, b"\xff\xfe{}");
    }

    #[tokio::test]
    async fn test_oversized_line_is_refused_and_skipped() {
        let input = [vec![b'x'; 100], b"\nnext\n".to_vec()].concat();
        let mut reader = BufReader::with_capacity(8, &input[..]);
        let mut line = Vec::new();

        assert_eq!(read_request_line(&mut reader, &mut line, 16).await.unwrap(), LineRead::TooLong);
        assert!(line.is_empty());
        discard_line(&mut reader).await.unwrap();

        assert_eq!(read_request_line(&mut reader, &mut line, 16).await.unwrap(), LineRead::Line);
        assert_eq!(line, b"next");
    }

    #[tokio::test]
    async fn test_line_at_limit_is_accepted() {
        let mut reader = BufReader::new(&b"0123456789abcdef\n"[..]);
        let mut line = Vec::new();

        assert_eq!(read_request_line(&mut reader, &mut line, 16).await.unwrap(), LineRead::Line);
        assert_eq!(line.len(), 16);
    }

    #[tokio::test]
    async fn test_ipc_server_accept_connection() {
        let temp_dir = TempDir::new().unwrap();
        let server = IpcServer::bind(temp_dir.path().join("panel-bridge.sock")).unwrap();
        let socket_path = server.socket_path().to_path_buf();

        let accept_handle = tokio::spawn(async move { server.accept().await.unwrap() });

        let _client = tokio::net::UnixStream::connect(&socket_path).await.unwrap();

        let _server_stream = accept_handle.await.unwrap();
    }
}
