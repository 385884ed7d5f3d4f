//! Shared harness: a bridge served over a real socket in a temp dir

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use panel_bridge::commands::register_builtin_commands;
use panel_bridge::compositor::CompositorFacade;
use panel_bridge::ipc::IpcServer;
use panel_bridge::BridgeContext;
use panel_bridge_config::Config;
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

pub const TIMEOUT: Duration = Duration::from_secs(2);

pub struct Bridge {
    pub ctx: Arc<BridgeContext>,
    server: JoinHandle<anyhow::Result<()>>,
    distributor: JoinHandle<()>,
    _dir: TempDir,
}

impl Bridge {
    pub async fn start() -> Self {
        Self::start_with(|config| CompositorFacade::new(&config.compositor)).await
    }

    pub async fn start_with(make_facade: impl FnOnce(&Config) -> CompositorFacade) -> Self {
        Self::launch(|_| {}, make_facade).await
    }

    /// Start without a compositor after adjusting the default config
    pub async fn start_configured(configure: impl FnOnce(&mut Config)) -> Self {
        Self::launch(configure, |config| CompositorFacade::new(&config.compositor)).await
    }

    async fn launch(
        configure: impl FnOnce(&mut Config),
        make_facade: impl FnOnce(&Config) -> CompositorFacade,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.socket_path = Some(dir.path().join("bridge.sock"));
        configure(&mut config);

        let facade = make_facade(&config);
        let ctx = BridgeContext::with_facade(config, facade);
        register_builtin_commands(&ctx);

        let server = IpcServer::bind(ctx.socket_path().to_path_buf()).unwrap();
        let server = tokio::spawn(server.serve(ctx.clone()));
        let distributor = tokio::spawn(ctx.distributor().run());

        Self {
            ctx,
            server,
            distributor,
            _dir: dir,
        }
    }

    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.ctx.socket_path()).await
    }

    /// Wait until exactly `count` clients are registered
    pub async fn wait_for_clients(&self, count: usize) {
        tokio::time::timeout(TIMEOUT, async {
            while self.ctx.clients.len() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "expected {} clients, have {}",
                count,
                self.ctx.clients.len()
            )
        });
    }

    pub async fn shutdown(self) {
        self.ctx.queue.close();
        self.server.abort();
        tokio::time::timeout(TIMEOUT, self.distributor)
            .await
            .expect("distributor did not stop")
            .unwrap();
    }
}

pub struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.send_raw(line.as_bytes()).await;
    }

    /// Send arbitrary bytes as one line
    pub async fn send_raw(&mut self, line: &[u8]) {
        self.writer.write_all(line).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next raw line from the server
    pub async fn next_line(&mut self) -> String {
        tokio::time::timeout(TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for the server")
            .unwrap()
            .expect("server closed the connection")
    }

    pub async fn next(&mut self) -> Value {
        serde_json::from_str(&self.next_line().await).unwrap()
    }

    pub async fn request(&mut self, line: &str) -> Value {
        self.send(line).await;
        self.next().await
    }

    /// Round-trip a ping; afterwards the client is registered for broadcasts
    pub async fn ping(&mut self) {
        let reply = self.request(r#"{"command":"ping","args":[]}"#).await;
        assert_eq!(reply["pong"], true, "unexpected ping reply: {}", reply);
    }

    pub fn into_parts(self) -> (Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) {
        (self.lines, self.writer)
    }
}
