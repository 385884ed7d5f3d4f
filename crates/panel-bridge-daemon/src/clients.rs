//! Connected IPC clients
//!
//! A client is registered when its connection is accepted and removed on
//! its first failed read or write. Ids are never reused.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub type ClientId = u64;

/// Write side of a client connection
pub type ClientWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Client {
    id: ClientId,
    writer: tokio::sync::Mutex<ClientWriter>,
}

impl Client {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Write one complete line and flush it
    ///
    /// Replies and broadcast events share this writer, so lines are never
    /// interleaved.
    pub async fn send_line(&self, line: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line).await?;
        writer.flush().await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("id", &self.id).finish()
    }
}

#[derive(Debug)]
pub struct ClientRegistry {
    next_id: AtomicU64,
    clients: Mutex<BTreeMap<ClientId, Arc<Client>>>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            clients: Mutex::new(BTreeMap::new()),
        }
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ClientId, Arc<Client>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, writer: ClientWriter) -> Arc<Client> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(Client {
            id,
            writer: tokio::sync::Mutex::new(writer),
        });

        let count = {
            let mut clients = self.lock();
            clients.insert(id, client.clone());
            clients.len()
        };
        debug!(client = id, clients = count, "Client connected");
        client
    }

    /// Remove a client; returns false if it was already gone
    pub fn remove(&self, id: ClientId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            debug!(client = id, "Client removed");
        }
        removed
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.lock().contains_key(&id)
    }

    /// The clients connected right now, in connection order
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_ids_are_not_reused() {
        let registry = ClientRegistry::new();
        let first = registry.register(Box::new(tokio::io::sink()));
        assert!(registry.remove(first.id()));
        assert!(!registry.remove(first.id()));

        let second = registry.register(Box::new(tokio::io::sink()));
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(second.id()));
    }

    #[tokio::test]
    async fn test_send_line_writes_and_flushes() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let registry = ClientRegistry::new();
        let client = registry.register(Box::new(writer));

        client.send_line(b"{\"event\":\"x\"}\n").await.unwrap();

        let mut buf = vec![0u8; 14];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"{\"event\":\"x\"}\n");
    }

    #[test]
    fn test_snapshot_in_connection_order() {
        let registry = ClientRegistry::new();
        let ids: Vec<_> = (0..3)
            .map(|_| registry.register(Box::new(tokio::io::sink())).id())
            .collect();
        let snapshot: Vec<_> = registry.snapshot().iter().map(|c| c.id()).collect();
        assert_eq!(snapshot, ids);
    }
}
