//! Event fan-out to clients and in-process subscribers

use std::sync::Arc;

use serde_json::Value;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, trace, warn};

use crate::clients::ClientRegistry;
use crate::queue::EventQueue;
use crate::registry::SubscriberRegistry;

/// Serialize an event as one newline-terminated JSON line
pub fn encode_line(event: &Value) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    Ok(line)
}

/// Write `line` to every connected client
///
/// A client whose write fails is removed; the others still get the line.
/// Returns the number of clients that received it.
pub async fn broadcast_line(clients: &ClientRegistry, line: &[u8]) -> usize {
    let mut delivered = 0;

    for client in clients.snapshot() {
        match client.send_line(line).await {
            Ok(()) => delivered += 1,
            Err(e) => {
                debug!(client = client.id(), error = %e, "Broadcast write failed, dropping client");
                clients.remove(client.id());
            }
        }
    }

    delivered
}

type SubscriberOutcome = (String, anyhow::Result<()>);

pub struct EventDistributor {
    queue: Arc<EventQueue>,
    clients: Arc<ClientRegistry>,
    subscribers: Arc<SubscriberRegistry>,
    tasks: JoinSet<SubscriberOutcome>,
}

impl EventDistributor {
    pub fn new(
        queue: Arc<EventQueue>,
        clients: Arc<ClientRegistry>,
        subscribers: Arc<SubscriberRegistry>,
    ) -> Self {
        Self {
            queue,
            clients,
            subscribers,
            tasks: JoinSet::new(),
        }
    }

    /// Distribute events in queue order until the queue is closed
    pub async fn run(mut self) {
        debug!("Event distributor started");

        loop {
            tokio::select! {
                event = self.queue.pop() => match event {
                    Some(event) => self.distribute(event).await,
                    None => break,
                },
                Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    log_subscriber_result(result);
                }
            }
        }

        while let Some(result) = self.tasks.join_next().await {
            log_subscriber_result(result);
        }
        debug!("Event distributor stopped");
    }

    async fn distribute(&mut self, event: Value) {
        let line = match encode_line(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize event");
                return;
            }
        };

        let delivered = broadcast_line(&self.clients, &line).await;

        let Some(event_type) = event.get("event").and_then(Value::as_str) else {
            trace!(delivered, "Broadcast event without type");
            return;
        };
        trace!(event_type, delivered, "Broadcast event");

        for callback in self.subscribers.subscribers_for(event_type) {
            let event = event.clone();
            let event_type = event_type.to_string();
            self.tasks.spawn(async move {
                let result = callback(event).await;
                (event_type, result)
            });
        }
    }
}

fn log_subscriber_result(result: Result<SubscriberOutcome, JoinError>) {
    match result {
        Ok((_, Ok(()))) => {}
        Ok((event_type, Err(e))) => {
            warn!(event_type = %event_type, error = %e, "Event subscriber failed");
        }
        Err(e) if e.is_panic() => warn!(error = %e, "Event subscriber panicked"),
        Err(e) => debug!(error = %e, "Event subscriber cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientWriter;
    use panel_bridge_config::BackpressurePolicy;
    use serde_json::json;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};

    /// A writer whose peer has gone away
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_failed_client_removed_others_still_served() {
        let clients = ClientRegistry::new();
        let broken = clients.register(Box::new(BrokenPipe) as ClientWriter);
        let (writer, reader) = tokio::io::duplex(1024);
        let healthy = clients.register(Box::new(writer));

        let delivered = broadcast_line(&clients, b"{\"event\":\"a\"}\n").await;
        assert_eq!(delivered, 1);
        assert!(!clients.contains(broken.id()));
        assert!(clients.contains(healthy.id()));

        broadcast_line(&clients, b"{\"event\":\"b\"}\n").await;
        let mut lines = BufReader::new(reader).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"event":"a"}"#);
        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"event":"b"}"#);
    }

    #[tokio::test]
    async fn test_subscriber_failures_are_isolated() {
        let queue = Arc::new(EventQueue::new(8, BackpressurePolicy::Block));
        let clients = Arc::new(ClientRegistry::new());
        let subscribers = Arc::new(SubscriberRegistry::new());
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();

        subscribers.add("tick", |_event: Value| async { anyhow::bail!("subscriber error") });
        subscribers.add("tick", |event: Value| async move {
            assert!(event.get("missing").is_some(), "subscriber panic");
            Ok(())
        });
        subscribers.add("tick", move |event: Value| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(event["n"].clone());
                Ok(())
            }
        });

        let distributor = tokio::spawn(
            EventDistributor::new(queue.clone(), clients, subscribers).run(),
        );

        for n in 0..3 {
            queue.push(json!({"event": "tick", "n": n})).unwrap();
        }

        for n in 0..3 {
            let seen = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
                .await
                .expect("subscriber not called")
                .unwrap();
            assert_eq!(seen, n);
        }

        queue.close();
        tokio::time::timeout(Duration::from_secs(2), distributor)
            .await
            .expect("distributor did not stop")
            .unwrap();
    }
}
