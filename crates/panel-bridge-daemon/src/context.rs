//! Shared bridge state
//!
//! `BridgeContext` is built once by the daemon's `main` and handed to every
//! component as an `Arc`. It is also the API the rest of the shell uses to
//! add commands and event subscribers.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use panel_bridge_config::Config;
use serde_json::Value;

use crate::clients::ClientRegistry;
use crate::compositor::CompositorFacade;
use crate::distributor::{broadcast_line, encode_line, EventDistributor};
use crate::queue::EventQueue;
use crate::registry::{CommandRegistry, SubscriberRegistry};

pub struct BridgeContext {
    pub config: Arc<Config>,
    pub facade: Arc<CompositorFacade>,
    pub queue: Arc<EventQueue>,
    pub commands: Arc<CommandRegistry>,
    pub subscribers: Arc<SubscriberRegistry>,
    pub clients: Arc<ClientRegistry>,
    socket_path: PathBuf,
}

impl BridgeContext {
    pub fn new(config: Config) -> Arc<Self> {
        let facade = CompositorFacade::new(&config.compositor);
        Self::with_facade(config, facade)
    }

    pub fn with_facade(config: Config, facade: CompositorFacade) -> Arc<Self> {
        let queue = EventQueue::new(config.events.queue_capacity, config.events.backpressure);
        let socket_path = config.server.resolve_socket_path();

        Arc::new(Self {
            config: Arc::new(config),
            facade: Arc::new(facade),
            queue: Arc::new(queue),
            commands: Arc::new(CommandRegistry::new()),
            subscribers: Arc::new(SubscriberRegistry::new()),
            clients: Arc::new(ClientRegistry::new()),
            socket_path,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Register a command; an existing command of the same name is replaced
    pub fn register_command<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.commands.register(name, handler);
    }

    /// Run `callback` for every distributed event whose `"event"` is `event_type`
    pub fn add_event_subscriber<F, Fut>(&self, event_type: impl Into<String>, callback: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribers.add(event_type, callback);
    }

    /// Send `message` to every connected client
    ///
    /// Bypasses the event queue and does not reach subscribers. Returns the
    /// number of clients written to.
    pub async fn broadcast_message(&self, message: &Value) -> anyhow::Result<usize> {
        let line = encode_line(message)?;
        Ok(broadcast_line(&self.clients, &line).await)
    }

    /// The distributor draining this context's queue
    pub fn distributor(&self) -> EventDistributor {
        EventDistributor::new(
            self.queue.clone(),
            self.clients.clone(),
            self.subscribers.clone(),
        )
    }
}

impl std::fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeContext")
            .field("socket_path", &self.socket_path)
            .field("facade", &self.facade)
            .field("clients", &self.clients.len())
            .field("commands", &self.commands.len())
            .finish()
    }
}
