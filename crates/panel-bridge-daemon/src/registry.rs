//! Command and event-subscriber registries

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

pub type CommandHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

pub type EventCallback = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Command name to handler; the last registration under a name wins
#[derive(Default)]
pub struct CommandRegistry {
    handlers: Mutex<HashMap<String, CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any existing handler
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let name = name.into();
        let handler: CommandHandler = Arc::new(move |args| handler(args).boxed());

        if lock(&self.handlers).insert(name.clone(), handler).is_some() {
            warn!(command = %name, "Command registered twice, replacing previous handler");
        } else {
            debug!(command = %name, "Registered command");
        }
    }

    pub fn get(&self, name: &str) -> Option<CommandHandler> {
        lock(&self.handlers).get(name).cloned()
    }

    /// Registered command names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.handlers).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        lock(&self.handlers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Event type to callbacks, append-only
///
/// Adding the same callback twice makes it run twice per event; there is
/// no way to remove a subscriber.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: Mutex<HashMap<String, Vec<EventCallback>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F, Fut>(&self, event_type: impl Into<String>, callback: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let event_type = event_type.into();
        let callback: EventCallback = Arc::new(move |event| callback(event).boxed());

        let mut subscribers = lock(&self.subscribers);
        let entry = subscribers.entry(event_type.clone()).or_default();
        entry.push(callback);
        debug!(event_type = %event_type, count = entry.len(), "Added event subscriber");
    }

    /// Callbacks for `event_type`, in registration order
    pub fn subscribers_for(&self, event_type: &str) -> Vec<EventCallback> {
        lock(&self.subscribers)
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of registered callbacks
    pub fn len(&self) -> usize {
        lock(&self.subscribers).values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
