//! Compositor event pump and liveness monitor
//!
//! The pump runs on its own OS thread because compositor event reads block.
//! It is the only caller of the blocking read; everything it produces
//! reaches the async side through the [`EventQueue`].

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use panel_bridge_config::EventsConfig;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace, warn};

use crate::compositor::{BackendKind, CompositorError, CompositorFacade};
use crate::queue::{EventQueue, PushOutcome};
use crate::translate::{EventTranslator, TranslateContext};

/// The compositor surface the pump needs
pub trait EventFeed: Send + Sync + 'static {
    fn is_connected(&self) -> bool;
    fn reconnect(&self) -> Result<(), CompositorError>;
    /// Block until the next raw event; `None` means the read failed
    fn read_next_event(&self) -> Option<Value>;
    fn backend_kind(&self) -> Option<BackendKind>;
}

impl EventFeed for CompositorFacade {
    fn is_connected(&self) -> bool {
        CompositorFacade::is_connected(self)
    }

    fn reconnect(&self) -> Result<(), CompositorError> {
        CompositorFacade::reconnect(self)
    }

    fn read_next_event(&self) -> Option<Value> {
        CompositorFacade::read_next_event(self)
    }

    fn backend_kind(&self) -> Option<BackendKind> {
        CompositorFacade::backend_kind(self)
    }
}

pub struct EventPump<F, T> {
    feed: Arc<F>,
    translator: T,
    queue: Arc<EventQueue>,
    reconnect_backoff: Duration,
    read_failure_backoff: Duration,
}

impl<F, T> EventPump<F, T>
where
    F: EventFeed,
    T: EventTranslator + 'static,
{
    pub fn new(feed: Arc<F>, translator: T, queue: Arc<EventQueue>, config: &EventsConfig) -> Self {
        Self {
            feed,
            translator,
            queue,
            reconnect_backoff: config.reconnect_backoff(),
            read_failure_backoff: config.read_failure_backoff(),
        }
    }

    /// Start the pump on a dedicated thread
    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("compositor-events".to_string())
            .spawn(move || self.run())
    }

    /// Pump until the queue is closed
    pub fn run(mut self) {
        info!("Event pump started");

        while !self.queue.is_closed() {
            if !self.feed.is_connected() {
                match self.feed.reconnect() {
                    Ok(()) => {
                        info!(backend = ?self.feed.backend_kind(), "Event pump reconnected");
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            retry_in_ms = self.reconnect_backoff.as_millis() as u64,
                            "Compositor unavailable"
                        );
                        thread::sleep(self.reconnect_backoff);
                        continue;
                    }
                }
            }

            match self.feed.read_next_event() {
                Some(raw) => {
                    if !self.forward(raw) {
                        break;
                    }
                }
                None => {
                    debug!("Event read failed, reconnecting");
                    if let Err(e) = self.feed.reconnect() {
                        debug!(error = %e, "Reconnect after read failure failed");
                    }
                    thread::sleep(self.read_failure_backoff);
                }
            }
        }

        info!("Event pump stopped");
    }

    /// Translate and enqueue one raw event; false once the queue is closed
    fn forward(&mut self, raw: Value) -> bool {
        let context = TranslateContext {
            backend: self.feed.backend_kind(),
        };

        let Some(event) = self.translator.translate(raw, &context) else {
            trace!("Translator discarded event");
            return true;
        };

        match self.queue.push(event) {
            Ok(PushOutcome::Queued) => true,
            Ok(outcome) => {
                trace!(?outcome, "Event queue applied backpressure");
                true
            }
            Err(_) => false,
        }
    }
}

/// Periodically check the compositor link and reconnect it when down
pub fn spawn_liveness_monitor<F: EventFeed>(feed: Arc<F>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks = IntervalStream::new(ticker);

        while ticks.next().await.is_some() {
            if feed.is_connected() {
                continue;
            }

            let feed = feed.clone();
            match tokio::task::spawn_blocking(move || feed.reconnect()).await {
                Ok(Ok(())) => info!("Liveness check reconnected to compositor"),
                Ok(Err(e)) => debug!(error = %e, "Liveness check could not reconnect"),
                Err(e) => warn!(error = %e, "Liveness reconnect task failed"),
            }
        }
    })
}
