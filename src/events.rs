//! Progress events emitted while a login flow runs.
//!
//! The flow emits via [`EventBus::emit`]; the CLI subscribes via
//! [`EventBus::subscribe`] and renders them. Built on
//! [`tokio::sync::broadcast`] so a missing or slow listener never blocks the
//! flow.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::broadcast;

/// Steps of a login flow, in the order they happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The callback listener is bound.
    ListenerStarted { addr: SocketAddr },
    /// The authorization URL, and whether a browser was opened for it.
    AuthorizeUrl { url: String, opened: bool },
    /// Blocking on the redirect, for at most `timeout`.
    WaitingForRedirect { timeout: Duration },
    /// The browser came back with a code.
    RedirectReceived,
    ExchangingCode,
    /// Both stores were updated for this client.
    Saved { client_id: String },
}

/// A broadcast channel that any component can emit to or subscribe from.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all current subscribers.
    /// Returns the number of receivers that will see it.
    pub fn emit(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events. Returns a receiver that yields all
    /// future events (does not replay past ones).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(16)
    }
}
