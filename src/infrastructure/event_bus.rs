//! Session Event Bus
//!
//! Typed publish/subscribe used by sessions and the fleet to broadcast
//! status, connection-status and data-notification events.
//!
//! A handler's identity is its `Arc` allocation: subscribing a clone of the
//! same `Arc` again is a no-op, so a handler never runs twice per event.
//! Publishing copies the listener list under the lock and invokes the copy
//! after releasing it, so handlers may subscribe or unsubscribe from inside
//! their own invocation.

use crate::domain::models::{ConnectionEvent, NotificationEvent, StatusEvent};
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared handler value; clone the `Arc` to unsubscribe it later
pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Wrap a closure as a handler value
pub fn handler<E, F>(f: F) -> Handler<E>
where
    F: Fn(&E) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One typed listener set
pub struct Channel<E> {
    listeners: Mutex<Vec<Handler<E>>>,
}

impl<E> Channel<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Add `handler`; returns false if that handler value is already present
    pub fn subscribe(&self, handler: &Handler<E>) -> bool {
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|h| Arc::ptr_eq(h, handler)) {
            return false;
        }
        listeners.push(Arc::clone(handler));
        true
    }

    /// Remove `handler`; returns false if it was not registered
    pub fn unsubscribe(&self, handler: &Handler<E>) -> bool {
        let mut listeners = self.listeners.lock();
        match listeners.iter().position(|h| Arc::ptr_eq(h, handler)) {
            Some(idx) => {
                listeners.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to a snapshot of the current listeners
    ///
    /// Returns the number of handlers invoked.
    pub fn publish(&self, event: &E) -> usize {
        let snapshot: Vec<Handler<E>> = self.listeners.lock().clone();
        for listener in &snapshot {
            listener(event);
        }
        snapshot.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn has_listeners(&self) -> bool {
        self.listener_count() > 0
    }
}

impl<E> Default for Channel<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Channel<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// The three channels every session exposes
#[derive(Debug, Default)]
pub struct EventBus {
    pub status: Channel<StatusEvent>,
    pub connection: Channel<ConnectionEvent>,
    pub notification: Channel<NotificationEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }
}
