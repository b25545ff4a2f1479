//! Flow lifecycle notifications.
//!
//! - `FlowListener`: observer interface implemented by UI and persistence collaborators
//! - `ListenerSet`: registered observers with snapshot fan-out
//! - `FlowEvent` / `BroadcastListener`: adapter forwarding notifications into a
//!   tokio broadcast channel for async subscribers
//!
//! Callbacks run after the manager's flow table is unlocked, in the order the
//! changes happened. Usually they run on the thread that caused the change
//! before its call returns; when several threads change flows at once, one
//! of them delivers the queued notifications for all. Callbacks may query
//! the manager, change flows, and add or remove listeners. Notifications
//! caused from inside a callback are delivered after that callback returns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;

use kegflow_core::Flow;

// ============================================================================
// Listener Contract
// ============================================================================

/// Observer of flow lifecycle changes.
///
/// Ordering per listener: `on_flow_start` is always immediately followed by
/// `on_flow_update` for the same flow, and `on_flow_end` is always
/// immediately preceded by `on_flow_update`.
pub trait FlowListener: Send + Sync {
    /// A new flow has been started.
    fn on_flow_start(&self, _flow: &Flow) {}

    /// A flow's ticks or metadata changed.
    fn on_flow_update(&self, _flow: &Flow) {}

    /// A flow has ended; its state is `Completed`.
    fn on_flow_end(&self, _flow: &Flow) {}
}

// ============================================================================
// Listener Set
// ============================================================================

/// Registered listeners, iterated in insertion order.
///
/// Membership is by identity (`Arc` address). Publishing copies the list and
/// releases the lock before invoking callbacks, so registration never races
/// with an in-flight fan-out.
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: Mutex<Vec<Arc<dyn FlowListener>>>,
}

impl ListenerSet {
    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn FlowListener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false if the listener was already registered.
    pub(crate) fn add(&self, listener: Arc<dyn FlowListener>) -> bool {
        let mut listeners = self.lock();
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Returns false if the listener was not registered.
    pub(crate) fn remove<L: FlowListener + ?Sized>(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn FlowListener>> {
        self.lock().clone()
    }

    pub(crate) fn publish_start(&self, flow: &Flow) {
        for listener in self.snapshot() {
            listener.on_flow_start(flow);
            listener.on_flow_update(flow);
        }
    }

    pub(crate) fn publish_update(&self, flow: &Flow) {
        for listener in self.snapshot() {
            listener.on_flow_update(flow);
        }
    }

    pub(crate) fn publish_end(&self, flow: &Flow) {
        for listener in self.snapshot() {
            listener.on_flow_update(flow);
            listener.on_flow_end(flow);
        }
    }
}

fn same_listener<A: ?Sized, B: ?Sized>(a: &Arc<A>, b: &Arc<B>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

// ============================================================================
// Broadcast Adapter
// ============================================================================

/// A flow notification as a value, for channel-based consumers.
///
/// The flow is boxed to reduce enum size variance.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    Started { flow: Box<Flow> },
    Updated { flow: Box<Flow> },
    Ended { flow: Box<Flow> },
}

impl FlowEvent {
    pub fn flow(&self) -> &Flow {
        match self {
            Self::Started { flow } | Self::Updated { flow } | Self::Ended { flow } => flow,
        }
    }
}

/// Listener that republishes every notification as a [`FlowEvent`].
///
/// Events are dropped when nobody is subscribed; slow subscribers observe
/// `RecvError::Lagged` rather than blocking the manager.
pub struct BroadcastListener {
    sender: broadcast::Sender<FlowEvent>,
}

impl BroadcastListener {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }

    fn send(&self, event: FlowEvent) {
        // Ignore send error - no subscribers
        let _ = self.sender.send(event);
    }
}

impl FlowListener for BroadcastListener {
    fn on_flow_start(&self, flow: &Flow) {
        self.send(FlowEvent::Started {
            flow: Box::new(flow.clone()),
        });
    }

    fn on_flow_update(&self, flow: &Flow) {
        self.send(FlowEvent::Updated {
            flow: Box::new(flow.clone()),
        });
    }

    fn on_flow_end(&self, flow: &Flow) {
        self.send(FlowEvent::Ended {
            flow: Box::new(flow.clone()),
        });
    }
}
