//! Ordered, deferred listener delivery.
//!
//! Notifications are queued while the flow table is locked, so queue order is
//! mutation order, and delivered after the table lock is released. One
//! thread at a time drains the queue; a caller arriving while another thread
//! drains waits for it and then drains whatever is left. A manager call made
//! from inside a callback queues its notifications and returns; the drain
//! loop already running on that thread delivers them once the current
//! callback returns.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use kegflow_core::Flow;

use super::listener::{FlowListener, ListenerSet};

/// A queued lifecycle notification.
#[derive(Debug)]
enum Notice {
    Start(Flow),
    Update(Flow),
    End(Flow),
}

#[derive(Default)]
struct Pending {
    queue: VecDeque<Notice>,
    /// Thread currently delivering notices
    drainer: Option<ThreadId>,
}

/// Listener set plus the queue of notices waiting for delivery.
#[derive(Default)]
pub(crate) struct Notifier {
    listeners: ListenerSet,
    pending: Mutex<Pending>,
    drained: Condvar,
}

impl Notifier {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn FlowListener>) -> bool {
        self.listeners.add(listener)
    }

    pub(crate) fn remove_listener<L: FlowListener + ?Sized>(&self, listener: &Arc<L>) -> bool {
        self.listeners.remove(listener)
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn start(&self, flow: &Flow) {
        self.lock().queue.push_back(Notice::Start(flow.clone()));
    }

    pub(crate) fn update(&self, flow: &Flow) {
        self.lock().queue.push_back(Notice::Update(flow.clone()));
    }

    pub(crate) fn end(&self, flow: &Flow) {
        self.lock().queue.push_back(Notice::End(flow.clone()));
    }

    /// Delivers every queued notice. Must not be called with the flow table
    /// locked.
    ///
    /// Returns once the queue is empty, except when called from inside a
    /// callback on the draining thread, where it returns immediately.
    pub(crate) fn flush(&self) {
        let current = thread::current().id();
        {
            let mut pending = self.lock();
            loop {
                match pending.drainer {
                    None => break,
                    Some(drainer) if drainer == current => return,
                    Some(_) => {
                        pending = self
                            .drained
                            .wait(pending)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
            pending.drainer = Some(current);
        }

        // Released on return and on unwind from a panicking listener
        let _drainer = DrainerGuard(self);
        while let Some(notice) = self.next_notice() {
            match &notice {
                Notice::Start(flow) => self.listeners.publish_start(flow),
                Notice::Update(flow) => self.listeners.publish_update(flow),
                Notice::End(flow) => self.listeners.publish_end(flow),
            }
        }
    }

    fn next_notice(&self) -> Option<Notice> {
        self.lock().queue.pop_front()
    }
}

struct DrainerGuard<'a>(&'a Notifier);

impl Drop for DrainerGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().drainer = None;
        self.0.drained.notify_all();
    }
}
