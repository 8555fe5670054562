use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::events::ExecutionEvent;

pub type ObserverId = u64;

struct HubInner {
    observers: Mutex<HashMap<ObserverId, mpsc::Sender<Arc<ExecutionEvent>>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
    buffer: usize,
}

impl HubInner {
    fn remove(&self, id: ObserverId) -> bool {
        self.observers.lock().remove(&id).is_some()
    }
}

/// Best-effort fan-out of execution events to connected observers.
///
/// Each observer owns a bounded buffer. `publish` never waits: an observer
/// whose buffer is full misses that event, and an observer that went away is
/// dropped from the set. Events reach a given observer in publish order.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                observers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Register a new observer. Only events published after this call are
    /// delivered to it.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.buffer);

        // A closed hub hands out subscriptions that end immediately
        let mut observers = self.inner.observers.lock();
        if !self.inner.closed.load(Ordering::Acquire) {
            observers.insert(id, tx);
            tracing::info!(observer_id = id, "Observer connected");
        }
        drop(observers);

        Subscription {
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Push an event to every observer without blocking.
    pub fn publish(&self, event: ExecutionEvent) {
        let event = Arc::new(event);
        let mut observers = self.inner.observers.lock();
        observers.retain(|&id, tx| match tx.try_send(Arc::clone(&event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    observer_id = id,
                    job_id = %event.job_id,
                    "Observer buffer full, event dropped"
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::info!(observer_id = id, "Observer disconnected");
                false
            }
        });
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let removed = self.inner.remove(id);
        if removed {
            tracing::info!(observer_id = id, "Observer unsubscribed");
        }
        removed
    }

    /// Disconnect every observer. Later subscriptions end immediately.
    pub fn close(&self) {
        let count = {
            let mut observers = self.inner.observers.lock();
            self.inner.closed.store(true, Ordering::Release);
            let count = observers.len();
            observers.clear();
            count
        };
        tracing::info!(observers = count, "Broadcast hub closed");
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }

    /// Total events dropped because an observer's buffer was full.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// One observer's receiving end. Dropping it unsubscribes.
pub struct Subscription {
    id: ObserverId,
    rx: mpsc::Receiver<Arc<ExecutionEvent>>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Next event, or `None` once the hub closed or dropped this observer.
    pub async fn recv(&mut self) -> Option<Arc<ExecutionEvent>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<ExecutionEvent>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}
