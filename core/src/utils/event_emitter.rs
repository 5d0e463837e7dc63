/// Typed observer lists for connection and message events
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::error;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_id: AtomicU64,
}

impl<T> Registry<T> {
    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }
}

/// Fan-out of `T` values to any number of listeners.
///
/// Listeners run synchronously inside `emit`, in subscription order. A
/// listener that panics is logged and skipped; the others still run.
pub struct EventEmitter<T> {
    registry: Arc<Registry<T>>,
    name: &'static str,
}

impl<T: Send + 'static> EventEmitter<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            registry: Arc::new(Registry {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
            name,
        }
    }

    /// Attach a listener; the returned handle detaches it
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.listeners.lock().push((id, Arc::new(listener)));

        let weak: Weak<Registry<T>> = Arc::downgrade(&self.registry);
        Subscription {
            id,
            detach: Box::new(move |id| match weak.upgrade() {
                Some(registry) => registry.remove(id),
                None => false,
            }),
        }
    }

    /// Detach by id. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.registry.remove(id)
    }

    /// Channel-backed listener for async consumers
    pub fn listen(&self) -> EventStream<T>
    where
        T: Clone,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |value: &T| {
            let _ = tx.send(value.clone());
        });
        EventStream {
            rx,
            subscription: Some(subscription),
        }
    }

    /// Deliver `value` to every listener attached right now
    pub fn emit(&self, value: &T) {
        // Snapshot so listeners may (un)subscribe while being called
        let listeners: Vec<(u64, Listener<T>)> = self.registry.listeners.lock().clone();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| (*listener)(value))).is_err() {
                error!("Listener {} on {} panicked", id, self.name);
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry.listeners.lock().len()
    }

    /// Remove every listener
    pub fn clear(&self) {
        self.registry.listeners.lock().clear();
    }
}

impl<T> Clone for EventEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            name: self.name,
        }
    }
}

/// Handle returned by [`EventEmitter::subscribe`]
pub struct Subscription {
    id: u64,
    detach: Box<dyn Fn(u64) -> bool + Send + Sync>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Detach the listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        (self.detach)(self.id)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Receiver side of [`EventEmitter::listen`]; detaches itself when dropped
pub struct EventStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    subscription: Option<Subscription>,
}

impl<T> EventStream<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}
