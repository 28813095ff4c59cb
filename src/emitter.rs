//! Listener registries used by every component to publish typed events.
//!
//! Each component exposes a closed enum of events and an [`Emitter`] for it.
//! Registering a listener returns an [`Unsubscriber`]; dropping the handle
//! leaves the listener installed, calling [`Unsubscriber::unsubscribe`]
//! removes it.

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered set of entries addressable by the id they were registered with.
pub(crate) struct Registry<T> {
    entries: Arc<Mutex<Entries<T>>>,
}

struct Entries<T> {
    next_id: u64,
    items: Vec<(u64, T)>,
}

impl<T: Clone + Send + 'static> Registry<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                next_id: 0,
                items: Vec::new(),
            })),
        }
    }

    pub(crate) fn add(&self, item: T) -> Unsubscriber {
        let id = {
            let mut entries = self.entries.lock();
            let id = entries.next_id;
            entries.next_id += 1;
            entries.items.push((id, item));
            id
        };

        let entries: Weak<Mutex<Entries<T>>> = Arc::downgrade(&self.entries);
        Unsubscriber::new(move || {
            if let Some(entries) = entries.upgrade() {
                entries.lock().items.retain(|(item_id, _)| *item_id != id);
            }
        })
    }

    /// Copies the current entries so callers never run user code under the lock.
    pub(crate) fn snapshot(&self) -> Vec<T> {
        self.entries
            .lock()
            .items
            .iter()
            .map(|(_, item)| item.clone())
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().items.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().items.len()
    }
}

pub struct Emitter<E> {
    listeners: Registry<Listener<E>>,
}

impl<E: 'static> Emitter<E> {
    pub fn new() -> Self {
        Self {
            listeners: Registry::new(),
        }
    }

    pub fn on<F>(&self, listener: F) -> Unsubscriber
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.listeners.add(Arc::new(listener))
    }

    /// Calls every listener registered at the time of the call, in
    /// registration order. Listeners may register, unregister or emit
    /// again from inside the callback.
    pub fn emit(&self, event: &E) {
        for listener in self.listeners.snapshot() {
            listener(event);
        }
    }

    pub fn clear(&self) {
        self.listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl<E: 'static> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter").finish_non_exhaustive()
    }
}

/// Handle that detaches whatever was registered when it was created.
#[must_use = "dropping an Unsubscriber keeps the listener registered"]
pub struct Unsubscriber {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Unsubscriber {
    pub fn new<F>(detach: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    pub fn noop() -> Self {
        Self { detach: None }
    }

    /// Combines several handles into one that detaches all of them.
    pub fn all(handles: Vec<Unsubscriber>) -> Self {
        Self::new(move || {
            for handle in handles {
                handle.unsubscribe();
            }
        })
    }

    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for Unsubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscriber")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}
