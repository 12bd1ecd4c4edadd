//! Change Notification
//!
//! Listeners hear about every value change no matter which path produced
//! it. Registration swaps in a new list, so delivery walks an immutable
//! snapshot and never races with add/remove.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use super::entry::AttributeValue;

/// Receiver of value change notifications
pub trait TurboListener<K, V>: Send + Sync {
    /// Called after `(key, name)` changed. `None` means the value was
    /// invalidated or could not be determined.
    fn entry_changed(&self, key: &Arc<K>, name: &str, value: Option<&AttributeValue<V>>);
}

impl<K, V, F> TurboListener<K, V> for F
where
    F: Fn(&Arc<K>, &str, Option<&AttributeValue<V>>) + Send + Sync,
{
    fn entry_changed(&self, key: &Arc<K>, name: &str, value: Option<&AttributeValue<V>>) {
        self(key, name, value)
    }
}

type Snapshot<K, V> = Arc<Vec<Arc<dyn TurboListener<K, V>>>>;

/// Copy-on-write listener list
pub struct ListenerList<K, V> {
    listeners: RwLock<Snapshot<K, V>>,
}

impl<K, V> Default for ListenerList<K, V> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Arc::new(Vec::new())),
        }
    }
}

impl<K, V> ListenerList<K, V> {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn add(&self, listener: Arc<dyn TurboListener<K, V>>) {
        let mut guard = self.listeners.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(listener);
        *guard = Arc::new(next);
    }

    /// Unregister a listener by identity. Returns true if it was found.
    pub fn remove(&self, listener: &Arc<dyn TurboListener<K, V>>) -> bool {
        let mut guard = self.listeners.write();
        let before = guard.len();
        let target = Arc::as_ptr(listener) as *const ();
        let next: Vec<_> = guard
            .iter()
            .filter(|l| Arc::as_ptr(*l) as *const () != target)
            .cloned()
            .collect();
        let removed = next.len() != before;
        *guard = Arc::new(next);
        removed
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Returns true if nobody is listening
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one change to every listener registered right now
    pub fn notify(&self, key: &Arc<K>, name: &str, value: Option<&AttributeValue<V>>)
    where
        K: fmt::Display,
    {
        let snapshot = Arc::clone(&self.listeners.read());
        if snapshot.is_empty() {
            return;
        }
        trace!(key = %key, attribute = name, listeners = snapshot.len(), "Notifying");
        for listener in snapshot.iter() {
            listener.entry_changed(key, name, value);
        }
    }
}

impl<K, V> fmt::Debug for ListenerList<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerList")
            .field("len", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
