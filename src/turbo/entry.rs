//! Entry Types
//!
//! Keys, values and the small value types that flow between the memory
//! store, the provider chain and the prefetch worker.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identity of the object attributes are attached to.
///
/// Any type with value equality, a stable hash and a display form can be
/// used as a key. The display form shows up in logs and in the statistics
/// log used for leak hunting.
pub trait EntityKey: Eq + Hash + fmt::Display + Send + Sync + 'static {}

impl<T> EntityKey for T where T: Eq + Hash + fmt::Display + Send + Sync + 'static {}

/// Bound shared by all attribute value payloads.
pub trait Payload: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

impl<T> Payload for T where T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

/// A cached attribute value.
///
/// `Absent` is a confirmed negative: the provider looked and the attribute
/// does not exist. Not knowing anything is expressed as `None` around this
/// type, never as a variant of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttributeValue<V> {
    /// The attribute exists with this value
    Present(V),
    /// The attribute is known not to exist
    Absent,
}

impl<V> AttributeValue<V> {
    /// Returns true for the known-absent sentinel
    #[inline]
    pub fn is_absent(&self) -> bool {
        matches!(self, AttributeValue::Absent)
    }

    /// Borrow the payload, if any
    #[inline]
    pub fn present(&self) -> Option<&V> {
        match self {
            AttributeValue::Present(v) => Some(v),
            AttributeValue::Absent => None,
        }
    }

    /// Take the payload, if any
    pub fn into_present(self) -> Option<V> {
        match self {
            AttributeValue::Present(v) => Some(v),
            AttributeValue::Absent => None,
        }
    }
}

impl<V> From<V> for AttributeValue<V> {
    fn from(value: V) -> Self {
        AttributeValue::Present(value)
    }
}

/// A queued background load for one (key, attribute) pair.
///
/// Equality and hashing go through the key's value, not the `Arc`
/// pointer, so two callers holding different but equal key instances
/// collapse into one request.
#[derive(Debug)]
pub struct PendingRequest<K> {
    key: Arc<K>,
    name: String,
}

impl<K> PendingRequest<K> {
    /// Create a new pending request
    pub fn new(key: Arc<K>, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
        }
    }

    /// The key to load
    #[inline]
    pub fn key(&self) -> &Arc<K> {
        &self.key
    }

    /// The attribute to load
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<K> Clone for PendingRequest<K> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            name: self.name.clone(),
        }
    }
}

impl<K: PartialEq> PartialEq for PendingRequest<K> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && *self.key == *other.key
    }
}

impl<K: Eq> Eq for PendingRequest<K> {}

impl<K: Hash> Hash for PendingRequest<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (*self.key).hash(state);
        self.name.hash(state);
    }
}

impl<K: fmt::Display> fmt::Display for PendingRequest<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.key, self.name)
    }
}

/// A value a provider computed for free while answering another request.
#[derive(Debug, Clone)]
pub struct SpeculativeResult<K, V> {
    /// Key the value belongs to
    pub key: Arc<K>,
    /// Attribute name
    pub name: String,
    /// The computed value
    pub value: AttributeValue<V>,
}

/// Per-caller memo of the last entry proven present.
///
/// `prepare_in`/`is_prepared_in` fill it when they find a value, and the
/// next `read_in` with the same slot empties it. This lets the value
/// survive an eviction or key reclamation that happens between the two
/// calls. Each logical caller owns its own slot.
#[derive(Debug)]
pub struct PreparedSlot<K, V> {
    entry: Option<(Arc<K>, String, AttributeValue<V>)>,
}

impl<K, V> Default for PreparedSlot<K, V> {
    fn default() -> Self {
        Self { entry: None }
    }
}

impl<K, V> PreparedSlot<K, V> {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if nothing is memoized
    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    /// Forget whatever is memoized
    pub fn clear(&mut self) {
        self.entry = None;
    }

    pub(crate) fn remember(&mut self, key: Arc<K>, name: &str, value: AttributeValue<V>) {
        self.entry = Some((key, name.to_string(), value));
    }
}

impl<K: PartialEq, V> PreparedSlot<K, V> {
    /// Empty the slot, returning its value only if it matches the pair.
    pub(crate) fn take_matching(&mut self, key: &K, name: &str) -> Option<AttributeValue<V>> {
        match self.entry.take() {
            Some((k, n, value)) if *k == *key && n == name => Some(value),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
