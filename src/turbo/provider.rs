//! Provider Chain
//!
//! Providers are the storage and computation layer behind the cache. The
//! chain walks them in registration order and hands each (key, attribute)
//! pair to the first provider that claims it. A no-op fallback sits at the
//! end so the walk always ends with a defined answer.
//!
//! Once a provider claims a pair it is authoritative: if it fails, the
//! chain logs the failure and reports "no value" rather than asking the
//! next provider. A provider that panics is treated the same way.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{trace, warn};

use super::entry::{AttributeValue, EntityKey, Payload, SpeculativeResult};
use super::memory::MemoryStore;

/// Result type for provider calls
pub type ProviderResult<T> = anyhow::Result<T>;

/// Backing store or computation for a family of attributes.
///
/// Implementations only need to be safe to call from several threads;
/// the chain never calls two providers for the same request.
pub trait TurboProvider<K, V>: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Whether this provider understands the attribute
    fn recognizes_attribute(&self, name: &str) -> bool;

    /// Whether this provider handles the key
    fn recognizes_entity(&self, key: &K) -> bool;

    /// Compute or load a value.
    ///
    /// `Ok(None)` means unknown. Values for other attributes computed on the
    /// way can be pushed into `cache`.
    fn read_entry(
        &self,
        key: &Arc<K>,
        name: &str,
        cache: &mut SpeculativeSink<'_, K, V>,
    ) -> ProviderResult<Option<AttributeValue<V>>>;

    /// Persist a value. `None` asks the provider to drop the attribute.
    ///
    /// `Ok(false)` rejects the value, which callers treat as a contract
    /// violation.
    fn write_entry(
        &self,
        key: &Arc<K>,
        name: &str,
        value: Option<&AttributeValue<V>>,
    ) -> ProviderResult<bool>;
}

/// Fallback that claims everything, knows nothing and accepts every write
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProvider;

impl<K, V> TurboProvider<K, V> for NoopProvider {
    fn name(&self) -> &str {
        "noop"
    }

    fn recognizes_attribute(&self, _name: &str) -> bool {
        true
    }

    fn recognizes_entity(&self, _key: &K) -> bool {
        true
    }

    fn read_entry(
        &self,
        _key: &Arc<K>,
        _name: &str,
        _cache: &mut SpeculativeSink<'_, K, V>,
    ) -> ProviderResult<Option<AttributeValue<V>>> {
        Ok(None)
    }

    fn write_entry(
        &self,
        _key: &Arc<K>,
        _name: &str,
        _value: Option<&AttributeValue<V>>,
    ) -> ProviderResult<bool> {
        Ok(true)
    }
}

// =============================================================================
// Speculative Sink
// =============================================================================

/// The only cache operation available to a provider mid-read.
///
/// Values pushed here are merged into the memory store immediately and
/// kept so the caller can notify listeners once the provider returns.
pub struct SpeculativeSink<'a, K, V> {
    store: Option<&'a MemoryStore<K, V>>,
    results: Vec<SpeculativeResult<K, V>>,
}

impl<'a, K: EntityKey, V: Payload> SpeculativeSink<'a, K, V> {
    /// Sink that merges into `store`
    pub fn new(store: &'a MemoryStore<K, V>) -> Self {
        Self {
            store: Some(store),
            results: Vec::new(),
        }
    }

    /// Sink that only collects
    pub fn detached() -> Self {
        Self {
            store: None,
            results: Vec::new(),
        }
    }

    /// Offer a value for another (key, attribute) pair
    pub fn cache_entry(&mut self, key: Arc<K>, name: impl Into<String>, value: AttributeValue<V>) {
        let name = name.into();
        if let Some(store) = self.store {
            store.put(&key, &name, Some(value.clone()));
        }
        trace!(key = %key, attribute = %name, "Speculative result cached");
        self.results.push(SpeculativeResult { key, name, value });
    }

    /// Number of results collected so far
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns true if nothing was offered
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Take the collected results
    pub fn into_results(self) -> Vec<SpeculativeResult<K, V>> {
        self.results
    }
}

// =============================================================================
// Chain
// =============================================================================

/// Outcome of a chain write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The responsible provider accepted the value
    Stored,
    /// The responsible provider refused the value
    Rejected,
    /// Only the fallback claimed the pair
    NoProvider,
    /// The responsible provider failed; the error was logged
    Failed,
}

impl WriteOutcome {
    /// Everything except an explicit rejection counts as success
    pub fn is_accepted(&self) -> bool {
        !matches!(self, WriteOutcome::Rejected)
    }
}

/// Ordered providers plus the no-op fallback
pub struct ProviderChain<K, V> {
    providers: Vec<Arc<dyn TurboProvider<K, V>>>,
}

impl<K: EntityKey, V: Payload> ProviderChain<K, V> {
    /// Build a chain; the fallback is appended after `providers`
    pub fn new(providers: Vec<Arc<dyn TurboProvider<K, V>>>) -> Self {
        let mut providers = providers;
        providers.push(Arc::new(NoopProvider));
        Self { providers }
    }

    /// Number of registered providers, not counting the fallback
    pub fn len(&self) -> usize {
        self.providers.len() - 1
    }

    /// Returns true if only the fallback is present
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the registered providers in walk order
    pub fn provider_names(&self) -> Vec<String> {
        self.providers[..self.len()]
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Index of the provider responsible for the pair
    fn responsible(&self, key: &K, name: &str) -> usize {
        self.providers
            .iter()
            .position(|p| p.recognizes_entity(key) && p.recognizes_attribute(name))
            .unwrap_or(self.providers.len() - 1)
    }

    fn is_fallback(&self, index: usize) -> bool {
        index == self.providers.len() - 1
    }

    /// Ask the responsible provider for a value.
    ///
    /// Returns `None` for unknown, including when the provider failed.
    pub fn read(
        &self,
        key: &Arc<K>,
        name: &str,
        sink: &mut SpeculativeSink<'_, K, V>,
    ) -> Option<AttributeValue<V>> {
        let index = self.responsible(key, name);
        let provider = &self.providers[index];
        match catch_unwind(AssertUnwindSafe(|| provider.read_entry(key, name, sink))) {
            Ok(Ok(value)) => {
                trace!(
                    provider = provider.name(),
                    key = %key,
                    attribute = name,
                    found = value.is_some(),
                    "Provider read"
                );
                value
            }
            Ok(Err(e)) => {
                warn!(
                    provider = provider.name(),
                    key = %key,
                    attribute = name,
                    "Provider read failed: {:#}",
                    e
                );
                None
            }
            Err(panic) => {
                warn!(
                    provider = provider.name(),
                    key = %key,
                    attribute = name,
                    "Provider read panicked: {}",
                    panic_message(&*panic)
                );
                None
            }
        }
    }

    /// Hand a value to the responsible provider
    pub fn write(&self, key: &Arc<K>, name: &str, value: Option<&AttributeValue<V>>) -> WriteOutcome {
        let index = self.responsible(key, name);
        let provider = &self.providers[index];
        match catch_unwind(AssertUnwindSafe(|| provider.write_entry(key, name, value))) {
            Ok(Ok(true)) if self.is_fallback(index) => WriteOutcome::NoProvider,
            Ok(Ok(true)) => WriteOutcome::Stored,
            Ok(Ok(false)) => {
                warn!(
                    provider = provider.name(),
                    key = %key,
                    attribute = name,
                    "Provider rejected value"
                );
                WriteOutcome::Rejected
            }
            Ok(Err(e)) => {
                warn!(
                    provider = provider.name(),
                    key = %key,
                    attribute = name,
                    "Provider write failed: {:#}",
                    e
                );
                WriteOutcome::Failed
            }
            Err(panic) => {
                warn!(
                    provider = provider.name(),
                    key = %key,
                    attribute = name,
                    "Provider write panicked: {}",
                    panic_message(&*panic)
                );
                WriteOutcome::Failed
            }
        }
    }
}

/// Best-effort text of a panic payload
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

impl<K, V> fmt::Debug for ProviderChain<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.providers.iter().map(|p| p.name()).collect();
        f.debug_struct("ProviderChain").field("providers", &names).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
