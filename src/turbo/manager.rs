//! Turbo - Attribute Cache Facade
//!
//! Composes the memory store, the provider chain and the prefetch worker
//! behind the only API other subsystems call. Every operation is safe to
//! call from any thread and none of them fails: provider trouble degrades
//! to a cache miss or a best-effort write.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace};

use super::entry::{
    AttributeValue, EntityKey, Payload, PendingRequest, PreparedSlot, SpeculativeResult,
};
use super::listener::{ListenerList, TurboListener};
use super::memory::{MemoryConfig, MemoryStore};
use super::metrics::{NoStatistics, TurboStatistics};
use super::provider::{ProviderChain, SpeculativeSink, TurboProvider, WriteOutcome};
use super::worker::{PrefetchWorker, RequestHandler};
use super::{DEFAULT_IDLE_TIMEOUT, DEFAULT_WORKER_NAME};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurboConfig {
    /// Memory tier sizing
    pub memory: MemoryConfig,
    /// How long the prefetch worker waits for work before exiting
    pub idle_timeout_ms: u64,
    /// Name of the prefetch worker thread
    pub worker_name: String,
}

impl Default for TurboConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
            worker_name: DEFAULT_WORKER_NAME.to_string(),
        }
    }
}

impl TurboConfig {
    /// Default configuration with the given memory sizing
    pub fn with_memory(memory: MemoryConfig) -> Self {
        Self {
            memory,
            ..Default::default()
        }
    }

    /// Worker idle timeout
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Check every setting
    pub fn validate(&self) -> Result<()> {
        self.memory.validate()?;
        if self.idle_timeout_ms == 0 {
            return Err(Error::config("idle_timeout_ms must be greater than zero"));
        }
        if self.worker_name.trim().is_empty() {
            return Err(Error::config("worker_name must not be empty"));
        }
        Ok(())
    }
}

// =============================================================================
// Shared Core
// =============================================================================

/// State shared between callers and the prefetch thread
struct Core<K, V> {
    store: MemoryStore<K, V>,
    chain: ProviderChain<K, V>,
    listeners: ListenerList<K, V>,
    stats: Arc<dyn TurboStatistics>,
}

impl<K: EntityKey, V: Payload> Core<K, V> {
    /// Walk the chain and cache the answer. A pair nobody can answer is
    /// cached as `Absent`.
    fn load(&self, key: &Arc<K>, name: &str) -> (AttributeValue<V>, Vec<SpeculativeResult<K, V>>) {
        let mut sink = SpeculativeSink::new(&self.store);
        let value = self
            .chain
            .read(key, name, &mut sink)
            .unwrap_or(AttributeValue::Absent);
        self.store.put(key, name, Some(value.clone()));
        self.stats.provider_hit();
        (value, sink.into_results())
    }

    fn notify_speculative(&self, results: Vec<SpeculativeResult<K, V>>) {
        for result in results {
            self.listeners
                .notify(&result.key, &result.name, Some(&result.value));
        }
    }
}

impl<K: EntityKey, V: Payload> RequestHandler<K> for Core<K, V> {
    fn handle(&self, request: &PendingRequest<K>) {
        let key = request.key();
        let name = request.name();

        if let Some(value) = self.store.get(None, key, name) {
            trace!(request = %request, "Resolved elsewhere before prefetch");
            self.stats.background_hit_elsewhere();
            self.listeners.notify(key, name, Some(&value));
            return;
        }

        let (value, speculative) = self.load(key, name);
        self.listeners.notify(key, name, Some(&value));
        self.notify_speculative(speculative);
    }
}

// =============================================================================
// Facade
// =============================================================================

/// Entity-attribute cache backed by an ordered list of providers
pub struct Turbo<K: EntityKey, V: Payload> {
    core: Arc<Core<K, V>>,
    worker: PrefetchWorker<K>,
    shut_down: AtomicBool,
}

impl<K: EntityKey, V: Payload> Turbo<K, V> {
    /// Create a cache without statistics
    pub fn new(providers: Vec<Arc<dyn TurboProvider<K, V>>>, config: TurboConfig) -> Result<Self> {
        Self::with_statistics(providers, config, Arc::new(NoStatistics))
    }

    /// Create a cache reporting to `stats`
    #[instrument(skip(providers, stats))]
    pub fn with_statistics(
        providers: Vec<Arc<dyn TurboProvider<K, V>>>,
        config: TurboConfig,
        stats: Arc<dyn TurboStatistics>,
    ) -> Result<Self> {
        config.validate()?;

        let chain = ProviderChain::new(providers);
        info!(providers = ?chain.provider_names(), "Creating attribute cache");

        let store = MemoryStore::new(config.memory.clone(), Arc::clone(&stats))?;
        let worker = PrefetchWorker::new(
            config.idle_timeout(),
            config.worker_name.clone(),
            Arc::clone(&stats),
        );

        Ok(Self {
            core: Arc::new(Core {
                store,
                chain,
                listeners: ListenerList::new(),
                stats,
            }),
            worker,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Read an attribute, consulting providers on a miss.
    ///
    /// May block for as long as the responsible provider takes. A pair no
    /// provider can answer reads as `Absent`.
    pub fn read(&self, key: &Arc<K>, name: &str) -> AttributeValue<V> {
        self.read_in(&mut PreparedSlot::new(), key, name)
    }

    /// [`read`](Self::read) that also consumes a value proven present by an
    /// earlier `prepare_in`/`is_prepared_in` on the same slot.
    pub fn read_in(&self, slot: &mut PreparedSlot<K, V>, key: &Arc<K>, name: &str) -> AttributeValue<V> {
        let core = &self.core;
        core.stats.attribute_request();

        if let Some(value) = core.store.get(Some(slot), key, name) {
            core.stats.memory_hit();
            return value;
        }

        let (value, speculative) = core.load(key, name);
        core.listeners.notify(key, name, Some(&value));
        core.notify_speculative(speculative);
        value
    }

    /// Write an attribute through the provider chain.
    ///
    /// `None` invalidates. Returns false only when the responsible provider
    /// rejected the value; the memory tier is then left untouched. Writing
    /// the value that is already cached does nothing at all, which assumes
    /// providers have no side effects beyond storing the value.
    pub fn write(&self, key: &Arc<K>, name: &str, value: Option<AttributeValue<V>>) -> bool {
        let core = &self.core;

        if let Some(new) = &value {
            if core.store.get(None, key, name).as_ref() == Some(new) {
                trace!(key = %key, attribute = name, "Unchanged value, skipping write");
                return true;
            }
        }

        match core.chain.write(key, name, value.as_ref()) {
            WriteOutcome::Rejected => false,
            outcome => {
                trace!(key = %key, attribute = name, ?outcome, "Write accepted");
                core.store.put(key, name, value.clone());
                core.listeners.notify(key, name, value.as_ref());
                true
            }
        }
    }

    /// Drop a cached attribute (a `None` write)
    pub fn invalidate(&self, key: &Arc<K>, name: &str) -> bool {
        self.write(key, name, None)
    }

    /// Make an attribute available without blocking.
    ///
    /// Returns true if the value can be read right away. Otherwise a
    /// background load is scheduled (or joined) and listeners are told
    /// when it completes.
    pub fn prepare(&self, key: &Arc<K>, name: &str) -> bool {
        self.prepare_in(&mut PreparedSlot::new(), key, name)
    }

    /// [`prepare`](Self::prepare) that remembers a found value in `slot`
    /// for the next `read_in`.
    pub fn prepare_in(&self, slot: &mut PreparedSlot<K, V>, key: &Arc<K>, name: &str) -> bool {
        let core = &self.core;
        core.stats.attribute_request();

        if core.store.exists(Some(slot), key, name) {
            core.stats.memory_hit();
            return true;
        }

        let request = PendingRequest::new(Arc::clone(key), name);
        let handler: Arc<dyn RequestHandler<K>> = self.core.clone();
        let submission = self.worker.submit(request, handler);
        trace!(key = %key, attribute = name, ?submission, "Prefetch requested");
        false
    }

    /// Whether `read` would answer from memory. Never schedules a load.
    pub fn is_prepared(&self, key: &Arc<K>, name: &str) -> bool {
        self.core.store.exists(None, key, name)
    }

    /// [`is_prepared`](Self::is_prepared) that remembers a found value in
    /// `slot` for the next `read_in`.
    pub fn is_prepared_in(&self, slot: &mut PreparedSlot<K, V>, key: &Arc<K>, name: &str) -> bool {
        self.core.store.exists(Some(slot), key, name)
    }

    /// The cached key instance equal to `key`.
    ///
    /// In lifetime-tracked mode, holding on to the returned instance keeps
    /// the entry alive; holding an equal but different instance does not.
    pub fn get_monitored_key(&self, key: &K) -> Option<Arc<K>> {
        self.core.store.monitored_key(key)
    }

    /// Register a change listener
    pub fn add_listener(&self, listener: Arc<dyn TurboListener<K, V>>) {
        self.core.listeners.add(listener);
    }

    /// Unregister a change listener. Returns true if it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn TurboListener<K, V>>) -> bool {
        self.core.listeners.remove(listener)
    }

    /// Drop entries whose keys have been reclaimed
    pub fn purge(&self) -> usize {
        self.core.store.purge()
    }

    /// Returns true while the prefetch thread is alive
    pub fn is_worker_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Requests waiting for or undergoing a background load
    pub fn pending_requests(&self) -> usize {
        self.worker.pending_len()
    }

    /// Block until scheduled background loads are done.
    /// Returns false if `timeout` elapsed first.
    pub fn wait_for_prefetch(&self, timeout: Duration) -> bool {
        self.worker.wait_drained(timeout)
    }

    /// Keys in the live and minimum memory tiers
    pub fn memory_len(&self) -> (usize, usize) {
        (self.core.store.live_len(), self.core.store.minimum_len())
    }

    /// Stop background loading and discard pending requests
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Shutting down attribute cache");
        self.worker.shutdown();
        self.core.stats.shutdown();
    }
}

impl<K: EntityKey, V: Payload> Drop for Turbo<K, V> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<K: EntityKey, V: Payload> fmt::Debug for Turbo<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Turbo")
            .field("chain", &self.core.chain)
            .field("store", &self.core.store)
            .field("listeners", &self.core.listeners)
            .field("worker", &self.worker)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
