//! Memory Store - In-Process Attribute Tier
//!
//! Two cooperating sub-tiers guarded by a single lock:
//!
//! - **Minimum tier**: strict LRU over the `min_size` most recently touched
//!   keys. Holds keys strongly, so it is a cache floor that survives even
//!   when callers drop every other reference.
//! - **Live tier**: either lifetime-tracked (holds `Weak` keys; an entry
//!   disappears once nothing outside the cache references its key) or
//!   bounded (holds keys strongly, capped at `max_size`, random batch
//!   eviction on overflow).
//!
//! Each key owns one attribute map. Both tiers point at the same map
//! (`Arc`), so a mutation through one lookup path is visible through the
//! other, and promotion never copies.

use std::collections::hash_map::RandomState;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::BuildHasher;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::entry::{AttributeValue, EntityKey, Payload, PreparedSlot};
use super::metrics::TurboStatistics;
use super::{DEFAULT_MIN_SIZE, MAX_EVICTION_BATCH, SWEEP_INTERVAL};
use crate::error::{Error, Result};

/// Attribute map shared between the tiers for one key
type AttrMap<V> = Arc<Mutex<HashMap<String, AttributeValue<V>>>>;

// =============================================================================
// Configuration
// =============================================================================

/// Memory store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Number of most recently used keys always kept
    pub min_size: usize,
    /// Live tier cap. `None` tracks key lifetimes instead of counting.
    pub max_size: Option<usize>,
    /// Seed for the overflow eviction sampler. `None` seeds from entropy.
    pub eviction_seed: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
            max_size: None,
            eviction_seed: None,
        }
    }
}

impl MemoryConfig {
    /// Lifetime-tracked store keeping at least `min_size` keys
    pub fn tracked(min_size: usize) -> Self {
        Self {
            min_size,
            max_size: None,
            eviction_seed: None,
        }
    }

    /// Counted store with a hard `max_size` cap on the live tier
    pub fn bounded(min_size: usize, max_size: usize) -> Self {
        Self {
            min_size,
            max_size: Some(max_size),
            eviction_seed: None,
        }
    }

    /// Build from the `(min, max)` pair convention where `max == -1`
    /// selects lifetime tracking.
    pub fn from_sizes(min_size: i64, max_size: i64) -> Result<Self> {
        let min = usize::try_from(min_size)
            .map_err(|_| Error::config(format!("min_size must not be negative: {}", min_size)))?;
        let max = match max_size {
            -1 => None,
            m => Some(usize::try_from(m).map_err(|_| {
                Error::config(format!("max_size must be -1 or non-negative: {}", m))
            })?),
        };
        let config = Self {
            min_size: min,
            max_size: max,
            eviction_seed: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Fix the eviction sampler seed (reproducible tests)
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.eviction_seed = Some(seed);
        self
    }

    /// Returns true for lifetime-tracked mode
    pub fn is_tracked(&self) -> bool {
        self.max_size.is_none()
    }

    /// Check the size combination
    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 {
            return Err(Error::config("min_size must be at least 1"));
        }
        if let Some(max) = self.max_size {
            if max < self.min_size {
                return Err(Error::config(format!(
                    "max_size ({}) must not be smaller than min_size ({})",
                    max, self.min_size
                )));
            }
        }
        Ok(())
    }
}

/// Store mutations before the next sweep of a tier holding `slots` weak
/// slots. A sweep walks every slot, so the interval grows with the tier
/// to keep the amortized cost per mutation constant.
fn sweep_threshold(slots: usize) -> usize {
    SWEEP_INTERVAL.max(slots / 2)
}

/// Number of keys removed per overflow of a bounded live tier
pub fn eviction_batch(max_size: usize) -> usize {
    (max_size / 10).clamp(1, MAX_EVICTION_BATCH)
}

// =============================================================================
// Minimum Tier (strict LRU)
// =============================================================================

struct MinEntry<K, V> {
    tick: u64,
    key: Arc<K>,
    map: AttrMap<V>,
}

/// Access-ordered tier of the `capacity` most recently touched keys
struct MinimumTier<K, V> {
    capacity: usize,
    entries: HashMap<Arc<K>, MinEntry<K, V>>,
    /// tick -> key, oldest first
    order: BTreeMap<u64, Arc<K>>,
    tick: u64,
}

impl<K: EntityKey, V> MinimumTier<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: BTreeMap::new(),
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up and mark as most recently used
    fn touch(&mut self, key: &K) -> Option<(Arc<K>, AttrMap<V>)> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, Arc::clone(&entry.key));
        Some((Arc::clone(&entry.key), Arc::clone(&entry.map)))
    }

    fn peek(&self, key: &K) -> Option<&Arc<K>> {
        self.entries.get(key).map(|e| &e.key)
    }

    fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert as most recently used. Returns the evicted key, if any.
    fn insert(&mut self, key: Arc<K>, map: AttrMap<V>) -> Option<Arc<K>> {
        if self.touch(&*key).is_some() {
            return None;
        }
        let tick = self.next_tick();
        self.order.insert(tick, Arc::clone(&key));
        self.entries.insert(
            Arc::clone(&key),
            MinEntry {
                tick,
                key,
                map,
            },
        );

        if self.entries.len() > self.capacity {
            let (_, oldest) = self.order.pop_first()?;
            self.entries.remove(&*oldest);
            return Some(oldest);
        }
        None
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// =============================================================================
// Live Tier
// =============================================================================

struct WeakSlot<K, V> {
    key: Weak<K>,
    /// Display form kept for reporting once the key is gone
    label: Option<String>,
    map: AttrMap<V>,
}

/// Lifetime-tracked tier: holds keys weakly, bucketed by key hash
struct TrackedTier<K, V> {
    hasher: RandomState,
    buckets: HashMap<u64, Vec<WeakSlot<K, V>>>,
    slots: usize,
}

impl<K: EntityKey, V> TrackedTier<K, V> {
    fn new() -> Self {
        Self {
            hasher: RandomState::new(),
            buckets: HashMap::new(),
            slots: 0,
        }
    }

    fn get(&self, key: &K) -> Option<(Arc<K>, AttrMap<V>)> {
        let bucket = self.buckets.get(&self.hasher.hash_one(key))?;
        bucket.iter().find_map(|slot| {
            let live = slot.key.upgrade()?;
            (*live == *key).then(|| (live, Arc::clone(&slot.map)))
        })
    }

    fn insert(&mut self, key: &Arc<K>, map: AttrMap<V>, label: Option<String>) {
        let hash = self.hasher.hash_one(&**key);
        self.buckets.entry(hash).or_default().push(WeakSlot {
            key: Arc::downgrade(key),
            label,
            map,
        });
        self.slots += 1;
    }

    /// Drop slots whose key has been reclaimed, returning their labels
    fn sweep(&mut self) -> Vec<Option<String>> {
        let mut dead = Vec::new();
        self.buckets.retain(|_, bucket| {
            bucket.retain_mut(|slot| {
                if slot.key.strong_count() > 0 {
                    true
                } else {
                    dead.push(slot.label.take());
                    false
                }
            });
            !bucket.is_empty()
        });
        self.slots -= dead.len();
        dead
    }

    fn len(&self) -> usize {
        self.slots
    }
}

/// Counted tier: holds keys strongly, capped at `max_size`
struct BoundedTier<K, V> {
    max_size: usize,
    map: HashMap<Arc<K>, AttrMap<V>>,
    rng: StdRng,
}

impl<K: EntityKey, V> BoundedTier<K, V> {
    fn new(max_size: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            max_size,
            map: HashMap::new(),
            rng,
        }
    }

    fn get(&self, key: &K) -> Option<(Arc<K>, AttrMap<V>)> {
        self.map
            .get_key_value(key)
            .map(|(k, m)| (Arc::clone(k), Arc::clone(m)))
    }

    /// Insert, first evicting a random batch if the cap is reached.
    /// Returns the evicted keys.
    fn insert(&mut self, key: Arc<K>, map: AttrMap<V>) -> Vec<Arc<K>> {
        let evicted = if self.map.len() >= self.max_size && !self.map.contains_key(&*key) {
            self.evict_batch()
        } else {
            Vec::new()
        };
        self.map.insert(key, map);
        evicted
    }

    fn evict_batch(&mut self) -> Vec<Arc<K>> {
        let len = self.map.len();
        let amount = eviction_batch(self.max_size).min(len);
        let keys: Vec<Arc<K>> = self.map.keys().cloned().collect();
        let victims: Vec<Arc<K>> = rand::seq::index::sample(&mut self.rng, len, amount)
            .into_iter()
            .map(|i| Arc::clone(&keys[i]))
            .collect();
        for victim in &victims {
            self.map.remove(&**victim);
        }
        victims
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

enum LiveTier<K, V> {
    Tracked(TrackedTier<K, V>),
    Bounded(BoundedTier<K, V>),
}

impl<K: EntityKey, V> LiveTier<K, V> {
    fn get(&self, key: &K) -> Option<(Arc<K>, AttrMap<V>)> {
        match self {
            LiveTier::Tracked(t) => t.get(key),
            LiveTier::Bounded(b) => b.get(key),
        }
    }

    fn len(&self) -> usize {
        match self {
            LiveTier::Tracked(t) => t.len(),
            LiveTier::Bounded(b) => b.len(),
        }
    }
}

// =============================================================================
// Memory Store
// =============================================================================

struct Tiers<K, V> {
    minimum: MinimumTier<K, V>,
    live: LiveTier<K, V>,
    mutations: usize,
}

/// The two-tier in-process attribute store
pub struct MemoryStore<K, V> {
    tiers: Mutex<Tiers<K, V>>,
    config: MemoryConfig,
    stats: Arc<dyn TurboStatistics>,
    track_keys: bool,
}

impl<K: EntityKey, V: Payload> MemoryStore<K, V> {
    /// Create a store, validating the configuration
    pub fn new(config: MemoryConfig, stats: Arc<dyn TurboStatistics>) -> Result<Self> {
        config.validate()?;
        let live = match config.max_size {
            None => LiveTier::Tracked(TrackedTier::new()),
            Some(max) => LiveTier::Bounded(BoundedTier::new(max, config.eviction_seed)),
        };
        debug!(
            min_size = config.min_size,
            max_size = ?config.max_size,
            "Memory store created"
        );
        Ok(Self {
            tiers: Mutex::new(Tiers {
                minimum: MinimumTier::new(config.min_size),
                live,
                mutations: 0,
            }),
            config,
            track_keys: stats.tracks_keys(),
            stats,
        })
    }

    /// The configuration this store was built with
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Look up a cached value.
    ///
    /// Returns `Some` for a cached entry (including `Absent`) and `None`
    /// when nothing is known. A matching prepared entry in `slot` answers
    /// a miss; the slot is emptied either way.
    pub fn get(
        &self,
        slot: Option<&mut PreparedSlot<K, V>>,
        key: &K,
        name: &str,
    ) -> Option<AttributeValue<V>> {
        let found = {
            let mut tiers = self.tiers.lock();
            self.locate(&mut tiers, key)
                .and_then(|(_, map)| map.lock().get(name).cloned())
        };
        let memo = slot.and_then(|s| s.take_matching(key, name));
        if found.is_none() && memo.is_some() {
            trace!(key = %key, attribute = name, "Answered from prepared slot");
        }
        found.or(memo)
    }

    /// Check for a cached value, remembering it in `slot` when found
    pub fn exists(&self, slot: Option<&mut PreparedSlot<K, V>>, key: &K, name: &str) -> bool {
        let found = {
            let mut tiers = self.tiers.lock();
            self.locate(&mut tiers, key).and_then(|(instance, map)| {
                let value = map.lock().get(name).cloned();
                value.map(|v| (instance, v))
            })
        };
        match (found, slot) {
            (Some((instance, value)), Some(slot)) => {
                slot.remember(instance, name, value);
                true
            }
            (Some(_), None) => true,
            (None, Some(slot)) => {
                slot.clear();
                false
            }
            (None, None) => false,
        }
    }

    /// Store a value. `None` removes the attribute from the key's map.
    pub fn put(&self, key: &Arc<K>, name: &str, value: Option<AttributeValue<V>>) {
        let mut tiers = self.tiers.lock();
        self.maybe_sweep(&mut tiers);

        if let Some((_, map)) = self.locate(&mut tiers, key) {
            let mut map = map.lock();
            match value {
                Some(v) => {
                    map.insert(name.to_string(), v);
                }
                None => {
                    map.remove(name);
                }
            }
            return;
        }

        let Some(value) = value else {
            return;
        };

        let map: AttrMap<V> = Arc::new(Mutex::new(HashMap::from([(name.to_string(), value)])));
        let label = self.label(key);
        if let Some(label) = &label {
            self.stats.key_added(label);
        }
        trace!(key = %key, "New key cached");

        let evicted = match &mut tiers.live {
            LiveTier::Tracked(t) => {
                t.insert(key, Arc::clone(&map), label);
                Vec::new()
            }
            LiveTier::Bounded(b) => b.insert(Arc::clone(key), Arc::clone(&map)),
        };
        self.report_live_evictions(&tiers, evicted);

        if let Some(old) = tiers.minimum.insert(Arc::clone(key), map) {
            self.report_minimum_eviction(&tiers, &old);
        }
    }

    /// The cached key instance value-equal to `key`, if any
    pub fn monitored_key(&self, key: &K) -> Option<Arc<K>> {
        let tiers = self.tiers.lock();
        tiers
            .live
            .get(key)
            .map(|(instance, _)| instance)
            .or_else(|| tiers.minimum.peek(key).cloned())
    }

    /// Returns true if any tier holds the key
    pub fn contains_key(&self, key: &K) -> bool {
        let tiers = self.tiers.lock();
        tiers.minimum.contains(key) || tiers.live.get(key).is_some()
    }

    /// Drop reclaimed keys from a lifetime-tracked live tier now.
    /// Returns the number of keys removed.
    pub fn purge(&self) -> usize {
        let mut tiers = self.tiers.lock();
        self.sweep(&mut tiers)
    }

    /// Number of keys in the live tier
    pub fn live_len(&self) -> usize {
        self.tiers.lock().live.len()
    }

    /// Number of keys in the minimum tier
    pub fn minimum_len(&self) -> usize {
        self.tiers.lock().minimum.len()
    }

    /// Find the key's map, applying the promotion rule.
    ///
    /// A live hit refreshes the key in the minimum tier; a minimum-only
    /// hit installs the same map into the live tier.
    fn locate(&self, tiers: &mut Tiers<K, V>, key: &K) -> Option<(Arc<K>, AttrMap<V>)> {
        if let Some((instance, map)) = tiers.live.get(key) {
            if tiers.minimum.touch(key).is_none() {
                if let Some(old) = tiers.minimum.insert(Arc::clone(&instance), Arc::clone(&map)) {
                    self.report_minimum_eviction(tiers, &old);
                }
            }
            return Some((instance, map));
        }

        let (instance, map) = tiers.minimum.touch(key)?;
        trace!(key = %key, "Promoting key from minimum tier");
        let evicted = match &mut tiers.live {
            LiveTier::Tracked(t) => {
                t.insert(&instance, Arc::clone(&map), self.label(&instance));
                Vec::new()
            }
            LiveTier::Bounded(b) => b.insert(Arc::clone(&instance), Arc::clone(&map)),
        };
        self.report_live_evictions(tiers, evicted);
        Some((instance, map))
    }

    /// Key text for the statistics sink, if it wants keys at all
    fn label(&self, key: &K) -> Option<String> {
        self.track_keys.then(|| key.to_string())
    }

    fn maybe_sweep(&self, tiers: &mut Tiers<K, V>) {
        tiers.mutations += 1;
        if tiers.mutations >= sweep_threshold(tiers.live.len()) {
            self.sweep(tiers);
        }
    }

    fn sweep(&self, tiers: &mut Tiers<K, V>) -> usize {
        tiers.mutations = 0;
        let LiveTier::Tracked(t) = &mut tiers.live else {
            return 0;
        };
        let dead = t.sweep();
        for label in dead.iter().flatten() {
            self.stats.key_removed(label);
        }
        if !dead.is_empty() {
            debug!(removed = dead.len(), "Swept reclaimed keys");
        }
        dead.len()
    }

    fn report_live_evictions(&self, tiers: &Tiers<K, V>, evicted: Vec<Arc<K>>) {
        if evicted.is_empty() {
            return;
        }
        trace!(count = evicted.len(), "Live tier overflow eviction");
        for key in evicted {
            if !tiers.minimum.contains(&key) {
                if let Some(label) = self.label(&key) {
                    self.stats.key_removed(&label);
                }
            }
        }
    }

    fn report_minimum_eviction(&self, tiers: &Tiers<K, V>, key: &Arc<K>) {
        // A tracked key stays reachable through its weak slot until reclaimed
        if let LiveTier::Bounded(b) = &tiers.live {
            if b.get(key).is_none() {
                if let Some(label) = self.label(key) {
                    self.stats.key_removed(&label);
                }
            }
        }
    }
}

impl<K, V> fmt::Debug for MemoryStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (minimum, live) = match self.tiers.try_lock() {
            Some(t) => {
                let live = match &t.live {
                    LiveTier::Tracked(tr) => tr.slots,
                    LiveTier::Bounded(b) => b.map.len(),
                };
                (Some(t.minimum.entries.len()), Some(live))
            }
            None => (None, None),
        };
        f.debug_struct("MemoryStore")
            .field("config", &self.config)
            .field("minimum_keys", &minimum)
            .field("live_keys", &live)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
