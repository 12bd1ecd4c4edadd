//! Turbo - Entity-Attribute Cache
//!
//! Maps an opaque entity key plus an attribute name to a lazily computed
//! value, backed by ordered providers and fronted by an in-process memory
//! tier.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Turbo (facade)                                │
//! │   read / write / prepare / is_prepared / get_monitored_key            │
//! ├──────────────────────┬────────────────────────┬──────────────────────┤
//! │  MemoryStore         │  ProviderChain         │  PrefetchWorker      │
//! │  ┌────────────────┐  │  provider 1            │  pending set         │
//! │  │ minimum (LRU)  │  │  provider 2            │  (de-duplicated)     │
//! │  ├────────────────┤  │  ...                   │  one lazy thread,    │
//! │  │ live (weak or  │  │  noop fallback         │  exits when idle     │
//! │  │ bounded)       │  │                        │                      │
//! │  └────────────────┘  │                        │                      │
//! ├──────────────────────┴────────────────────────┴──────────────────────┤
//! │        ListenerList (copy-on-write)    │    TurboStatistics sink      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A synchronous `read` consults memory, then walks the chain and caches
//! the answer. `prepare` never blocks: on a miss it queues a request for
//! the worker and returns false; listeners hear about the value once it
//! has been loaded.

mod entry;
mod listener;
mod manager;
mod memory;
mod metrics;
mod provider;
mod worker;

mod proptest;

pub use entry::{
    AttributeValue, EntityKey, Payload, PendingRequest, PreparedSlot, SpeculativeResult,
};
pub use listener::{ListenerList, TurboListener};
pub use manager::{Turbo, TurboConfig};
pub use memory::{eviction_batch, MemoryConfig, MemoryStore};
pub use metrics::{CountingStatistics, NoStatistics, StatisticsSnapshot, TurboStatistics};
pub use provider::{
    NoopProvider, ProviderChain, ProviderResult, SpeculativeSink, TurboProvider, WriteOutcome,
};
pub use worker::{PrefetchWorker, RequestHandler, Submission};

use std::time::Duration;

/// Default number of keys the minimum tier always keeps
pub const DEFAULT_MIN_SIZE: usize = 50;

/// Upper bound on keys removed per live tier overflow
pub const MAX_EVICTION_BATCH: usize = 7;

/// Minimum store mutations between sweeps of reclaimed weak keys
pub const SWEEP_INTERVAL: usize = 64;

/// How long an idle prefetch worker waits before exiting
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(123);

/// Default prefetch thread name
pub const DEFAULT_WORKER_NAME: &str = "turbo-prefetch";

// =============================================================================
// Tests
// =============================================================================
