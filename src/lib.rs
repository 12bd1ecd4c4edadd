//! Turbo - Pluggable Entity-Attribute Cache
//!
//! A dictionary from an opaque entity key plus an attribute name to a
//! lazily computed value. Values come from an ordered list of providers
//! and are kept in an in-process memory tier with two eviction strategies:
//! a strict LRU floor and a live tier that either tracks key lifetimes or
//! is capped with random batch eviction.
//!
//! # Architecture
//!
//! ```text
//! caller ──read/write──▶ Turbo ──miss──▶ ProviderChain ──▶ providers
//!    │                     │  ▲
//!    └──prepare──▶ PrefetchWorker (one lazy thread)
//!                          │
//!                     MemoryStore ──▶ listeners / statistics
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use turbo::{AttributeValue, ProviderResult, SpeculativeSink, Turbo, TurboConfig, TurboProvider};
//!
//! struct Length;
//!
//! impl TurboProvider<String, usize> for Length {
//!     fn recognizes_attribute(&self, name: &str) -> bool {
//!         name == "len"
//!     }
//!
//!     fn recognizes_entity(&self, _key: &String) -> bool {
//!         true
//!     }
//!
//!     fn read_entry(
//!         &self,
//!         key: &Arc<String>,
//!         _name: &str,
//!         _cache: &mut SpeculativeSink<'_, String, usize>,
//!     ) -> ProviderResult<Option<AttributeValue<usize>>> {
//!         Ok(Some(AttributeValue::Present(key.len())))
//!     }
//!
//!     fn write_entry(
//!         &self,
//!         _key: &Arc<String>,
//!         _name: &str,
//!         _value: Option<&AttributeValue<usize>>,
//!     ) -> ProviderResult<bool> {
//!         Ok(false)
//!     }
//! }
//!
//! let providers: Vec<Arc<dyn TurboProvider<String, usize>>> = vec![Arc::new(Length)];
//! let turbo = Turbo::new(providers, TurboConfig::default()).unwrap();
//! let key = Arc::new("hello".to_string());
//! assert_eq!(turbo.read(&key, "len"), AttributeValue::Present(5));
//! ```
//!
//! # Modules
//!
//! - [`turbo`] - Memory store, provider chain, prefetch worker and facade
//! - [`error`] - Error types

pub mod error;
pub mod turbo;

// Re-export commonly used types
pub use error::{Error, Result};
pub use turbo::{
    AttributeValue, CountingStatistics, EntityKey, MemoryConfig, NoStatistics, PreparedSlot,
    ProviderResult, SpeculativeSink, StatisticsSnapshot, Turbo, TurboConfig, TurboListener,
    TurboProvider, TurboStatistics, WriteOutcome,
};
