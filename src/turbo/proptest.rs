//! Property-Based Tests for the Memory Store
//!
//! # Test Properties
//!
//! 1. **Overflow Bound**: a bounded live tier never exceeds `max_size` and
//!    sheds at most one eviction batch per insert
//! 2. **LRU Floor**: the `min_size` most recently touched keys are always
//!    readable, even after callers drop them
//! 3. **Last Write Wins**: the value read back is the last one stored

#![cfg(test)]

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;

use super::entry::AttributeValue;
use super::memory::{eviction_batch, MemoryConfig, MemoryStore};
use super::metrics::NoStatistics;

fn bounded(min: usize, max: usize, seed: u64) -> MemoryStore<String, u32> {
    MemoryStore::new(
        MemoryConfig::bounded(min, max).with_seed(seed),
        Arc::new(NoStatistics),
    )
    .unwrap()
}

fn tracked(min: usize) -> MemoryStore<String, u32> {
    MemoryStore::new(MemoryConfig::tracked(min), Arc::new(NoStatistics)).unwrap()
}

/// Strategy for (min_size, max_size) with min <= max
fn sizes_strategy() -> impl Strategy<Value = (usize, usize)> {
    (1usize..=20, 1usize..=200).prop_map(|(min, max)| (min.min(max), max))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: the live tier stays within its cap and each overflow
    /// removes no more than one batch.
    #[test]
    fn prop_overflow_bound(
        (min, max) in sizes_strategy(),
        inserts in 1usize..1500,
        seed in any::<u64>(),
    ) {
        let store = bounded(min, max, seed);
        let batch = eviction_batch(max);
        let mut previous = 0usize;

        for i in 0..inserts {
            store.put(&Arc::new(format!("k{}", i)), "a", Some(AttributeValue::Present(i as u32)));
            let len = store.live_len();
            prop_assert!(len <= max);
            if len <= previous {
                prop_assert!(previous + 1 - len <= batch);
            }
            previous = len;
        }
    }

    /// Property: the most recently touched `min` keys survive even when no
    /// caller holds them anymore.
    #[test]
    fn prop_lru_floor(min in 1usize..16, total in 1usize..200) {
        let store = tracked(min);
        for i in 0..total {
            store.put(&Arc::new(format!("k{}", i)), "a", Some(AttributeValue::Present(i as u32)));
        }
        store.purge();

        let first_kept = total.saturating_sub(min);
        for i in first_kept..total {
            prop_assert_eq!(
                store.get(None, &format!("k{}", i), "a"),
                Some(AttributeValue::Present(i as u32))
            );
        }
        prop_assert!(store.minimum_len() <= min);
    }

    /// Property: with a key population that fits, the last stored value wins.
    #[test]
    fn prop_last_write_wins(ops in prop::collection::vec((0u8..10, 0u32..1000), 1..300)) {
        let store = bounded(10, 10, 1);
        let keys: Vec<Arc<String>> = (0..10).map(|i| Arc::new(format!("k{}", i))).collect();
        let mut expected = HashMap::new();

        for (k, v) in ops {
            store.put(&keys[k as usize], "a", Some(AttributeValue::Present(v)));
            expected.insert(k, v);
        }
        for (k, v) in expected {
            prop_assert_eq!(
                store.get(None, &keys[k as usize], "a"),
                Some(AttributeValue::Present(v))
            );
        }
    }
}
