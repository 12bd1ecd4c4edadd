//! Turbo Integration Tests
//!
//! End-to-end scenarios through the public facade:
//! - Synchronous read/write paths and statistics
//! - Background prefetch, de-duplication and notifications
//! - Memory tier behaviour under key reclamation and overflow

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use turbo::{
    AttributeValue, CountingStatistics, MemoryConfig, PreparedSlot, ProviderResult,
    SpeculativeSink, Turbo, TurboConfig, TurboListener, TurboProvider,
};

// =============================================================================
// Fixtures
// =============================================================================

/// Answers `size` with a fixed value for every key
struct SizeProvider {
    size: u64,
    reads: AtomicUsize,
    delay: Duration,
}

impl SizeProvider {
    fn new(size: u64) -> Self {
        Self {
            size,
            reads: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn slow(size: u64, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(size)
        }
    }
}

impl TurboProvider<String, u64> for SizeProvider {
    fn name(&self) -> &str {
        "size"
    }

    fn recognizes_attribute(&self, name: &str) -> bool {
        name == "size"
    }

    fn recognizes_entity(&self, _key: &String) -> bool {
        true
    }

    fn read_entry(
        &self,
        _key: &Arc<String>,
        _name: &str,
        _cache: &mut SpeculativeSink<'_, String, u64>,
    ) -> ProviderResult<Option<AttributeValue<u64>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok(Some(AttributeValue::Present(self.size)))
    }

    fn write_entry(
        &self,
        _key: &Arc<String>,
        _name: &str,
        _value: Option<&AttributeValue<u64>>,
    ) -> ProviderResult<bool> {
        Ok(true)
    }
}

/// Accepts writes for `status` into a table, rejects writes for `locked`
#[derive(Default)]
struct StatusProvider {
    table: Mutex<HashMap<(String, String), AttributeValue<u64>>>,
    writes: AtomicUsize,
}

impl TurboProvider<String, u64> for StatusProvider {
    fn name(&self) -> &str {
        "status"
    }

    fn recognizes_attribute(&self, name: &str) -> bool {
        name == "status" || name == "locked"
    }

    fn recognizes_entity(&self, _key: &String) -> bool {
        true
    }

    fn read_entry(
        &self,
        key: &Arc<String>,
        name: &str,
        _cache: &mut SpeculativeSink<'_, String, u64>,
    ) -> ProviderResult<Option<AttributeValue<u64>>> {
        Ok(self
            .table
            .lock()
            .get(&(key.to_string(), name.to_string()))
            .cloned())
    }

    fn write_entry(
        &self,
        key: &Arc<String>,
        name: &str,
        value: Option<&AttributeValue<u64>>,
    ) -> ProviderResult<bool> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if name == "locked" {
            return Ok(false);
        }
        let slot = (key.to_string(), name.to_string());
        let mut table = self.table.lock();
        match value {
            Some(v) => table.insert(slot, v.clone()),
            None => table.remove(&slot),
        };
        Ok(true)
    }
}

/// Records every notification
#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<(String, String, Option<AttributeValue<u64>>)>>,
}

impl TurboListener<String, u64> for RecordingListener {
    fn entry_changed(&self, key: &Arc<String>, name: &str, value: Option<&AttributeValue<u64>>) {
        self.events
            .lock()
            .push((key.to_string(), name.to_string(), value.cloned()));
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn key(s: &str) -> Arc<String> {
    Arc::new(s.to_string())
}

fn config(memory: MemoryConfig) -> TurboConfig {
    let mut config = TurboConfig::with_memory(memory);
    config.idle_timeout_ms = 200;
    config
}

// =============================================================================
// Synchronous Paths
// =============================================================================

mod sync_tests {
    use super::*;

    #[test]
    fn test_read_miss_then_memory_hit() {
        init_tracing();
        let provider = Arc::new(SizeProvider::new(42));
        let stats = Arc::new(CountingStatistics::new());
        let turbo = Turbo::with_statistics(
            vec![provider.clone() as Arc<dyn TurboProvider<String, u64>>],
            config(MemoryConfig::tracked(10)),
            stats.clone(),
        )
        .unwrap();
        let k = key("src/main.c");

        assert_eq!(turbo.read(&k, "size"), AttributeValue::Present(42));
        let snap = stats.snapshot();
        assert_eq!(snap.provider_hits, 1);
        assert_eq!(snap.memory_hits, 0);

        assert_eq!(turbo.read(&k, "size"), AttributeValue::Present(42));
        let snap = stats.snapshot();
        assert_eq!(snap.provider_hits, 1);
        assert_eq!(snap.memory_hits, 1);
        assert_eq!(provider.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_absent_sentinel_distinct_from_unknown() {
        let turbo: Turbo<String, u64> = Turbo::new(
            vec![Arc::new(StatusProvider::default()) as Arc<dyn TurboProvider<_, _>>],
            config(MemoryConfig::tracked(10)),
        )
        .unwrap();
        let k = key("a.txt");

        assert!(turbo.write(&k, "status", Some(AttributeValue::Absent)));
        assert!(turbo.is_prepared(&k, "status"));
        assert_eq!(turbo.read(&k, "status"), AttributeValue::Absent);

        let never = key("b.txt");
        assert!(!turbo.is_prepared(&never, "status"));
    }

    #[test]
    fn test_unchanged_write_calls_provider_once() {
        let provider = Arc::new(StatusProvider::default());
        let listener = Arc::new(RecordingListener::default());
        let turbo: Turbo<String, u64> = Turbo::new(
            vec![provider.clone() as Arc<dyn TurboProvider<_, _>>],
            config(MemoryConfig::tracked(10)),
        )
        .unwrap();
        turbo.add_listener(listener.clone());
        let k = key("a.txt");

        assert!(turbo.write(&k, "status", Some(AttributeValue::Present(3))));
        assert!(turbo.write(&k, "status", Some(AttributeValue::Present(3))));

        assert_eq!(provider.writes.load(Ordering::SeqCst), 1);
        assert_eq!(listener.events.lock().len(), 1);
    }

    #[test]
    fn test_rejection_propagates() {
        let turbo: Turbo<String, u64> = Turbo::new(
            vec![Arc::new(StatusProvider::default()) as Arc<dyn TurboProvider<_, _>>],
            config(MemoryConfig::tracked(10)),
        )
        .unwrap();
        let k = key("a.txt");

        assert!(!turbo.write(&k, "locked", Some(AttributeValue::Present(1))));
        assert!(!turbo.is_prepared(&k, "locked"));
        assert!(turbo.get_monitored_key(&k).is_none());
    }

    #[test]
    fn test_remove_listener_stops_delivery() {
        let turbo: Turbo<String, u64> = Turbo::new(
            vec![Arc::new(StatusProvider::default()) as Arc<dyn TurboProvider<_, _>>],
            config(MemoryConfig::tracked(10)),
        )
        .unwrap();
        let recorder = Arc::new(RecordingListener::default());
        let listener: Arc<dyn TurboListener<String, u64>> = recorder.clone();
        turbo.add_listener(Arc::clone(&listener));

        let k = key("a.txt");
        turbo.write(&k, "status", Some(AttributeValue::Present(1)));
        assert!(turbo.remove_listener(&listener));
        turbo.write(&k, "status", Some(AttributeValue::Present(2)));

        let events = recorder.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            ("a.txt".to_string(), "status".to_string(), Some(AttributeValue::Present(1)))
        );
    }
}

// =============================================================================
// Background Prefetch
// =============================================================================

mod prefetch_tests {
    use super::*;

    #[test]
    fn test_concurrent_prepare_loads_once() {
        init_tracing();
        let provider = Arc::new(SizeProvider::slow(7, Duration::from_millis(100)));
        let stats = Arc::new(CountingStatistics::new());
        let turbo = Arc::new(
            Turbo::with_statistics(
                vec![provider.clone() as Arc<dyn TurboProvider<String, u64>>],
                config(MemoryConfig::tracked(10)),
                stats.clone(),
            )
            .unwrap(),
        );
        let k = key("big.iso");
        let barrier = Arc::new(Barrier::new(50));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let turbo = Arc::clone(&turbo);
                let barrier = Arc::clone(&barrier);
                // Each caller brings its own, merely equal, key instance
                let k = key(k.as_str());
                thread::spawn(move || {
                    barrier.wait();
                    turbo.prepare(&k, "size")
                })
            })
            .collect();

        let ready = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|ready| *ready)
            .count();
        assert!(turbo.wait_for_prefetch(Duration::from_secs(10)));

        assert_eq!(provider.reads.load(Ordering::SeqCst), 1);
        let snap = stats.snapshot();
        assert_eq!(snap.background_threads, 1);
        assert!(snap.duplicate_requests + ready as u64 <= 49);
        assert!(turbo.is_prepared(&k, "size"));
        assert_eq!(turbo.read(&k, "size"), AttributeValue::Present(7));
    }

    #[test]
    fn test_background_load_notifies() {
        init_tracing();
        let turbo: Turbo<String, u64> = Turbo::new(
            vec![Arc::new(SizeProvider::new(5)) as Arc<dyn TurboProvider<_, _>>],
            config(MemoryConfig::tracked(10)),
        )
        .unwrap();
        let listener = Arc::new(RecordingListener::default());
        turbo.add_listener(listener.clone());
        let k = key("a.bin");

        assert!(!turbo.prepare(&k, "size"));
        assert!(turbo.wait_for_prefetch(Duration::from_secs(5)));

        let events = listener.events.lock().clone();
        assert_eq!(
            events,
            vec![("a.bin".to_string(), "size".to_string(), Some(AttributeValue::Present(5)))]
        );
        assert!(turbo.prepare(&k, "size"));
    }

    #[test]
    fn test_prepared_slot_roundtrip() {
        let turbo: Turbo<String, u64> = Turbo::new(
            vec![Arc::new(SizeProvider::new(5)) as Arc<dyn TurboProvider<_, _>>],
            config(MemoryConfig::bounded(1, 1)),
        )
        .unwrap();
        let k = key("a.bin");
        turbo.read(&k, "size");

        let mut slot = PreparedSlot::new();
        assert!(turbo.is_prepared_in(&mut slot, &k, "size"));

        // Evict the entry between the check and the read
        turbo.write(&key("other"), "size", Some(AttributeValue::Present(0)));
        assert_eq!(turbo.read_in(&mut slot, &k, "size"), AttributeValue::Present(5));
    }

    #[test]
    fn test_worker_restarts_after_idle_exit() {
        let stats = Arc::new(CountingStatistics::new());
        let turbo = Turbo::with_statistics(
            vec![Arc::new(SizeProvider::new(1)) as Arc<dyn TurboProvider<String, u64>>],
            config(MemoryConfig::tracked(10)),
            stats.clone(),
        )
        .unwrap();

        turbo.prepare(&key("a"), "size");
        assert!(turbo.wait_for_prefetch(Duration::from_secs(5)));
        for _ in 0..100 {
            if !turbo.is_worker_running() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!turbo.is_worker_running());

        turbo.prepare(&key("b"), "size");
        assert!(turbo.wait_for_prefetch(Duration::from_secs(5)));
        assert_eq!(stats.snapshot().background_threads, 2);
    }

    /// Answers `size` and reports `mtime` on the side, like a stat() call
    struct StatProvider;

    impl TurboProvider<String, u64> for StatProvider {
        fn recognizes_attribute(&self, name: &str) -> bool {
            name == "size" || name == "mtime"
        }

        fn recognizes_entity(&self, _key: &String) -> bool {
            true
        }

        fn read_entry(
            &self,
            key: &Arc<String>,
            _name: &str,
            cache: &mut SpeculativeSink<'_, String, u64>,
        ) -> ProviderResult<Option<AttributeValue<u64>>> {
            cache.cache_entry(Arc::clone(key), "mtime", AttributeValue::Present(1_700_000_000));
            Ok(Some(AttributeValue::Present(4096)))
        }

        fn write_entry(
            &self,
            _key: &Arc<String>,
            _name: &str,
            _value: Option<&AttributeValue<u64>>,
        ) -> ProviderResult<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_background_speculative_notified_after_request() {
        let turbo: Turbo<String, u64> = Turbo::new(
            vec![Arc::new(StatProvider) as Arc<dyn TurboProvider<_, _>>],
            config(MemoryConfig::tracked(10)),
        )
        .unwrap();
        let listener = Arc::new(RecordingListener::default());
        turbo.add_listener(listener.clone());
        let k = key("disk.img");

        assert!(!turbo.prepare(&k, "size"));
        assert!(turbo.wait_for_prefetch(Duration::from_secs(5)));

        let events = listener.events.lock().clone();
        assert_eq!(
            events,
            vec![
                ("disk.img".to_string(), "size".to_string(), Some(AttributeValue::Present(4096))),
                (
                    "disk.img".to_string(),
                    "mtime".to_string(),
                    Some(AttributeValue::Present(1_700_000_000))
                ),
            ]
        );
        assert!(turbo.is_prepared(&k, "mtime"));
    }

    /// Holds every read of `blocker` until released
    #[derive(Default)]
    struct GatedProvider {
        entered: AtomicBool,
        released: AtomicBool,
        reads: Mutex<Vec<String>>,
    }

    impl TurboProvider<String, u64> for GatedProvider {
        fn recognizes_attribute(&self, name: &str) -> bool {
            name == "size"
        }

        fn recognizes_entity(&self, _key: &String) -> bool {
            true
        }

        fn read_entry(
            &self,
            key: &Arc<String>,
            _name: &str,
            _cache: &mut SpeculativeSink<'_, String, u64>,
        ) -> ProviderResult<Option<AttributeValue<u64>>> {
            self.reads.lock().push(key.to_string());
            if key.as_str() == "blocker" {
                self.entered.store(true, Ordering::SeqCst);
                while !self.released.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
            }
            Ok(Some(AttributeValue::Present(1)))
        }

        fn write_entry(
            &self,
            _key: &Arc<String>,
            _name: &str,
            _value: Option<&AttributeValue<u64>>,
        ) -> ProviderResult<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_request_resolved_elsewhere_while_queued() {
        let provider = Arc::new(GatedProvider::default());
        let stats = Arc::new(CountingStatistics::new());
        let turbo = Turbo::with_statistics(
            vec![provider.clone() as Arc<dyn TurboProvider<String, u64>>],
            config(MemoryConfig::tracked(10)),
            stats.clone(),
        )
        .unwrap();
        let listener = Arc::new(RecordingListener::default());
        turbo.add_listener(listener.clone());

        // Occupy the worker
        let blocker = key("blocker");
        turbo.prepare(&blocker, "size");
        for _ in 0..1000 {
            if provider.entered.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(provider.entered.load(Ordering::SeqCst));

        // Queue a request, then answer it on the synchronous path
        let k = key("queued");
        assert!(!turbo.prepare(&k, "size"));
        assert!(turbo.write(&k, "size", Some(AttributeValue::Present(9))));

        provider.released.store(true, Ordering::SeqCst);
        assert!(turbo.wait_for_prefetch(Duration::from_secs(5)));

        assert_eq!(*provider.reads.lock(), vec!["blocker".to_string()]);
        assert_eq!(stats.snapshot().background_hits_elsewhere, 1);

        // One from the write, one from the worker, both with the stored value
        let queued: Vec<_> = listener
            .events
            .lock()
            .iter()
            .filter(|(key, _, _)| key == "queued")
            .cloned()
            .collect();
        let expected = ("queued".to_string(), "size".to_string(), Some(AttributeValue::Present(9)));
        assert_eq!(queued, vec![expected.clone(), expected]);
    }
}

// =============================================================================
// Memory Tiers
// =============================================================================

mod memory_tests {
    use super::*;

    #[test]
    fn test_lru_floor_and_reclamation() {
        let turbo: Turbo<String, u64> = Turbo::new(
            vec![Arc::new(StatusProvider::default()) as Arc<dyn TurboProvider<_, _>>],
            config(MemoryConfig::tracked(2)),
        )
        .unwrap();

        let k1 = key("k1");
        turbo.write(&k1, "status", Some(AttributeValue::Present(1)));
        for i in 0..50 {
            turbo.write(&key(&format!("other-{}", i)), "status", Some(AttributeValue::Present(i)));
        }
        turbo.purge();

        // Still referenced by this test, so still cached
        assert!(turbo.is_prepared(&k1, "status"));

        // The lookup made k1 most recently used again; push it back out of
        // the LRU window
        for i in 50..55 {
            turbo.write(&key(&format!("other-{}", i)), "status", Some(AttributeValue::Present(i)));
        }

        // Drop the only reference: allowed to disappear
        let lookalike = key("k1");
        drop(k1);
        turbo.purge();
        assert!(turbo.get_monitored_key(&lookalike).is_none());
        assert_eq!(turbo.memory_len(), (2, 2));
    }

    #[test]
    fn test_monitored_key_extends_lifetime() {
        let turbo: Turbo<String, u64> = Turbo::new(
            vec![Arc::new(StatusProvider::default()) as Arc<dyn TurboProvider<_, _>>],
            config(MemoryConfig::tracked(1)),
        )
        .unwrap();

        turbo.write(&key("pinned"), "status", Some(AttributeValue::Present(1)));
        let pinned = turbo.get_monitored_key(&"pinned".to_string()).unwrap();

        // Push it out of the minimum tier
        turbo.write(&key("other"), "status", Some(AttributeValue::Present(2)));
        turbo.purge();

        assert!(turbo.is_prepared(&pinned, "status"));
    }

    #[test]
    fn test_bounded_live_tier_cap() {
        let turbo: Turbo<String, u64> = Turbo::new(
            vec![Arc::new(StatusProvider::default()) as Arc<dyn TurboProvider<_, _>>],
            config(MemoryConfig::bounded(10, 100).with_seed(42)),
        )
        .unwrap();

        for i in 0..1000 {
            turbo.write(&key(&format!("k{}", i)), "status", Some(AttributeValue::Present(i)));
            let (live, minimum) = turbo.memory_len();
            assert!(live <= 100);
            assert!(minimum <= 10);
        }
    }

    #[test]
    fn test_statistics_log_tracks_keys() {
        init_tracing();
        let path = std::env::temp_dir().join(format!("turbo-it-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let stats = Arc::new(CountingStatistics::with_log(&path).unwrap());
        {
            let turbo = Turbo::with_statistics(
                vec![Arc::new(StatusProvider::default()) as Arc<dyn TurboProvider<String, u64>>],
                config(MemoryConfig::tracked(1)),
                stats.clone(),
            )
            .unwrap();
            turbo.write(&key("a"), "status", Some(AttributeValue::Present(1)));
            turbo.write(&key("b"), "status", Some(AttributeValue::Present(2)));
            turbo.purge();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("+ a"));
        assert!(contents.contains("+ b"));
        assert!(contents.contains("- a"));
        assert!(contents.lines().last().unwrap().starts_with("# "));

        let _ = std::fs::remove_file(&path);
    }
}
