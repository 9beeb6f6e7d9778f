//! End-to-end scenarios against the public `CacheFacade` surface, mirroring
//! the literal seeds used to validate the cache's latency and budget
//! contracts against a synthetic loader.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use framekeep::{CacheConfig, CacheFacade, FrameKey, FrameLoader, FrameRange, LoaderError};

struct FixedSizeLoader {
    byte_size: usize,
    fail_keys: Vec<u32>,
    calls: AtomicU64,
}

impl FixedSizeLoader {
    fn new(byte_size: usize, fail_keys: Vec<u32>) -> Arc<Self> {
        Arc::new(FixedSizeLoader { byte_size, fail_keys, calls: AtomicU64::new(0) })
    }

    fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FrameLoader for FixedSizeLoader {
    fn load(&self, key: FrameKey, _deadline: Instant) -> Result<framekeep::LoadedFrame, LoaderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_keys.contains(&key.value()) {
            return Err(LoaderError::Decode("injected failure".into()));
        }
        Ok(framekeep::LoadedFrame { data: Arc::from(vec![7u8; self.byte_size]), width: 1, height: 1, channels: 1 })
    }
}

fn config_with(hard_limit: u64, soft_limit: u64, target: u64, max_entries: usize) -> CacheConfig {
    CacheConfig {
        hard_limit_bytes: hard_limit,
        soft_limit_bytes: soft_limit,
        target_after_eviction_bytes: target,
        max_entries,
        worker_count: 4,
        ..CacheConfig::default()
    }
}

#[test]
fn sequential_sweep_is_all_hits_after_preload_settles() {
    const MIB: u64 = 1024 * 1024;
    let loader = FixedSizeLoader::new(1024 * 1024, vec![]);
    let config = config_with(1024 * MIB, 900 * MIB, 800 * MIB, 500);
    let facade = CacheFacade::spawn(config, loader);

    let bounds = FrameRange::new(0, 1000);
    facade.notify_project_opened(bounds);
    facade.notify_frame_changed(FrameKey::new(100), None, bounds);
    thread::sleep(Duration::from_millis(500));

    let mut all_hits = true;
    for v in 101..=200u32 {
        let deadline = Instant::now() + Duration::from_millis(50);
        let start = Instant::now();
        let handle = facade.get(FrameKey::new(v), deadline).expect("frame should load");
        let elapsed = start.elapsed();
        assert!(elapsed <= Duration::from_millis(5), "get({v}) took {elapsed:?}, expected a preloaded hit");
        all_hits &= handle.bytes().len() == 1024 * 1024;
    }
    assert!(all_hits);

    let stats = facade.stats();
    assert!(stats.resident_bytes >= 100 * MIB && stats.resident_bytes <= 200 * MIB);
    assert_eq!(stats.evictions, 0);
}

#[test]
fn backward_jump_after_sweep_is_mostly_hits() {
    let loader = FixedSizeLoader::new(1024 * 1024, vec![]);
    let config = config_with(1024 * 1024 * 1024, 900 * 1024 * 1024, 800 * 1024 * 1024, 500);
    let facade = CacheFacade::spawn(config, loader);

    let bounds = FrameRange::new(0, 1000);
    facade.notify_project_opened(bounds);
    facade.notify_frame_changed(FrameKey::new(100), None, bounds);
    thread::sleep(Duration::from_millis(500));
    for v in 100..=200u32 {
        let deadline = Instant::now() + Duration::from_millis(200);
        facade.get(FrameKey::new(v), deadline).unwrap();
    }

    facade.notify_frame_changed(FrameKey::new(50), Some(FrameKey::new(200)), bounds);
    thread::sleep(Duration::from_millis(500));

    let mut hits = 0;
    for v in (1..=49u32).rev() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let start = Instant::now();
        if facade.get(FrameKey::new(v), deadline).is_ok() {
            if start.elapsed() <= Duration::from_millis(5) {
                hits += 1;
            }
        }
        assert!(start.elapsed() <= Duration::from_millis(50));
    }
    assert!(hits >= 45, "expected most of the backward window preloaded, got {hits}/49 fast hits");
}

#[test]
fn hot_spot_is_one_miss_then_all_hits() {
    let loader = FixedSizeLoader::new(4096, vec![]);
    let config = config_with(256 * 1024 * 1024, 200 * 1024 * 1024, 150 * 1024 * 1024, 500);
    let facade = CacheFacade::spawn(config, loader.clone());

    let key = FrameKey::new(500);
    let deadline = Instant::now() + Duration::from_millis(200);
    for _ in 0..1000 {
        facade.get(key, deadline).unwrap();
    }

    assert_eq!(loader.call_count(), 1);
    let stats = facade.stats();
    assert_eq!(stats.evictions, 0);
    assert_eq!(stats.hits, 999);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_rate - 0.999).abs() < 1e-9);
}

#[test]
fn budget_pressure_respects_hard_limit_and_entry_cap() {
    let loader = FixedSizeLoader::new(10 * 1024 * 1024, vec![]);
    let config = config_with(100 * 1024 * 1024, 90 * 1024 * 1024, 80 * 1024 * 1024, 10);
    let facade = CacheFacade::spawn(config, loader);

    for v in 1..=100u32 {
        let deadline = Instant::now() + Duration::from_millis(200);
        let start = Instant::now();
        facade.get(FrameKey::new(v), deadline).unwrap();
        assert!(start.elapsed() <= Duration::from_millis(200));
        assert!(facade.stats().resident_bytes <= 100 * 1024 * 1024);
    }

    let stats = facade.stats();
    assert!(stats.resident_entries <= 10);
    assert!(stats.evictions >= 89);
}

#[test]
fn entry_cap_is_enforced_even_when_byte_budget_is_not_the_constraint() {
    // Frames are tiny and the byte budget is effectively unconstraining
    // (hundreds of megabytes for 1 KiB frames), so only max_entries can be
    // responsible for keeping resident_entries bounded here.
    let loader = FixedSizeLoader::new(1024, vec![]);
    let config = config_with(512 * 1024 * 1024, 400 * 1024 * 1024, 300 * 1024 * 1024, 10);
    let facade = CacheFacade::spawn(config, loader);

    for v in 1..=100u32 {
        let deadline = Instant::now() + Duration::from_millis(200);
        facade.get(FrameKey::new(v), deadline).unwrap();
    }

    let stats = facade.stats();
    assert!(stats.resident_entries <= 10, "max_entries should cap residency independent of byte headroom, got {}", stats.resident_entries);
    assert!(stats.evictions >= 89);
    assert!(stats.resident_bytes <= 10 * 1024, "resident bytes should track the entry cap, not the (much larger) byte budget");
}

#[test]
fn loader_failure_returns_not_found_and_warns() {
    let loader = FixedSizeLoader::new(1024, vec![42]);
    let config = config_with(64 * 1024 * 1024, 48 * 1024 * 1024, 32 * 1024 * 1024, 100);
    let facade = CacheFacade::spawn(config, loader);

    let deadline = Instant::now() + Duration::from_millis(50);
    let start = Instant::now();
    let result = facade.get(FrameKey::new(42), deadline);
    assert!(result.is_err());
    assert!(start.elapsed() <= Duration::from_millis(50));

    let events = facade.event_bus().poll();
    let warned = events
        .iter()
        .any(|e| framekeep::downcast_event::<framekeep::PerformanceWarningEvent>(e).is_some());
    assert!(warned, "expected a performance_warning event for the loader failure");

    let other = facade.get(FrameKey::new(7), Instant::now() + Duration::from_millis(50));
    assert!(other.is_ok());
}

#[test]
fn pin_safety_keeps_pinned_entry_resident_under_pressure() {
    let loader = FixedSizeLoader::new(10 * 1024 * 1024, vec![]);
    let config = config_with(50 * 1024 * 1024, 40 * 1024 * 1024, 30 * 1024 * 1024, 10);
    let facade = CacheFacade::spawn(config, loader);

    let deadline = Instant::now() + Duration::from_millis(200);
    let pinned_handle = facade.get(FrameKey::new(10), deadline).unwrap();

    for v in 11..=30u32 {
        facade.get(FrameKey::new(v), Instant::now() + Duration::from_millis(200)).unwrap();
    }

    let still_there = facade.get(FrameKey::new(10), Instant::now() + Duration::from_millis(200));
    assert!(still_there.is_ok());

    drop(pinned_handle);
    drop(still_there);
}

#[test]
fn ten_concurrent_misses_on_same_key_trigger_one_load() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls2 = Arc::clone(&calls);
    let loader: Arc<dyn FrameLoader> = Arc::new(move |_key: FrameKey, _deadline: Instant| {
        calls2.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        Ok(framekeep::LoadedFrame { data: Arc::from(vec![1u8; 1024]), width: 1, height: 1, channels: 1 })
    });
    let config = config_with(64 * 1024 * 1024, 48 * 1024 * 1024, 32 * 1024 * 1024, 100);
    let facade = CacheFacade::spawn(config, loader);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let facade = Arc::clone(&facade);
        handles.push(thread::spawn(move || facade.get(FrameKey::new(900), Instant::now() + Duration::from_millis(500)).is_ok()));
    }
    for h in handles {
        assert!(h.join().unwrap());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn release_then_get_is_a_hit() {
    let loader = FixedSizeLoader::new(1024, vec![]);
    let config = config_with(16 * 1024 * 1024, 12 * 1024 * 1024, 8 * 1024 * 1024, 50);
    let facade = CacheFacade::spawn(config, loader.clone());

    let deadline = Instant::now() + Duration::from_millis(100);
    let handle = facade.get(FrameKey::new(1), deadline).unwrap();
    drop(handle);

    let before = loader.call_count();
    let handle2 = facade.get(FrameKey::new(1), deadline).unwrap();
    assert_eq!(loader.call_count(), before);
    drop(handle2);
}

#[test]
fn invalidate_then_get_is_a_miss() {
    let loader = FixedSizeLoader::new(1024, vec![]);
    let config = config_with(16 * 1024 * 1024, 12 * 1024 * 1024, 8 * 1024 * 1024, 50);
    let facade = CacheFacade::spawn(config, loader.clone());

    let deadline = Instant::now() + Duration::from_millis(100);
    let handle = facade.get(FrameKey::new(2), deadline).unwrap();
    drop(handle);
    facade.invalidate(FrameKey::new(2));

    let before = loader.call_count();
    let _handle2 = facade.get(FrameKey::new(2), deadline).unwrap();
    assert_eq!(loader.call_count(), before + 1);
}

#[test]
fn direction_prediction_biases_preload_window() {
    let loader = FixedSizeLoader::new(4096, vec![]);
    let config = config_with(64 * 1024 * 1024, 48 * 1024 * 1024, 32 * 1024 * 1024, 500);
    let facade = CacheFacade::spawn(config, loader);

    let bounds = FrameRange::new(0, 10_000);
    facade.notify_project_opened(bounds);
    let mut previous = None;
    for v in 1000..1010u32 {
        facade.notify_frame_changed(FrameKey::new(v), previous, bounds);
        previous = Some(FrameKey::new(v));
        let _ = facade.get(FrameKey::new(v), Instant::now() + Duration::from_millis(100));
    }
    thread::sleep(Duration::from_millis(300));

    let ahead = facade.get(FrameKey::new(1030), Instant::now() + Duration::from_millis(50));
    assert!(ahead.is_ok());
}
