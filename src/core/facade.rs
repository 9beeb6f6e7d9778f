//! Cache facade: the single entry point callers use. Wires the store,
//! governor, predictor, scheduler and timers together and owns the
//! single-flight load coalescing that keeps concurrent misses on the same
//! frame from issuing duplicate loader calls (spec §4.2, §5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::buffer::{FrameBuffer, LoadedFrame};
use crate::config::CacheConfig;
use crate::core::event_bus::{
    CacheHitEvent, CacheMissEvent, EventBus, FrameChangedEvent, ProjectOpenedEvent, SustainedViolationEvent,
};
use crate::core::governor::MemoryGovernor;
use crate::core::predictor::{AccessPredictor, Direction};
use crate::core::scheduler::{PreloadScheduler, SchedulerHooks};
use crate::core::store::{self, LruStore, PinnedEntry};
use crate::core::timer::{HitRateAlert, LatencyStats, PerformanceTimer};
use crate::error::CacheError;
use crate::key::{FrameKey, FrameRange};
use crate::loader::{FrameLoader, LoaderError};

struct LoadState {
    done: bool,
    result: Option<Result<FrameBuffer, CacheError>>,
}

struct InFlight {
    state: Mutex<LoadState>,
    condvar: Condvar,
}

/// An outstanding borrow of a cached frame. Dropping it releases the pin;
/// if the frame was invalidated while borrowed, the deferred eviction
/// completes here.
pub struct FrameHandle {
    pub key: FrameKey,
    buffer: FrameBuffer,
    pin: Arc<AtomicI64>,
    facade: Weak<CacheFacade>,
}

impl FrameHandle {
    pub fn bytes(&self) -> &[u8] {
        self.buffer.bytes()
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        if let Some(facade) = self.facade.upgrade() {
            facade.on_release(self.key, &self.pin);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub resident_entries: usize,
    pub resident_bytes: u64,
    pub hard_limit_bytes: u64,
    pub evictions: u64,
    pub frame_switch: LatencyStats,
    pub loader_latency: LatencyStats,
    pub preload_queue_len: usize,
    pub preload_paused: bool,
}

/// The cache facade. Construct with [`CacheFacade::spawn`], which returns an
/// `Arc` with the background monitor thread already running.
pub struct CacheFacade {
    config: CacheConfig,
    store: LruStore,
    governor: MemoryGovernor,
    predictor: AccessPredictor,
    scheduler: PreloadScheduler,
    bus: EventBus,
    frame_switch_timer: PerformanceTimer,
    loader_timer: PerformanceTimer,
    hit_rate: HitRateAlert,
    loader: Arc<dyn FrameLoader>,
    hits: AtomicU64,
    misses: AtomicU64,
    in_flight: Mutex<HashMap<FrameKey, Arc<InFlight>>>,
    monitor_shutdown: Arc<AtomicBool>,
    monitor_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CacheFacade {
    /// Build the facade and start its background monitor thread. The
    /// monitor thread holds only a `Weak` reference, so the facade is
    /// dropped (and the thread exits) as soon as the caller drops the last
    /// strong `Arc`.
    pub fn spawn(config: CacheConfig, loader: Arc<dyn FrameLoader>) -> Arc<Self> {
        let bus = EventBus::new();
        let store = LruStore::new(config.max_entries);
        let governor = MemoryGovernor::new(&config);
        let predictor = AccessPredictor::new(config.predictor_window);
        let frame_switch_timer = PerformanceTimer::new(
            "frame_switch_latency",
            config.timer_ring_size,
            config.timer_recent_window,
            config.warn_threshold_ms as f64,
            config.hard_threshold_ms as f64,
            config.sustained_violation_count as usize,
        );
        let loader_timer = PerformanceTimer::new(
            "loader_latency",
            config.timer_ring_size,
            config.timer_recent_window,
            config.warn_threshold_ms as f64,
            config.hard_threshold_ms as f64,
            config.sustained_violation_count as usize,
        );
        let hit_rate = HitRateAlert::new(config.hit_rate_alert_min_window, config.hit_rate_alert_threshold);
        let monitor_shutdown = Arc::new(AtomicBool::new(false));

        let facade = Arc::new_cyclic(|weak: &Weak<CacheFacade>| {
            let hooks = scheduler_hooks(weak.clone());
            let scheduler = PreloadScheduler::new(
                config.worker_count,
                Duration::from_millis(config.prefetch_deadline_ms),
                Arc::clone(&loader),
                bus.clone(),
                hooks,
            );

            CacheFacade {
                config: config.clone(),
                store,
                governor,
                predictor,
                scheduler,
                bus,
                frame_switch_timer,
                loader_timer,
                hit_rate,
                loader,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                in_flight: Mutex::new(HashMap::new()),
                monitor_shutdown: Arc::clone(&monitor_shutdown),
                monitor_handle: Mutex::new(None),
            }
        });

        let monitor_weak = Arc::downgrade(&facade);
        let handle = thread::Builder::new()
            .name("framekeep-monitor".to_string())
            .spawn(move || monitor_loop(monitor_weak, monitor_shutdown))
            .expect("failed to spawn monitor thread");
        *facade.monitor_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        facade
    }

    /// Foreground fetch: returns a pinned handle, loading on a miss and
    /// waiting on any in-flight load (background or foreground) already in
    /// progress for this key. `deadline` bounds how long a miss may block.
    pub fn get(self: &Arc<Self>, key: FrameKey, deadline: Instant) -> Result<FrameHandle, CacheError> {
        let start = Instant::now();
        self.predictor.record(key);

        if let Some(entry) = self.store.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.bus.emit(CacheHitEvent { key, elapsed_ms: start.elapsed().as_secs_f64() * 1000.0 });
            self.hit_rate.record(true, &self.bus);
            let (_, sustained) = self.frame_switch_timer.record(start.elapsed(), &self.bus);
            if sustained {
                self.handle_sustained_violation("frame_switch_latency");
            }
            return Ok(self.wrap(key, entry));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.hit_rate.record(false, &self.bus);
        let result = self.load_blocking(key, deadline)?;
        self.bus.emit(CacheMissEvent { key, load_elapsed_ms: start.elapsed().as_secs_f64() * 1000.0 });
        let (_, sustained) = self.frame_switch_timer.record(start.elapsed(), &self.bus);
        if sustained {
            self.handle_sustained_violation("frame_switch_latency");
        }
        Ok(result)
    }

    /// Spec §4.6's three automatic actions for a sustained run of hard-
    /// threshold violations: force a cleanup, shrink the preload window by
    /// half, and emit a compound alert describing what was done.
    fn handle_sustained_violation(&self, metric: &'static str) {
        let entries_freed = self.governor.force_cleanup(&self.store);
        self.scheduler.shrink_window();
        warn!(
            "sustained latency violations on {metric}: forced cleanup freed {entries_freed} entries, preload window shrunk"
        );
        self.bus.emit(SustainedViolationEvent {
            metric,
            consecutive_violations: self.config.sustained_violation_count as usize,
            entries_freed,
        });
    }

    /// Notify the cache of a cursor move so the predictor and scheduler can
    /// react. Cheap and non-blocking.
    pub fn notify_frame_changed(&self, current: FrameKey, previous: Option<FrameKey>, bounds: FrameRange) {
        self.bus.emit(FrameChangedEvent { current_key: current, previous_key: previous, direction_hint: None });
        let prediction = self.predictor.predict();
        let direction = if prediction.direction == Direction::Random { Direction::Stationary } else { prediction.direction };
        self.scheduler.on_frame_changed(current, direction, bounds, self.config.preload_back, self.config.preload_forward);
    }

    pub fn notify_project_opened(&self, bounds: FrameRange) {
        self.bus.emit(ProjectOpenedEvent { frame_range: bounds });
    }

    pub fn invalidate(&self, key: FrameKey) {
        if let Some((_buffer, size)) = self.store.invalidate(key) {
            self.governor.free(size as u64);
        }
    }

    pub fn clear(&self) {
        let freed = self.store.clear();
        let total: u64 = freed.iter().map(|(_, size)| *size as u64).sum();
        self.governor.free(total);
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            resident_entries: self.store.len(),
            resident_bytes: self.governor.resident_bytes(),
            hard_limit_bytes: self.governor.hard_limit_bytes(),
            evictions: self.governor.evictions(),
            frame_switch: self.frame_switch_timer.stats(),
            loader_latency: self.loader_timer.stats(),
            preload_queue_len: self.scheduler.queued_len(),
            preload_paused: self.scheduler.is_paused(),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    fn wrap(self: &Arc<Self>, key: FrameKey, entry: PinnedEntry) -> FrameHandle {
        FrameHandle { key, buffer: entry.buffer, pin: entry.pin, facade: Arc::downgrade(self) }
    }

    fn on_release(&self, key: FrameKey, pin: &Arc<AtomicI64>) {
        if let Some((_buffer, size)) = store::release_pin(&self.store, key, pin) {
            self.governor.free(size as u64);
        }
    }

    fn load_blocking(self: &Arc<Self>, key: FrameKey, deadline: Instant) -> Result<FrameHandle, CacheError> {
        let slot = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = in_flight.get(&key) {
                Arc::clone(existing)
            } else {
                let fresh = Arc::new(InFlight { state: Mutex::new(LoadState { done: false, result: None }), condvar: Condvar::new() });
                in_flight.insert(key, Arc::clone(&fresh));
                drop(in_flight);
                self.run_load(key, deadline, Arc::clone(&fresh));
                fresh
            }
        };

        let mut state = slot.state.lock().unwrap_or_else(|e| e.into_inner());
        while !state.done {
            let now = Instant::now();
            if now >= deadline {
                return Err(CacheError::NotFound);
            }
            let (guard, timeout) = slot
                .condvar
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
            if timeout.timed_out() && !state.done {
                return Err(CacheError::NotFound);
            }
        }

        match state.result.clone() {
            Some(Ok(buffer)) => {
                // The owning caller already pinned the entry in the store;
                // re-resolve it here so every waiter gets its own pin.
                if let Some(entry) = self.store.get(key) {
                    Ok(self.wrap(key, entry))
                } else {
                    // Evicted between completion and this waiter's wake-up.
                    let _ = buffer;
                    Err(CacheError::NotFound)
                }
            }
            Some(Err(e)) => Err(e),
            None => Err(CacheError::NotFound),
        }
    }

    fn run_load(self: &Arc<Self>, key: FrameKey, deadline: Instant, slot: Arc<InFlight>) {
        let facade = Arc::clone(self);
        // The owner runs the loader inline on the calling thread: a
        // foreground miss must not hand the user-visible load off to a
        // pool thread it doesn't control the deadline of.
        let started = Instant::now();
        let result = facade.loader.load(key, deadline);
        let (_, sustained) = facade.loader_timer.record(started.elapsed(), &facade.bus);
        if sustained {
            facade.handle_sustained_violation("loader_latency");
        }
        facade.complete(key, result, Some(slot));
    }

    /// Shared completion path for both the foreground owner and background
    /// preload workers: admits the buffer, inserts it pinned, and wakes any
    /// waiters on the single-flight slot.
    fn complete(&self, key: FrameKey, result: Result<LoadedFrame, LoaderError>, slot: Option<Arc<InFlight>>) {
        let outcome: Result<FrameBuffer, CacheError> = match result {
            Ok(frame) => {
                let buffer: FrameBuffer = frame.into();
                match self.governor.admit(&self.store, buffer.byte_size as u64, &self.bus) {
                    Ok(_admitted) => {
                        // This call's own pin is released immediately: the
                        // owner and every waiter each re-resolve their own
                        // pin via `store.get` once the result is published.
                        let (entry, _delta) = self.store.insert_and_pin(key, buffer.clone());
                        store::release_pin(&self.store, key, &entry.pin);
                        Ok(buffer)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(LoaderError::DeadlineExceeded) => Err(CacheError::NotFound),
            Err(e) => {
                warn!("loader failed for frame {key}: {e}");
                self.bus.emit(crate::core::event_bus::PerformanceWarningEvent {
                    metric: "loader_failure",
                    value: 1.0,
                    threshold: 0.0,
                    severity: crate::core::event_bus::AlertSeverity::Warning,
                });
                Err(CacheError::NotFound)
            }
        };

        if let Some(slot) = slot {
            let mut state = slot.state.lock().unwrap_or_else(|e| e.into_inner());
            state.done = true;
            state.result = Some(outcome);
            drop(state);
            slot.condvar.notify_all();
        }

        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&key);
    }
}

fn scheduler_hooks(weak: Weak<CacheFacade>) -> SchedulerHooks {
    let try_weak = weak.clone();
    let complete_weak = weak;

    SchedulerHooks {
        try_begin_load: Arc::new(move |key: FrameKey| {
            let Some(facade) = try_weak.upgrade() else { return false };
            if facade.store.is_resident(key) {
                return false;
            }
            let mut in_flight = facade.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if in_flight.contains_key(&key) {
                return false;
            }
            in_flight.insert(
                key,
                Arc::new(InFlight { state: Mutex::new(LoadState { done: false, result: None }), condvar: Condvar::new() }),
            );
            true
        }),
        complete_load: Arc::new(move |key: FrameKey, result: Result<LoadedFrame, LoaderError>| {
            if let Some(facade) = complete_weak.upgrade() {
                let slot = facade.in_flight.lock().unwrap_or_else(|e| e.into_inner()).get(&key).cloned();
                facade.complete(key, result, slot);
            }
        }),
    }
}

fn monitor_loop(weak: Weak<CacheFacade>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        let Some(facade) = weak.upgrade() else { break };
        match facade.governor.tick() {
            Some(true) => {
                debug!("memory governor requesting preload pause");
                facade.scheduler.pause();
            }
            Some(false) => {
                debug!("memory governor requesting preload resume");
                facade.scheduler.resume();
            }
            None => {}
        }
        facade.governor.publish_memory_usage(&facade.bus);
        drop(facade);
        thread::sleep(Duration::from_millis(100));
    }
}

impl Drop for CacheFacade {
    fn drop(&mut self) {
        self.monitor_shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.monitor_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }
}
