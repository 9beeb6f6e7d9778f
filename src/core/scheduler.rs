//! Preload scheduler: keeps the cache hot around the cursor without ever
//! impacting foreground `get` latency (spec §4.4).
//!
//! Grounded on the teacher's channel-based worker pool (`src/workers.rs`)
//! for the run-loop shape, generalized to three strict-priority queues
//! (High/Normal/Low) because the scheduler's preemption contract is a
//! property of queue choice, not of a single FIFO channel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::trace;

use crate::core::event_bus::{EventBus, PreloadPausedEvent, PreloadResumedEvent};
use crate::core::predictor::Direction;
use crate::key::{FrameKey, FrameRange};
use crate::loader::{FrameLoader, LoaderError};
use crate::buffer::LoadedFrame;

/// Default "near window" radius for Normal priority (spec §4.4).
const NEAR_WINDOW: u32 = 10;
/// Normal-priority tasks farther than this from the cursor are the "far
/// half" of the near window; a pause cancels those along with all Low
/// tasks (spec §4.4 Backpressure).
const FAR_HALF_NORMAL: u32 = NEAR_WINDOW / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
}

pub struct PrefetchTask {
    pub key: FrameKey,
    pub priority: Priority,
    pub deadline: Instant,
    pub cancel: Arc<AtomicBool>,
    retried: bool,
}

/// Callbacks the scheduler uses to stay entirely decoupled from the cache
/// facade's internals (spec ownership rule: "the scheduler ... submits
/// completed buffers to the store via the facade, never touching entries
/// directly").
pub struct SchedulerHooks {
    /// Returns `true` if this call became responsible for loading `key`
    /// (not resident, no other in-flight load for it); `false` means skip,
    /// someone else already owns it or it is already resident. This is the
    /// same single-flight bookkeeping consulted by foreground misses.
    pub try_begin_load: Arc<dyn Fn(FrameKey) -> bool + Send + Sync>,
    /// Reports a completed (or failed) background load for admission.
    pub complete_load: Arc<dyn Fn(FrameKey, Result<LoadedFrame, LoaderError>) + Send + Sync>,
}

struct Window {
    center: FrameKey,
    direction: Direction,
    back: u32,
    forward: u32,
    bounds: FrameRange,
}

/// Bookkeeping kept for every key currently queued (or retried), enough to
/// cancel it later: a window recompute dropping it out of range, or a pause
/// sweeping low/far-normal work (spec §4.4 Backpressure).
struct QueuedTask {
    cancel: Arc<AtomicBool>,
    priority: Priority,
    distance: u32,
}

struct Shared {
    bus: EventBus,
    loader: Arc<dyn FrameLoader>,
    hooks: SchedulerHooks,
    queued: Mutex<HashMap<FrameKey, QueuedTask>>,
    window: Mutex<Option<Window>>,
    paused: AtomicBool,
    prefetch_deadline: Duration,
}

/// Fixed-size pool of worker threads draining three strict-priority queues.
pub struct PreloadScheduler {
    high_tx: Sender<PrefetchTask>,
    normal_tx: Sender<PrefetchTask>,
    low_tx: Sender<PrefetchTask>,
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl PreloadScheduler {
    pub fn new(
        worker_count: usize,
        prefetch_deadline: Duration,
        loader: Arc<dyn FrameLoader>,
        bus: EventBus,
        hooks: SchedulerHooks,
    ) -> Self {
        let (high_tx, high_rx) = unbounded::<PrefetchTask>();
        let (normal_tx, normal_rx) = unbounded::<PrefetchTask>();
        let (low_tx, low_rx) = unbounded::<PrefetchTask>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let shared = Arc::new(Shared {
            bus,
            loader,
            hooks,
            queued: Mutex::new(HashMap::new()),
            window: Mutex::new(None),
            paused: AtomicBool::new(false),
            prefetch_deadline,
        });

        let mut handles = Vec::new();
        for worker_id in 0..worker_count.max(1) {
            let high_rx = high_rx.clone();
            let normal_rx = normal_rx.clone();
            let low_rx = low_rx.clone();
            let low_tx = low_tx.clone();
            let shared = Arc::clone(&shared);
            let shutdown = Arc::clone(&shutdown);

            let handle = thread::Builder::new()
                .name(format!("framekeep-preload-{worker_id}"))
                .spawn(move || worker_loop(worker_id, high_rx, normal_rx, low_rx, low_tx, shared, shutdown))
                .expect("failed to spawn preload worker thread");
            handles.push(handle);
        }

        PreloadScheduler { high_tx, normal_tx, low_tx, shared, shutdown, handles }
    }

    /// Recompute the prefetch window around `cursor` per spec §4.4, enqueue
    /// newly-in-window keys, and cancel anything now out of window.
    #[allow(clippy::too_many_arguments)]
    pub fn on_frame_changed(
        &self,
        cursor: FrameKey,
        direction: Direction,
        bounds: FrameRange,
        preload_back: u32,
        preload_forward: u32,
    ) {
        let (back, forward) = match direction {
            Direction::Forward => (preload_back, preload_forward),
            Direction::Backward => (preload_forward, preload_back),
            Direction::Stationary | Direction::Random => {
                let half = (preload_back + preload_forward) / 2;
                (half, half)
            }
        };

        *self.shared.window.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(Window { center: cursor, direction, back, forward, bounds });

        self.apply_window(cursor, direction, back, forward, bounds);
    }

    /// Halve the tracked preload window and re-apply it, cancelling
    /// whatever now falls outside the shrunk range (spec §4.6 automatic
    /// action: "shrink the preload window by 50%").
    pub fn shrink_window(&self) {
        let snapshot = {
            let mut guard = self.shared.window.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_mut() {
                Some(w) => {
                    w.back = (w.back / 2).max(1);
                    w.forward = (w.forward / 2).max(1);
                    Some((w.center, w.direction, w.back, w.forward, w.bounds))
                }
                None => None,
            }
        };
        if let Some((center, direction, back, forward, bounds)) = snapshot {
            self.apply_window(center, direction, back, forward, bounds);
        }
    }

    /// Diff the desired window against what's queued: cancel stale
    /// (now out-of-window) tasks via their cancel flag, enqueue fresh ones.
    /// Shared by `on_frame_changed` and `shrink_window`.
    fn apply_window(&self, cursor: FrameKey, direction: Direction, back: u32, forward: u32, bounds: FrameRange) {
        let desired: HashSet<FrameKey> = bounds.window(cursor, back, forward).collect();

        let mut queued = self.shared.queued.lock().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<FrameKey> = queued.keys().copied().filter(|k| !desired.contains(k)).collect();
        for key in &stale {
            if let Some(task) = queued.remove(key) {
                task.cancel.store(true, Ordering::SeqCst);
            }
        }
        let fresh: Vec<FrameKey> = desired.iter().copied().filter(|k| !queued.contains_key(k)).collect();
        drop(queued);

        for key in fresh {
            let distance = key.delta(cursor).abs() as u32;
            let matches_direction = match direction {
                Direction::Forward => key.delta(cursor) >= 0,
                Direction::Backward => key.delta(cursor) <= 0,
                _ => true,
            };
            let priority = if distance <= 1 && matches_direction {
                Priority::High
            } else if distance <= NEAR_WINDOW {
                Priority::Normal
            } else {
                Priority::Low
            };

            // While paused, don't hand out new low-priority or far-half
            // normal work; `pause()` already cancelled anything matching
            // this shape that was already queued.
            if self.shared.paused.load(Ordering::Relaxed)
                && (priority == Priority::Low || (priority == Priority::Normal && distance > FAR_HALF_NORMAL))
            {
                continue;
            }

            let cancel = Arc::new(AtomicBool::new(false));
            {
                let mut queued = self.shared.queued.lock().unwrap_or_else(|e| e.into_inner());
                queued.insert(key, QueuedTask { cancel: Arc::clone(&cancel), priority, distance });
            }
            self.send_task(key, priority, cancel);
        }
    }

    fn send_task(&self, key: FrameKey, priority: Priority, cancel: Arc<AtomicBool>) {
        let task = PrefetchTask { key, priority, deadline: Instant::now() + self.shared.prefetch_deadline, cancel, retried: false };
        let tx = match priority {
            Priority::High => &self.high_tx,
            Priority::Normal => &self.normal_tx,
            Priority::Low => &self.low_tx,
        };
        let _ = tx.send(task);
    }

    /// Backpressure entry point (spec §4.3/§4.4): cancel low-priority work
    /// and far-half normal-priority work, leave high-priority alone.
    pub fn pause(&self) {
        if self.shared.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_backpressure_targets();
        self.shared.bus.emit(PreloadPausedEvent { reason: "memory_governor_backpressure" });
    }

    fn cancel_backpressure_targets(&self) {
        let mut queued = self.shared.queued.lock().unwrap_or_else(|e| e.into_inner());
        let targets: Vec<FrameKey> = queued
            .iter()
            .filter(|(_, t)| t.priority == Priority::Low || (t.priority == Priority::Normal && t.distance > FAR_HALF_NORMAL))
            .map(|(k, _)| *k)
            .collect();
        for key in targets {
            if let Some(task) = queued.remove(&key) {
                task.cancel.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn resume(&self) {
        if !self.shared.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.bus.emit(PreloadResumedEvent);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Relaxed)
    }

    pub fn queued_len(&self) -> usize {
        self.shared.queued.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for PreloadScheduler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_millis(500);
        let handles = std::mem::take(&mut self.handles);
        for handle in handles {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    worker_id: usize,
    high_rx: Receiver<PrefetchTask>,
    normal_rx: Receiver<PrefetchTask>,
    low_rx: Receiver<PrefetchTask>,
    low_tx: Sender<PrefetchTask>,
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
) {
    trace!("preload worker {worker_id} started");
    loop {
        let task = high_rx.try_recv().or_else(|_| normal_rx.try_recv()).or_else(|_| low_rx.try_recv());

        let task = match task {
            Ok(t) => t,
            Err(_) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
                continue;
            }
        };

        run_task(task, &shared, &low_tx);
    }
    trace!("preload worker {worker_id} stopped");
}

fn run_task(task: PrefetchTask, shared: &Arc<Shared>, low_tx: &Sender<PrefetchTask>) {
    let key = task.key;
    let forget = || {
        shared.queued.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
    };

    if task.cancel.load(Ordering::Relaxed) || Instant::now() >= task.deadline {
        forget();
        return;
    }
    if !(shared.hooks.try_begin_load)(key) {
        forget();
        return;
    }

    let result = shared.loader.load(key, task.deadline);

    if task.cancel.load(Ordering::Relaxed) {
        // Cancelled while loading: drop whatever came back without admission.
        (shared.hooks.complete_load)(key, Err(LoaderError::DeadlineExceeded));
        forget();
        return;
    }

    match result {
        Ok(frame) => {
            (shared.hooks.complete_load)(key, Ok(frame));
            forget();
        }
        Err(_) if !task.retried => {
            // Retry once at Low priority (spec §7) instead of surfacing the
            // failure; the queue stays registered until the retry resolves.
            if let Some(entry) = shared.queued.lock().unwrap_or_else(|e| e.into_inner()).get_mut(&key) {
                entry.priority = Priority::Low;
            }
            let retry =
                PrefetchTask { key, priority: Priority::Low, deadline: task.deadline, cancel: task.cancel, retried: true };
            if low_tx.send(retry).is_err() {
                forget();
            }
        }
        Err(e) => {
            (shared.hooks.complete_load)(key, Err(e));
            forget();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::FrameRange;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn noop_loader() -> Arc<dyn FrameLoader> {
        Arc::new(|_key: FrameKey, _deadline: Instant| {
            Ok(LoadedFrame { data: Arc::from(vec![0u8; 16]), width: 1, height: 1, channels: 4 })
        })
    }

    #[test]
    fn window_recompute_enqueues_forward_window() {
        let loaded = Arc::new(AtomicUsize::new(0));
        let loaded2 = Arc::clone(&loaded);
        let hooks = SchedulerHooks {
            try_begin_load: Arc::new(|_| true),
            complete_load: Arc::new(move |_, _| {
                loaded2.fetch_add(1, Ordering::SeqCst);
            }),
        };
        let scheduler = PreloadScheduler::new(2, Duration::from_millis(500), noop_loader(), EventBus::new(), hooks);
        let bounds = FrameRange::new(0, 1000);
        scheduler.on_frame_changed(FrameKey::new(100), Direction::Forward, bounds, 25, 75);

        let deadline = Instant::now() + Duration::from_secs(2);
        while loaded.load(Ordering::SeqCst) < 101 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(loaded.load(Ordering::SeqCst) >= 90);
    }

    #[test]
    fn pause_resume_toggle_and_emit_once() {
        let hooks = SchedulerHooks { try_begin_load: Arc::new(|_| true), complete_load: Arc::new(|_, _| {}) };
        let scheduler = PreloadScheduler::new(1, Duration::from_millis(500), noop_loader(), EventBus::new(), hooks);
        assert!(!scheduler.is_paused());
        scheduler.pause();
        assert!(scheduler.is_paused());
        scheduler.pause();
        assert!(scheduler.is_paused());
        scheduler.resume();
        assert!(!scheduler.is_paused());
    }

    /// A loader that blocks the single worker until told to proceed, used to
    /// pin a task in-flight so the rest of the queue is observable without a
    /// race against the worker draining it.
    fn gated_loader() -> (Arc<dyn FrameLoader>, Arc<AtomicBool>) {
        let gate = Arc::new(AtomicBool::new(false));
        let gate2 = Arc::clone(&gate);
        let loader: Arc<dyn FrameLoader> = Arc::new(move |_key: FrameKey, _deadline: Instant| {
            while !gate2.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(LoadedFrame { data: Arc::from(vec![0u8; 16]), width: 1, height: 1, channels: 4 })
        });
        (loader, gate)
    }

    #[test]
    fn stale_window_entries_are_cancelled() {
        let (loader, gate) = gated_loader();
        let hooks = SchedulerHooks { try_begin_load: Arc::new(|_| true), complete_load: Arc::new(|_, _| {}) };
        let scheduler = PreloadScheduler::new(1, Duration::from_millis(500), loader, EventBus::new(), hooks);
        let bounds = FrameRange::new(0, 1000);
        scheduler.on_frame_changed(FrameKey::new(100), Direction::Forward, bounds, 5, 5);
        thread::sleep(Duration::from_millis(20));

        let stale_key = FrameKey::new(95);
        let cancel_flag = {
            let queued = scheduler.shared.queued.lock().unwrap_or_else(|e| e.into_inner());
            queued.get(&stale_key).map(|t| Arc::clone(&t.cancel))
        }
        .expect("key should still be queued behind the blocked worker");
        assert!(!cancel_flag.load(Ordering::SeqCst));

        scheduler.on_frame_changed(FrameKey::new(500), Direction::Forward, bounds, 5, 5);
        assert!(cancel_flag.load(Ordering::SeqCst), "out-of-window task should have its cancel flag set");
        assert!(!scheduler.shared.queued.lock().unwrap_or_else(|e| e.into_inner()).contains_key(&stale_key));

        gate.store(true, Ordering::Relaxed);
    }

    #[test]
    fn pause_cancels_low_priority_queued_tasks() {
        let (loader, gate) = gated_loader();
        let hooks = SchedulerHooks { try_begin_load: Arc::new(|_| true), complete_load: Arc::new(|_, _| {}) };
        let scheduler = PreloadScheduler::new(1, Duration::from_millis(500), loader, EventBus::new(), hooks);
        let bounds = FrameRange::new(0, 1000);
        scheduler.on_frame_changed(FrameKey::new(500), Direction::Forward, bounds, 30, 30);
        thread::sleep(Duration::from_millis(20));

        let low_key = FrameKey::new(470);
        let cancel_flag = {
            let queued = scheduler.shared.queued.lock().unwrap_or_else(|e| e.into_inner());
            queued.get(&low_key).map(|t| Arc::clone(&t.cancel))
        }
        .expect("low-priority key should still be queued");

        scheduler.pause();
        assert!(cancel_flag.load(Ordering::SeqCst), "pause should cancel low-priority queued work");
        assert!(!scheduler.shared.queued.lock().unwrap_or_else(|e| e.into_inner()).contains_key(&low_key));

        gate.store(true, Ordering::Relaxed);
    }
}
