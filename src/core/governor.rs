//! Memory governor: enforces the residency budget and drives eviction
//! without starving the loader (spec §4.3).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::core::event_bus::{AlertSeverity, EventBus, MemoryUsageEvent, PerformanceWarningEvent};
use crate::core::store::LruStore;
use crate::error::CacheError;
use crate::key::FrameKey;

/// Result of a successful admission: the keys evicted to make room.
pub struct Admitted {
    pub evicted: Vec<FrameKey>,
}

pub struct MemoryGovernor {
    resident_bytes: AtomicU64,
    hard_limit_bytes: u64,
    soft_limit_bytes: u64,
    target_after_eviction_bytes: u64,
    max_entries: usize,
    grace_margin_bytes: u64,
    grace_interval: Duration,
    soft_crossed_since: Mutex<Option<Instant>>,
    paused: AtomicBool,
    evictions: AtomicU64,
}

impl MemoryGovernor {
    pub fn new(cfg: &CacheConfig) -> Self {
        MemoryGovernor {
            resident_bytes: AtomicU64::new(0),
            hard_limit_bytes: cfg.hard_limit_bytes,
            soft_limit_bytes: cfg.soft_limit_bytes,
            target_after_eviction_bytes: cfg.target_after_eviction_bytes,
            max_entries: cfg.max_entries,
            grace_margin_bytes: cfg.soft_limit_grace_margin_bytes,
            grace_interval: Duration::from_millis(cfg.soft_limit_grace_interval_ms),
            soft_crossed_since: Mutex::new(None),
            paused: AtomicBool::new(false),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::Relaxed)
    }

    pub fn hard_limit_bytes(&self) -> u64 {
        self.hard_limit_bytes
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn usage_ratio(&self) -> f64 {
        if self.hard_limit_bytes == 0 {
            0.0
        } else {
            self.resident_bytes() as f64 / self.hard_limit_bytes as f64
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Account for bytes freed outside the normal admission path (e.g. an
    /// explicit `invalidate`/`clear` releasing a pinned entry after its
    /// final borrow drops).
    pub fn free(&self, bytes: u64) {
        let mut current = self.resident_bytes.load(Ordering::Relaxed);
        loop {
            let new_val = current.saturating_sub(bytes);
            match self.resident_bytes.compare_exchange_weak(current, new_val, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Admission algorithm (spec §4.3), run on every `put` and on every
    /// miss's loader result.
    pub fn admit(&self, store: &LruStore, incoming: u64, bus: &EventBus) -> Result<Admitted, CacheError> {
        let mut evicted = Vec::new();

        // `max_entries` is a hard cap independent of the byte budget (spec
        // §6): make room for the incoming entry before it would push the
        // store over the cap, regardless of how much byte headroom remains.
        while store.len() >= self.max_entries {
            match store.evict_lru_skipping_pinned() {
                Some((key, _buffer, size)) => {
                    self.free(size as u64);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    evicted.push(key);
                }
                None => break,
            }
        }

        let resident = self.resident_bytes.load(Ordering::Relaxed);
        if resident + incoming <= self.soft_limit_bytes {
            self.resident_bytes.fetch_add(incoming, Ordering::Relaxed);
            self.publish_memory_usage(bus);
            return Ok(Admitted { evicted });
        }

        loop {
            let resident = self.resident_bytes.load(Ordering::Relaxed);
            if resident + incoming <= self.target_after_eviction_bytes {
                break;
            }
            match store.evict_lru_skipping_pinned() {
                Some((key, _buffer, size)) => {
                    self.free(size as u64);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    evicted.push(key);
                }
                None => break,
            }
        }

        let resident = self.resident_bytes.load(Ordering::Relaxed);
        if resident + incoming > self.hard_limit_bytes {
            bus.emit(PerformanceWarningEvent {
                metric: "budget_exhausted",
                value: (resident + incoming) as f64,
                threshold: self.hard_limit_bytes as f64,
                severity: AlertSeverity::Error,
            });
            return Err(CacheError::BudgetExhausted);
        }

        self.resident_bytes.fetch_add(incoming, Ordering::Relaxed);
        self.publish_memory_usage(bus);
        Ok(Admitted { evicted })
    }

    pub fn publish_memory_usage(&self, bus: &EventBus) {
        bus.emit(MemoryUsageEvent {
            resident_bytes: self.resident_bytes(),
            hard_limit_bytes: self.hard_limit_bytes,
            usage_ratio: self.usage_ratio(),
        });
    }

    /// Background tick: proactively pause/resume preloading when residency
    /// has drifted above `soft_limit_bytes + grace_margin_bytes` for longer
    /// than `grace_interval`. Returns `Some(true)` to request a pause,
    /// `Some(false)` to request a resume, `None` for no change.
    pub fn tick(&self) -> Option<bool> {
        let resident = self.resident_bytes();
        let over = resident > self.soft_limit_bytes.saturating_add(self.grace_margin_bytes);

        let mut crossed = self.soft_crossed_since.lock().unwrap_or_else(|e| e.into_inner());
        if over {
            let since = *crossed.get_or_insert_with(Instant::now);
            if !self.paused.load(Ordering::Relaxed) && since.elapsed() >= self.grace_interval {
                self.paused.store(true, Ordering::Relaxed);
                return Some(true);
            }
            None
        } else {
            *crossed = None;
            if self.paused.load(Ordering::Relaxed) && resident <= self.target_after_eviction_bytes {
                self.paused.store(false, Ordering::Relaxed);
                return Some(false);
            }
            None
        }
    }

    /// Force a cleanup equivalent to spec §4.6's automatic action: release
    /// all unpinned evictable entries above `target_after_eviction_bytes`
    /// or above `max_entries`, whichever is still over.
    pub fn force_cleanup(&self, store: &LruStore) -> usize {
        let mut freed = 0;
        loop {
            if self.resident_bytes() <= self.target_after_eviction_bytes && store.len() <= self.max_entries {
                break;
            }
            match store.evict_lru_skipping_pinned() {
                Some((_, _, size)) => {
                    self.free(size as u64);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    freed += 1;
                }
                None => break,
            }
        }
        freed
    }
}
