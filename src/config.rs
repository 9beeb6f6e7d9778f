//! Configuration surface for the cache core (spec §6).
//!
//! Flat, serde-friendly settings struct with a hand-written `Default`,
//! following the teacher's `AppSettings` pattern
//! (`dialogs/prefs/prefs.rs`).

const GIB: u64 = 1024 * 1024 * 1024;

/// Construction-time configuration for `CacheFacade`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Budget ceiling. Never exceeded (invariant I3).
    pub hard_limit_bytes: u64,
    /// Proactive eviction trigger.
    pub soft_limit_bytes: u64,
    /// Eviction-stop threshold once reactive eviction has started.
    pub target_after_eviction_bytes: u64,
    /// Hard cap on entry count regardless of bytes.
    pub max_entries: usize,
    /// Frames behind the cursor to keep resident.
    pub preload_back: u32,
    /// Frames ahead of the cursor to keep resident.
    pub preload_forward: u32,
    /// Preload worker pool size.
    pub worker_count: usize,
    /// The 50 ms contract.
    pub frame_switch_budget_ms: u64,
    /// Single-`get` warning threshold (severity=warning).
    pub warn_threshold_ms: u64,
    /// Single-`get` hard threshold (severity=error).
    pub hard_threshold_ms: u64,
    /// Soft deadline for background prefetch tasks.
    pub prefetch_deadline_ms: u64,
    /// Access-predictor ring buffer size (K).
    pub predictor_window: usize,

    /// How far above `soft_limit_bytes` residency may drift before the
    /// proactive-pause grace interval starts counting (spec §4.3).
    pub soft_limit_grace_margin_bytes: u64,
    /// How long residency must stay above `soft_limit_bytes + grace_margin`
    /// before preloading is proactively paused.
    pub soft_limit_grace_interval_ms: u64,

    /// Ring buffer size for the performance timer (spec §4.6).
    pub timer_ring_size: usize,
    /// Size of the "last N" rolling window for timer statistics.
    pub timer_recent_window: usize,
    /// Minimum accesses before `cache_hit_rate_low` may fire.
    pub hit_rate_alert_min_window: usize,
    /// Hit-rate threshold below which `cache_hit_rate_low` fires.
    pub hit_rate_alert_threshold: f64,
    /// Number of hard-threshold violations within `sustained_violation_window_ms`
    /// that triggers the automatic corrective actions of spec §4.6.
    pub sustained_violation_count: u32,
    pub sustained_violation_window_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hard_limit_bytes: 20 * GIB,
            soft_limit_bytes: 18 * GIB,
            target_after_eviction_bytes: 17 * GIB,
            max_entries: 200,
            preload_back: 25,
            preload_forward: 75,
            worker_count: 4,
            frame_switch_budget_ms: 50,
            warn_threshold_ms: 45,
            hard_threshold_ms: 50,
            prefetch_deadline_ms: 500,
            predictor_window: 64,

            soft_limit_grace_margin_bytes: 64 * 1024 * 1024,
            soft_limit_grace_interval_ms: 200,

            timer_ring_size: 1000,
            timer_recent_window: 100,
            hit_rate_alert_min_window: 200,
            hit_rate_alert_threshold: 0.95,
            sustained_violation_count: 3,
            sustained_violation_window_ms: 10_000,
        }
    }
}

impl CacheConfig {
    /// Recommended worker count when the caller wants it derived from the
    /// machine instead of the fixed default of 4, mirroring the teacher's
    /// `num_cpus::get() * 3 / 4` recommendation (leave headroom for the UI
    /// thread).
    pub fn auto_worker_count() -> usize {
        (num_cpus::get() * 3 / 4).max(1)
    }

    /// Derive `hard_limit_bytes` from a fraction of currently available
    /// system memory, reserving `reserve_gb` for the rest of the system.
    /// Mirrors `CacheManager::new`'s probing in the teacher codebase; the
    /// spec's default remains the fixed 20 GiB constant unless a caller
    /// opts into this.
    pub fn hard_limit_bytes_from_system(mem_fraction: f64, reserve_gb: f64) -> u64 {
        use sysinfo::System;
        let mut sys = System::new_all();
        sys.refresh_memory();
        let available = sys.available_memory();
        let reserve = (reserve_gb * GIB as f64) as u64;
        let usable = available.saturating_sub(reserve);
        (usable as f64 * mem_fraction) as u64
    }
}
