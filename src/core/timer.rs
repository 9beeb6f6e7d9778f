//! Performance timer and alert bus: tracks frame-switch latency against the
//! 50ms budget and raises sustained-violation alerts (spec §4.6).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::core::event_bus::{AlertSeverity, EventBus, PerformanceWarningEvent};

struct Ring {
    samples: VecDeque<f64>,
    capacity: usize,
    recent_window: usize,
    recent_violations: VecDeque<bool>,
    sustained_alert_active: bool,
}

impl Ring {
    fn new(capacity: usize, recent_window: usize) -> Self {
        Ring {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            recent_window: recent_window.max(1),
            recent_violations: VecDeque::with_capacity(recent_window.max(1)),
            sustained_alert_active: false,
        }
    }

    fn push(&mut self, value_ms: f64, violated: bool) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value_ms);

        if self.recent_violations.len() >= self.recent_window {
            self.recent_violations.pop_front();
        }
        self.recent_violations.push_back(violated);
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }

    fn max(&self) -> f64 {
        self.samples.iter().cloned().fold(0.0, f64::max)
    }

    fn sustained_violation_run(&self) -> usize {
        let mut run = 0;
        for v in self.recent_violations.iter().rev() {
            if *v {
                run += 1;
            } else {
                break;
            }
        }
        run
    }

    /// Edge-triggered check: `true` only the first time the run reaches
    /// `threshold`, so a consumer acting on it (forced cleanup, window
    /// shrink) fires once per sustained episode rather than on every sample
    /// while it continues.
    fn sustained_violation_crossed(&mut self, threshold: usize) -> bool {
        let over = self.sustained_violation_run() >= threshold;
        let crossed = over && !self.sustained_alert_active;
        self.sustained_alert_active = over;
        crossed
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStats {
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub sample_count: usize,
}

/// Rolling latency tracker for a single named metric (frame-switch latency
/// by default; the facade may also feed loader latency through it).
pub struct PerformanceTimer {
    ring: Mutex<Ring>,
    warn_threshold_ms: f64,
    hard_threshold_ms: f64,
    sustained_violation_count: usize,
    metric_name: &'static str,
}

impl PerformanceTimer {
    pub fn new(
        metric_name: &'static str,
        ring_size: usize,
        recent_window: usize,
        warn_threshold_ms: f64,
        hard_threshold_ms: f64,
        sustained_violation_count: usize,
    ) -> Self {
        PerformanceTimer {
            ring: Mutex::new(Ring::new(ring_size, recent_window)),
            warn_threshold_ms,
            hard_threshold_ms,
            sustained_violation_count: sustained_violation_count.max(1),
            metric_name,
        }
    }

    /// Record one sample and raise alerts on the event bus if warranted.
    /// Returns the just-recorded sample's stats snapshot, plus `true` if
    /// this sample just crossed into a sustained-violation run (spec §4.6:
    /// the caller is expected to react with a forced cleanup and a preload
    /// window shrink, not just log the alert emitted here).
    pub fn record(&self, elapsed: Duration, bus: &EventBus) -> (LatencyStats, bool) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let violated = ms > self.warn_threshold_ms;

        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.push(ms, violated);

        if ms > self.hard_threshold_ms {
            bus.emit(PerformanceWarningEvent {
                metric: self.metric_name,
                value: ms,
                threshold: self.hard_threshold_ms,
                severity: AlertSeverity::Error,
            });
        } else if ms > self.warn_threshold_ms {
            bus.emit(PerformanceWarningEvent {
                metric: self.metric_name,
                value: ms,
                threshold: self.warn_threshold_ms,
                severity: AlertSeverity::Warning,
            });
        }

        let sustained = ring.sustained_violation_crossed(self.sustained_violation_count);
        if sustained {
            bus.emit(PerformanceWarningEvent {
                metric: self.metric_name,
                value: ring.sustained_violation_run() as f64,
                threshold: self.sustained_violation_count as f64,
                severity: AlertSeverity::Error,
            });
        }

        let stats = LatencyStats {
            mean_ms: ring.mean(),
            p50_ms: ring.percentile(0.50),
            p95_ms: ring.percentile(0.95),
            p99_ms: ring.percentile(0.99),
            max_ms: ring.max(),
            sample_count: ring.samples.len(),
        };
        (stats, sustained)
    }

    pub fn stats(&self) -> LatencyStats {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        LatencyStats {
            mean_ms: ring.mean(),
            p50_ms: ring.percentile(0.50),
            p95_ms: ring.percentile(0.95),
            p99_ms: ring.percentile(0.99),
            max_ms: ring.max(),
            sample_count: ring.samples.len(),
        }
    }
}

/// Tracks cache hit-rate over a rolling window and raises an alert when the
/// rate drops below threshold once enough samples have accumulated.
pub struct HitRateAlert {
    hits: Mutex<VecDeque<bool>>,
    window: usize,
    min_window: usize,
    threshold: f64,
}

impl HitRateAlert {
    pub fn new(min_window: usize, threshold: f64) -> Self {
        HitRateAlert { hits: Mutex::new(VecDeque::with_capacity(min_window.max(1))), window: min_window.max(1), min_window: min_window.max(1), threshold }
    }

    pub fn record(&self, hit: bool, bus: &EventBus) -> f64 {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        if hits.len() >= self.window {
            hits.pop_front();
        }
        hits.push_back(hit);

        let rate = hits.iter().filter(|h| **h).count() as f64 / hits.len() as f64;
        if hits.len() >= self.min_window && rate < self.threshold {
            bus.emit(PerformanceWarningEvent {
                metric: "hit_rate",
                value: rate,
                threshold: self.threshold,
                severity: AlertSeverity::Warning,
            });
        }
        rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_report_percentiles_over_window() {
        let timer = PerformanceTimer::new("frame_switch", 100, 50, 45.0, 50.0, 3);
        let bus = EventBus::new();
        for ms in 1..=100u64 {
            timer.record(Duration::from_millis(ms), &bus);
        }
        let stats = timer.stats();
        assert_eq!(stats.sample_count, 100);
        assert!(stats.p99_ms >= 95.0);
        assert!(stats.max_ms >= 99.0);
    }

    #[test]
    fn sustained_violations_raise_alert_once() {
        let timer = PerformanceTimer::new("frame_switch", 100, 50, 10.0, 20.0, 3);
        let bus = EventBus::new();
        let mut crossings = 0;
        for _ in 0..5 {
            let (_, sustained) = timer.record(Duration::from_millis(15), &bus);
            if sustained {
                crossings += 1;
            }
        }
        assert_eq!(crossings, 1, "sustained-violation signal should be edge-triggered, not re-fired every sample");

        let events = bus.poll();
        assert!(events.iter().any(|e| {
            crate::core::event_bus::downcast_event::<PerformanceWarningEvent>(e)
                .map(|w| w.value >= 3.0)
                .unwrap_or(false)
        }));
    }

    #[test]
    fn hit_rate_alert_fires_below_threshold_after_min_window() {
        let alert = HitRateAlert::new(10, 0.95);
        let bus = EventBus::new();
        for i in 0..10 {
            alert.record(i != 0, &bus);
        }
        let events = bus.poll();
        assert!(!events.is_empty());
    }
}
