//! Access predictor: cheap, local pattern recognition used to bias the
//! prefetch window (spec §4.5).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::key::FrameKey;

/// Threshold on delta variance above which the access pattern is reported
/// as `Random` rather than a direction with low confidence.
const VARIANCE_THRESHOLD: f64 = 25.0;
/// Minimum fraction of same-signed deltas to report a dominant direction.
const DIRECTION_AGREEMENT: f64 = 0.70;
/// Maximum median stride magnitude to still call it directional access.
const MAX_DIRECTIONAL_STRIDE: i64 = 3;
/// Minimum share of one key among recent accesses to call it stationary.
const STATIONARY_SHARE: f64 = 0.30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
    Stationary,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub direction: Direction,
    pub stride: u32,
    pub confidence: f64,
}

/// Ring buffer of the last K access events, re-evaluated in O(K) on demand.
pub struct AccessPredictor {
    ring: Mutex<VecDeque<FrameKey>>,
    capacity: usize,
}

impl AccessPredictor {
    pub fn new(capacity: usize) -> Self {
        AccessPredictor { ring: Mutex::new(VecDeque::with_capacity(capacity.max(1))), capacity: capacity.max(1) }
    }

    /// Record an access, dropping the oldest entry once the ring is full.
    pub fn record(&self, key: FrameKey) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(key);
    }

    /// Compute the current prediction in O(K). Side-effect-free beyond
    /// `record`'s own buffer updates.
    pub fn predict(&self) -> Prediction {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() < 2 {
            return Prediction { direction: Direction::Stationary, stride: 0, confidence: 0.0 };
        }

        let mut counts: HashMap<FrameKey, usize> = HashMap::new();
        for k in ring.iter() {
            *counts.entry(*k).or_insert(0) += 1;
        }
        if let Some((_, top_count)) = counts.iter().max_by_key(|(_, c)| **c) {
            let share = *top_count as f64 / ring.len() as f64;
            if share > STATIONARY_SHARE {
                return Prediction { direction: Direction::Stationary, stride: 0, confidence: share };
            }
        }

        let deltas: Vec<i64> = ring.iter().zip(ring.iter().skip(1)).map(|(a, b)| b.delta(*a)).collect();
        let total = deltas.len() as f64;
        let pos = deltas.iter().filter(|d| **d > 0).count();
        let neg = deltas.iter().filter(|d| **d < 0).count();
        let (dominant_count, dominant_sign) = if pos >= neg { (pos, 1i64) } else { (neg, -1i64) };
        let agreement = dominant_count as f64 / total;

        let mut dominant_mags: Vec<i64> =
            deltas.iter().filter(|d| d.signum() == dominant_sign).map(|d| d.abs()).collect();
        dominant_mags.sort_unstable();
        let median = dominant_mags.get(dominant_mags.len() / 2).copied().unwrap_or(0);

        if agreement >= DIRECTION_AGREEMENT && median <= MAX_DIRECTIONAL_STRIDE {
            let direction = if dominant_sign > 0 { Direction::Forward } else { Direction::Backward };
            return Prediction { direction, stride: median as u32, confidence: agreement };
        }

        let mean = deltas.iter().sum::<i64>() as f64 / total;
        let variance = deltas.iter().map(|d| { let diff = *d as f64 - mean; diff * diff }).sum::<f64>() / total;

        if variance > VARIANCE_THRESHOLD {
            Prediction { direction: Direction::Random, stride: median.max(1) as u32, confidence: (1.0 - agreement).max(0.0) }
        } else {
            Prediction { direction: Direction::Random, stride: median.max(1) as u32, confidence: 0.1 }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_forward_access_is_directional() {
        let predictor = AccessPredictor::new(64);
        for i in 100..120u32 {
            predictor.record(FrameKey::new(i));
        }
        let p = predictor.predict();
        assert_eq!(p.direction, Direction::Forward);
        assert_eq!(p.stride, 1);
        assert!(p.confidence >= 0.70);
    }

    #[test]
    fn sequential_backward_access_is_directional() {
        let predictor = AccessPredictor::new(64);
        for i in (80..100u32).rev() {
            predictor.record(FrameKey::new(i));
        }
        let p = predictor.predict();
        assert_eq!(p.direction, Direction::Backward);
    }

    #[test]
    fn repeated_key_is_stationary() {
        let predictor = AccessPredictor::new(64);
        for _ in 0..10 {
            predictor.record(FrameKey::new(500));
        }
        predictor.record(FrameKey::new(501));
        let p = predictor.predict();
        assert_eq!(p.direction, Direction::Stationary);
    }

    #[test]
    fn erratic_access_is_random() {
        let predictor = AccessPredictor::new(64);
        let seq = [10u32, 900, 3, 777, 42, 611, 5, 888, 19, 499];
        for k in seq {
            predictor.record(FrameKey::new(k));
        }
        let p = predictor.predict();
        assert_eq!(p.direction, Direction::Random);
    }

    #[test]
    fn ring_drops_oldest_beyond_capacity() {
        let predictor = AccessPredictor::new(4);
        for i in 0..10u32 {
            predictor.record(FrameKey::new(i));
        }
        assert_eq!(predictor.ring.lock().unwrap().len(), 4);
    }
}
