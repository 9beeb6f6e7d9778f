//! In-memory `FrameLoader` test double for the `sweep` demo binary and for
//! exercising the cache without real video decoding.
//!
//! Generates a deterministic pixel pattern per frame and can simulate
//! decode latency and transient failures, matching the shape of the
//! teacher's `debounced_preloader.rs` synthetic-workload test harness.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use framekeep::{FrameKey, LoadedFrame, LoaderError};

/// Fixed output geometry; enough to exercise realistic byte-size budgeting
/// without decoding an actual 4K frame.
const WIDTH: u32 = 3840;
const HEIGHT: u32 = 2160;
const CHANNELS: u8 = 4;

pub struct SyntheticLoader {
    /// Simulated per-frame decode latency.
    pub latency: Duration,
    /// Every `fail_every`th load (by call count, not by key) returns an
    /// error; 0 disables failure injection.
    pub fail_every: u64,
    calls: AtomicU64,
}

impl SyntheticLoader {
    pub fn new(latency: Duration, fail_every: u64) -> Arc<Self> {
        Arc::new(SyntheticLoader { latency, fail_every, calls: AtomicU64::new(0) })
    }

    fn render(key: FrameKey) -> Arc<[u8]> {
        let size = (WIDTH * HEIGHT * CHANNELS as u32) as usize;
        let seed = key.value() as u8;
        let mut data = vec![0u8; size];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = seed.wrapping_add((i % 256) as u8);
        }
        Arc::from(data)
    }
}

impl framekeep::FrameLoader for SyntheticLoader {
    fn load(&self, key: FrameKey, deadline: Instant) -> Result<LoadedFrame, LoaderError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if self.fail_every > 0 && call % self.fail_every == 0 {
            return Err(LoaderError::Decode(format!("synthetic failure on call {call}")));
        }

        if self.latency > Duration::ZERO {
            if Instant::now() + self.latency > deadline {
                thread::sleep(deadline.saturating_duration_since(Instant::now()));
                return Err(LoaderError::DeadlineExceeded);
            }
            thread::sleep(self.latency);
        }

        Ok(LoadedFrame { data: Self::render(key), width: WIDTH, height: HEIGHT, channels: CHANNELS })
    }
}
