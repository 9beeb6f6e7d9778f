//! `sweep`: small CLI that drives the cache facade over a synthetic frame
//! range and prints latency/hit-rate stats, for manually sanity-checking
//! the 50ms frame-switch contract without a real annotation tool attached.

#[path = "../../demos/synthetic_loader.rs"]
mod synthetic_loader;

use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use framekeep::{CacheConfig, CacheFacade, FrameKey, FrameRange};
use synthetic_loader::SyntheticLoader;

#[derive(Parser, Debug)]
#[command(name = "sweep", about = "Sweep a synthetic frame range through the cache facade")]
struct Args {
    /// Inclusive last frame of the synthetic range.
    #[arg(long, default_value_t = 2000)]
    last_frame: u32,

    /// Simulated per-frame decode latency, in milliseconds.
    #[arg(long, default_value_t = 8)]
    decode_latency_ms: u64,

    /// Inject a synthetic decode failure every N loader calls (0 disables).
    #[arg(long, default_value_t = 0)]
    fail_every: u64,

    /// Number of passes back and forth across the range.
    #[arg(long, default_value_t = 1)]
    passes: u32,

    /// Per-`get` deadline budget, in milliseconds.
    #[arg(long, default_value_t = 500)]
    deadline_ms: u64,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let loader = SyntheticLoader::new(Duration::from_millis(args.decode_latency_ms), args.fail_every);
    let config = CacheConfig { worker_count: CacheConfig::auto_worker_count(), ..CacheConfig::default() };
    let facade = CacheFacade::spawn(config, loader);

    let bounds = FrameRange::new(0, args.last_frame);
    facade.notify_project_opened(bounds);

    let mut previous = None;
    for pass in 0..args.passes {
        let keys: Box<dyn Iterator<Item = u32>> = if pass % 2 == 0 { Box::new(0..=args.last_frame) } else { Box::new((0..=args.last_frame).rev()) };

        for value in keys {
            let key = FrameKey::new(value);
            facade.notify_frame_changed(key, previous, bounds);

            let deadline = Instant::now() + Duration::from_millis(args.deadline_ms);
            let start = Instant::now();
            match facade.get(key, deadline) {
                Ok(handle) => {
                    let _ = handle.bytes().len();
                }
                Err(e) => {
                    log::warn!("frame {key} failed: {e}");
                }
            }
            let elapsed = start.elapsed();
            if elapsed > Duration::from_millis(50) {
                log::warn!("frame {key} switch took {:.1}ms (budget 50ms)", elapsed.as_secs_f64() * 1000.0);
            }
            previous = Some(key);
        }
    }

    let stats = facade.stats();
    println!("hits={} misses={} hit_rate={:.4}", stats.hits, stats.misses, stats.hit_rate);
    println!("resident_entries={}", stats.resident_entries);
    println!("resident_bytes={}", stats.resident_bytes);
    println!("evictions={}", stats.evictions);
    println!(
        "frame_switch p50={:.2}ms p95={:.2}ms p99={:.2}ms max={:.2}ms",
        stats.frame_switch.p50_ms, stats.frame_switch.p95_ms, stats.frame_switch.p99_ms, stats.frame_switch.max_ms
    );
    println!("preload_queue_len={} preload_paused={}", stats.preload_queue_len, stats.preload_paused);

    Ok(())
}
