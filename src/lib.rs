//! Frame cache and preload engine for a 4K-video bounding-box annotation
//! tool: an LRU-backed, budget-governed, prediction-driven cache that keeps
//! frame switches under a 50ms latency contract.
//!
//! The public surface is [`CacheFacade`]; everything under [`core`] is
//! implementation detail wired together by it.

pub mod buffer;
pub mod config;
pub mod core;
pub mod error;
pub mod key;
pub mod loader;

pub use buffer::{FrameBuffer, LoadedFrame};
pub use config::CacheConfig;
pub use core::event_bus::{
    downcast_event, AlertSeverity, CacheHitEvent, CacheMissEvent, EventBus, FrameChangedEvent,
    MemoryUsageEvent, PerformanceWarningEvent, PreloadPausedEvent, PreloadResumedEvent, ProjectOpenedEvent,
    SustainedViolationEvent,
};
pub use core::facade::{CacheFacade, CacheStats, FrameHandle};
pub use core::predictor::Direction;
pub use error::CacheError;
pub use key::{FrameKey, FrameRange};
pub use loader::{FrameLoader, LoaderError};
