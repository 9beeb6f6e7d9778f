//! `FrameLoader`: the external collaborator that decodes or reads one frame.
//!
//! Out of scope per the cache's own design (spec §1): this trait is the only
//! contact point with video decoding / disk I/O. Implementations must be
//! thread-safe, reentrant, and honor the deadline within a small tolerance
//! (spec §6, §5 "Timeouts").

use std::fmt;
use std::time::Instant;

use crate::buffer::LoadedFrame;
use crate::key::FrameKey;

/// Errors a `FrameLoader` can return. Collapsed into `CacheError::NotFound`
/// at the facade boundary (spec §7), but logged with cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    Io(String),
    Decode(String),
    DeadlineExceeded,
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderError::Io(msg) => write!(f, "io error: {msg}"),
            LoaderError::Decode(msg) => write!(f, "decode error: {msg}"),
            LoaderError::DeadlineExceeded => write!(f, "loader exceeded its deadline"),
        }
    }
}

impl std::error::Error for LoaderError {}

/// A blocking operation that decodes or reads one frame.
///
/// `load` must observe `deadline` within a small tolerance; callers abandon
/// results that arrive late and increment a `loader_overrun` counter
/// (spec §5 "Timeouts").
pub trait FrameLoader: Send + Sync + 'static {
    fn load(&self, key: FrameKey, deadline: Instant) -> Result<LoadedFrame, LoaderError>;
}

impl<F> FrameLoader for F
where
    F: Fn(FrameKey, Instant) -> Result<LoadedFrame, LoaderError> + Send + Sync + 'static,
{
    fn load(&self, key: FrameKey, deadline: Instant) -> Result<LoadedFrame, LoaderError> {
        self(key, deadline)
    }
}
