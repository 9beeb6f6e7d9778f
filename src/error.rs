//! Error taxonomy for the cache facade (spec §7).

use std::fmt;

/// Errors surfaced by `CacheFacade` public operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The loader could not produce the frame within the remaining budget
    /// (miss + loader error, or deadline exhaustion).
    NotFound,
    /// A single incoming buffer exceeds `hard_limit_bytes` even with the
    /// cache empty, or admission failed because every entry is pinned.
    BudgetExhausted,
    /// Key outside the configured frame range. Returned synchronously
    /// without side effects.
    InvalidKey,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::NotFound => write!(f, "frame not available within budget"),
            CacheError::BudgetExhausted => write!(f, "cache budget exhausted"),
            CacheError::InvalidKey => write!(f, "key outside configured frame range"),
        }
    }
}

impl std::error::Error for CacheError {}
