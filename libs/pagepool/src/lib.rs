//! Shared-Memory Page Pool
//!
//! A process-shared, lock-free allocator for fixed-size memory pages. A pool
//! is a memory-mapped segment: a versioned header validated at attach time,
//! an atomic free-list stack, and the page payload region. Independent
//! processes map the same segment file and acquire/release pages through
//! compare-and-swap alone; no mutex or semaphore is used anywhere.
//!
//! A [`PageId`] is a capability: holding one entitles the holder to the
//! corresponding page's bytes and obligates a later [`PagePool::push`].
//! Misuse of the capability (double push, foreign pool, out-of-range number)
//! is a contract violation and panics; an empty pool is the only recoverable
//! failure and surfaces as `None` from [`PagePool::pop`].

// Unsafe is confined to mapping raw segment bytes onto atomics and page
// slices; every unsafe block states its layout assumption.
#![allow(unsafe_code)]

pub mod layout;
pub mod pool;
pub mod stack;

pub use layout::{SegmentHeader, SegmentLayout, LAYOUT_VERSION, SEGMENT_MAGIC};
pub use pool::PagePool;
pub use stack::{PageId, PageStack, PoolId};

use thiserror::Error;

/// Segment creation/attach failures
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("segment I/O failed: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("segment layout rejected: {message}")]
    Layout { message: String },

    #[error("pool misconfigured: {message}")]
    Config { message: String },
}

impl PoolError {
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    pub fn layout(message: impl Into<String>) -> Self {
        Self::Layout {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;
