//! Error types for the one recoverable failure path in this crate: mapping
//! virtual memory for a new `Pool`. Everything else either returns a
//! sentinel value (`None`, `NOT_FOUND`) or aborts through a `Runtime` upcall.

use std::fmt;
use std::io;

/// Failure to reserve virtual memory for a pool.
#[derive(Debug)]
pub enum PoolInitError {
    /// `libc::mmap` returned `MAP_FAILED`.
    MapFailed(io::Error),
    /// The requested page count, multiplied by `PAGE_SIZE`, overflows `usize`.
    SizeOverflow,
}

impl fmt::Display for PoolInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolInitError::MapFailed(e) => write!(f, "failed to map pool memory: {}", e),
            PoolInitError::SizeOverflow => write!(f, "pool size overflows usize"),
        }
    }
}

impl std::error::Error for PoolInitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolInitError::MapFailed(e) => Some(e),
            PoolInitError::SizeOverflow => None,
        }
    }
}
