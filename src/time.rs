//! Kernel tick counter.
//!
//! The embedder's timer interrupt calls [`tick`]; the buffer cache stamps
//! idle slots with [`now`]. Reads are lock-free: LRU selection only needs
//! monotonicity, so if release A happens-before release B, A's stamp is at
//! most B's.

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Advances the tick counter and returns the new value.
pub fn tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Current tick value.
pub fn now() -> u64 {
    TICKS.load(Ordering::Relaxed)
}
