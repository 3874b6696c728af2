//! Concurrent resource pools for a small teaching kernel: a bucket-sharded
//! block buffer cache and a per-CPU physical page allocator with work
//! stealing, plus a reference-counted allocator variant for copy-on-write.
//!
//! The surrounding kernel supplies a disk driver ([`disk::Disk`]), a CPU
//! source ([`cpu::Cpus`]) and timer ticks ([`time::tick`]); everything else
//! lives here.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod buf;
pub mod cpu;
pub mod disk;
pub mod kalloc;
pub mod kref;
pub mod param;
pub mod sleeplock;
pub mod spinlock;
pub mod time;
