//! Disk driver contract.
//!
//! The buffer cache does not link against a driver; the embedding kernel
//! supplies one through this trait. Transfers are synchronous, one block at a
//! time, the way a virtio request completes before the issuing process is
//! rescheduled.

use crate::param::BSIZE;

/// A synchronous block device.
pub trait Disk: Sync {
    /// Transfers one block. On return with `write == false`, `data` reflects
    /// the on-disk block; with `write == true`, the disk reflects `data`.
    ///
    /// Device errors are not recoverable at this layer; implementations
    /// panic on them.
    fn rw(&self, dev: u32, block_no: u32, data: &mut [u8; BSIZE], write: bool);
}

impl<T: Disk> Disk for &T {
    fn rw(&self, dev: u32, block_no: u32, data: &mut [u8; BSIZE], write: bool) {
        (**self).rw(dev, block_no, data, write)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::Disk;
    use crate::param::BSIZE;

    /// In-memory disk. Blocks never written read back as a pattern derived
    /// from their number, and transfers are counted so tests can assert how
    /// many times the cache really went to the device.
    pub struct RamDisk {
        blocks: Mutex<HashMap<(u32, u32), [u8; BSIZE]>>,
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    impl RamDisk {
        pub fn new() -> Self {
            Self {
                blocks: Mutex::new(HashMap::new()),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            }
        }

        pub fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }

        pub fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        pub fn pattern(dev: u32, block_no: u32) -> [u8; BSIZE] {
            [(dev as u8) ^ (block_no as u8); BSIZE]
        }
    }

    impl Disk for RamDisk {
        fn rw(&self, dev: u32, block_no: u32, data: &mut [u8; BSIZE], write: bool) {
            let mut blocks = self.blocks.lock().unwrap();
            if write {
                self.writes.fetch_add(1, Ordering::SeqCst);
                blocks.insert((dev, block_no), *data);
            } else {
                self.reads.fetch_add(1, Ordering::SeqCst);
                *data = *blocks
                    .entry((dev, block_no))
                    .or_insert_with(|| Self::pattern(dev, block_no));
            }
        }
    }
}
