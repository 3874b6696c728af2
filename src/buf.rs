use alloc::vec::Vec;
use core::array;

use crate::disk::Disk;
use crate::param::{BSIZE, NBUCKET, NBUF};
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::time;

/// Slot metadata. A slot's entry lives inside the bucket currently holding
/// it, so the bucket lock is the only way to reach these fields.
#[derive(Debug, Clone, Copy)]
struct Slot {
    /// Index of the slot's data cell in `Bcache::bufs`. Fixed for the slot's
    /// lifetime; the key and bucket are not.
    id: usize,
    dev: u32,
    block_no: u32,
    refcnt: u32,
    /// Tick at which `refcnt` last reached zero. Meaningful only while idle.
    timestamp: u64,
}

/// One hash partition: the slots whose `block_no % NBUCKET` matched this
/// bucket when they were last assigned a key.
struct Bucket {
    slots: Vec<Slot>,
}

/// Block payload, protected by the slot's `SleepLock` across disk I/O.
pub struct BufData {
    /// Key whose block the payload holds, `None` until the first read. A
    /// stale tag after eviction is what makes the new key re-read the disk.
    tag: Option<(u32, u32)>,
    data: [u8; BSIZE],
}

/// Stable identity of a held buffer: its slot and the key it was returned
/// for. Survives `release`, which is what lets the log layer `unpin` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufId {
    slot: usize,
    dev: u32,
    block_no: u32,
}

/// A locked buffer handle returned by `read()`.
///
/// Holds the slot's sleep-lock guard, so the holder may mutate the payload
/// and nobody else can. Hand it back with [`Bcache::release`]; dropping it
/// without releasing leaves the slot referenced forever.
pub struct Buf<'a> {
    id: BufId,
    guard: SleepLockGuard<'a, BufData>,
}

impl Buf<'_> {
    pub fn id(&self) -> BufId {
        self.id
    }

    pub fn dev(&self) -> u32 {
        self.id.dev
    }

    pub fn block_no(&self) -> u32 {
        self.id.block_no
    }

    pub fn data(&self) -> &[u8; BSIZE] {
        &self.guard.data
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.guard.data
    }
}

fn bucket_of(block_no: u32) -> usize {
    block_no as usize % NBUCKET
}

/// Block buffer cache.
///
/// A fixed pool of `NBUF` slots holding cached copies of disk blocks,
/// sharded over `NBUCKET` bucket lists so that hits on different buckets
/// never contend. Caching disk blocks in memory reduces the number of disk
/// reads and also provides a synchronization point for blocks used by
/// multiple processes.
///
/// Interface:
/// * To get a buffer for a particular disk block, call `read()`.
/// * After changing buffer data, call `write()` to write it to disk.
/// * When done with the buffer, call `release()`.
/// * Do not use the buffer after calling `release()`.
/// * Only one process at a time can use a buffer, so do not keep them longer
///   than necessary.
pub struct Bcache<D> {
    disk: D,
    /// Serializes eviction. Any path that may reparent a slot holds it, so
    /// at most one slot anywhere carries a given key.
    evict: SpinLock<()>,
    buckets: [SpinLock<Bucket>; NBUCKET],
    /// Each slot's payload, under its own sleep-lock.
    bufs: [SleepLock<BufData>; NBUF],
}

impl<D: Disk> Bcache<D> {
    /// Creates the cache with every slot parked in bucket 0, unkeyed and
    /// idle.
    pub fn new(disk: D) -> Self {
        let buckets = array::from_fn(|i| {
            let mut bucket = Bucket {
                slots: Vec::with_capacity(NBUF),
            };
            if i == 0 {
                for id in 0..NBUF {
                    bucket.slots.push(Slot {
                        id,
                        dev: 0,
                        block_no: 0,
                        refcnt: 0,
                        timestamp: 0,
                    });
                }
            }
            SpinLock::new(bucket, "bcache.bucket")
        });

        log::debug!("binit: {NBUF} buffers in {NBUCKET} buckets");

        Self {
            disk,
            evict: SpinLock::new((), "bcache.evict"),
            buckets,
            bufs: array::from_fn(|_| {
                SleepLock::new(
                    BufData {
                        tag: None,
                        data: [0; BSIZE],
                    },
                    "buffer",
                )
            }),
        }
    }

    /// Looks through the cache for the block on device `dev`. If not found,
    /// recycles the oldest idle slot. Either way, returns the slot with its
    /// sleep-lock held and its reference taken.
    fn get(&self, dev: u32, block_no: u32) -> Buf<'_> {
        let b = bucket_of(block_no);

        // fast path: a hit touches nothing but the home bucket
        {
            let mut bucket = self.buckets[b].lock();
            if let Some(slot) = bucket
                .slots
                .iter_mut()
                .find(|s| s.dev == dev && s.block_no == block_no)
            {
                slot.refcnt += 1;
                let id = BufId {
                    slot: slot.id,
                    dev,
                    block_no,
                };
                drop(bucket);
                return Buf {
                    id,
                    guard: self.bufs[id.slot].lock(),
                };
            }
        }

        // Not cached. Take the eviction lock and look again: another hart
        // may have installed the key between the two scans, and only one
        // eviction may run at a time.
        let evict = self.evict.lock();

        {
            let mut bucket = self.buckets[b].lock();
            if let Some(slot) = bucket
                .slots
                .iter_mut()
                .find(|s| s.dev == dev && s.block_no == block_no)
            {
                slot.refcnt += 1;
                let id = BufId {
                    slot: slot.id,
                    dev,
                    block_no,
                };
                drop(bucket);
                drop(evict);
                return Buf {
                    id,
                    guard: self.bufs[id.slot].lock(),
                };
            }
        }

        // Recycle the least recently used idle slot from the other buckets.
        // The scan keeps only the current best candidate's bucket locked, so
        // the candidate cannot gain a reference behind our back.
        let mut victim: Option<(SpinLockGuard<'_, Bucket>, usize, u64)> = None;
        for i in 0..NBUCKET {
            if i == b {
                continue;
            }
            let bucket = self.buckets[i].lock();

            let mut threshold = victim.as_ref().map(|(_, _, ts)| *ts);
            let mut better = None;
            for (pos, slot) in bucket.slots.iter().enumerate() {
                if slot.refcnt == 0 && threshold.is_none_or(|t| slot.timestamp < t) {
                    better = Some((pos, slot.timestamp));
                    threshold = Some(slot.timestamp);
                }
            }

            if let Some((pos, ts)) = better {
                // replacing the previous candidate unlocks its bucket
                victim = Some((bucket, pos, ts));
            }
        }

        let Some((mut victim_bucket, pos, _)) = victim else {
            panic!("bget: no buffers");
        };

        let mut home = self.buckets[b].lock();

        let mut slot = victim_bucket.slots.swap_remove(pos);
        log::trace!(
            "bget: slot {} ({}, {}) -> ({dev}, {block_no})",
            slot.id,
            slot.dev,
            slot.block_no
        );
        slot.dev = dev;
        slot.block_no = block_no;
        slot.refcnt = 1;
        let id = BufId {
            slot: slot.id,
            dev,
            block_no,
        };
        home.slots.push(slot);

        drop(home);
        drop(victim_bucket);
        drop(evict);

        Buf {
            id,
            guard: self.bufs[id.slot].lock(),
        }
    }

    /// Returns a locked buffer with the contents of the indicated block,
    /// going to the disk only if the cached copy is not valid for this key.
    pub fn read(&self, dev: u32, block_no: u32) -> Buf<'_> {
        let mut buf = self.get(dev, block_no);

        if buf.guard.tag != Some((dev, block_no)) {
            self.disk.rw(dev, block_no, &mut buf.guard.data, false);
            buf.guard.tag = Some((dev, block_no));
        }

        buf
    }

    /// Writes the buffer's contents to disk. The caller holds the buffer's
    /// sleep-lock by construction of `Buf`.
    pub fn write(&self, buf: &mut Buf<'_>) {
        let BufId { dev, block_no, .. } = buf.id;
        self.disk.rw(dev, block_no, &mut buf.guard.data, true);
    }

    /// Releases a locked buffer: drops the sleep-lock first, then retires
    /// the reference under the home bucket's lock, stamping the idle time
    /// when the count reaches zero.
    pub fn release(&self, buf: Buf<'_>) {
        let Buf { id, guard } = buf;
        drop(guard);

        let mut bucket = self.buckets[bucket_of(id.block_no)].lock();
        let Some(slot) = bucket.slots.iter_mut().find(|s| s.id == id.slot) else {
            panic!("brelse");
        };
        assert!(slot.refcnt > 0, "brelse");
        slot.refcnt -= 1;
        if slot.refcnt == 0 {
            slot.timestamp = time::now();
        }
    }

    /// Takes an extra reference so the slot survives `release`; the log
    /// layer pins dirty buffers until they are committed.
    pub fn pin(&self, buf: &Buf<'_>) {
        let id = buf.id;
        let mut bucket = self.buckets[bucket_of(id.block_no)].lock();
        let Some(slot) = bucket.slots.iter_mut().find(|s| s.id == id.slot) else {
            panic!("bpin");
        };
        slot.refcnt += 1;
    }

    /// Balances `pin` once the pinned block has been committed. The slot
    /// must still carry the pinned key; a pinned slot cannot be recycled.
    pub fn unpin(&self, id: BufId) {
        let mut bucket = self.buckets[bucket_of(id.block_no)].lock();
        let Some(slot) = bucket
            .slots
            .iter_mut()
            .find(|s| s.id == id.slot && s.dev == id.dev && s.block_no == id.block_no)
        else {
            panic!("bunpin");
        };
        assert!(slot.refcnt > 0, "bunpin");
        slot.refcnt -= 1;
    }
}

#[cfg(test)]
impl<D: Disk> Bcache<D> {
    /// Bucket currently holding the slot keyed `(dev, block_no)`.
    fn bucket_index_of(&self, dev: u32, block_no: u32) -> Option<usize> {
        (0..NBUCKET).find(|&i| {
            self.buckets[i]
                .lock()
                .slots
                .iter()
                .any(|s| s.dev == dev && s.block_no == block_no)
        })
    }

    fn refcnt_of(&self, dev: u32, block_no: u32) -> Option<u32> {
        for i in 0..NBUCKET {
            let bucket = self.buckets[i].lock();
            if let Some(slot) = bucket
                .slots
                .iter()
                .find(|s| s.dev == dev && s.block_no == block_no)
            {
                return Some(slot.refcnt);
            }
        }
        None
    }

    fn resident_slots(&self) -> usize {
        (0..NBUCKET).map(|i| self.buckets[i].lock().slots.len()).sum()
    }

    fn assert_invariants(&self) {
        use std::collections::HashSet;

        assert_eq!(self.resident_slots(), NBUF);

        let mut keys = HashSet::new();
        let mut ids = HashSet::new();
        for i in 0..NBUCKET {
            let bucket = self.buckets[i].lock();
            for slot in bucket.slots.iter() {
                assert!(ids.insert(slot.id));
                if (slot.dev, slot.block_no) != (0, 0) {
                    assert!(
                        keys.insert((slot.dev, slot.block_no)),
                        "duplicate key ({}, {})",
                        slot.dev,
                        slot.block_no
                    );
                    assert_eq!(bucket_of(slot.block_no), i);
                }
            }
        }
    }
}
