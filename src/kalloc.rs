use alloc::alloc::{alloc, dealloc, handle_alloc_error};
use core::alloc::Layout;
use core::array;
use core::ptr::{self, NonNull};

use crate::cpu;
use crate::param::{NCPU, PGSIZE};
use crate::spinlock::SpinLock;

/// Byte written over a freshly allocated page, to surface reads of
/// uninitialized memory.
pub const ALLOC_JUNK: u8 = 0x05;
/// Byte written over a freed page, to surface use-after-free.
pub const FREE_JUNK: u8 = 0x01;

/// Freelist terminator.
const NIL: usize = usize::MAX;

/// Physical page allocator for kernel stacks, page-table pages and pipe
/// buffers. Whole pages only.
///
/// Each hart keeps its own freelist under its own lock, so the common path
/// never contends. A hart that runs dry steals from the others. Free pages
/// are an intrusive list: the first word of a free page holds the arena
/// index of the next free page.
///
/// The arena is owned and page-aligned, standing in for the physical range
/// `[end, PHYSTOP)` of a real machine.
pub struct Kmem {
    /// Head of each hart's freelist, as a page index into the arena.
    freelist: [SpinLock<usize>; NCPU],
    base: NonNull<u8>,
    npages: usize,
    layout: Layout,
}

// Safety: the arena is owned by this value for its whole lifetime, and a
// page is reachable either through exactly one freelist (under its lock) or
// through the caller that allocated it, never both.
unsafe impl Send for Kmem {}
unsafe impl Sync for Kmem {}

impl Kmem {
    /// Creates an allocator backed by a fresh arena of `npages` pages, all
    /// seeded onto hart 0's freelist and junk-filled.
    pub fn new(npages: usize) -> Self {
        assert!(npages > 0, "kinit");
        let size = npages.checked_mul(PGSIZE).expect("kinit: arena size");
        let layout = Layout::from_size_align(size, PGSIZE).expect("kinit: arena layout");

        let base = match NonNull::new(unsafe { alloc(layout) }) {
            Some(base) => base,
            None => handle_alloc_error(layout),
        };

        let kmem = Self {
            freelist: array::from_fn(|_| SpinLock::new(NIL, "kmem")),
            base,
            npages,
            layout,
        };

        // boot-time freerange: everything starts on hart 0
        let mut head = kmem.freelist[0].lock();
        for pn in 0..npages {
            unsafe {
                kmem.scrub(pn, FREE_JUNK);
                kmem.set_next(pn, *head);
            }
            *head = pn;
        }
        drop(head);

        log::debug!("kinit: {npages} pages");
        kmem
    }

    /// Allocates one page of physical memory, filled with `ALLOC_JUNK`.
    /// Returns `None` once every hart is out of pages.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        let _intr = cpu::push_off();
        let hart = cpu::id();

        let mut head = self.freelist[hart].lock();
        if *head == NIL {
            // Refill in two passes, so at most one per-CPU lock is ever
            // held: two harts stealing from each other must not deadlock.
            drop(head);
            let stolen = self.steal(hart);
            head = self.freelist[hart].lock();
            if stolen != NIL {
                unsafe { self.splice(stolen, &mut head) };
            }
        }

        if *head == NIL {
            log::debug!("kalloc: hart {hart} found no pages anywhere");
            return None;
        }

        let pn = *head;
        *head = unsafe { self.next(pn) };
        drop(head);

        unsafe { self.scrub(pn, ALLOC_JUNK) };
        Some(unsafe { NonNull::new_unchecked(self.page(pn)) })
    }

    /// Returns a page to the calling hart's freelist, filled with
    /// `FREE_JUNK`. Panics if `pa` is not a page the arena owns.
    pub fn free(&self, pa: NonNull<u8>) {
        let _intr = cpu::push_off();
        let hart = cpu::id();
        let pn = self.index_of(pa);

        unsafe { self.scrub(pn, FREE_JUNK) };

        let mut head = self.freelist[hart].lock();
        unsafe { self.set_next(pn, *head) };
        *head = pn;
    }

    /// Visits every other hart once, in index order, taking at most the
    /// head page of each non-empty freelist. Returns the spoils as a chain,
    /// `NIL` if every other hart was empty too. Nothing else is locked
    /// while a remote lock is held.
    fn steal(&self, hart: usize) -> usize {
        let mut chain = NIL;
        for i in 0..NCPU {
            if i == hart {
                continue;
            }
            let mut head = self.freelist[i].lock();
            if *head != NIL {
                let pn = *head;
                *head = unsafe { self.next(pn) };
                drop(head);
                // the page is ours alone now; link it into the chain
                unsafe { self.set_next(pn, chain) };
                chain = pn;
                log::trace!("kalloc: hart {hart} stole page {pn} from hart {i}");
            }
        }
        chain
    }

    /// Pushes a stolen chain onto a locked freelist head.
    ///
    /// # Safety
    /// Every page on the chain must be owned by the caller.
    unsafe fn splice(&self, chain: usize, head: &mut usize) {
        let mut tail = chain;
        loop {
            let next = unsafe { self.next(tail) };
            if next == NIL {
                break;
            }
            tail = next;
        }
        unsafe { self.set_next(tail, *head) };
        *head = chain;
    }

    fn page(&self, pn: usize) -> *mut u8 {
        debug_assert!(pn < self.npages);
        unsafe { self.base.as_ptr().add(pn * PGSIZE) }
    }

    /// Maps a page address back to its arena index. Panics on an address
    /// outside the arena or one that is not page-aligned.
    pub(crate) fn index_of(&self, pa: NonNull<u8>) -> usize {
        let base = self.base.as_ptr() as usize;
        let addr = pa.as_ptr() as usize;
        assert!(
            addr % PGSIZE == 0 && addr >= base && addr < base + self.npages * PGSIZE,
            "kfree: bad pa {addr:#x}"
        );
        (addr - base) / PGSIZE
    }

    /// # Safety
    /// The page must be owned by the caller: freshly popped, or on the
    /// caller's locked freelist.
    unsafe fn set_next(&self, pn: usize, next: usize) {
        unsafe { (self.page(pn) as *mut usize).write(next) }
    }

    /// # Safety
    /// Same ownership requirement as `set_next`.
    unsafe fn next(&self, pn: usize) -> usize {
        unsafe { (self.page(pn) as *const usize).read() }
    }

    /// # Safety
    /// The page must be exclusively owned by the caller.
    unsafe fn scrub(&self, pn: usize, junk: u8) {
        unsafe { ptr::write_bytes(self.page(pn), junk, PGSIZE) }
    }
}

impl Drop for Kmem {
    fn drop(&mut self) {
        // outstanding pages dangle, which is the embedder's leak to avoid
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
impl Kmem {
    pub(crate) fn free_count_on(&self, hart: usize) -> usize {
        let head = self.freelist[hart].lock();
        let mut n = 0;
        let mut pn = *head;
        while pn != NIL {
            n += 1;
            pn = unsafe { self.next(pn) };
        }
        n
    }

    pub(crate) fn free_count(&self) -> usize {
        (0..NCPU).map(|hart| self.free_count_on(hart)).sum()
    }
}

#[cfg(test)]
mod tests {
    use core::mem::size_of;
    use std::thread;
    use std::vec::Vec;

    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::cpu::harness;

    fn page_bytes(pa: NonNull<u8>) -> &'static [u8] {
        unsafe { core::slice::from_raw_parts(pa.as_ptr(), PGSIZE) }
    }

    #[test]
    fn seeds_everything_onto_hart_zero() {
        harness::bind(0);
        let kmem = Kmem::new(8);
        assert_eq!(kmem.free_count_on(0), 8);
        assert_eq!(kmem.free_count(), 8);
    }

    #[test]
    fn alloc_and_free_junk_fill() {
        harness::bind(0);
        let kmem = Kmem::new(4);

        let pa = kmem.alloc().expect("pages available");
        assert!(page_bytes(pa).iter().all(|&b| b == ALLOC_JUNK));

        kmem.free(pa);
        assert!(
            page_bytes(pa)[size_of::<usize>()..]
                .iter()
                .all(|&b| b == FREE_JUNK)
        );
        assert_eq!(kmem.free_count(), 4);
    }

    #[test]
    fn exhaustion_returns_none() {
        harness::bind(0);
        let kmem = Kmem::new(3);

        let held: Vec<_> = (0..3).map(|_| kmem.alloc().unwrap()).collect();
        assert!(kmem.alloc().is_none());

        for pa in held {
            kmem.free(pa);
        }
        assert_eq!(kmem.free_count(), 3);
    }

    #[test]
    fn alloc_steals_from_a_remote_hart() {
        harness::bind(0);
        let kmem = Kmem::new(1);

        let pa = kmem.alloc().unwrap();
        harness::bind(1);
        kmem.free(pa);
        assert_eq!(kmem.free_count_on(1), 1);

        harness::bind(0);
        let stolen = kmem.alloc().expect("steal must find hart 1's page");
        assert_eq!(stolen, pa);
        assert_eq!(kmem.free_count_on(1), 0);
        assert!(page_bytes(stolen).iter().all(|&b| b == ALLOC_JUNK));

        kmem.free(stolen);
    }

    #[test]
    fn pages_are_distinct_and_aligned() {
        harness::bind(0);
        let kmem = Kmem::new(16);

        let mut held = Vec::new();
        while let Some(pa) = kmem.alloc() {
            assert_eq!(pa.as_ptr() as usize % PGSIZE, 0);
            assert!(!held.contains(&pa), "page handed out twice");
            held.push(pa);
        }
        assert_eq!(held.len(), 16);

        for pa in held {
            kmem.free(pa);
        }
    }

    #[test]
    #[should_panic(expected = "kfree: bad pa")]
    fn free_of_misaligned_address_panics() {
        harness::bind(0);
        let kmem = Kmem::new(2);
        let pa = kmem.alloc().unwrap();
        let bad = NonNull::new(unsafe { pa.as_ptr().add(1) }).unwrap();
        kmem.free(bad);
    }

    #[test]
    fn conservation_under_cross_hart_churn() {
        harness::bind(0);
        let kmem = Kmem::new(64);

        thread::scope(|s| {
            for hart in 0..4 {
                s.spawn({
                    let kmem = &kmem;
                    move || {
                        harness::bind(hart);
                        let mut rng = SmallRng::seed_from_u64(0x6b6d656d + hart as u64);
                        let mut held = Vec::new();
                        for _ in 0..400 {
                            if held.len() < 8 && rng.gen_bool(0.6) {
                                if let Some(pa) = kmem.alloc() {
                                    held.push(pa);
                                }
                            } else if !held.is_empty() {
                                let pa = held.swap_remove(rng.gen_range(0..held.len()));
                                kmem.free(pa);
                            }
                        }
                        for pa in held {
                            kmem.free(pa);
                        }
                    }
                });
            }
        });

        assert_eq!(kmem.free_count(), 64, "pages lost or duplicated");
    }
}
