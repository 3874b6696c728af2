use alloc::boxed::Box;
use alloc::vec;
use core::ptr::NonNull;

use crate::kalloc::Kmem;
use crate::spinlock::SpinLock;

/// Page allocator with per-page reference counts: the copy-on-write variant
/// of [`Kmem`]. Duplicating a page-table entry pins the page instead of
/// copying it, and the page goes back to the freelists only when its last
/// owner frees it.
pub struct RcKmem {
    kmem: Kmem,
    /// One count per page. `refcount[p] == 0` iff `p` is on a freelist. One
    /// lock covers the whole table and never nests with a freelist lock.
    refcount: SpinLock<Box<[u32]>>,
}

impl RcKmem {
    pub fn new(npages: usize) -> Self {
        Self {
            kmem: Kmem::new(npages),
            refcount: SpinLock::new(vec![0u32; npages].into_boxed_slice(), "kref"),
        }
    }

    /// Allocates a page with a reference count of one.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        let pa = self.kmem.alloc()?;
        let pn = self.kmem.index_of(pa);
        let mut refcount = self.refcount.lock();
        debug_assert_eq!(refcount[pn], 0);
        refcount[pn] = 1;
        Some(pa)
    }

    /// Adds an owner to an allocated page. Panics on a page nobody owns.
    pub fn pin(&self, pa: NonNull<u8>) {
        let pn = self.kmem.index_of(pa);
        let mut refcount = self.refcount.lock();
        assert!(refcount[pn] > 0, "kpin");
        refcount[pn] += 1;
    }

    /// Drops one owner. The last owner's free returns the page to the
    /// calling hart's freelist; earlier frees leave it untouched for the
    /// remaining owners.
    pub fn free(&self, pa: NonNull<u8>) {
        let pn = self.kmem.index_of(pa);

        let mut refcount = self.refcount.lock();
        assert!(refcount[pn] > 0, "kfree: refcount");
        refcount[pn] -= 1;
        let last = refcount[pn] == 0;
        drop(refcount);

        // whoever dropped the count to zero was the sole remaining owner,
        // so nobody can pin or free the page between here and the insert
        if last {
            self.kmem.free(pa);
        }
    }

    /// Current owner count of the page. Zero means free.
    pub fn refcount(&self, pa: NonNull<u8>) -> u32 {
        self.refcount.lock()[self.kmem.index_of(pa)]
    }
}
