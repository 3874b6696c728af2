//! CPU identity and preemption control.
//!
//! The pools need two things from the surrounding kernel: which hart is
//! executing, and a guarantee that the answer stays valid for the duration of
//! an operation. [`Cpus`] is that contract. The kernel registers one source at
//! boot with [`install`]; until then the crate behaves as a single-hart
//! system and preemption control is a no-op.

use core::marker::PhantomData;

use spin::Once;

use crate::param::NCPU;

/// Source of CPU identity and preemption control.
///
/// Implementations must return a stable id in `0..NCPU` for the calling
/// thread of execution, and must keep it stable between `push_off` and the
/// matching `pop_off`. On a real machine that means reading the hart id with
/// interrupts disabled; a host embedding maps each worker thread to a fixed
/// hart instead.
pub trait Cpus: Sync {
    /// Current hart id, `< NCPU`.
    fn id(&self) -> usize;

    /// Disables preemption on the calling hart. Nestable.
    fn push_off(&self) {}

    /// Balances one `push_off`; the outermost call re-enables preemption.
    fn pop_off(&self) {}

    /// Gives the CPU up to the scheduler while waiting on a sleep-lock.
    fn yield_now(&self) {
        core::hint::spin_loop()
    }
}

static CPUS: Once<&'static dyn Cpus> = Once::new();

/// Registers the CPU source. Later calls are ignored.
pub fn install(cpus: &'static dyn Cpus) {
    CPUS.call_once(|| cpus);
}

pub(crate) fn installed() -> bool {
    CPUS.get().is_some()
}

/// Current hart id. 0 when no source is installed.
pub fn id() -> usize {
    let id = CPUS.get().map_or(0, |c| c.id());
    assert!(id < NCPU, "cpu id");
    id
}

/// Pins the caller to its hart until the returned lock is dropped.
pub fn push_off() -> IntrLock {
    if let Some(c) = CPUS.get() {
        c.push_off();
    }
    IntrLock {
        _not_send: PhantomData,
    }
}

pub(crate) fn yield_now() {
    match CPUS.get() {
        Some(c) => c.yield_now(),
        None => core::hint::spin_loop(),
    }
}

/// Ownership of one level of disabled preemption.
pub struct IntrLock {
    _not_send: PhantomData<*mut ()>,
}

impl Drop for IntrLock {
    fn drop(&mut self) {
        if let Some(c) = CPUS.get() {
            c.pop_off();
        }
    }
}

#[cfg(test)]
pub(crate) mod harness {
    use std::cell::Cell;

    use super::{Cpus, install};

    std::thread_local! {
        static HART: Cell<usize> = const { Cell::new(0) };
    }

    struct TestCpus;

    impl Cpus for TestCpus {
        fn id(&self) -> usize {
            HART.with(|h| h.get())
        }

        fn yield_now(&self) {
            std::thread::yield_now()
        }
    }

    static TEST_CPUS: TestCpus = TestCpus;

    /// Installs the thread-local CPU source and binds the calling thread to
    /// `hart`. Concurrent test threads must bind distinct harts.
    pub fn bind(hart: usize) {
        install(&TEST_CPUS);
        HART.with(|h| h.set(hart));
    }
}
