//! A generic spinlock, ported from the teacher's `spinlock.rs` (which
//! carried a non-generic `Mutex<T>` in `src/` and a renamed, generic
//! `SpinLock<T>` in the `kernel/src/` revision — this port takes the
//! generic name, since every lock the core needs (`p.lock`, `p.link_lock`,
//! list head locks, `wait_lock`) wraps different data).
//!
//! `push_off`/`pop_off` and the interrupt-nesting they track are the one
//! piece of per-hart state this module owns directly, per spec.md §3's
//! note that `noff`/`intena` "belong to the cpu-kernel-thread, not the cpu
//! per se" — rather than hang them off `proc::Cpu`, they live in a small
//! per-CPU table here, so `spinlock.rs` has no dependency on `proc.rs`.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::hal;
use crate::param::NCPU;

struct PushOffState {
    /// Depth of nested `push_off()` calls on this CPU.
    noff: AtomicUsize,
    /// Interrupt-enabled state saved by the outermost `push_off()`.
    intena: AtomicBool,
}

impl PushOffState {
    const fn new() -> Self {
        Self {
            noff: AtomicUsize::new(0),
            intena: AtomicBool::new(false),
        }
    }
}

static PUSH_OFF: [PushOffState; NCPU] = [const { PushOffState::new() }; NCPU];

fn this_cpu_push_off(&self_: &PushOffState) {
    let old = hal::get();
    hal::disable();

    if self_.noff.load(Ordering::Relaxed) == 0 {
        self_.intena.store(old, Ordering::Relaxed);
    }
    self_.noff.fetch_add(1, Ordering::Relaxed);
}

/// Disables interrupts, remembering the previous state on the first nested
/// call so `pop_off` can restore it. Every `SpinLock::acquire` brackets
/// itself with one `push_off`/`pop_off` pair.
pub fn push_off() {
    let id = hal::hart_id();
    this_cpu_push_off(&PUSH_OFF[id]);
}

/// Reverses one `push_off`. Re-enables interrupts only once the nesting
/// depth returns to zero, and only if they were enabled before the
/// outermost `push_off`.
pub fn pop_off() {
    assert!(!hal::get(), "pop_off - interruptible");

    let id = hal::hart_id();
    let state = &PUSH_OFF[id];
    let prev = state.noff.fetch_sub(1, Ordering::Relaxed);
    assert!(prev >= 1, "pop_off");

    if prev == 1 && state.intena.load(Ordering::Relaxed) {
        hal::enable();
    }
}

/// Current CPU's nested-`push_off` depth, i.e. the number of spinlocks it
/// holds (every `SpinLock::lock` brackets itself with one `push_off`). Used
/// by `proc::sched`'s precondition check that the caller holds exactly one
/// lock (`p.lock`) when entering the scheduler.
pub fn depth() -> usize {
    PUSH_OFF[hal::hart_id()].noff.load(Ordering::Relaxed)
}

/// A mutual-exclusion lock built from a spin loop over an `AtomicBool`,
/// bracketed by `push_off`/`pop_off` so a lock holder can never be
/// interrupted and rescheduled onto another hart mid-critical-section.
#[derive(Debug)]
pub struct SpinLock<T> {
    name: &'static str,
    locked: AtomicBool,
    holder: AtomicUsize,
    data: UnsafeCell<T>,
}

const NO_HOLDER: usize = usize::MAX;

unsafe impl<T: Send> Sync for SpinLock<T> {}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            holder: AtomicUsize::new(NO_HOLDER),
            data: UnsafeCell::new(value),
        }
    }

    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.holder.load(Ordering::Relaxed) == hal::hart_id()
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        push_off();
        assert!(!self.holding(), "acquire {} (already held)", self.name);

        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        self.holder.store(hal::hart_id(), Ordering::Relaxed);

        SpinLockGuard { lock: self }
    }

    /// Releases a guard that was moved out of scope without being dropped
    /// normally (e.g. handed across a `swtch` boundary the way the
    /// scheduler hands `p.lock` to the next kernel thread). The caller is
    /// responsible for not using the guard's borrow afterwards.
    pub fn force_unlock(&self) {
        assert!(self.holding(), "release {} (not held)", self.name);
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }

    /// Mutable access without locking, for debug dumps that must not risk
    /// wedging on a stuck lock (`procdump`).
    ///
    /// # Safety
    /// The caller must ensure no other code is concurrently mutating the
    /// value.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// Releases the lock early and hands back a reference the caller can
    /// later `.lock()` again, instead of waiting for `Drop`. `sleep` uses
    /// this to release the condition lock passed in by its caller only
    /// after `p.lock` is already held (the ordering that prevents missed
    /// wakeups).
    pub fn unlock(self) -> &'a SpinLock<T> {
        let lock = self.lock;
        lock.force_unlock();
        core::mem::forget(self);
        lock
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.force_unlock();
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}
