//! The narrow "Low-level" collaborator contract from spec.md §6: reading
//! the current hart id (`r_tp`) and the raw interrupt-enable bit
//! (`intr_on`/`intr_get`). Everything above this module (`spinlock.rs` and
//! up) is the core's own synchronization design; this module is the seam
//! where it touches real hardware, which is out of scope per §1.
//!
//! In a deployed build the host kernel provides these two symbols (reading
//! the `tp` register and the `sstatus` CSR, as the teacher's `riscv.rs`
//! does). Under test, there is no hart to read from, so each simulated CPU
//! is a host OS thread and "current hart id" / "interrupts enabled" are
//! thread-local, set by whichever scenario test spins the thread up.

#[cfg(not(test))]
unsafe extern "Rust" {
    /// Returns the id of the hart executing this code. Must be callable
    /// with interrupts enabled or disabled.
    fn corvid_hal_hart_id() -> usize;
    /// Returns whether interrupts are currently enabled on this hart.
    fn corvid_hal_intr_get() -> bool;
    /// Enables interrupts on this hart.
    fn corvid_hal_intr_on();
    /// Disables interrupts on this hart.
    fn corvid_hal_intr_off();
}

#[cfg(not(test))]
pub fn hart_id() -> usize {
    unsafe { corvid_hal_hart_id() }
}

#[cfg(not(test))]
pub fn get() -> bool {
    unsafe { corvid_hal_intr_get() }
}

#[cfg(not(test))]
pub fn enable() {
    unsafe { corvid_hal_intr_on() }
}

#[cfg(not(test))]
pub fn disable() {
    unsafe { corvid_hal_intr_off() }
}

#[cfg(test)]
mod test_hal {
    use std::cell::Cell;

    std::thread_local! {
        static HART_ID: Cell<usize> = const { Cell::new(usize::MAX) };
        static INTR_ENABLED: Cell<bool> = const { Cell::new(true) };
    }

    /// Scenario tests call this once per simulated CPU thread before doing
    /// anything else, standing in for the boot-time `mhartid`/`tp` setup
    /// the real entry assembly would perform.
    pub fn bind_this_thread_to_cpu(id: usize) {
        HART_ID.with(|c| c.set(id));
    }

    pub fn hart_id() -> usize {
        let id = HART_ID.with(|c| c.get());
        assert_ne!(id, usize::MAX, "current thread is not bound to a cpu");
        id
    }

    pub fn get() -> bool {
        INTR_ENABLED.with(|c| c.get())
    }

    pub fn enable() {
        INTR_ENABLED.with(|c| c.set(true));
    }

    pub fn disable() {
        INTR_ENABLED.with(|c| c.set(false));
    }
}

#[cfg(test)]
pub use test_hal::{bind_this_thread_to_cpu, enable, get, hart_id, disable};
