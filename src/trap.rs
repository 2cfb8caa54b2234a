//! The trap/trampoline collaborator contract (spec.md §6): `usertrapret`.
//! Real trap handling, the trampoline page, and user-mode entry are
//! explicitly out of scope per §1 — the one piece of behavior this core
//! actually depends on is the cancellation check from §5: `killed` is
//! "observed at the next trap-to-user transition," which is exactly the
//! moment `usertrapret` represents.

use crate::proc;

/// The return path from kernel to user mode. A real implementation
/// restores user registers from the trapframe and switches page tables; the
/// one behavior this core relies on — checking `killed` one last time before
/// actually returning to user code — is implemented here so the
/// kill-sleeper scenario (spec.md §8.4) is testable without a real trap
/// handler.
pub fn usertrapret() {
    if let Some(p) = proc::myproc() {
        if p.is_killed() {
            proc::exit(-1);
        }
    }
}
