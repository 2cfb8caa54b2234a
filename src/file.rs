//! The File collaborator contract (spec.md §6): `filedup`/`fileclose`.
//! Narrowed from the teacher's `file.rs` (pipes, inodes, devices) down to an
//! opaque, refcounted handle — enough for `fork` to duplicate a process's
//! open-file table and `exit` to close it, with no real VFS behind it
//! (explicitly out of scope per §1).

use alloc::sync::Arc;

/// An open file, shared by reference count the way `fork` expects
/// (`filedup` bumps it, `fileclose` drops it).
#[derive(Debug, Clone)]
pub struct File {
    inner: Arc<()>,
}

impl File {
    pub fn new() -> Self {
        Self { inner: Arc::new(()) }
    }

    /// `filedup`.
    pub fn dup(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    /// `fileclose`. Consumes the handle; the shared state is reclaimed once
    /// the last reference drops.
    pub fn close(self) {
        drop(self);
    }

    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl Default for File {
    fn default() -> Self {
        Self::new()
    }
}
