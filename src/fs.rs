//! The FS collaborator contract (spec.md §6): `namei`/`idup`/`iput`,
//! `begin_op`/`end_op`, `fsinit`. Narrowed from the teacher's `fs.rs`/
//! `log.rs` (a full on-disk log-structured filesystem) down to an opaque,
//! refcounted inode handle and an RAII journal bracket — a real VFS is
//! explicitly out of scope per §1; `exit`'s `begin_op`/`end_op` bracket
//! around releasing `cwd` is the one piece of FS behavior the core actually
//! calls.

use alloc::sync::Arc;

/// A directory (or file) inode, shared by reference count.
#[derive(Debug, Clone)]
pub struct Inode {
    inner: Arc<()>,
}

impl Inode {
    pub fn new() -> Self {
        Self { inner: Arc::new(()) }
    }

    /// `idup`.
    pub fn dup(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    /// `iput`. Consumes the handle; the shared state is reclaimed once the
    /// last reference drops.
    pub fn put(self) {
        drop(self);
    }
}

impl Default for Inode {
    fn default() -> Self {
        Self::new()
    }
}

/// `namei(path)`: resolves a path to an inode. The real filesystem this
/// would walk is out of scope; this always succeeds with a fresh handle.
pub fn namei(_path: &str) -> Inode {
    Inode::new()
}

/// `fsinit(rootdev)`: mounts the root filesystem. No-op stand-in.
pub fn fsinit(_rootdev: u32) {}

/// RAII bracket for `begin_op`/`end_op`, the FS collaborator's batching of
/// writes into a single on-disk transaction. `exit` brackets the release of
/// `cwd` with one of these, matching the teacher's own `log::Operation`.
pub struct Operation;

impl Operation {
    pub fn begin() -> Self {
        Self
    }
}

impl Drop for Operation {
    fn drop(&mut self) {}
}
