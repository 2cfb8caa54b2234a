//! The VM collaborator contract (spec.md §6): page-table create/copy/free,
//! user-memory grow/shrink, and the copyin/copyout seam the core uses to
//! move bytes across the kernel/user boundary. Real Sv39 walking is
//! explicitly out of scope per §1 — this narrows the teacher's `Uvm`
//! (`src/vm.rs`) down to a byte buffer standing in for a page table, which
//! is all the core's own state machine and property tests need (notably
//! P7's "parent and child user memories are byte-identical").

use alloc::vec;
use alloc::vec::Vec;

use crate::error::KernelError;
use crate::param::PGSIZE;

/// A user address space. Backed by a plain byte buffer rather than a real
/// page table; `len()` plays the role of `p.sz`.
#[derive(Debug, Default)]
pub struct UserMemory {
    bytes: Vec<u8>,
}

impl UserMemory {
    /// `uvmcreate`: an empty address space with only the fixed trampoline
    /// and trapframe mappings (both no-ops here, since there is no real
    /// page table to map them into).
    pub fn uvmcreate() -> Result<Self, KernelError> {
        Ok(Self { bytes: Vec::new() })
    }

    /// `mappages`: narrowed to a no-op — there is no real page table to
    /// install a PTE into, and nothing in this core inspects the mapping
    /// afterwards.
    pub fn mappages(&mut self, _va: usize, _len: usize, _pa: usize, _flags: u32) -> Result<(), KernelError> {
        Ok(())
    }

    pub fn uvmunmap(&mut self, _va: usize, _npages: usize) {}

    /// `uvmfree`: releases the backing memory.
    pub fn uvmfree(&mut self, _sz: usize) {
        self.bytes.clear();
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `uvminit`: loads the first user image (e.g. `init`'s code) into a
    /// single fresh page.
    pub fn uvminit(&mut self, image: &[u8]) {
        self.bytes = vec![0u8; PGSIZE];
        let n = image.len().min(PGSIZE);
        self.bytes[..n].copy_from_slice(&image[..n]);
    }

    /// `uvmalloc`: grows the address space from `old_sz` to `new_sz`.
    pub fn uvmalloc(&mut self, old_sz: usize, new_sz: usize) -> Result<usize, KernelError> {
        if new_sz < old_sz {
            return Ok(old_sz);
        }
        self.bytes.resize(new_sz, 0);
        Ok(new_sz)
    }

    /// `uvmdealloc`: shrinks the address space from `old_sz` to `new_sz`.
    pub fn uvmdealloc(&mut self, old_sz: usize, new_sz: usize) -> usize {
        if new_sz >= old_sz {
            return old_sz;
        }
        self.bytes.truncate(new_sz);
        new_sz
    }

    /// `uvmcopy`: duplicates `sz` bytes of this address space into `dst`,
    /// as `fork` uses to give the child its own copy of the parent's
    /// memory (P7: byte-identical up to `sz`).
    pub fn uvmcopy(&self, dst: &mut Self, sz: usize) -> Result<(), KernelError> {
        if self.bytes.len() < sz {
            return Err(KernelError::InvalidPageError);
        }
        dst.bytes = self.bytes[..sz].to_vec();
        Ok(())
    }

    /// `copyout`: kernel → user.
    pub fn copyout(&mut self, dst_va: usize, src: &[u8]) -> Result<(), KernelError> {
        let end = dst_va.checked_add(src.len()).ok_or(KernelError::CopyFault)?;
        if end > self.bytes.len() {
            return Err(KernelError::CopyFault);
        }
        self.bytes[dst_va..end].copy_from_slice(src);
        Ok(())
    }

    /// `copyin`: user → kernel.
    pub fn copyin(&self, src_va: usize, dst: &mut [u8]) -> Result<(), KernelError> {
        let end = src_va.checked_add(dst.len()).ok_or(KernelError::CopyFault)?;
        if end > self.bytes.len() {
            return Err(KernelError::CopyFault);
        }
        dst.copy_from_slice(&self.bytes[src_va..end]);
        Ok(())
    }
}
