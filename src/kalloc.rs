//! Global allocator backing `alloc`, ported from the teacher's
//! `src/kalloc.rs`. The teacher carves its heap out of real physical
//! memory between `end` (the kernel image's end, from the linker script)
//! and `PHYSTOP`; the physical page allocator itself is out of scope per
//! spec.md §1, so this port narrows the backing store to a fixed static
//! byte array instead of a linker-provided physical range. `buddy-alloc`
//! on top is unchanged.
//!
//! Only compiled for a real `no_std` build — under `cfg(test)` the host's
//! allocator is used instead, same as every other module that reaches for
//! `alloc`.

#![cfg(not(test))]

use core::alloc::{GlobalAlloc, Layout};

use buddy_alloc::{BuddyAllocParam, buddy_alloc::BuddyAlloc};

use crate::spinlock::SpinLock;

const HEAP_BYTES: usize = 4 * 1024 * 1024;

static mut HEAP: [u8; HEAP_BYTES] = [0; HEAP_BYTES];

#[global_allocator]
static KMEM: Kmem = Kmem(SpinLock::new(None, "kmem"));

struct Kmem(SpinLock<Option<BuddyAlloc>>);
unsafe impl Sync for Kmem {}

unsafe impl GlobalAlloc for Kmem {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0
            .lock()
            .as_mut()
            .expect("kmem not initialized")
            .malloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.0
            .lock()
            .as_mut()
            .expect("kmem not initialized")
            .free(ptr)
    }
}

#[alloc_error_handler]
fn handle_alloc_error(layout: Layout) -> ! {
    panic!("alloc error: {:?}", layout)
}

/// Carves the static heap into the buddy allocator. Must run once, before
/// any code that touches `Box`/`String`/`Vec` (`proc::init`, `kalloc::init`
/// itself uses none).
pub fn init() {
    let mut guard = KMEM.0.lock();
    let base = core::ptr::addr_of_mut!(HEAP) as *const u8;
    let param = BuddyAllocParam::new(base, HEAP_BYTES, 0x1000);
    *guard = Some(unsafe { BuddyAlloc::new(param) });
}
