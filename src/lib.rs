//! # modheap — fixed-buffer heap allocator with module ownership
//!
//! This crate provides dynamic memory allocation for environments that have
//! no backing OS allocator: the caller hands over one contiguous byte
//! region and every allocation is carved out of it. On top of the usual
//! `malloc`/`aligned_alloc`/`realloc`/`free` surface, each allocation can
//! be charged to a named **module**, and unregistering that module reclaims
//! all of its memory in a single call. That makes teardown of a whole
//! subsystem (a driver, a protocol stack, a plugin) one operation instead
//! of a bookkeeping hunt.
//!
//! ## Design
//!
//! The region is managed as a sequence of blocks, each an in-band header
//! followed by its payload:
//!
//! ```text
//!   ┌────────┬──────────┬────────┬──────────────┬────────┬───────────┐
//!   │ header │ payload  │ header │ payload      │ header │ payload   │
//!   └────────┴──────────┴────────┴──────────────┴────────┴───────────┘
//! ```
//!
//! Two unordered singly-linked lists partition the blocks (free and used);
//! allocation is a first-fit walk, with block splitting on the way out and
//! merging of byte-adjacent neighbors on the way back in. Module records
//! live inside the region as well, so the allocator needs no memory of its
//! own. Every public operation runs under a spin lock and appears atomic
//! to other callers.
//!
//! ## Usage
//!
//! Either create explicit [`Heap`] contexts (several can coexist), or use
//! the module-level functions, which forward to a process-wide default
//! context:
//!
//! ```
//! fn bring_up(region: &'static mut [u8]) {
//!     // SAFETY: the region is reserved for the allocator's exclusive use.
//!     unsafe {
//!         assert!(modheap::init(region.as_mut_ptr(), region.len(), 8));
//!     }
//!
//!     let rx = modheap::malloc(1024, Some("uart"));
//!     let tx = modheap::aligned_alloc(64, 512, Some("uart"));
//!     assert!(!rx.is_null() && !tx.is_null());
//!
//!     // Tear the whole subsystem down in one call.
//!     // SAFETY: nothing uses the uart buffers anymore.
//!     unsafe { modheap::unregister_module("uart") };
//! }
//! ```
//!
//! The crate is `no_std`; logging goes through the `log` facade and is
//! silent until the host installs a sink.

#![cfg_attr(not(test), no_std)]

mod heap;

pub use heap::{Heap, MAX_MODULE_NAME};

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

// =============================================================================
// Process-default context
// =============================================================================

/// The built-in context the module-level functions fall back to.
static BUILTIN: Heap = Heap::new();

/// Override installed by [`set_default_heap`]; null means "use BUILTIN".
static DEFAULT: AtomicPtr<Heap> = AtomicPtr::new(ptr::null_mut());

/// Returns the process-default heap context.
///
/// Unless [`set_default_heap`] has installed another one, this is a
/// built-in context that still needs [`init`] before first use.
pub fn default_heap() -> &'static Heap {
    let installed = DEFAULT.load(Ordering::Acquire);
    if installed.is_null() {
        &BUILTIN
    } else {
        // SAFETY: only set_default_heap stores here, always from a
        // &'static Heap, so the pointer is valid for the program's life.
        unsafe { &*installed }
    }
}

/// Makes `heap` the process-default context used by the module-level
/// functions. Handy for tests and for hosts that assemble their contexts
/// elsewhere.
pub fn set_default_heap(heap: &'static Heap) {
    DEFAULT.store(heap as *const Heap as *mut Heap, Ordering::Release);
}

// =============================================================================
// Module-level convenience surface
// =============================================================================
//
// Thin forwarders to the default context, for hosts that want the plain
// malloc-style call set without carrying a handle around.
// =============================================================================

/// Initializes the default context over `buffer`. See [`Heap::init`].
///
/// # Safety
/// Same contract as [`Heap::init`].
pub unsafe fn init(buffer: *mut u8, size: usize, alignment: usize) -> bool {
    unsafe { default_heap().init(buffer, size, alignment) }
}

/// True once the default context has been initialized.
pub fn is_initialized() -> bool {
    default_heap().is_initialized()
}

/// Allocates from the default context. See [`Heap::malloc`].
pub fn malloc(size: usize, module_name: Option<&str>) -> *mut u8 {
    default_heap().malloc(size, module_name)
}

/// Aligned allocation from the default context. See [`Heap::aligned_alloc`].
pub fn aligned_alloc(alignment: usize, size: usize, module_name: Option<&str>) -> *mut u8 {
    default_heap().aligned_alloc(alignment, size, module_name)
}

/// Resizes an allocation of the default context. See [`Heap::realloc`].
///
/// # Safety
/// Same contract as [`Heap::realloc`].
pub unsafe fn realloc(ptr: *mut u8, size: usize, module_name: Option<&str>) -> *mut u8 {
    unsafe { default_heap().realloc(ptr, size, module_name) }
}

/// Frees an allocation of the default context. See [`Heap::free`].
///
/// # Safety
/// Same contract as [`Heap::free`].
pub unsafe fn free(ptr: *mut u8, concatenate: bool) {
    unsafe { default_heap().free(ptr, concatenate) }
}

/// Defragmentation pass over the default context's free list.
pub fn concatenate_free_blocks() {
    default_heap().concatenate_free_blocks()
}

/// Registers a module on the default context. See [`Heap::register_module`].
pub fn register_module(module_name: &str) -> bool {
    default_heap().register_module(module_name)
}

/// Tears down a module on the default context and reclaims its memory.
///
/// # Safety
/// Same contract as [`Heap::unregister_module`].
pub unsafe fn unregister_module(module_name: &str) {
    unsafe { default_heap().unregister_module(module_name) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(64))]
    struct Region([u8; 32 * 1024]);

    /// The default-context surface shares one process-wide static, so
    /// everything that touches it lives in this single test.
    #[test]
    fn default_context_round_trip() {
        assert!(!is_initialized());

        let private: &'static Heap = Box::leak(Box::new(Heap::new()));
        let region: &'static mut Region = Box::leak(Box::new(Region([0; 32 * 1024])));
        set_default_heap(private);
        assert!(core::ptr::eq(default_heap(), private));

        unsafe {
            assert!(init(region.0.as_mut_ptr(), region.0.len(), 8));
        }
        assert!(is_initialized());

        assert!(register_module("svc"));
        let a = malloc(128, Some("svc"));
        let b = aligned_alloc(64, 256, Some("svc"));
        assert!(!a.is_null() && !b.is_null());
        assert_eq!(b as usize % 64, 0);

        let c = unsafe { realloc(a, 512, Some("svc")) };
        assert!(!c.is_null());

        unsafe {
            free(b, false);
            unregister_module("svc");
        }
        concatenate_free_blocks();

        // Everything went back; only bookkeeping of the region remains.
        assert_eq!(private.used_bytes(), 0);
        assert!(private.free_bytes() > 0);
    }
}
