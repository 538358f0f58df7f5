// =============================================================================
// modheap — Heap Subsystem
// =============================================================================
//
// The heap subsystem is organized in layers:
//
//   block.rs   — in-band block headers, split/merge, list primitives
//   raw.rs     — the unsynchronized engine (one RawHeap per managed region)
//   module.rs  — named ownership records, stored inside the region
//   mod.rs     — the public, locked surface (this file)
//
// `Heap` wraps the engine in a spin lock. Acquiring the lock is the
// critical-section entry of every public operation and releasing it is the
// exit: operations appear atomic to all other callers, no intermediate
// list state is ever observable, and nothing inside the engine suspends or
// calls back out. Hosts that need interrupt masking around the lock can
// layer it over these calls.
// =============================================================================

mod block;
mod module;
mod raw;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::heap::raw::RawHeap;

pub use crate::heap::module::MAX_MODULE_NAME;

/// A fixed-buffer heap with per-module ownership tracking.
///
/// One `Heap` manages one caller-provided byte region. Contexts are
/// independent: a process can run several side by side, and tests get a
/// fresh heap each by simply creating another instance.
///
/// # Examples
/// ```
/// static HEAP: modheap::Heap = modheap::Heap::new();
///
/// fn bring_up(region: &'static mut [u8]) {
///     // SAFETY: the region is handed over for the heap's exclusive use.
///     assert!(unsafe { HEAP.init(region.as_mut_ptr(), region.len(), 8) });
///     let scratch = HEAP.malloc(256, Some("boot"));
///     assert!(!scratch.is_null());
/// }
/// ```
pub struct Heap {
    /// The engine, protected by the lock that forms the critical section.
    inner: spin::Mutex<RawHeap>,
}

impl Heap {
    /// Creates an uninitialized heap context.
    ///
    /// This is a `const fn`, so heaps can live in statics. Every operation
    /// fails cleanly until [`Heap::init`] has succeeded.
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(RawHeap::new()),
        }
    }

    /// Hands `buffer` to the allocator and resets all bookkeeping, leaving
    /// one free block that spans the whole region.
    ///
    /// `alignment` is the default for [`Heap::malloc`] and the granularity
    /// sizes are rounded to. It must be a power of two, at least the block
    /// header's own alignment and at most the header size; `buffer` must be
    /// aligned to it. Returns false, with an error log, when any parameter
    /// is unusable. Calling `init` again re-initializes the context.
    ///
    /// # Safety
    /// `buffer` must be valid for reads and writes of `size` bytes and must
    /// not be touched by anything but this heap until the context is
    /// re-initialized or discarded. Pointers handed out by the heap borrow
    /// from that region.
    pub unsafe fn init(&self, buffer: *mut u8, size: usize, alignment: usize) -> bool {
        unsafe { self.inner.lock().init(buffer, size, alignment) }
    }

    /// True once [`Heap::init`] has succeeded on this context.
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_initialized()
    }

    /// Allocates `size` bytes at the heap's default alignment, charged to
    /// `module_name` when one is given (the module is created on first
    /// use). Returns null when the request cannot be satisfied.
    pub fn malloc(&self, size: usize, module_name: Option<&str>) -> *mut u8 {
        let mut heap = self.inner.lock();
        let alignment = heap.alignment;
        unsafe { heap.aligned_alloc(alignment, size, module_name) }
    }

    /// Allocates `size` bytes whose address is a multiple of `alignment`
    /// (any power of two), charged to `module_name` when one is given.
    /// Returns null when the request cannot be satisfied.
    pub fn aligned_alloc(
        &self,
        alignment: usize,
        size: usize,
        module_name: Option<&str>,
    ) -> *mut u8 {
        unsafe { self.inner.lock().aligned_alloc(alignment, size, module_name) }
    }

    /// Resizes the allocation at `ptr` to `size` bytes, preserving the
    /// leading `min(old, new)` payload bytes.
    ///
    /// Shrinking keeps the address; growing moves the allocation to fresh
    /// storage at the default alignment and frees the old block. A null
    /// `ptr` behaves like [`Heap::malloc`]; an unknown one is reported and
    /// yields null with the original allocation left alone.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation of this heap, and when the
    /// call returns a different address the caller must stop using `ptr`.
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize, module_name: Option<&str>) -> *mut u8 {
        unsafe { self.inner.lock().realloc(ptr, size, module_name) }
    }

    /// Frees the allocation at `ptr`. With `concatenate` set the block is
    /// merged with its byte-adjacent free neighbors immediately.
    ///
    /// Null is a no-op; a pointer this heap never handed out is reported at
    /// error severity and ignored.
    ///
    /// # Safety
    /// After the call the payload at `ptr` must no longer be accessed.
    pub unsafe fn free(&self, ptr: *mut u8, concatenate: bool) {
        unsafe { self.inner.lock().free(ptr, concatenate) }
    }

    /// Merges every run of byte-adjacent free blocks into a single block.
    /// An explicit, O(n²) defragmentation pass over the free list.
    pub fn concatenate_free_blocks(&self) {
        unsafe { self.inner.lock().concatenate_free_blocks() }
    }

    /// Registers `module_name` ahead of its first allocation. Registering
    /// the same name twice warns and still succeeds; false means the heap
    /// could not host the record.
    pub fn register_module(&self, module_name: &str) -> bool {
        unsafe { self.inner.lock().register_module(module_name) }
    }

    /// Unregisters `module_name`, returning every block it owns and the
    /// record itself to the free list in one pass. Unknown names warn and
    /// change nothing. Uncharged allocations are never affected.
    ///
    /// # Safety
    /// All pointers charged to the module become dangling; the caller must
    /// make sure nothing uses them afterwards.
    pub unsafe fn unregister_module(&self, module_name: &str) {
        unsafe { self.inner.lock().unregister_module(module_name) }
    }

    /// Total bytes of the managed region.
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes()
    }

    /// Payload bytes currently sitting on the free list.
    pub fn free_bytes(&self) -> usize {
        unsafe { self.inner.lock().free_bytes() }
    }

    /// Payload bytes currently handed out, module records included.
    pub fn used_bytes(&self) -> usize {
        unsafe { self.inner.lock().used_bytes() }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Host allocator shim
// =============================================================================

// SAFETY: the lock serializes all list manipulation, layouts are honored by
// the engine's alignment arithmetic, and failures surface as null exactly
// as GlobalAlloc requires.
unsafe impl GlobalAlloc for Heap {
    /// Uncharged allocation at the layout's alignment. Blocks allocated
    /// through the shim survive every module teardown.
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        unsafe { self.inner.lock().aligned_alloc(layout.align(), layout.size(), None) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.inner.lock().free(ptr, true) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let mut heap = self.inner.lock();
        if layout.align() <= heap.alignment {
            // The engine's own realloc keeps the default alignment, which
            // covers this layout.
            unsafe { heap.realloc(ptr, new_size, None) }
        } else {
            // Oversized alignments must be re-placed by hand.
            unsafe {
                let new_ptr = heap.aligned_alloc(layout.align(), new_size, None);
                if !new_ptr.is_null() {
                    ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                    heap.free(ptr, true);
                }
                new_ptr
            }
        }
    }
}
