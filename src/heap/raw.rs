// =============================================================================
// modheap — Raw Heap Engine
// =============================================================================
//
// The unsynchronized core of the allocator. One `RawHeap` manages one
// caller-provided byte region:
//
//   ┌────────┬─────────┬────────┬──────────┬────────┬───────────────┐
//   │ header │ payload │ header │ payload  │ header │ payload       │
//   └────────┴─────────┴────────┴──────────┴────────┴───────────────┘
//
// Every byte of the region belongs to exactly one block, and every block is
// on exactly one of two lists (free or used). Module records live inside
// the region too, carved out with the same block machinery, so the
// allocator needs no memory beyond what the caller handed it.
//
// ALLOCATION (first-fit with in-front headers):
//   1. Round the size up to the requested alignment.
//   2. Walk the free list for the first block that can host the request,
//      padding cost included.
//   3. If the payload base is not aligned, restructure the block so that a
//      header sits exactly one header below the aligned address. The pad in
//      front stays behind as a small free block.
//   4. Split off the unused tail, tag the owner, move the block to the used
//      list and hand out its payload base.
//
// DEALLOCATION:
//   Look the pointer up in the used list (unknown pointers are reported,
//   not chased), move the block to the free list and, on request, merge it
//   with its byte-adjacent free neighbors.
//
// The engine never suspends and touches nothing outside the region; all
// synchronization is the caller's job (see `heap::Heap`, which brackets
// every operation with its lock).
// =============================================================================

use core::ptr;

use crate::heap::block::{
    self, BlockHeader, HEADER_SIZE, align_up, blocks_adjacent, create_block,
    find_block_by_payload, find_suitable_block, merge_blocks, push_block, remove_block,
    split_block,
};
use crate::heap::module::ModuleRecord;

/// One heap context: the managed region plus the three list heads.
///
/// A process may hold several independent contexts; nothing in here is
/// global. The struct is plain data so it can live in a `static` behind a
/// lock and be re-initialized in place.
pub(crate) struct RawHeap {
    /// Base of the managed byte region. Null until `init` succeeds.
    pub(crate) region_start: *mut u8,
    /// Byte length of the managed region.
    pub(crate) region_size: usize,
    /// Alignment used whenever the caller does not ask for one. Also the
    /// granularity every payload size is rounded to.
    pub(crate) alignment: usize,
    /// Head of the list of unallocated blocks.
    pub(crate) free_list: *mut BlockHeader,
    /// Head of the list of allocated blocks.
    pub(crate) used_list: *mut BlockHeader,
    /// Head of the list of registered module records.
    pub(crate) module_list: *mut ModuleRecord,
}

// SAFETY: RawHeap owns the region exclusively (the init contract) and is
// only ever accessed under the public wrapper's lock, so sending it between
// threads is sound even though it holds raw pointers.
unsafe impl Send for RawHeap {}

impl RawHeap {
    /// Creates an uninitialized context. Every operation fails cleanly
    /// until `init` is called.
    pub(crate) const fn new() -> Self {
        Self {
            region_start: ptr::null_mut(),
            region_size: 0,
            alignment: 0,
            free_list: ptr::null_mut(),
            used_list: ptr::null_mut(),
            module_list: ptr::null_mut(),
        }
    }

    /// Takes ownership of `buffer` and turns it into a single free block
    /// spanning the whole region.
    ///
    /// Re-initializing a live context is allowed and resets all lists.
    /// Returns false (with an error log) when the parameters cannot yield a
    /// working heap: null or misaligned buffer, a region too small for one
    /// block, or an unsupported default alignment. The default alignment
    /// must be a power of two no smaller than the header's own alignment
    /// and no larger than the header size, so that every payload base stays
    /// a multiple of it; the placement arithmetic depends on that.
    pub(crate) unsafe fn init(&mut self, buffer: *mut u8, size: usize, alignment: usize) -> bool {
        if buffer.is_null() || size == 0 {
            log::error!("heap: init called with invalid parameters");
            return false;
        }
        if size <= HEADER_SIZE {
            log::error!("heap: region of {} bytes cannot hold a block", size);
            return false;
        }
        if !alignment.is_power_of_two()
            || alignment < core::mem::align_of::<BlockHeader>()
            || alignment > HEADER_SIZE
        {
            log::error!("heap: unsupported default alignment {}", alignment);
            return false;
        }
        if (buffer as usize) % alignment != 0 {
            log::error!("heap: buffer {:p} is not {}-byte aligned", buffer, alignment);
            return false;
        }

        self.region_start = buffer;
        self.region_size = size;
        self.alignment = alignment;
        self.free_list = unsafe { create_block(buffer, size) };
        self.used_list = ptr::null_mut();
        self.module_list = ptr::null_mut();

        log::info!(
            "heap: modheap {} managing {} bytes at {:p}, default alignment {}",
            env!("CARGO_PKG_VERSION"),
            size,
            buffer,
            alignment
        );
        true
    }

    pub(crate) fn is_initialized(&self) -> bool {
        !self.region_start.is_null()
    }

    /// Allocates `size` bytes whose address is a multiple of `alignment`,
    /// charged to `module_name` when one is given.
    ///
    /// Returns null on a zero size, a non-power-of-two alignment, or when no
    /// free block can host the request. All failures are recoverable.
    pub(crate) unsafe fn aligned_alloc(
        &mut self,
        alignment: usize,
        size: usize,
        module_name: Option<&str>,
    ) -> *mut u8 {
        if !self.is_initialized() {
            log::error!("heap: aligned_alloc before init");
            return ptr::null_mut();
        }
        if size == 0 {
            return ptr::null_mut();
        }
        if !alignment.is_power_of_two() {
            log::error!("heap: alignment {} is not a power of two", alignment);
            return ptr::null_mut();
        }
        // A request at least as large as the region can never fit, and
        // rejecting it here keeps the padding sums below from wrapping.
        if size >= self.region_size {
            log::error!(
                "heap: request of {} bytes exceeds the {} byte region",
                size,
                self.region_size
            );
            return ptr::null_mut();
        }

        let aligned_size = align_up(size, alignment);
        unsafe {
            let mut block = find_suitable_block(self.free_list, aligned_size, alignment);
            if block.is_null() {
                log::error!(
                    "heap: unable to allocate {} bytes with alignment {} for module {}",
                    size,
                    alignment,
                    module_name.unwrap_or("<none>")
                );
                return ptr::null_mut();
            }

            let payload_addr = (*block).payload as usize;
            let padding = align_up(payload_addr, alignment) - payload_addr;

            // The block leaves the free list before any surgery on it.
            remove_block(&mut self.free_list, block);

            if padding > 0 {
                block = self.carve_aligned(block, padding, aligned_size, alignment);
                if block.is_null() {
                    log::error!(
                        "heap: unable to place {} bytes at alignment {} for module {}",
                        size,
                        alignment,
                        module_name.unwrap_or("<none>")
                    );
                    return ptr::null_mut();
                }
            }
            debug_assert_eq!((*block).payload as usize % alignment, 0);

            // Give back whatever the request does not need.
            if (*block).size > aligned_size + HEADER_SIZE + 1 {
                let tail = split_block(block, aligned_size, self.alignment);
                if !tail.is_null() {
                    push_block(&mut self.free_list, tail);
                }
            }

            (*block).owner = match module_name {
                Some(name) => self.get_or_create_module(name),
                None => ptr::null_mut(),
            };
            push_block(&mut self.used_list, block);
            (*block).payload
        }
    }

    /// Restructures `block` (already off the free list) so that a block's
    /// payload begins exactly at the wanted aligned address, `padding` bytes
    /// above the current payload base.
    ///
    /// Returns the aligned block, or null after re-inserting `block` into
    /// the free list when the padding cannot be restructured.
    unsafe fn carve_aligned(
        &mut self,
        block: *mut BlockHeader,
        padding: usize,
        aligned_size: usize,
        alignment: usize,
    ) -> *mut BlockHeader {
        unsafe {
            if padding > HEADER_SIZE {
                // The pad can stay behind as a block of its own: split so
                // the tail header lands one header below the aligned
                // address, which puts the tail's payload right on it.
                let usable = split_block(block, padding - HEADER_SIZE, self.alignment);
                push_block(&mut self.free_list, block);
                // The fit check already priced in padding plus one header,
                // so this split cannot run out of room.
                debug_assert!(!usable.is_null());
                usable
            } else {
                // The pad cannot host a header (or would leave it a
                // zero-byte payload). Skip forward to the next aligned
                // position that leaves a real block in front.
                let payload_addr = (*block).payload as usize;
                let next_aligned = align_up(payload_addr + HEADER_SIZE + 1, alignment);
                let new_padding = next_aligned - payload_addr;
                if new_padding > HEADER_SIZE
                    && (*block).size >= new_padding - HEADER_SIZE + aligned_size
                {
                    let usable = split_block(block, new_padding - HEADER_SIZE, self.alignment);
                    push_block(&mut self.free_list, block);
                    usable
                } else {
                    // Not enough room behind the skip; put the block back
                    // and report exhaustion to the caller.
                    push_block(&mut self.free_list, block);
                    ptr::null_mut()
                }
            }
        }
    }

    /// Returns `address` to the free list.
    ///
    /// A null pointer is a no-op. A pointer that is not the payload base of
    /// a used block is reported and ignored. With `concatenate` set the
    /// freed block is merged with its byte-adjacent free neighbors right
    /// away; otherwise fragments stay separate until an explicit
    /// `concatenate_free_blocks`.
    pub(crate) unsafe fn free(&mut self, address: *mut u8, concatenate: bool) {
        if address.is_null() {
            return;
        }
        unsafe {
            let block = find_block_by_payload(self.used_list, address);
            if block.is_null() {
                log::error!("heap: free called with unknown pointer {:p}", address);
                return;
            }
            remove_block(&mut self.used_list, block);
            push_block(&mut self.free_list, block);
            if concatenate {
                self.coalesce_around(block);
            }
        }
    }

    /// Merges `block` (already on the free list) with every free block it
    /// touches, in both orderings, until the run containing it is one block.
    ///
    /// Whichever side absorbs the other, the surviving block may now touch
    /// yet another free neighbor, so the scan restarts after every merge.
    unsafe fn coalesce_around(&mut self, mut block: *mut BlockHeader) {
        unsafe {
            loop {
                let mut merged = false;
                let mut current = self.free_list;
                while !current.is_null() {
                    let next = (*current).next;
                    if current != block {
                        if blocks_adjacent(block, current) {
                            remove_block(&mut self.free_list, current);
                            merge_blocks(block, current);
                            merged = true;
                            break;
                        }
                        if blocks_adjacent(current, block) {
                            remove_block(&mut self.free_list, block);
                            merge_blocks(current, block);
                            block = current;
                            merged = true;
                            break;
                        }
                    }
                    current = next;
                }
                if !merged {
                    break;
                }
            }
        }
    }

    /// Merges every run of byte-adjacent free blocks into one block.
    ///
    /// Quadratic in the length of the free list, which is fine for the
    /// small heaps this allocator targets; the pass only runs when the
    /// caller asks for it.
    pub(crate) unsafe fn concatenate_free_blocks(&mut self) {
        unsafe {
            let mut current = self.free_list;
            while !current.is_null() {
                // Keep absorbing whatever free block starts exactly at the
                // end of `current`; every merge extends `current`, so retry
                // until no upward neighbor is left.
                loop {
                    let mut candidate = self.free_list;
                    let mut merged = false;
                    while !candidate.is_null() {
                        let next = (*candidate).next;
                        if candidate != current && blocks_adjacent(current, candidate) {
                            remove_block(&mut self.free_list, candidate);
                            merge_blocks(current, candidate);
                            merged = true;
                            break;
                        }
                        candidate = next;
                    }
                    if !merged {
                        break;
                    }
                }
                current = (*current).next;
            }
        }
    }

    /// Resizes the allocation at `address` to `size` bytes.
    ///
    /// Shrinking splits the block in place and keeps the address. Growing
    /// allocates fresh storage at the default alignment, copies the old
    /// payload and frees the old block; the allocator never tries to extend
    /// a block into a neighbor. A null `address` behaves like a fresh
    /// allocation, an unknown one is reported and yields null.
    pub(crate) unsafe fn realloc(
        &mut self,
        address: *mut u8,
        size: usize,
        module_name: Option<&str>,
    ) -> *mut u8 {
        unsafe {
            if address.is_null() {
                return self.aligned_alloc(self.alignment, size, module_name);
            }
            if size == 0 {
                return ptr::null_mut();
            }
            let block = find_block_by_payload(self.used_list, address);
            if block.is_null() {
                log::error!("heap: realloc called with unknown pointer {:p}", address);
                return ptr::null_mut();
            }

            if size < (*block).size {
                // Shrink in place; the tail becomes a free block. When the
                // tail would be too small to stand alone the block simply
                // keeps its current size.
                remove_block(&mut self.used_list, block);
                let tail = split_block(block, size, self.alignment);
                if !tail.is_null() {
                    push_block(&mut self.free_list, tail);
                }
                push_block(&mut self.used_list, block);
                address
            } else if size > (*block).size {
                let new_address = self.aligned_alloc(self.alignment, size, module_name);
                if new_address.is_null() {
                    return ptr::null_mut();
                }
                ptr::copy_nonoverlapping(address, new_address, (*block).size);
                remove_block(&mut self.used_list, block);
                push_block(&mut self.free_list, block);
                new_address
            } else {
                address
            }
        }
    }

    /// Total bytes of the managed region.
    pub(crate) fn total_bytes(&self) -> usize {
        self.region_size
    }

    /// Payload bytes sitting on the free list.
    pub(crate) unsafe fn free_bytes(&self) -> usize {
        unsafe { block::list_payload_bytes(self.free_list) }
    }

    /// Payload bytes currently handed out (module records included).
    pub(crate) unsafe fn used_bytes(&self) -> usize {
        unsafe { block::list_payload_bytes(self.used_list) }
    }
}
