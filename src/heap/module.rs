// =============================================================================
// modheap — Module Registry
// =============================================================================
//
// A module is a named subsystem that allocations can be charged to. Its
// record lives inside the managed region, carved out with the same block
// machinery as any other allocation, so the registry costs nothing beyond
// heap bytes. Unregistering a module reclaims every block it owns in one
// pass; that is the whole point of the tag.
// =============================================================================

use core::fmt;
use core::ptr;

use crate::heap::block::{
    BlockHeader, HEADER_SIZE, find_block_by_payload, find_suitable_block, push_block,
    remove_block, set_next, split_block,
};
use crate::heap::raw::RawHeap;

/// Capacity of a module name buffer, terminator included. Longer names are
/// silently truncated.
pub const MAX_MODULE_NAME: usize = 64;

/// A fixed-capacity, NUL-terminated module name.
///
/// Names are stored and compared as raw bytes with a hard cap, never as
/// growable strings: the registry must not allocate while it manipulates
/// the very heap those strings would come from.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub(crate) struct ModuleName {
    bytes: [u8; MAX_MODULE_NAME],
}

impl ModuleName {
    /// Copies `name` into an owned buffer, truncating to the cap and
    /// keeping the final byte as terminator.
    pub(crate) fn copy_of(name: &str) -> Self {
        let mut bytes = [0u8; MAX_MODULE_NAME];
        let raw = name.as_bytes();
        let len = raw.len().min(MAX_MODULE_NAME - 1);
        bytes[..len].copy_from_slice(&raw[..len]);
        Self { bytes }
    }

    /// The stored bytes up to (not including) the terminator.
    fn as_bytes(&self) -> &[u8] {
        let end = self
            .bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_MODULE_NAME);
        &self.bytes[..end]
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Truncation can cut a multi-byte character; don't let that turn a
        // log line into a panic.
        f.write_str(core::str::from_utf8(self.as_bytes()).unwrap_or("<non-utf8>"))
    }
}

/// A registered subsystem's bookkeeping record, stored in-heap.
///
/// The record's address is always the payload base of some used block, so
/// the block housing it can be found by the same lookup `free` uses.
#[repr(C)]
pub(crate) struct ModuleRecord {
    pub(crate) name: ModuleName,
    pub(crate) next: *mut ModuleRecord,
}

/// Unlinks `module` from the registry list rooted at `head`, if present.
unsafe fn remove_module(head: &mut *mut ModuleRecord, module: *mut ModuleRecord) {
    if module.is_null() || (*head).is_null() {
        return;
    }
    unsafe {
        if *head == module {
            *head = (*module).next;
            return;
        }
        let mut current = *head;
        while !(*current).next.is_null() {
            if (*current).next == module {
                (*current).next = (*module).next;
                return;
            }
            current = (*current).next;
        }
    }
}

impl RawHeap {
    /// Finds a registered module by bounded name comparison.
    pub(crate) fn find_module(&self, name: &ModuleName) -> *mut ModuleRecord {
        let mut current = self.module_list;
        unsafe {
            while !current.is_null() {
                if (*current).name.as_bytes() == name.as_bytes() {
                    return current;
                }
                current = (*current).next;
            }
        }
        ptr::null_mut()
    }

    /// Carves a record for `name` out of the heap and prepends it to the
    /// registry. Returns null when the heap cannot host the record.
    unsafe fn create_module(&mut self, name: &ModuleName) -> *mut ModuleRecord {
        let record_size = core::mem::size_of::<ModuleRecord>();
        unsafe {
            let block = find_suitable_block(self.free_list, record_size, self.alignment);
            if block.is_null() {
                log::error!("heap: unable to allocate a record for module {}", name);
                return ptr::null_mut();
            }
            remove_block(&mut self.free_list, block);
            if (*block).size > record_size + HEADER_SIZE + self.alignment {
                let tail = split_block(block, record_size, self.alignment);
                if !tail.is_null() {
                    push_block(&mut self.free_list, tail);
                }
            }
            // Records are uncharged: they must outlive every bulk release
            // and are only reclaimed by explicit unregistration.
            (*block).owner = ptr::null_mut();
            push_block(&mut self.used_list, block);

            let record = (*block).payload.cast::<ModuleRecord>();
            record.write(ModuleRecord {
                name: *name,
                next: self.module_list,
            });
            self.module_list = record;
            record
        }
    }

    /// Looks `name` up in the registry, creating the record on first use.
    pub(crate) unsafe fn get_or_create_module(&mut self, name: &str) -> *mut ModuleRecord {
        let probe = ModuleName::copy_of(name);
        let module = self.find_module(&probe);
        if module.is_null() {
            unsafe { self.create_module(&probe) }
        } else {
            module
        }
    }

    /// Registers `name` explicitly. Registering a module twice is reported
    /// at warning severity and still counts as success.
    pub(crate) unsafe fn register_module(&mut self, name: &str) -> bool {
        let probe = ModuleName::copy_of(name);
        if !self.find_module(&probe).is_null() {
            log::warn!("heap: module {} is already registered", probe);
            return true;
        }
        if unsafe { self.create_module(&probe) }.is_null() {
            log::error!("heap: failed to register module {}", probe);
            return false;
        }
        log::info!("heap: module {} registered", probe);
        true
    }

    /// Tears a module down: every block it owns goes back to the free list,
    /// then the record itself is unlinked and its block reclaimed.
    ///
    /// Unregistering an unknown name is reported at warning severity and
    /// changes nothing.
    pub(crate) unsafe fn unregister_module(&mut self, name: &str) {
        // The caller's name very often lives inside a buffer this call is
        // about to reclaim; copy it out before touching any block.
        let copy = ModuleName::copy_of(name);
        let module = self.find_module(&copy);
        if module.is_null() {
            log::warn!("heap: module {} is not registered", copy);
            return;
        }
        unsafe {
            self.release_memory_of(module);
            remove_module(&mut self.module_list, module);
            let block = find_block_by_payload(self.used_list, module.cast::<u8>());
            if !block.is_null() {
                remove_block(&mut self.used_list, block);
                push_block(&mut self.free_list, block);
            }
        }
        log::info!("heap: module {} unregistered", copy);
    }

    /// Moves every used block owned by `module` to the free list. No
    /// coalescing happens here; callers run a concatenation pass when they
    /// care about fragmentation.
    unsafe fn release_memory_of(&mut self, module: *mut ModuleRecord) {
        unsafe {
            let mut current = self.used_list;
            let mut prev: *mut BlockHeader = ptr::null_mut();
            while !current.is_null() {
                if (*current).owner == module {
                    let to_free = current;
                    if prev.is_null() {
                        self.used_list = (*current).next;
                        current = self.used_list;
                    } else {
                        set_next(prev, (*current).next);
                        current = (*prev).next;
                    }
                    push_block(&mut self.free_list, to_free);
                } else {
                    prev = current;
                    current = (*current).next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(64))]
    struct Region([u8; 64 * 1024]);

    fn region() -> Box<Region> {
        Box::new(Region([0; 64 * 1024]))
    }

    fn heap(region: &mut Region) -> RawHeap {
        let mut heap = RawHeap::new();
        assert!(unsafe { heap.init(region.0.as_mut_ptr(), region.0.len(), 8) });
        heap
    }

    fn module_count(heap: &RawHeap) -> usize {
        let mut count = 0;
        let mut current = heap.module_list;
        unsafe {
            while !current.is_null() {
                count += 1;
                current = (*current).next;
            }
        }
        count
    }

    #[test]
    fn names_truncate_at_the_cap() {
        let long = "m".repeat(MAX_MODULE_NAME + 17);
        let name = ModuleName::copy_of(&long);
        assert_eq!(name.as_bytes().len(), MAX_MODULE_NAME - 1);
        // Two names that only differ beyond the cap are the same module.
        let other = ModuleName::copy_of(&"m".repeat(MAX_MODULE_NAME));
        assert_eq!(name.as_bytes(), other.as_bytes());
    }

    #[test]
    fn first_allocation_creates_the_module() {
        let mut region = region();
        let mut heap = heap(&mut region);
        unsafe {
            assert_eq!(module_count(&heap), 0);
            let a = heap.aligned_alloc(8, 64, Some("net"));
            assert!(!a.is_null());
            assert_eq!(module_count(&heap), 1);
            // A second allocation reuses the record.
            let b = heap.aligned_alloc(8, 64, Some("net"));
            assert!(!b.is_null());
            assert_eq!(module_count(&heap), 1);
            // Uncharged allocations never touch the registry.
            let c = heap.aligned_alloc(8, 64, None);
            assert!(!c.is_null());
            assert_eq!(module_count(&heap), 1);
        }
        heap.assert_invariants();
    }

    #[test]
    fn register_twice_warns_but_succeeds() {
        let mut region = region();
        let mut heap = heap(&mut region);
        unsafe {
            assert!(heap.register_module("storage"));
            assert!(heap.register_module("storage"));
            assert_eq!(module_count(&heap), 1);
            assert!(heap.register_module("input"));
            assert_eq!(module_count(&heap), 2);
        }
        heap.assert_invariants();
    }

    #[test]
    fn unregister_reclaims_every_owned_block() {
        let mut region = region();
        let mut heap = heap(&mut region);
        unsafe {
            let kept = heap.aligned_alloc(8, 64, Some("keep"));
            kept.write_bytes(0x77, 64);

            let free_before = heap.free_bytes();
            let a = heap.aligned_alloc(8, 100, Some("gone"));
            let b = heap.aligned_alloc(8, 200, Some("gone"));
            let c = heap.aligned_alloc(8, 300, Some("gone"));
            assert!(!a.is_null() && !b.is_null() && !c.is_null());

            heap.unregister_module("gone");
            heap.assert_invariants();

            // Everything the module cost, record included, is free again;
            // only the four headers fabricated by the splits still stand,
            // and a concatenation pass absorbs those too.
            assert_eq!(heap.free_bytes(), free_before - 4 * HEADER_SIZE);
            heap.concatenate_free_blocks();
            assert_eq!(heap.free_bytes(), free_before);
            assert_eq!(module_count(&heap), 1);
            // No used block references the dead module anymore, and the
            // survivor's bytes are intact.
            assert!(find_block_by_payload(heap.used_list, a).is_null());
            assert!(find_block_by_payload(heap.used_list, b).is_null());
            assert!(find_block_by_payload(heap.used_list, c).is_null());
            for i in 0..64 {
                assert_eq!(kept.add(i).read(), 0x77);
            }
        }
    }

    #[test]
    fn unregister_unknown_module_is_a_no_op() {
        let mut region = region();
        let mut heap = heap(&mut region);
        unsafe {
            let ptr = heap.aligned_alloc(8, 64, Some("real"));
            assert!(!ptr.is_null());
            let used_before = heap.used_bytes();
            heap.unregister_module("imaginary");
            assert_eq!(heap.used_bytes(), used_before);
            assert_eq!(module_count(&heap), 1);
        }
        heap.assert_invariants();
    }

    #[test]
    fn unregister_survives_a_name_stored_in_the_heap() {
        let mut region = region();
        let mut heap = heap(&mut region);
        unsafe {
            // The name string lives inside a block owned by the module that
            // is being torn down, like a module unloading itself.
            let storage = heap.aligned_alloc(8, 64, Some("self"));
            assert!(!storage.is_null());
            storage.copy_from_nonoverlapping(b"self".as_ptr(), 4);
            let name = core::str::from_utf8(core::slice::from_raw_parts(storage, 4)).unwrap();

            heap.unregister_module(name);
            assert_eq!(module_count(&heap), 0);
            assert!(find_block_by_payload(heap.used_list, storage).is_null());
        }
        heap.assert_invariants();
    }

    #[test]
    fn uncharged_blocks_survive_every_teardown() {
        let mut region = region();
        let mut heap = heap(&mut region);
        unsafe {
            let anon = heap.aligned_alloc(8, 64, None);
            heap.register_module("a");
            heap.register_module("b");
            heap.unregister_module("a");
            heap.unregister_module("b");
            assert!(!find_block_by_payload(heap.used_list, anon).is_null());
        }
        heap.assert_invariants();
    }
}
