//! Copying, stop-the-world memory management for the tagged object model.
//!
//! Two collectors share one interface: the classic Baker two-space collector
//! ([`BakerHeap`]) and a generational collector layered on the same
//! semi-space machinery ([`GenerationalHeap`]). Allocation never moves
//! existing objects; only [`MemoryManager::collect`] does. Any reference held
//! across an operation that may allocate must be registered as a root slot
//! first — the collector rewrites registered slots in place.

mod baker;
mod generational;
mod system;

pub use baker::BakerHeap;
pub use generational::GenerationalHeap;
pub use system::{map_memory, unmap_memory, MappedFile, OS_PAGE_SIZE};

use std::time::Duration;

use object::Value;

/// Heap configuration shared by both collectors.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Total size of both semi-spaces together, in bytes.
    pub heap_size: usize,
    /// Fill abandoned spaces with a sentinel byte after collection.
    pub poison: bool,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            heap_size: 8 * 1024 * 1024,
            poison: true,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.heap_size == 0 {
            return Err("heap_size must be > 0");
        }
        if self.heap_size % 16 != 0 {
            return Err("heap_size must be a multiple of 16");
        }
        if self.heap_size < 4096 {
            return Err("heap_size too small to hold a useful object graph");
        }
        Ok(())
    }
}

/// Collection counters and timings reported by [`MemoryManager::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    /// Total `collect()` calls.
    pub collections: u64,
    /// Minor (left-to-right) collections. Equals `collections` for the
    /// Baker collector.
    pub minor_collections: u64,
    /// Major (right-to-left) collections. Always 0 for the Baker collector.
    pub major_collections: u64,
    /// Wall time spent in all collection phases.
    pub total_collection_time: Duration,
    /// Wall time spent in major phases only.
    pub major_collection_time: Duration,
    /// Free bytes in the space serving new allocations.
    pub free_bytes: usize,
    /// Free bytes in the old generation (generational only).
    pub old_free_bytes: usize,
    /// Total heap size in bytes.
    pub heap_size: usize,
}

/// The collector interface shared by [`BakerHeap`] and [`GenerationalHeap`].
///
/// Roots come in two flavors. *External pointers* (`register_root`) are
/// pointer-to-pointer slots that may themselves live on the host stack, e.g.
/// an interpreter local pinned in a handle scope. *Static roots*
/// (`register_static_root`) are slots in non-moving storage, e.g. the global
/// name table. Both are rewritten in place when the objects they reference
/// move.
pub trait MemoryManager {
    /// Allocate an ordinary object: `field_count` tagged values, initialized
    /// to the published nil (small integer 0 before [`set_nil`] is called).
    ///
    /// [`set_nil`]: MemoryManager::set_nil
    fn allocate_ordinary(&mut self, class: Value, field_count: usize) -> Value;

    /// Allocate a binary object: `byte_count` raw bytes, zeroed, padded to
    /// word alignment.
    fn allocate_binary(&mut self, class: Value, byte_count: usize) -> Value;

    /// Register an external pointer slot. The slot must stay valid until
    /// [`unregister_root`](MemoryManager::unregister_root).
    fn register_root(&mut self, slot: *mut Value);

    fn unregister_root(&mut self, slot: *mut Value);

    /// Register a slot in non-moving storage. The slot must stay valid until
    /// [`unregister_static_root`](MemoryManager::unregister_static_root) or
    /// the end of the program.
    fn register_static_root(&mut self, slot: *mut Value);

    fn unregister_static_root(&mut self, slot: *mut Value);

    /// Must be called before every field store into a heap-resident ordinary
    /// object, with the old value still in `slot`. The caller performs the
    /// store afterwards. Stores into freshly allocated objects that have not
    /// been published yet may skip the barrier.
    fn write_barrier(&mut self, value: Value, slot: *mut Value);

    /// Run a collection cycle. Every registered root slot is rewritten to
    /// the moved location of the object it references.
    fn collect(&mut self);

    /// Number of collection cycles so far. Callers compare this across an
    /// allocation to learn whether a collection happened inside it (and
    /// therefore whether previously fetched raw pointers are stale).
    fn collections(&self) -> u64;

    fn stats(&self) -> HeapStats;

    /// Publish the nil singleton used to initialize ordinary-object fields.
    fn set_nil(&mut self, nil: Value);
}
