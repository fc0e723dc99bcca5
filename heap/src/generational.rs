use std::time::{Duration, Instant};

use object::{Value, HEADER_BYTES};

use crate::baker::{SemiSpaces, Space};
use crate::{HeapSettings, HeapStats, MemoryManager};

/// Generational collector layered on the semi-space machinery.
///
/// Space one is the young generation and serves all allocations; space two
/// holds the old generation. Most objects die young, so the frequent
/// *left-to-right* (minor) collection only evacuates young survivors into
/// the old space, using the cross-generation log plus the registered roots
/// as its root set. When the old space's free region drops below one eighth
/// of the total heap, a *right-to-left* (major) collection copies everything
/// live to space one and immediately back, compacting the old generation and
/// leaving space one empty for young allocation again.
pub struct GenerationalHeap {
    spaces: SemiSpaces,
    /// Slots inside old objects currently referring to young objects,
    /// maintained by [`write_barrier`](MemoryManager::write_barrier).
    crossgen: Vec<*mut Value>,
    collections: u64,
    minor_collections: u64,
    major_collections: u64,
    total_time: Duration,
    major_time: Duration,
}

const YOUNG: Space = Space::One;
const OLD: Space = Space::Two;

impl GenerationalHeap {
    pub fn new(settings: HeapSettings) -> Self {
        Self {
            spaces: SemiSpaces::new(&settings),
            crossgen: Vec::new(),
            collections: 0,
            minor_collections: 0,
            major_collections: 0,
            total_time: Duration::ZERO,
            major_time: Duration::ZERO,
        }
    }

    fn in_young(&self, ptr: *const u8) -> bool {
        self.spaces.in_space(YOUNG, ptr)
    }

    fn allocate(&mut self, mut class: Value, count: usize, binary: bool) -> Value {
        let total = HEADER_BYTES
            + if binary {
                object::pad_to_word(count)
            } else {
                count * std::mem::size_of::<Value>()
            };
        let ptr = match self.spaces.bump(YOUNG, total) {
            Some(ptr) => ptr,
            None => {
                self.spaces.register_root(&mut class);
                self.collect();
                self.spaces.unregister_root(&mut class);
                self.spaces
                    .bump(YOUNG, total)
                    .unwrap_or_else(|| panic!("out of memory: {total} bytes"))
            }
        };
        unsafe { self.spaces.init_object(ptr, class, count, binary) }
    }

    /// Minor collection: move young survivors into the old space. Roots are
    /// the cross-generation log, the external pointers, and the static roots
    /// ([`SemiSpaces::move_object`] leaves old-space references untouched).
    fn collect_left_to_right(&mut self) {
        let scan_top = self.spaces.bump_ptr(OLD);
        unsafe {
            for i in 0..self.crossgen.len() {
                let slot = self.crossgen[i];
                *slot = self.spaces.move_object(*slot, OLD);
            }
            self.spaces.move_roots(OLD);
            self.spaces.scan_copied(OLD, scan_top);
        }
        // No young objects remain, so no old→young edges can exist.
        self.crossgen.clear();
        self.spaces.abandon(YOUNG);
        self.minor_collections += 1;
    }

    /// Major collection: evacuate the whole old generation into space one,
    /// then immediately back, so the old space ends up compacted and space
    /// one is free for young allocation again.
    fn collect_right_to_left(&mut self) {
        let start = Instant::now();

        debug_assert!(self.crossgen.is_empty(), "major requires a prior minor");

        let scan_top = self.spaces.top(YOUNG);
        self.spaces.set_bump_ptr(YOUNG, scan_top);
        unsafe {
            self.spaces.move_roots(YOUNG);
            self.spaces.scan_copied(YOUNG, scan_top);
        }
        self.spaces.abandon(OLD);

        let scan_top = self.spaces.top(OLD);
        self.spaces.set_bump_ptr(OLD, scan_top);
        unsafe {
            self.spaces.move_roots(OLD);
            self.spaces.scan_copied(OLD, scan_top);
        }
        self.spaces.abandon(YOUNG);

        self.major_collections += 1;
        self.major_time += start.elapsed();
    }

    fn below_threshold(&self) -> bool {
        self.spaces.free_bytes(OLD) < self.spaces.heap_size / 8
    }

    fn remove_crossgen(&mut self, slot: *mut Value) {
        if let Some(pos) = self.crossgen.iter().rposition(|&s| s == slot) {
            self.crossgen.swap_remove(pos);
        }
    }
}

impl MemoryManager for GenerationalHeap {
    fn allocate_ordinary(&mut self, class: Value, field_count: usize) -> Value {
        self.allocate(class, field_count, false)
    }

    fn allocate_binary(&mut self, class: Value, byte_count: usize) -> Value {
        self.allocate(class, byte_count, true)
    }

    fn register_root(&mut self, slot: *mut Value) {
        self.spaces.register_root(slot);
    }

    fn unregister_root(&mut self, slot: *mut Value) {
        self.spaces.unregister_root(slot);
    }

    fn register_static_root(&mut self, slot: *mut Value) {
        self.spaces.register_static_root(slot);
    }

    fn unregister_static_root(&mut self, slot: *mut Value) {
        self.spaces.unregister_static_root(slot);
    }

    /// Maintain the cross-generation log. Young slots need no bookkeeping;
    /// slots outside the heap are already in the static-root set; old slots
    /// are logged when the store creates an old→young edge and unlogged when
    /// it removes the last one in that slot.
    fn write_barrier(&mut self, value: Value, slot: *mut Value) {
        if self.in_young(slot as *const u8) {
            return;
        }
        if !self.spaces.in_region(slot as *const u8) {
            return;
        }
        let previous = unsafe { *slot };
        let value_young = value.is_ref() && self.in_young(value.as_ptr());
        let previous_young =
            previous.is_ref() && self.in_young(previous.as_ptr());
        if value_young {
            if !previous_young {
                self.crossgen.push(slot);
            }
        } else if previous_young {
            self.remove_crossgen(slot);
        }
    }

    fn collect(&mut self) {
        let start = Instant::now();

        self.collect_left_to_right();
        if self.below_threshold() {
            self.collect_right_to_left();
        }

        self.collections += 1;
        self.total_time += start.elapsed();
    }

    fn collections(&self) -> u64 {
        self.collections
    }

    fn stats(&self) -> HeapStats {
        HeapStats {
            collections: self.collections,
            minor_collections: self.minor_collections,
            major_collections: self.major_collections,
            total_collection_time: self.total_time,
            major_collection_time: self.major_time,
            free_bytes: self.spaces.free_bytes(YOUNG),
            old_free_bytes: self.spaces.free_bytes(OLD),
            heap_size: self.spaces.heap_size,
        }
    }

    fn set_nil(&mut self, nil: Value) {
        self.spaces.set_nil(nil);
    }
}
