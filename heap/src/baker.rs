use std::ptr::{self, NonNull};
use std::time::Instant;

use object::{Header, Value, HEADER_BYTES};

use crate::{system, HeapSettings, HeapStats, MemoryManager};

/// Sentinel written over space one when it is abandoned.
pub(crate) const POISON_ONE: u8 = 0xAA;
/// Sentinel written over space two when it is abandoned.
pub(crate) const POISON_TWO: u8 = 0xBB;

/// One of the two halves of the heap region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Space {
    One,
    Two,
}

impl Space {
    pub(crate) fn other(self) -> Space {
        match self {
            Space::One => Space::Two,
            Space::Two => Space::One,
        }
    }

    fn poison_byte(self) -> u8 {
        match self {
            Space::One => POISON_ONE,
            Space::Two => POISON_TWO,
        }
    }
}

/// The semi-space machinery shared by both collectors: one mmap'd region
/// split into two halves, downward bump allocation, registered root slots,
/// and the copying step with forwarding marks.
pub(crate) struct SemiSpaces {
    region: NonNull<u8>,
    pub(crate) heap_size: usize,
    half: usize,
    one_ptr: *mut u8,
    two_ptr: *mut u8,
    roots: Vec<*mut Value>,
    static_roots: Vec<*mut Value>,
    nil_fill: Value,
    next_hash: u64,
    poison: bool,
}

impl SemiSpaces {
    pub(crate) fn new(settings: &HeapSettings) -> Self {
        settings.validate().expect("invalid heap settings");
        let region = system::map_memory(settings.heap_size)
            .expect("failed to map heap region");
        let half = settings.heap_size / 2;
        let base = region.as_ptr();
        Self {
            region,
            heap_size: settings.heap_size,
            half,
            // Bump pointers start at each half's top; allocation moves down.
            one_ptr: unsafe { base.add(half) },
            two_ptr: unsafe { base.add(settings.heap_size) },
            roots: Vec::new(),
            static_roots: Vec::new(),
            // Fields are filled with small integer 0 until nil is published.
            nil_fill: Value::from_i32(0),
            next_hash: 1,
            poison: settings.poison,
        }
    }

    pub(crate) fn base(&self, space: Space) -> *mut u8 {
        match space {
            Space::One => self.region.as_ptr(),
            Space::Two => unsafe { self.region.as_ptr().add(self.half) },
        }
    }

    pub(crate) fn top(&self, space: Space) -> *mut u8 {
        unsafe { self.base(space).add(self.half) }
    }

    pub(crate) fn bump_ptr(&self, space: Space) -> *mut u8 {
        match space {
            Space::One => self.one_ptr,
            Space::Two => self.two_ptr,
        }
    }

    pub(crate) fn set_bump_ptr(&mut self, space: Space, ptr: *mut u8) {
        match space {
            Space::One => self.one_ptr = ptr,
            Space::Two => self.two_ptr = ptr,
        }
    }

    pub(crate) fn free_bytes(&self, space: Space) -> usize {
        self.bump_ptr(space) as usize - self.base(space) as usize
    }

    pub(crate) fn in_space(&self, space: Space, ptr: *const u8) -> bool {
        ptr >= self.base(space) as *const u8
            && ptr < self.top(space) as *const u8
    }

    pub(crate) fn in_region(&self, ptr: *const u8) -> bool {
        ptr >= self.region.as_ptr() as *const u8
            && (ptr as usize)
                < self.region.as_ptr() as usize + self.heap_size
    }

    /// Reserve `total` bytes in `space`, bumping its pointer downward.
    /// Fails when the pointer would cross the space's base.
    pub(crate) fn bump(&mut self, space: Space, total: usize) -> Option<*mut u8> {
        let ptr = self.bump_ptr(space) as usize;
        let new = ptr.checked_sub(total)?;
        if new < self.base(space) as usize {
            return None;
        }
        self.set_bump_ptr(space, new as *mut u8);
        Some(new as *mut u8)
    }

    /// Initialize a freshly reserved object: header, nil-filled fields or
    /// zeroed (padded) bytes.
    pub(crate) unsafe fn init_object(
        &mut self,
        ptr: *mut u8,
        class: Value,
        count: usize,
        binary: bool,
    ) -> Value {
        let hash = self.next_hash;
        self.next_hash += 1;
        ptr::write(ptr as *mut Header, Header::new(class, count, binary, hash));
        if binary {
            ptr.add(HEADER_BYTES)
                .write_bytes(0, object::pad_to_word(count));
        } else {
            let fields = ptr.add(HEADER_BYTES) as *mut Value;
            for i in 0..count {
                ptr::write(fields.add(i), self.nil_fill);
            }
        }
        Value::from_ptr(ptr)
    }

    /// Copy one object into `dest` unless it is a small integer, already in
    /// `dest`, or already forwarded. Returns the (possibly moved) value.
    pub(crate) unsafe fn move_object(&mut self, v: Value, dest: Space) -> Value {
        if !v.is_ref() {
            return v;
        }
        let src = v.as_ptr();
        if self.in_space(dest, src) {
            return v;
        }
        let header = &mut *(src as *mut Header);
        if header.is_forwarded() {
            return Value::from_ptr(header.forwarding());
        }
        let total = header.total_size();
        let target = self
            .bump(dest, total)
            .expect("destination space exhausted during collection");
        ptr::copy_nonoverlapping(src, target, total);
        header.forward_to(target);
        Value::from_ptr(target)
    }

    /// Rewrite every registered external and static root slot through
    /// [`move_object`](SemiSpaces::move_object).
    pub(crate) unsafe fn move_roots(&mut self, dest: Space) {
        for i in 0..self.roots.len() {
            let slot = self.roots[i];
            *slot = self.move_object(*slot, dest);
        }
        for i in 0..self.static_roots.len() {
            let slot = self.static_roots[i];
            *slot = self.move_object(*slot, dest);
        }
    }

    /// Cheney-style sweep over freshly copied objects in `dest`. `scan_top`
    /// is the destination bump pointer from before the roots were moved; the
    /// sweep pushes the forwarding front until the scan pointer meets the
    /// allocation pointer.
    pub(crate) unsafe fn scan_copied(&mut self, dest: Space, scan_top: *mut u8) {
        let mut scan_limit = scan_top as usize;
        loop {
            let batch_start = self.bump_ptr(dest) as usize;
            if batch_start == scan_limit {
                break;
            }
            let mut p = batch_start;
            while p < scan_limit {
                let header = p as *mut Header;
                let total = (*header).total_size();
                let class = (*header).class();
                let moved = self.move_object(class, dest);
                (*header).set_class(moved);
                if !(*header).is_binary() {
                    let count = (*header).count();
                    let fields = (p as *mut u8).add(HEADER_BYTES) as *mut Value;
                    for i in 0..count {
                        let slot = fields.add(i);
                        *slot = self.move_object(*slot, dest);
                    }
                }
                p += total;
            }
            scan_limit = batch_start;
        }
    }

    /// Reset `space` to empty, optionally stamping it with its sentinel.
    pub(crate) fn abandon(&mut self, space: Space) {
        if self.poison {
            unsafe {
                self.base(space).write_bytes(space.poison_byte(), self.half);
            }
        }
        let top = self.top(space);
        self.set_bump_ptr(space, top);
    }

    pub(crate) fn register_root(&mut self, slot: *mut Value) {
        self.roots.push(slot);
    }

    pub(crate) fn unregister_root(&mut self, slot: *mut Value) {
        if let Some(pos) = self.roots.iter().rposition(|&s| s == slot) {
            self.roots.swap_remove(pos);
        }
    }

    pub(crate) fn register_static_root(&mut self, slot: *mut Value) {
        self.static_roots.push(slot);
    }

    pub(crate) fn unregister_static_root(&mut self, slot: *mut Value) {
        if let Some(pos) = self.static_roots.iter().rposition(|&s| s == slot) {
            self.static_roots.swap_remove(pos);
        }
    }

    pub(crate) fn set_nil(&mut self, nil: Value) {
        self.nil_fill = nil;
    }
}

impl Drop for SemiSpaces {
    fn drop(&mut self) {
        system::unmap_memory(self.region, self.heap_size);
    }
}

/// The classic Baker two-space collector: one space serves
/// allocations, the other is empty; on exhaustion all reachable objects are
/// copied into the empty space and the roles swap.
pub struct BakerHeap {
    spaces: SemiSpaces,
    active: Space,
    collections: u64,
    total_time: std::time::Duration,
}

impl BakerHeap {
    pub fn new(settings: HeapSettings) -> Self {
        Self {
            spaces: SemiSpaces::new(&settings),
            active: Space::One,
            collections: 0,
            total_time: std::time::Duration::ZERO,
        }
    }

    fn allocate(&mut self, mut class: Value, count: usize, binary: bool) -> Value {
        let total = HEADER_BYTES
            + if binary {
                object::pad_to_word(count)
            } else {
                count * std::mem::size_of::<Value>()
            };
        let ptr = match self.spaces.bump(self.active, total) {
            Some(ptr) => ptr,
            None => {
                // The caller's class reference would go stale across the
                // collection; pin it for the duration.
                self.spaces.register_root(&mut class);
                self.collect();
                self.spaces.unregister_root(&mut class);
                self.spaces
                    .bump(self.active, total)
                    .unwrap_or_else(|| panic!("out of memory: {total} bytes"))
            }
        };
        unsafe { self.spaces.init_object(ptr, class, count, binary) }
    }
}

impl MemoryManager for BakerHeap {
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

    fn write_barrier(&mut self, _value: Value, _slot: *mut Value) {
        // Single-space collection scans every live object; no log to keep.
    }

    fn collect(&mut self) {
        let start = Instant::now();

        let dest = self.active.other();
        let scan_top = self.spaces.top(dest);
        self.spaces.set_bump_ptr(dest, scan_top);
        unsafe {
            self.spaces.move_roots(dest);
            self.spaces.scan_copied(dest, scan_top);
        }
        self.spaces.abandon(self.active);
        self.active = dest;

        self.collections += 1;
        self.total_time += start.elapsed();
    }

    fn collections(&self) -> u64 {
        self.collections
    }

    fn stats(&self) -> HeapStats {
        HeapStats {
            collections: self.collections,
            minor_collections: self.collections,
            major_collections: 0,
            total_collection_time: self.total_time,
            major_collection_time: std::time::Duration::ZERO,
            free_bytes: self.spaces.free_bytes(self.active),
            old_free_bytes: 0,
            heap_size: self.spaces.heap_size,
        }
    }

    fn set_nil(&mut self, nil: Value) {
        self.spaces.set_nil(nil);
    }
}
