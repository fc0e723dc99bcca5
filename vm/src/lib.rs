//! The Smalltalk execution core: image loading, the method cache, the
//! bytecode interpreter, primitives, and the runtime entry points native
//! code may call. The VM owns a boxed [`MemoryManager`] and the
//! [`SpecialObjects`] table; everything else reaches both through [`Vm`].

pub mod bootstrap;
pub mod cache;
pub mod handles;
pub mod image;
pub mod interpreter;
pub mod materialize;
pub mod primitives;
pub mod runtime;

use heap::MemoryManager;
use object::{SpecialObjects, Value};

use crate::cache::MethodCache;

/// The VM: one heap, one special-object table, one method cache.
///
/// The special-object table is boxed so its slots have stable addresses;
/// every slot is registered as a static GC root on construction.
pub struct Vm {
    pub memory: Box<dyn MemoryManager>,
    pub special: Box<SpecialObjects>,
    pub cache: MethodCache,
    /// Collection count last observed, for stale-pointer/cache detection.
    gc_epoch: u64,
}

impl Vm {
    pub fn new(memory: Box<dyn MemoryManager>) -> Self {
        let mut vm = Self {
            memory,
            special: Box::new(SpecialObjects::empty()),
            cache: MethodCache::new(),
            gc_epoch: 0,
        };
        for slot in vm.special.slots() {
            vm.memory.register_static_root(slot);
        }
        vm
    }

    pub fn nil(&self) -> Value {
        self.special.nil
    }

    /// Allocate an ordinary object, flushing the method cache if the
    /// allocation had to collect (cached method pointers moved).
    pub fn allocate_ordinary(&mut self, class: Value, field_count: usize) -> Value {
        let v = self.memory.allocate_ordinary(class, field_count);
        self.after_possible_collection();
        v
    }

    pub fn allocate_binary(&mut self, class: Value, byte_count: usize) -> Value {
        let v = self.memory.allocate_binary(class, byte_count);
        self.after_possible_collection();
        v
    }

    pub fn collect(&mut self) {
        self.memory.collect();
        self.after_possible_collection();
    }

    /// Store into a field of a heap-resident ordinary object, running the
    /// write barrier first (the barrier reads the old value from the slot).
    pub fn store_field(&mut self, obj: Value, index: usize, value: Value) {
        unsafe {
            let slot = object::field_slot(obj, index);
            self.memory.write_barrier(value, slot);
            *slot = value;
        }
    }

    fn after_possible_collection(&mut self) {
        let collections = self.memory.collections();
        if collections != self.gc_epoch {
            self.gc_epoch = collections;
            self.cache.flush();
            tracing::debug!(collections, "collection finished, method cache flushed");
        }
    }
}
