use core::cell::{Cell, UnsafeCell};
use core::marker::PhantomData;

use object::Value;

use crate::Vm;

pub const SCOPE_CAPACITY: usize = 16;

struct OverflowChunk {
    slots: [Value; SCOPE_CAPACITY],
}

/// A stack-scoped set of GC root slots.
///
/// Raw `Value` locals go stale across any operation that may allocate
/// (the collector moves objects and only rewrites *registered* slots).
/// Pinning a value gives back a [`Handle`] whose `get()` always sees the
/// current address. Every pinned slot is registered with the memory manager
/// as an external pointer root and unregistered when the scope drops.
///
/// The scope must stay where it was constructed (a local binding) for as
/// long as any slot is registered; the registered pointers refer into it.
pub struct HandleScope {
    vm: *mut Vm,
    len: Cell<usize>,
    slots: UnsafeCell<[Value; SCOPE_CAPACITY]>,
    overflow: UnsafeCell<Vec<Box<OverflowChunk>>>,
}

/// A copyable, scope-bounded rooted value.
#[derive(Clone, Copy)]
pub struct Handle<'scope> {
    slot: *mut Value,
    _scope: PhantomData<&'scope HandleScope>,
}

impl HandleScope {
    #[inline]
    pub fn new(vm: &mut Vm) -> Self {
        Self {
            vm: vm as *mut Vm,
            len: Cell::new(0),
            slots: UnsafeCell::new([Value::EMPTY; SCOPE_CAPACITY]),
            overflow: UnsafeCell::new(Vec::new()),
        }
    }

    /// Pin `value` into a fresh rooted slot.
    pub fn pin(&self, value: Value) -> Handle<'_> {
        let index = self.len.get();
        self.len.set(index + 1);

        let slot: *mut Value = if index < SCOPE_CAPACITY {
            unsafe { (*self.slots.get()).as_mut_ptr().add(index) }
        } else {
            let overflow_index = index - SCOPE_CAPACITY;
            let chunk = overflow_index / SCOPE_CAPACITY;
            let within = overflow_index % SCOPE_CAPACITY;
            let chunks = unsafe { &mut *self.overflow.get() };
            if chunk == chunks.len() {
                chunks.push(Box::new(OverflowChunk {
                    slots: [Value::EMPTY; SCOPE_CAPACITY],
                }));
            }
            // Box contents are stable; growing the Vec moves only the boxes'
            // pointers, not the chunks.
            unsafe { chunks[chunk].slots.as_mut_ptr().add(within) }
        };

        unsafe {
            *slot = value;
            (*self.vm).memory.register_root(slot);
        }
        Handle {
            slot,
            _scope: PhantomData,
        }
    }
}

impl Drop for HandleScope {
    fn drop(&mut self) {
        let len = self.len.get();
        let vm = unsafe { &mut *self.vm };
        let inline = len.min(SCOPE_CAPACITY);
        for i in (0..inline).rev() {
            let slot = unsafe { (*self.slots.get()).as_mut_ptr().add(i) };
            vm.memory.unregister_root(slot);
        }
        if len > SCOPE_CAPACITY {
            let chunks = unsafe { &mut *self.overflow.get() };
            let mut remaining = len - SCOPE_CAPACITY;
            for chunk in chunks.iter_mut() {
                let used = remaining.min(SCOPE_CAPACITY);
                for i in (0..used).rev() {
                    let slot = chunk.slots.as_mut_ptr().wrapping_add(i);
                    vm.memory.unregister_root(slot);
                }
                remaining -= used;
                if remaining == 0 {
                    break;
                }
            }
        }
    }
}

impl<'scope> Handle<'scope> {
    /// The current (possibly moved) value.
    #[inline(always)]
    pub fn get(&self) -> Value {
        unsafe { *self.slot }
    }

    #[inline(always)]
    pub fn set(&self, value: Value) {
        unsafe {
            *self.slot = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_vm;

    #[test]
    fn handles_follow_objects_across_collections() {
        let mut vm = test_vm();
        let obj = vm.allocate_ordinary(vm.special.object_class, 1);
        vm.store_field(obj, 0, Value::from_i32(17));

        let scope = HandleScope::new(&mut vm);
        let h = scope.pin(obj);
        let before = h.get().raw();
        vm.collect();
        let after = h.get().raw();
        assert_ne!(before, after, "handle slot must be rewritten by the GC");
        unsafe {
            assert_eq!(object::field_at(h.get(), 0), Value::from_i32(17));
        }
    }

    #[test]
    fn overflow_slots_are_rooted_too() {
        let mut vm = test_vm();
        let scope = HandleScope::new(&mut vm);
        let mut handles = Vec::new();
        for i in 0..(SCOPE_CAPACITY * 2 + 3) {
            let obj = vm.allocate_ordinary(vm.special.object_class, 1);
            vm.store_field(obj, 0, Value::from_i32(i as i32));
            handles.push(scope.pin(obj));
        }
        vm.collect();
        for (i, h) in handles.iter().enumerate() {
            unsafe {
                assert_eq!(
                    object::field_at(h.get(), 0),
                    Value::from_i32(i as i32)
                );
            }
        }
    }

    #[test]
    fn dropping_the_scope_unregisters_all_slots() {
        let mut vm = test_vm();
        let obj = vm.allocate_ordinary(vm.special.object_class, 0);
        {
            let scope = HandleScope::new(&mut vm);
            let _h = scope.pin(obj);
        }
        // The dead handle no longer keeps the object alive: after a
        // collection the old address must not be updated anywhere. Nothing
        // to assert directly — this collection must simply not touch the
        // dropped scope's slots.
        vm.collect();
    }
}
