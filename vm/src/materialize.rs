//! Materialize runtime objects — symbols, arrays, dictionaries, classes,
//! methods, processes — into the heap. Used by the bootstrap, the CLI, and
//! the tests; everything here pins its inputs before allocating.

use object::{ClassView, Context, DictionaryView, Method, Process, Value};

use crate::handles::HandleScope;
use crate::Vm;

/// Allocate a symbol (a binary object of the Symbol class).
pub fn make_symbol(vm: &mut Vm, text: &str) -> Value {
    make_byte_object(vm, vm.special.symbol_class, text.as_bytes())
}

/// Allocate a string (a binary object of the String class).
pub fn make_string(vm: &mut Vm, text: &str) -> Value {
    make_byte_object(vm, vm.special.string_class, text.as_bytes())
}

pub fn make_byte_object(vm: &mut Vm, class: Value, data: &[u8]) -> Value {
    let v = vm.allocate_binary(class, data.len());
    unsafe {
        object::bytes_mut(v)[..data.len()].copy_from_slice(data);
    }
    v
}

/// Allocate an Array holding `elements` in order.
pub fn make_array(vm: &mut Vm, elements: &[Value]) -> Value {
    let scope = HandleScope::new(vm);
    let pinned: Vec<_> = elements.iter().map(|&e| scope.pin(e)).collect();
    let array = vm.allocate_ordinary(vm.special.array_class, elements.len());
    for (i, handle) in pinned.iter().enumerate() {
        // Fresh allocation, not yet published: the barrier may be skipped.
        unsafe { object::set_field_raw(array, i, handle.get()) };
    }
    array
}

/// Allocate an empty Dictionary (keys array + values array).
pub fn make_dictionary(vm: &mut Vm) -> Value {
    let scope = HandleScope::new(vm);
    let keys = scope.pin(make_array(vm, &[]));
    let values = scope.pin(make_array(vm, &[]));
    let dict = vm.allocate_ordinary(vm.special.dictionary_class, DictionaryView::FIELD_COUNT);
    unsafe {
        object::set_field_raw(dict, 0, keys.get());
        object::set_field_raw(dict, 1, values.get());
    }
    dict
}

/// Insert `key → value`, growing the dictionary's parallel arrays by one.
pub fn dictionary_insert(vm: &mut Vm, dict: Value, key: Value, value: Value) {
    let scope = HandleScope::new(vm);
    let dict = scope.pin(dict);
    let key = scope.pin(key);
    let value = scope.pin(value);

    let (old_keys, old_values, count) = unsafe {
        let view = DictionaryView(dict.get());
        (view.keys(), view.values(), object::size_of(view.keys()))
    };
    let old_keys = scope.pin(old_keys);
    let old_values = scope.pin(old_values);

    let new_keys = scope.pin(grown_copy(vm, old_keys.get(), count, key.get()));
    let new_values = grown_copy(vm, old_values.get(), count, value.get());

    vm.store_field(dict.get(), 0, new_keys.get());
    vm.store_field(dict.get(), 1, new_values);
}

fn grown_copy(vm: &mut Vm, source: Value, count: usize, appended: Value) -> Value {
    let scope = HandleScope::new(vm);
    let source = scope.pin(source);
    let appended = scope.pin(appended);
    let array = vm.allocate_ordinary(vm.special.array_class, count + 1);
    unsafe {
        for i in 0..count {
            object::set_field_raw(array, i, object::field_at(source.get(), i));
        }
        object::set_field_raw(array, count, appended.get());
    }
    array
}

/// Allocate a class object: name symbol, parent class, empty method
/// dictionary, instance field count.
pub fn make_class(vm: &mut Vm, name: &str, parent: Value, instance_size: i32) -> Value {
    let scope = HandleScope::new(vm);
    let parent = scope.pin(parent);
    let name = scope.pin(make_symbol(vm, name));
    let methods = scope.pin(make_dictionary(vm));
    let class = vm.allocate_ordinary(vm.special.class_class, ClassView::FIELD_COUNT);
    unsafe {
        object::set_field_raw(class, 0, name.get());
        object::set_field_raw(class, 1, parent.get());
        object::set_field_raw(class, 2, methods.get());
        object::set_field_raw(class, 3, Value::from_i32(instance_size));
    }
    class
}

/// Everything needed to materialize a compiled method.
pub struct MethodDesc<'a> {
    pub selector: &'a str,
    /// Owning class; super sends start lookup at its parent.
    pub class: Value,
    pub bytecode: Vec<u8>,
    pub literals: Vec<Value>,
    pub arg_count: i32,
    pub temp_count: i32,
    pub stack_size: i32,
}

/// Materialize a Method object: selector symbol, owning class, bytecode
/// vector (binary), literal array, and the three size fields.
pub fn make_method(vm: &mut Vm, desc: &MethodDesc<'_>) -> Value {
    let scope = HandleScope::new(vm);
    let class = scope.pin(desc.class);
    let selector = scope.pin(make_symbol(vm, desc.selector));
    let bytecodes = scope.pin(make_byte_object(
        vm,
        vm.special.string_class,
        &desc.bytecode,
    ));
    let literals = scope.pin(make_array(vm, &desc.literals));
    let method = vm.allocate_ordinary(vm.special.method_class, Method::FIELD_COUNT);
    unsafe {
        object::set_field_raw(method, 0, selector.get());
        object::set_field_raw(method, 1, class.get());
        object::set_field_raw(method, 2, bytecodes.get());
        object::set_field_raw(method, 3, literals.get());
        object::set_field_raw(method, 4, Value::from_i32(desc.arg_count));
        object::set_field_raw(method, 5, Value::from_i32(desc.temp_count));
        object::set_field_raw(method, 6, Value::from_i32(desc.stack_size));
    }
    method
}

/// Materialize a method and enter it into its class's method dictionary.
/// Mutating class structure invalidates the method cache.
pub fn install_method(vm: &mut Vm, desc: &MethodDesc<'_>) -> Value {
    let scope = HandleScope::new(vm);
    let class = scope.pin(desc.class);
    let method = scope.pin(make_method(vm, desc));
    let (methods, selector) = unsafe {
        (
            ClassView(class.get()).methods(),
            Method(method.get()).selector(),
        )
    };
    dictionary_insert(vm, methods, selector, method.get());
    vm.cache.flush();
    method.get()
}

/// Build the bootstrap Process for `method`: a Context with `nil` as the
/// receiver, empty sender, and freshly sized temporary and stack arrays.
pub fn make_process(vm: &mut Vm, method: Value) -> Value {
    let scope = HandleScope::new(vm);
    let method = scope.pin(method);
    let nil = vm.nil();

    let (temp_count, stack_size) = unsafe {
        let m = Method(method.get());
        (m.temp_count().as_i32(), m.stack_size().as_i32())
    };

    let arguments = scope.pin(make_array(vm, &[nil]));
    let temporaries =
        scope.pin(vm.allocate_ordinary(vm.special.array_class, temp_count.max(0) as usize));
    let stack =
        scope.pin(vm.allocate_ordinary(vm.special.array_class, stack_size.max(0) as usize));

    let context = scope.pin(vm.allocate_ordinary(vm.special.context_class, Context::FIELD_COUNT));
    unsafe {
        object::set_field_raw(context.get(), 0, method.get());
        object::set_field_raw(context.get(), 1, Value::from_i32(0));
        object::set_field_raw(context.get(), 2, Value::from_i32(0));
        object::set_field_raw(context.get(), 3, arguments.get());
        object::set_field_raw(context.get(), 4, temporaries.get());
        object::set_field_raw(context.get(), 5, stack.get());
        object::set_field_raw(context.get(), 6, vm.nil());
        object::set_field_raw(context.get(), 7, vm.nil());
    }

    let process = vm.allocate_ordinary(vm.special.process_class, Process::FIELD_COUNT);
    unsafe {
        object::set_field_raw(process, 0, context.get());
        object::set_field_raw(process, 1, vm.nil());
    }
    process
}

/// Look up a global by name in the image's globals dictionary.
pub fn get_global(vm: &Vm, name: &str) -> Option<Value> {
    unsafe { DictionaryView(vm.special.globals).lookup_by_name(name) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_vm;

    #[test]
    fn symbols_carry_their_bytes_and_class() {
        let mut vm = test_vm();
        let sym = make_symbol(&mut vm, "ifTrue:ifFalse:");
        unsafe {
            assert!(object::is_binary(sym));
            assert_eq!(object::symbol_text(sym), "ifTrue:ifFalse:");
            assert!(object::header(sym)
                .class()
                .same_as(vm.special.symbol_class));
        }
    }

    #[test]
    fn arrays_preserve_element_order() {
        let mut vm = test_vm();
        let nil = vm.nil();
        let a = make_array(
            &mut vm,
            &[Value::from_i32(1), nil, Value::from_i32(3)],
        );
        unsafe {
            assert_eq!(object::size_of(a), 3);
            assert_eq!(object::field_at(a, 0), Value::from_i32(1));
            assert!(object::field_at(a, 1).same_as(vm.nil()));
            assert_eq!(object::field_at(a, 2), Value::from_i32(3));
        }
    }

    #[test]
    fn dictionary_insert_and_lookup_round_trip() {
        let mut vm = test_vm();
        let dict = {
            let scope = HandleScope::new(&mut vm);
            let dict = scope.pin(make_dictionary(&mut vm));
            let key = scope.pin(make_symbol(&mut vm, "size"));
            dictionary_insert(&mut vm, dict.get(), key.get(), Value::from_i32(4));
            let key2 = scope.pin(make_symbol(&mut vm, "hash"));
            dictionary_insert(&mut vm, dict.get(), key2.get(), Value::from_i32(9));
            dict.get()
        };
        unsafe {
            let view = DictionaryView(dict);
            assert_eq!(view.lookup_by_name("size"), Some(Value::from_i32(4)));
            assert_eq!(view.lookup_by_name("hash"), Some(Value::from_i32(9)));
            assert_eq!(view.lookup_by_name("missing"), None);
        }
    }

    #[test]
    fn installed_methods_are_found_by_fresh_symbols() {
        let mut vm = test_vm();
        let class = vm.special.object_class;
        let method = install_method(
            &mut vm,
            &MethodDesc {
                selector: "answer",
                class,
                bytecode: vec![],
                literals: vec![],
                arg_count: 1,
                temp_count: 0,
                stack_size: 2,
            },
        );
        // Lookup with a *different* symbol object of the same text.
        let probe = make_symbol(&mut vm, "answer");
        unsafe {
            let methods = ClassView(class).methods();
            let found = DictionaryView(methods).lookup(probe);
            assert_eq!(found.map(|v| v.raw()), Some(method.raw()));
        }
    }

    #[test]
    fn processes_wrap_a_bootstrap_context() {
        let mut vm = test_vm();
        let object_class = vm.special.object_class;
        let method = make_method(
            &mut vm,
            &MethodDesc {
                selector: "go",
                class: object_class,
                bytecode: vec![],
                literals: vec![],
                arg_count: 1,
                temp_count: 2,
                stack_size: 5,
            },
        );
        let process = make_process(&mut vm, method);
        unsafe {
            let context = Process(process).context();
            let ctx = Context(context);
            assert!(ctx.method().same_as(method));
            assert_eq!(ctx.byte_pointer(), Value::from_i32(0));
            assert_eq!(object::size_of(ctx.temporaries()), 2);
            assert_eq!(object::size_of(ctx.stack()), 5);
            assert!(ctx.sender().same_as(vm.nil()));
            assert!(Process(process).result().same_as(vm.nil()));
        }
    }
}
