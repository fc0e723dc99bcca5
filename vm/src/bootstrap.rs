//! Build a minimal in-memory object world: the distinguished classes, the
//! nil/true/false singletons, an empty globals dictionary, and the selector
//! roots. Hosts that have an image file use [`crate::image::load_image`]
//! instead; the bootstrap serves tests, benches, and embedding.

use heap::MemoryManager;
use object::{ClassView, Value};

use crate::handles::HandleScope;
use crate::materialize::{
    dictionary_insert, make_class, make_dictionary, make_symbol,
};
use crate::Vm;

/// Bootstrap a VM on top of `memory`.
pub fn bootstrap(memory: Box<dyn MemoryManager>) -> Vm {
    let mut vm = Vm::new(memory);

    // The metaclass knot: Class's class is Class itself, and the first few
    // allocations run before any class object exists. Allocate the shells
    // with a small-integer placeholder class, then tie the knot by hand —
    // the only header writes outside the collector's forwarding step, done
    // before the objects are published.
    let placeholder = Value::from_i32(0);
    let class_class = vm.allocate_ordinary(placeholder, ClassView::FIELD_COUNT);
    unsafe {
        object::header_mut(class_class).set_class(class_class);
    }
    vm.special.class_class = class_class;

    let raw_class = |vm: &mut Vm| {
        vm.allocate_ordinary(vm.special.class_class, ClassView::FIELD_COUNT)
    };

    // Shells for every class whose instances the bootstrap itself needs.
    vm.special.symbol_class = raw_class(&mut vm);
    vm.special.array_class = raw_class(&mut vm);
    vm.special.dictionary_class = raw_class(&mut vm);
    vm.special.string_class = raw_class(&mut vm);
    vm.special.object_class = raw_class(&mut vm);

    let undefined_class = raw_class(&mut vm);
    let nil = vm.allocate_ordinary(undefined_class, 0);
    vm.special.nil = nil;
    vm.memory.set_nil(nil);

    // From here on regular construction works: symbols, arrays,
    // dictionaries, classes.
    let object_class = vm.special.object_class;
    vm.special.method_class = make_class(&mut vm, "Method", object_class, 7);
    vm.special.context_class = make_class(&mut vm, "Context", object_class, 8);
    vm.special.process_class = make_class(&mut vm, "Process", object_class, 2);
    vm.special.block_class = make_class(&mut vm, "Block", object_class, 4);
    vm.special.integer_class = make_class(&mut vm, "Integer", object_class, 0);
    let integer_class = vm.special.integer_class;
    vm.special.small_int_class =
        make_class(&mut vm, "SmallInt", integer_class, 0);

    let true_class = make_class(&mut vm, "True", object_class, 0);
    vm.special.true_obj = vm.allocate_ordinary(true_class, 0);
    let false_class = make_class(&mut vm, "False", object_class, 0);
    vm.special.false_obj = vm.allocate_ordinary(false_class, 0);

    // Fill in the shells allocated before symbols existed. Every class is
    // re-read from rooted storage at its use site: a collection inside any
    // of these allocations moves the whole world.
    let c = vm.special.class_class;
    let object_class = vm.special.object_class;
    fill_class(&mut vm, c, "Class", object_class, 4);
    let c = vm.special.symbol_class;
    let string_class = vm.special.string_class;
    fill_class(&mut vm, c, "Symbol", string_class, 0);
    let c = vm.special.array_class;
    let object_class = vm.special.object_class;
    fill_class(&mut vm, c, "Array", object_class, 0);
    let c = vm.special.dictionary_class;
    let object_class = vm.special.object_class;
    fill_class(&mut vm, c, "Dictionary", object_class, 2);
    let c = vm.special.string_class;
    let object_class = vm.special.object_class;
    fill_class(&mut vm, c, "String", object_class, 0);
    let c = vm.special.object_class;
    let nil = vm.nil();
    fill_class(&mut vm, c, "Object", nil, 0);
    let c = nil_class(&vm);
    let object_class = vm.special.object_class;
    fill_class(&mut vm, c, "UndefinedObject", object_class, 0);

    // Selector roots.
    vm.special.bad_method_symbol = make_symbol(&mut vm, "doesNotUnderstand:");
    vm.special.binary_selectors[0] = make_symbol(&mut vm, "<");
    vm.special.binary_selectors[1] = make_symbol(&mut vm, "<=");
    vm.special.binary_selectors[2] = make_symbol(&mut vm, "+");
    vm.special.initial_method = vm.nil();

    // Publish the world through the globals dictionary. Values are fetched
    // through the special table (or a singleton's header) at insert time so
    // intervening collections cannot leave a stale pointer behind.
    type Getter = fn(&Vm) -> Value;
    vm.special.globals = make_dictionary(&mut vm);
    let globals_entries: &[(&str, Getter)] = &[
        ("Object", |vm| vm.special.object_class),
        ("Class", |vm| vm.special.class_class),
        ("Method", |vm| vm.special.method_class),
        ("Context", |vm| vm.special.context_class),
        ("Process", |vm| vm.special.process_class),
        ("Array", |vm| vm.special.array_class),
        ("Dictionary", |vm| vm.special.dictionary_class),
        ("Block", |vm| vm.special.block_class),
        ("String", |vm| vm.special.string_class),
        ("Symbol", |vm| vm.special.symbol_class),
        ("Integer", |vm| vm.special.integer_class),
        ("SmallInt", |vm| vm.special.small_int_class),
        ("UndefinedObject", nil_class),
        ("True", |vm| unsafe { object::header(vm.special.true_obj).class() }),
        ("False", |vm| unsafe { object::header(vm.special.false_obj).class() }),
    ];
    for (name, getter) in globals_entries {
        let scope = HandleScope::new(&mut vm);
        let value = scope.pin(getter(&vm));
        let key = scope.pin(make_symbol(&mut vm, name));
        let globals = vm.special.globals;
        dictionary_insert(&mut vm, globals, key.get(), value.get());
    }

    vm
}

/// nil's class, re-read through the rooted singleton.
fn nil_class(vm: &Vm) -> Value {
    unsafe { object::header(vm.nil()).class() }
}

/// Late-fill a class shell allocated before symbols were available.
fn fill_class(vm: &mut Vm, class: Value, name: &str, parent: Value, instance_size: i32) {
    let scope = HandleScope::new(vm);
    let class = scope.pin(class);
    let parent = scope.pin(parent);
    let name = scope.pin(make_symbol(vm, name));
    let methods = scope.pin(make_dictionary(vm));
    vm.store_field(class.get(), 0, name.get());
    vm.store_field(class.get(), 1, parent.get());
    vm.store_field(class.get(), 2, methods.get());
    vm.store_field(class.get(), 3, Value::from_i32(instance_size));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materialize::get_global;
    use crate::tests::{test_settings, test_vm};
    use heap::GenerationalHeap;
    use object::DictionaryView;

    #[test]
    fn the_world_is_wired_up() {
        let vm = test_vm();
        unsafe {
            // Class's class is Class.
            assert!(object::header(vm.special.class_class)
                .class()
                .same_as(vm.special.class_class));
            // SmallInt < Integer < Object, Object's parent is nil.
            let small = ClassView(vm.special.small_int_class);
            assert!(small.parent().same_as(vm.special.integer_class));
            let integer = ClassView(vm.special.integer_class);
            assert!(integer.parent().same_as(vm.special.object_class));
            let object_cls = ClassView(vm.special.object_class);
            assert!(object_cls.parent().same_as(vm.nil()));
            // Names are readable symbols.
            assert_eq!(object::symbol_text(small.name()), "SmallInt");
        }
    }

    #[test]
    fn globals_resolve_the_distinguished_classes() {
        let vm = test_vm();
        for name in [
            "Object",
            "Class",
            "Method",
            "Context",
            "Process",
            "Array",
            "Dictionary",
            "Block",
            "String",
            "Symbol",
            "SmallInt",
        ] {
            let found = get_global(&vm, name);
            assert!(found.is_some(), "global {name} missing");
            assert!(found.unwrap().is_ref());
        }
        assert!(get_global(&vm, "NoSuchGlobal").is_none());
    }

    #[test]
    fn singletons_have_distinct_identities_and_classes() {
        let vm = test_vm();
        let nil = vm.nil();
        let t = vm.special.true_obj;
        let f = vm.special.false_obj;
        assert!(!nil.same_as(t) && !nil.same_as(f) && !t.same_as(f));
        unsafe {
            let nil_cls = object::header(nil).class();
            assert_eq!(object::symbol_text(ClassView(nil_cls).name()), "UndefinedObject");
        }
    }

    #[test]
    fn bootstrap_world_survives_heavy_collection_pressure() {
        let mut vm = bootstrap(Box::new(GenerationalHeap::new(test_settings())));
        // Churn enough garbage to force many minor collections.
        for i in 0..5000 {
            let cls = vm.special.array_class;
            let garbage = vm.allocate_ordinary(cls, 8);
            vm.store_field(garbage, 0, Value::from_i32(i % 100));
        }
        assert!(vm.memory.stats().collections > 0);
        unsafe {
            let dict = DictionaryView(vm.special.globals);
            assert!(dict.lookup_by_name("SmallInt").is_some());
            let small = ClassView(vm.special.small_int_class);
            assert_eq!(object::symbol_text(small.name()), "SmallInt");
        }
    }
}
