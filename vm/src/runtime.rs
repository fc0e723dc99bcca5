//! Runtime entry points for natively compiled code.
//!
//! A method translator may emit calls to these functions instead of
//! interpreting bytecodes; each preserves the collector's invariants. The
//! caller-side rules match the interpreter's own: native code may assume the
//! tagged-integer and header layouts, but must not cache heap addresses
//! across any call that can allocate unless it registered them as roots —
//! every `Value` passed in here is pinned before the first allocation, and
//! every `Value` handed back is fresh.

use object::{Process, Value};

use crate::handles::HandleScope;
use crate::interpreter::{self, ExecuteResult};
use crate::Vm;

/// Allocate an ordinary object of `class` with `field_count` nil fields.
///
/// The class argument is rooted across the allocation, so the returned
/// object's header is valid even when the allocation collected.
pub fn new_ordinary_object(
    vm: &mut Vm,
    class: Value,
    field_count: usize,
) -> Value {
    vm.allocate_ordinary(class, field_count)
}

/// The write barrier. Must be called before every field store into a
/// heap-resident ordinary object, with the old value still in `slot`; the
/// caller performs the store afterwards.
///
/// # Safety
///
/// `slot` must point into a live ordinary object (or non-moving storage)
/// and hold a valid tagged value.
pub unsafe fn check_root(vm: &mut Vm, value: Value, slot: *mut Value) {
    vm.memory.write_barrier(value, slot);
}

/// Perform a full message send on behalf of native code: look the method up
/// (through the cache), activate it with `calling_context` as the sender,
/// and interpret until the send answers. Returns the result code and value;
/// on anything but `Returned` the value is nil.
///
/// Non-local returns unwind through `calling_context`'s sender chain like
/// interpreted sends. The tick budget bounds runaway sends.
pub fn send_message(
    vm: &mut Vm,
    calling_context: Value,
    selector: Value,
    arguments: Value,
    ticks: u32,
) -> (ExecuteResult, Value) {
    let scope = HandleScope::new(vm);
    let calling = scope.pin(calling_context);
    let selector = scope.pin(selector);
    let arguments = scope.pin(arguments);

    // A scratch Process around the calling context drives the interpreter.
    let process = vm.allocate_ordinary(vm.special.process_class, Process::FIELD_COUNT);
    unsafe {
        object::set_field_raw(process, 0, calling.get());
        object::set_field_raw(process, 1, vm.nil());
    }
    let process = scope.pin(process);

    unsafe {
        if let Err(result) = interpreter::send(
            vm,
            process,
            selector.get(),
            arguments.get(),
            None,
        ) {
            return (result, vm.nil());
        }
    }

    let mut remaining = ticks;
    loop {
        // The send has answered once the calling context is current again;
        // the result sits on its operand stack.
        let current = unsafe { Process(process.get()).context() };
        if current.same_as(calling.get()) {
            let value = unsafe { interpreter::pop(vm, current) }
                .unwrap_or_else(|_| vm.nil());
            return (ExecuteResult::Returned, value);
        }
        if remaining == 0 {
            return (ExecuteResult::TimeExpired, vm.nil());
        }
        remaining -= 1;
        if let Err(result) = unsafe { interpreter::step(vm, process) } {
            let value = match result {
                ExecuteResult::Returned => unsafe {
                    Process(process.get()).result()
                },
                _ => vm.nil(),
            };
            return (result, value);
        }
    }
}

/// The non-local-return landing pad: unwind `process` to the block's
/// creating context, pushing `value` as that context's pending result.
/// Fails with `Error` when the target has escaped the sender chain.
pub fn emit_block_return(
    vm: &mut Vm,
    process: Value,
    value: Value,
    target_context: Value,
) -> Result<(), ExecuteResult> {
    let scope = HandleScope::new(vm);
    let process = scope.pin(process);
    unsafe {
        interpreter::unwind_to_creating(vm, process, target_context, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materialize::{
        install_method, make_array, make_method, make_process, make_symbol,
        MethodDesc,
    };
    use crate::tests::test_vm;
    use bytecode::BytecodeBuilder;
    use object::Context;

    #[test]
    fn new_ordinary_object_is_nil_filled_and_classed() {
        let mut vm = test_vm();
        let array_class = vm.special.array_class;
        let obj = new_ordinary_object(&mut vm, array_class, 3);
        unsafe {
            assert_eq!(object::size_of(obj), 3);
            assert!(object::field_at(obj, 0).same_as(vm.nil()));
            assert!(object::header(obj)
                .class()
                .same_as(vm.special.array_class));
        }
    }

    #[test]
    fn check_root_maintains_the_cross_generation_log() {
        let mut vm = test_vm();
        // Promote a holder to the old generation, then store a young value.
        let scope = HandleScope::new(&mut vm);
        let holder =
            scope.pin(vm.allocate_ordinary(vm.special.array_class, 1));
        vm.collect();
        let young = vm.allocate_ordinary(vm.special.array_class, 0);
        unsafe {
            vm.store_field(holder.get(), 0, young);
        }
        // The barrier inside store_field logged the edge: the young object
        // must survive a collection reachable only through the old holder.
        let probe = scope.pin(holder.get());
        vm.collect();
        unsafe {
            let survivor = object::field_at(probe.get(), 0);
            assert!(survivor.is_ref());
            assert_eq!(object::size_of(survivor), 0);
        }
    }

    #[test]
    fn send_message_answers_the_sent_method_result() {
        let mut vm = test_vm();
        let mut body = BytecodeBuilder::new();
        body.push_small_constant(6);
        body.push_small_constant(7);
        body.do_primitive(crate::primitives::PRIM_MULTIPLY, 2);
        body.push_nil();
        body.stack_return();
        let small_int_class = vm.special.small_int_class;
        install_method(
            &mut vm,
            &MethodDesc {
                selector: "answer",
                class: small_int_class,
                bytecode: body.finish(),
                literals: vec![],
                arg_count: 1,
                temp_count: 0,
                stack_size: 4,
            },
        );

        // Any suspended context works as the caller; borrow one from an
        // idle process.
        let mut idle = BytecodeBuilder::new();
        idle.push_nil();
        idle.stack_return();
        let desc = MethodDesc {
            selector: "idle",
            class: vm.special.object_class,
            bytecode: idle.finish(),
            literals: vec![],
            arg_count: 1,
            temp_count: 0,
            stack_size: 4,
        };
        let scope = HandleScope::new(&mut vm);
        let idle_method = scope.pin(make_method(&mut vm, &desc));
        let idle_process = scope.pin(make_process(&mut vm, idle_method.get()));
        let calling =
            scope.pin(unsafe { object::Process(idle_process.get()).context() });

        let selector = scope.pin(make_symbol(&mut vm, "answer"));
        let arguments =
            scope.pin(make_array(&mut vm, &[Value::from_i32(1)]));
        let (result, value) = send_message(
            &mut vm,
            calling.get(),
            selector.get(),
            arguments.get(),
            1000,
        );
        assert_eq!(result, ExecuteResult::Returned);
        assert_eq!(value, Value::from_i32(42));
    }

    #[test]
    fn emit_block_return_rejects_escaped_targets() {
        let mut vm = test_vm();
        let mut b = BytecodeBuilder::new();
        b.push_nil();
        b.stack_return();
        let desc = MethodDesc {
            selector: "idle",
            class: vm.special.object_class,
            bytecode: b.finish(),
            literals: vec![],
            arg_count: 1,
            temp_count: 0,
            stack_size: 4,
        };
        let scope = HandleScope::new(&mut vm);
        let method = scope.pin(make_method(&mut vm, &desc));
        let process = scope.pin(make_process(&mut vm, method.get()));
        // A context that is not on the process's sender chain.
        let stray = scope.pin(make_process(&mut vm, method.get()));
        let stray_context =
            unsafe { object::Process(stray.get()).context() };

        let outcome = emit_block_return(
            &mut vm,
            process.get(),
            Value::from_i32(1),
            stray_context,
        );
        assert_eq!(outcome, Err(ExecuteResult::Error));
    }

    #[test]
    fn emit_block_return_lands_on_the_target_context() {
        let mut vm = test_vm();
        // Build caller → callee, then return non-locally to the caller.
        let mut b = BytecodeBuilder::new();
        b.push_nil();
        b.stack_return();
        let desc = MethodDesc {
            selector: "idle",
            class: vm.special.object_class,
            bytecode: b.finish(),
            literals: vec![],
            arg_count: 1,
            temp_count: 0,
            stack_size: 4,
        };
        let scope = HandleScope::new(&mut vm);
        let method = scope.pin(make_method(&mut vm, &desc));
        let process = scope.pin(make_process(&mut vm, method.get()));
        let caller =
            scope.pin(unsafe { object::Process(process.get()).context() });

        // Push a callee activation by hand.
        let nil = vm.nil();
        let arguments = make_array(&mut vm, &[nil]);
        unsafe {
            let arguments = scope.pin(arguments);
            interpreter::activate_method(
                &mut vm,
                process,
                method.get(),
                arguments.get(),
            )
            .expect("activation");
        }

        emit_block_return(&mut vm, process.get(), Value::from_i32(5), caller.get())
            .expect("unwind");
        unsafe {
            let current = object::Process(process.get()).context();
            assert!(current.same_as(caller.get()));
            let sp = Context(current).stack_pointer();
            assert_eq!(sp, Value::from_i32(1), "result pushed on the target");
        }
    }
}
