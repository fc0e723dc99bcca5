//! The bytecode interpreter: decode, message send, block invocation,
//! primitives, non-local return, tick budget.
//!
//! All interpreter state lives in heap Contexts reachable from the Process,
//! so any pointer fetched before an allocation is re-read afterwards —
//! either through the Process (contexts, stacks) or through a pinned
//! [`HandleScope`] slot (locals).

use bytecode::{InstructionStream, Opcode, Special};
use bytecode::{
    BINARY_ADD, BINARY_LESS, BINARY_LESS_EQUAL, CONST_FALSE, CONST_NIL,
    CONST_TRUE, UNARY_IS_NIL, UNARY_NOT_NIL,
};
use object::{Block, ClassView, Context, DictionaryView, Method, Process, Value};

use crate::handles::{Handle, HandleScope};
use crate::primitives;
use crate::Vm;

/// Result of one `execute` call, with the process exit codes of the host
/// interface baked into the discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecuteResult {
    /// Unrecoverable runtime error (escaped block return, malformed state).
    Error = 2,
    /// Lookup fell off the top of the class chain and `doesNotUnderstand:`
    /// is itself missing.
    BadMethod = 3,
    /// The process returned from its bottom frame; the value is in the
    /// Process result slot.
    Returned = 4,
    /// The tick budget ran out; call `execute` again to resume.
    TimeExpired = 5,
    /// A breakpoint bytecode fired.
    Break = 6,
    /// The process has no runnable context.
    NoReturn = 255,
}

impl ExecuteResult {
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

/// Context field indices used for stores (reads go through the views).
const CTX_BYTE_POINTER: usize = 1;
const CTX_STACK_POINTER: usize = 2;
const PROC_CONTEXT: usize = 0;
const PROC_RESULT: usize = 1;

/// Internal short-circuit: `Err` terminates `execute` with that result.
type Step = Result<(), ExecuteResult>;

/// Run `process` until the tick budget is exhausted, the bottom frame
/// returns, a breakpoint fires, or an error occurs. One tick is one
/// bytecode. State is saved in the current Context at every step, so a
/// suspended process resumes where it stopped.
pub fn execute(vm: &mut Vm, process: Value, ticks: u32) -> ExecuteResult {
    let scope = HandleScope::new(vm);
    let process = scope.pin(process);
    let mut remaining = ticks;
    loop {
        if remaining == 0 {
            return ExecuteResult::TimeExpired;
        }
        remaining -= 1;
        if let Err(result) = unsafe { step(vm, process) } {
            return result;
        }
    }
}

/// Decode and execute one bytecode.
pub(crate) unsafe fn step(vm: &mut Vm, process: Handle<'_>) -> Step {
    let context = Process(process.get()).context();
    if !is_object(vm, context) {
        return Err(ExecuteResult::NoReturn);
    }
    let ctx = Context(context);
    let method = ctx.method();
    if !is_object(vm, method) || object::size_of(method) < Method::FIELD_COUNT
    {
        return Err(ExecuteResult::Error);
    }
    let code_obj = Method(method).bytecodes();
    if !code_obj.is_ref() || !object::is_binary(code_obj) {
        return Err(ExecuteResult::Error);
    }
    let pc = ctx.byte_pointer();
    if !pc.is_small_int() || pc.as_i32() < 0 {
        return Err(ExecuteResult::Error);
    }

    // The byte slice is only valid until the next allocation: every arm
    // reads its trailing operands and saves the byte pointer before acting.
    let code = object::bytes(code_obj);
    let mut stream = InstructionStream::at(code, pc.as_i32() as usize);
    let instr = stream.decode_next().ok_or(ExecuteResult::Error)?;

    match instr.opcode {
        Opcode::Extended => Err(ExecuteResult::Error),

        Opcode::PushInstance => {
            set_pc(vm, context, stream.pos());
            let receiver = checked_field(ctx.arguments(), 0)?;
            let value = checked_field(receiver, instr.immediate as usize)?;
            push(vm, context, value)
        }

        Opcode::PushArgument => {
            set_pc(vm, context, stream.pos());
            let value =
                checked_field(ctx.arguments(), instr.immediate as usize)?;
            push(vm, context, value)
        }

        Opcode::PushTemporary => {
            set_pc(vm, context, stream.pos());
            let value =
                checked_field(ctx.temporaries(), instr.immediate as usize)?;
            push(vm, context, value)
        }

        Opcode::PushLiteral => {
            set_pc(vm, context, stream.pos());
            let literals = Method(method).literals();
            let value = checked_field(literals, instr.immediate as usize)?;
            push(vm, context, value)
        }

        Opcode::PushConstant => {
            set_pc(vm, context, stream.pos());
            let value = match instr.immediate {
                n @ 0..=9 => Value::from_i32(n as i32),
                CONST_NIL => vm.nil(),
                CONST_TRUE => vm.special.true_obj,
                CONST_FALSE => vm.special.false_obj,
                _ => return Err(ExecuteResult::Error),
            };
            push(vm, context, value)
        }

        Opcode::AssignInstance => {
            set_pc(vm, context, stream.pos());
            // Assignment leaves the value on the stack.
            let value = top(context)?;
            let receiver = checked_field(ctx.arguments(), 0)?;
            let index = instr.immediate as usize;
            if !is_object(vm, receiver) || index >= object::size_of(receiver)
            {
                return Err(ExecuteResult::Error);
            }
            vm.store_field(receiver, index, value);
            Ok(())
        }

        Opcode::AssignTemporary => {
            set_pc(vm, context, stream.pos());
            let value = top(context)?;
            let temporaries = ctx.temporaries();
            let index = instr.immediate as usize;
            if !is_object(vm, temporaries)
                || index >= object::size_of(temporaries)
            {
                return Err(ExecuteResult::Error);
            }
            vm.store_field(temporaries, index, value);
            Ok(())
        }

        Opcode::MarkArguments => {
            set_pc(vm, context, stream.pos());
            let count = instr.immediate as usize;
            let array =
                vm.allocate_ordinary(vm.special.array_class, count);
            // Allocation may have moved the world; re-read the context.
            let context = Process(process.get()).context();
            let ctx = Context(context);
            let sp = stack_pointer(ctx)?;
            if sp < count {
                return Err(ExecuteResult::Error);
            }
            let stack = ctx.stack();
            for i in 0..count {
                // Stack order: top of stack becomes the last element.
                let value = checked_field(stack, sp - count + i)?;
                object::set_field_raw(array, i, value);
            }
            vm.store_field(
                context,
                CTX_STACK_POINTER,
                Value::from_i32((sp - count) as i32),
            );
            push(vm, context, array)
        }

        Opcode::SendMessage => {
            set_pc(vm, context, stream.pos());
            let literals = Method(method).literals();
            let selector = checked_field(literals, instr.immediate as usize)?;
            let arguments = pop(vm, context)?;
            send(vm, process, selector, arguments, None)
        }

        Opcode::SendUnary => {
            set_pc(vm, context, stream.pos());
            let value = pop(vm, context)?;
            let is_nil = value.same_as(vm.nil());
            let result = match instr.immediate {
                UNARY_IS_NIL => bool_object(vm, is_nil),
                UNARY_NOT_NIL => bool_object(vm, !is_nil),
                _ => return Err(ExecuteResult::Error),
            };
            push(vm, context, result)
        }

        Opcode::SendBinary => {
            set_pc(vm, context, stream.pos());
            let rhs = pop(vm, context)?;
            let lhs = pop(vm, context)?;
            if instr.immediate > BINARY_ADD {
                return Err(ExecuteResult::Error);
            }
            if lhs.is_small_int() && rhs.is_small_int() {
                let (l, r) = (lhs.as_i32(), rhs.as_i32());
                let inline = if instr.immediate == BINARY_LESS {
                    Some(bool_object(vm, l < r))
                } else if instr.immediate == BINARY_LESS_EQUAL {
                    Some(bool_object(vm, l <= r))
                } else {
                    // Checked against the 31-bit range: on overflow the
                    // operation is lowered to a real message send.
                    l.checked_add(r).and_then(Value::try_from_i32)
                };
                if let Some(result) = inline {
                    return push(vm, context, result);
                }
            }
            // Lower to a normal message send of the binary selector.
            let scope = HandleScope::new(vm);
            let lhs = scope.pin(lhs);
            let rhs = scope.pin(rhs);
            let arguments =
                vm.allocate_ordinary(vm.special.array_class, 2);
            object::set_field_raw(arguments, 0, lhs.get());
            object::set_field_raw(arguments, 1, rhs.get());
            let selector =
                vm.special.binary_selectors[instr.immediate as usize];
            send(vm, process, selector, arguments, None)
        }

        Opcode::PushBlock => {
            let end = stream.read_u16_le().ok_or(ExecuteResult::Error)?;
            let body_start = stream.pos();
            // The skipped bytes stay in the method for later invocation.
            set_pc(vm, context, end as usize);

            let block =
                vm.allocate_ordinary(vm.special.block_class, Block::FIELD_COUNT);
            let context = Process(process.get()).context();
            object::set_field_raw(
                block,
                0,
                Value::from_i32(instr.immediate as i32),
            );
            object::set_field_raw(block, 1, Value::from_i32(body_start as i32));
            object::set_field_raw(block, 2, context);
            object::set_field_raw(block, 3, Context(context).method());
            push(vm, context, block)
        }

        Opcode::DoPrimitive => {
            let number = stream.read_u8().ok_or(ExecuteResult::Error)?;
            set_pc(vm, context, stream.pos());

            let count = instr.immediate as usize;
            let sp = stack_pointer(ctx)?;
            if sp < count {
                return Err(ExecuteResult::Error);
            }
            let stack = ctx.stack();
            let mut args = Vec::with_capacity(count);
            for i in 0..count {
                args.push(checked_field(stack, sp - count + i)?);
            }
            vm.store_field(
                context,
                CTX_STACK_POINTER,
                Value::from_i32((sp - count) as i32),
            );

            if number == primitives::PRIM_BLOCK_INVOKE {
                return invoke_block(vm, process, &args);
            }
            match primitives::call(vm, number, &args)? {
                // A produced value is consumed by the caller frame.
                Some(result) => return_value(vm, process, result),
                // Failure: fall through to the fallback bytecodes.
                None => Ok(()),
            }
        }

        Opcode::DoSpecial => {
            do_special(vm, process, context, method, instr.immediate, stream)
        }
    }
}

unsafe fn do_special(
    vm: &mut Vm,
    process: Handle<'_>,
    context: Value,
    method: Value,
    immediate: u8,
    mut stream: InstructionStream<'_>,
) -> Step {
    let special =
        Special::try_from(immediate).map_err(|_| ExecuteResult::Error)?;
    match special {
        Special::SelfReturn => {
            set_pc(vm, context, stream.pos());
            let receiver = checked_field(Context(context).arguments(), 0)?;
            return_value(vm, process, receiver)
        }

        Special::StackReturn => {
            set_pc(vm, context, stream.pos());
            let value = pop(vm, context)?;
            return_value(vm, process, value)
        }

        Special::BlockReturn => {
            set_pc(vm, context, stream.pos());
            let value = pop(vm, context)?;
            let creating = Context(context).creating();
            unwind_to_creating(vm, process, creating, value)
        }

        Special::Duplicate => {
            set_pc(vm, context, stream.pos());
            let value = top(context)?;
            push(vm, context, value)
        }

        Special::PopTop => {
            set_pc(vm, context, stream.pos());
            pop(vm, context).map(|_| ())
        }

        Special::Branch => {
            let target = stream.read_u16_le().ok_or(ExecuteResult::Error)?;
            set_pc(vm, context, target as usize);
            Ok(())
        }

        Special::BranchIfTrue | Special::BranchIfFalse => {
            let target = stream.read_u16_le().ok_or(ExecuteResult::Error)?;
            set_pc(vm, context, stream.pos());
            let value = pop(vm, context)?;
            let wanted = if special == Special::BranchIfTrue {
                vm.special.true_obj
            } else {
                vm.special.false_obj
            };
            if value.same_as(wanted) {
                set_pc(vm, context, target as usize);
            }
            Ok(())
        }

        Special::SendToSuper => {
            let literal_index =
                stream.read_u8().ok_or(ExecuteResult::Error)?;
            set_pc(vm, context, stream.pos());
            let literals = Method(method).literals();
            let selector = checked_field(literals, literal_index as usize)?;
            let arguments = pop(vm, context)?;
            // Lookup starts above the class that defines the running method.
            let holder = Method(method).class();
            if !is_object(vm, holder)
                || object::size_of(holder) < ClassView::FIELD_COUNT
            {
                return Err(ExecuteResult::Error);
            }
            let parent = ClassView(holder).parent();
            send(vm, process, selector, arguments, Some(parent))
        }

        Special::Breakpoint => {
            // State is already saved; resuming continues after the break.
            set_pc(vm, context, stream.pos());
            Err(ExecuteResult::Break)
        }
    }
}

// ── Message send ───────────────────────────────────────────────────

/// Send `selector` to the receiver in `arguments[0]`. `lookup_class`
/// overrides the dispatch class for super sends.
pub(crate) unsafe fn send(
    vm: &mut Vm,
    process: Handle<'_>,
    selector: Value,
    arguments: Value,
    lookup_class: Option<Value>,
) -> Step {
    if !is_object(vm, arguments)
        || object::size_of(arguments) == 0
        || !selector.is_ref()
        || !object::is_binary(selector)
    {
        return Err(ExecuteResult::Error);
    }
    let receiver = object::field_at(arguments, 0);
    let class = lookup_class.unwrap_or_else(|| {
        object::class_of(receiver, vm.special.small_int_class)
    });

    tracing::trace!(
        selector = object::symbol_text(selector),
        "send"
    );

    let method = match vm.cache.lookup(selector, class) {
        Some(method) => method,
        None => match lookup_method(vm, selector, class) {
            Some(method) => {
                vm.cache.insert(selector, class, method);
                method
            }
            None => {
                return send_does_not_understand(
                    vm, process, selector, arguments,
                )
            }
        },
    };
    activate_method(vm, process, method, arguments)
}

/// Full hierarchy walk: each class's method dictionary, then its parent.
pub(crate) unsafe fn lookup_method(
    vm: &Vm,
    selector: Value,
    class: Value,
) -> Option<Value> {
    let nil = vm.nil();
    let mut current = class;
    while current.is_ref()
        && !current.same_as(nil)
        && !object::is_binary(current)
        && object::size_of(current) >= ClassView::FIELD_COUNT
    {
        let view = ClassView(current);
        let methods = view.methods();
        if is_object(vm, methods)
            && object::size_of(methods) >= DictionaryView::FIELD_COUNT
        {
            if let Some(method) = DictionaryView(methods).lookup(selector) {
                return Some(method);
            }
        }
        current = view.parent();
    }
    None
}

/// Total lookup miss: send `doesNotUnderstand:` with `[receiver, selector]`
/// as the argument array, or halt with BadMethod if even that is missing.
unsafe fn send_does_not_understand(
    vm: &mut Vm,
    process: Handle<'_>,
    selector: Value,
    arguments: Value,
) -> Step {
    let receiver = object::field_at(arguments, 0);
    let class = object::class_of(receiver, vm.special.small_int_class);
    let bad_method = vm.special.bad_method_symbol;
    let Some(handler) = lookup_method(vm, bad_method, class) else {
        return Err(ExecuteResult::BadMethod);
    };
    tracing::debug!(
        selector = object::symbol_text(selector),
        "message not understood"
    );

    let scope = HandleScope::new(vm);
    let handler = scope.pin(handler);
    let receiver = scope.pin(receiver);
    let selector = scope.pin(selector);
    let dnu_args = vm.allocate_ordinary(vm.special.array_class, 2);
    object::set_field_raw(dnu_args, 0, receiver.get());
    object::set_field_raw(dnu_args, 1, selector.get());
    activate_method(vm, process, handler.get(), dnu_args)
}

/// Build and enter a fresh Context for `method`. Captured pointers are
/// pinned: the three allocations here may each trigger a collection.
pub(crate) unsafe fn activate_method(
    vm: &mut Vm,
    process: Handle<'_>,
    method: Value,
    arguments: Value,
) -> Step {
    if !is_object(vm, method)
        || object::size_of(method) < Method::FIELD_COUNT
    {
        return Err(ExecuteResult::Error);
    }
    let scope = HandleScope::new(vm);
    let method = scope.pin(method);
    let arguments = scope.pin(arguments);

    let (temp_count, stack_size) = method_frame_sizes(method.get())?;
    let temporaries =
        scope.pin(vm.allocate_ordinary(vm.special.array_class, temp_count));
    let stack =
        scope.pin(vm.allocate_ordinary(vm.special.array_class, stack_size));
    let context =
        vm.allocate_ordinary(vm.special.context_class, Context::FIELD_COUNT);

    let sender = Process(process.get()).context();
    object::set_field_raw(context, 0, method.get());
    object::set_field_raw(context, 1, Value::from_i32(0));
    object::set_field_raw(context, 2, Value::from_i32(0));
    object::set_field_raw(context, 3, arguments.get());
    object::set_field_raw(context, 4, temporaries.get());
    object::set_field_raw(context, 5, stack.get());
    object::set_field_raw(context, 6, sender);
    object::set_field_raw(context, 7, vm.nil());

    vm.store_field(process.get(), PROC_CONTEXT, context);
    Ok(())
}

/// Invoke a Block (primitive 8): a fresh Context resumes the block's method
/// at its byte pointer, sharing the creating context's argument and
/// temporary arrays; call arguments land in the shared temporaries at the
/// block's argument offset. Failure falls through like any primitive.
unsafe fn invoke_block(
    vm: &mut Vm,
    process: Handle<'_>,
    args: &[Value],
) -> Step {
    let Some(&block_value) = args.first() else {
        return Ok(());
    };
    if !is_object(vm, block_value)
        || object::size_of(block_value) < Block::FIELD_COUNT
        || !object::header(block_value)
            .class()
            .same_as(vm.special.block_class)
    {
        return Ok(());
    }

    let scope = HandleScope::new(vm);
    let block = scope.pin(block_value);
    let call_args: Vec<Handle<'_>> =
        args[1..].iter().map(|&a| scope.pin(a)).collect();

    let creating = Block(block.get()).creating();
    let method = Block(block.get()).method();
    if !is_object(vm, creating) || !is_object(vm, method) {
        return Ok(());
    }
    let offset = Block(block.get()).argument_offset();
    let byte_pointer = Block(block.get()).byte_pointer();
    if !offset.is_small_int() || !byte_pointer.is_small_int() {
        return Ok(());
    }
    let temporaries = Context(creating).temporaries();
    if !is_object(vm, temporaries)
        || offset.as_i32() < 0
        || offset.as_i32() as usize + call_args.len()
            > object::size_of(temporaries)
    {
        return Ok(());
    }

    let (_, stack_size) = method_frame_sizes(method)?;
    let stack =
        scope.pin(vm.allocate_ordinary(vm.special.array_class, stack_size));
    let context =
        vm.allocate_ordinary(vm.special.context_class, Context::FIELD_COUNT);

    let block_view = Block(block.get());
    let creating = block_view.creating();
    let creating_view = Context(creating);
    // The activation running this primitive is the `value` wrapper; the
    // block answers straight to that wrapper's sender, so its local return
    // becomes the result of the `value` send.
    let sender = Context(Process(process.get()).context()).sender();
    object::set_field_raw(context, 0, block_view.method());
    object::set_field_raw(context, 1, block_view.byte_pointer());
    object::set_field_raw(context, 2, Value::from_i32(0));
    object::set_field_raw(context, 3, creating_view.arguments());
    object::set_field_raw(context, 4, creating_view.temporaries());
    object::set_field_raw(context, 5, stack.get());
    object::set_field_raw(context, 6, sender);
    object::set_field_raw(context, 7, creating);

    let temporaries = creating_view.temporaries();
    let base = block_view.argument_offset().as_i32() as usize;
    for (i, arg) in call_args.iter().enumerate() {
        vm.store_field(temporaries, base + i, arg.get());
    }

    vm.store_field(process.get(), PROC_CONTEXT, context);
    Ok(())
}

// ── Returns ────────────────────────────────────────────────────────

/// Return `value` from the current activation to its sender; from the
/// bottom frame, store it in the Process result slot and finish.
pub(crate) unsafe fn return_value(
    vm: &mut Vm,
    process: Handle<'_>,
    value: Value,
) -> Step {
    let context = Process(process.get()).context();
    let sender = Context(context).sender();
    if !is_object(vm, sender) {
        vm.store_field(process.get(), PROC_RESULT, value);
        vm.store_field(process.get(), PROC_CONTEXT, vm.nil());
        return Err(ExecuteResult::Returned);
    }
    vm.store_field(process.get(), PROC_CONTEXT, sender);
    push(vm, sender, value)
}

/// Non-local return: scan sender contexts for the one whose identity
/// matches the block's creating context; it becomes current with `value`
/// pushed on its stack, discarding every intervening activation. An escaped
/// creating context is a runtime error.
pub(crate) unsafe fn unwind_to_creating(
    vm: &mut Vm,
    process: Handle<'_>,
    creating: Value,
    value: Value,
) -> Step {
    if !is_object(vm, creating) {
        return Err(ExecuteResult::Error);
    }
    let mut candidate = Context(Process(process.get()).context()).sender();
    while is_object(vm, candidate) {
        if candidate.same_as(creating) {
            vm.store_field(process.get(), PROC_CONTEXT, candidate);
            return push(vm, candidate, value);
        }
        candidate = Context(candidate).sender();
    }
    tracing::debug!("non-local return target escaped the sender chain");
    Err(ExecuteResult::Error)
}

// ── Stack and field helpers ────────────────────────────────────────

/// A heap reference that is not the nil singleton.
#[inline(always)]
unsafe fn is_object(vm: &Vm, value: Value) -> bool {
    value.is_ref() && !value.same_as(vm.nil()) && !object::is_binary(value)
}

#[inline(always)]
unsafe fn checked_field(obj: Value, index: usize) -> Result<Value, ExecuteResult> {
    if !obj.is_ref()
        || object::is_binary(obj)
        || index >= object::size_of(obj)
    {
        return Err(ExecuteResult::Error);
    }
    Ok(object::field_at(obj, index))
}

#[inline(always)]
unsafe fn stack_pointer(ctx: Context) -> Result<usize, ExecuteResult> {
    let sp = ctx.stack_pointer();
    if !sp.is_small_int() || sp.as_i32() < 0 {
        return Err(ExecuteResult::Error);
    }
    Ok(sp.as_i32() as usize)
}

unsafe fn push(vm: &mut Vm, context: Value, value: Value) -> Step {
    let ctx = Context(context);
    let sp = stack_pointer(ctx)?;
    let stack = ctx.stack();
    if !stack.is_ref()
        || object::is_binary(stack)
        || sp >= object::size_of(stack)
    {
        return Err(ExecuteResult::Error);
    }
    vm.store_field(stack, sp, value);
    vm.store_field(context, CTX_STACK_POINTER, Value::from_i32(sp as i32 + 1));
    Ok(())
}

pub(crate) unsafe fn pop(vm: &mut Vm, context: Value) -> Result<Value, ExecuteResult> {
    let ctx = Context(context);
    let sp = stack_pointer(ctx)?;
    if sp == 0 {
        return Err(ExecuteResult::Error);
    }
    let value = checked_field(ctx.stack(), sp - 1)?;
    vm.store_field(
        context,
        CTX_STACK_POINTER,
        Value::from_i32(sp as i32 - 1),
    );
    Ok(value)
}

unsafe fn top(context: Value) -> Result<Value, ExecuteResult> {
    let ctx = Context(context);
    let sp = stack_pointer(ctx)?;
    if sp == 0 {
        return Err(ExecuteResult::Error);
    }
    checked_field(ctx.stack(), sp - 1)
}

#[inline(always)]
fn bool_object(vm: &Vm, which: bool) -> Value {
    if which {
        vm.special.true_obj
    } else {
        vm.special.false_obj
    }
}

unsafe fn set_pc(vm: &mut Vm, context: Value, pc: usize) {
    vm.store_field(context, CTX_BYTE_POINTER, Value::from_i32(pc as i32));
}

unsafe fn method_frame_sizes(
    method: Value,
) -> Result<(usize, usize), ExecuteResult> {
    let m = Method(method);
    let temp_count = m.temp_count();
    let stack_size = m.stack_size();
    if !temp_count.is_small_int()
        || !stack_size.is_small_int()
        || temp_count.as_i32() < 0
        || stack_size.as_i32() < 0
    {
        return Err(ExecuteResult::Error);
    }
    Ok((temp_count.as_i32() as usize, stack_size.as_i32() as usize))
}
