//! Numbered primitive operations. A primitive either produces a value —
//! which the interpreter returns to the caller frame — or fails, in which
//! case control falls through to the Smalltalk fallback bytecodes after the
//! primitive instruction. Failures are silent by design: wrong operand
//! kinds, division by zero, and 31-bit overflow all take the fallback path.

use std::io::Write;

use object::{Value, SMALL_INT_MAX, SMALL_INT_MIN};

use crate::handles::HandleScope;
use crate::interpreter::ExecuteResult;
use crate::Vm;

pub const PRIM_IDENTITY: u8 = 1;
pub const PRIM_CLASS: u8 = 2;
pub const PRIM_PUT_CHAR: u8 = 3;
pub const PRIM_SIZE: u8 = 4;
pub const PRIM_NEW_ORDINARY: u8 = 7;
/// Handled directly by the interpreter (it switches contexts).
pub const PRIM_BLOCK_INVOKE: u8 = 8;
pub const PRIM_ADD: u8 = 10;
pub const PRIM_SUBTRACT: u8 = 11;
pub const PRIM_MULTIPLY: u8 = 12;
pub const PRIM_DIVIDE: u8 = 13;
pub const PRIM_MODULO: u8 = 14;
pub const PRIM_LESS: u8 = 15;
pub const PRIM_EQUAL: u8 = 16;
pub const PRIM_NEW_BINARY: u8 = 20;
pub const PRIM_BYTE_AT: u8 = 21;
pub const PRIM_BYTE_AT_PUT: u8 = 22;
pub const PRIM_FIELD_AT: u8 = 30;
pub const PRIM_FIELD_AT_PUT: u8 = 31;
pub const PRIM_FLUSH_CACHE: u8 = 34;

/// Execute primitive `number` over `args` (popped in push order).
/// `Ok(Some(v))` is success, `Ok(None)` is failure (fall through).
///
/// # Safety
///
/// All reference args must point to live heap objects.
pub(crate) unsafe fn call(
    vm: &mut Vm,
    number: u8,
    args: &[Value],
) -> Result<Option<Value>, ExecuteResult> {
    let result = match number {
        PRIM_IDENTITY => match args {
            [a, b] => Some(bool_object(vm, a.same_as(*b))),
            _ => None,
        },

        PRIM_CLASS => match args {
            [v] => Some(object::class_of(*v, vm.special.small_int_class)),
            _ => None,
        },

        PRIM_PUT_CHAR => match args {
            [v] if v.is_small_int() => {
                let n = v.as_i32();
                if (0..=0x10FFFF).contains(&n) {
                    if let Some(c) = char::from_u32(n as u32) {
                        let mut out = std::io::stdout();
                        let _ = write!(out, "{c}");
                        let _ = out.flush();
                        Some(*v)
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
            _ => None,
        },

        PRIM_SIZE => match args {
            [v] if v.is_small_int() => Some(Value::from_i32(0)),
            [v] if v.is_ref() => {
                Some(Value::from_i32(object::size_of(*v) as i32))
            }
            _ => None,
        },

        PRIM_NEW_ORDINARY | PRIM_NEW_BINARY => match args {
            [class, size]
                if class.is_ref()
                    && size.is_small_int()
                    && size.as_i32() >= 0 =>
            {
                let count = size.as_i32() as usize;
                let scope = HandleScope::new(vm);
                let class = scope.pin(*class);
                let v = if number == PRIM_NEW_ORDINARY {
                    vm.allocate_ordinary(class.get(), count)
                } else {
                    vm.allocate_binary(class.get(), count)
                };
                Some(v)
            }
            _ => None,
        },

        PRIM_ADD..=PRIM_EQUAL => small_int_op(vm, number, args),

        PRIM_BYTE_AT => match args {
            [v, index]
                if v.is_ref()
                    && object::is_binary(*v)
                    && index.is_small_int() =>
            {
                byte_index(*v, *index)
                    .map(|i| Value::from_i32(object::byte_at(*v, i) as i32))
            }
            _ => None,
        },

        PRIM_BYTE_AT_PUT => match args {
            [v, index, byte]
                if v.is_ref()
                    && object::is_binary(*v)
                    && index.is_small_int()
                    && byte.is_small_int()
                    && (0..=255).contains(&byte.as_i32()) =>
            {
                match byte_index(*v, *index) {
                    Some(i) => {
                        object::bytes_mut(*v)[i] = byte.as_i32() as u8;
                        Some(*v)
                    }
                    None => None,
                }
            }
            _ => None,
        },

        PRIM_FIELD_AT => match args {
            [v, index]
                if v.is_ref()
                    && !object::is_binary(*v)
                    && index.is_small_int() =>
            {
                field_index(*v, *index).map(|i| object::field_at(*v, i))
            }
            _ => None,
        },

        PRIM_FIELD_AT_PUT => match args {
            [v, index, value]
                if v.is_ref()
                    && !object::is_binary(*v)
                    && index.is_small_int() =>
            {
                match field_index(*v, *index) {
                    Some(i) => {
                        vm.store_field(*v, i, *value);
                        Some(*v)
                    }
                    None => None,
                }
            }
            _ => None,
        },

        PRIM_FLUSH_CACHE => {
            // Structural image mutation: the Smalltalk side just changed a
            // method dictionary.
            vm.cache.flush();
            Some(args.first().copied().unwrap_or(vm.nil()))
        }

        _ => {
            tracing::debug!(number, "unknown primitive");
            None
        }
    };
    Ok(result)
}

fn small_int_op(vm: &Vm, number: u8, args: &[Value]) -> Option<Value> {
    let [lhs, rhs] = args else { return None };
    if !lhs.is_small_int() || !rhs.is_small_int() {
        return None;
    }
    let (l, r) = (lhs.as_i32() as i64, rhs.as_i32() as i64);
    let arithmetic = |result: i64| -> Option<Value> {
        if (SMALL_INT_MIN as i64..=SMALL_INT_MAX as i64).contains(&result) {
            Some(Value::from_i32(result as i32))
        } else {
            None
        }
    };
    match number {
        PRIM_ADD => arithmetic(l + r),
        PRIM_SUBTRACT => arithmetic(l - r),
        PRIM_MULTIPLY => arithmetic(l * r),
        PRIM_DIVIDE => {
            if r == 0 {
                None
            } else {
                arithmetic(l / r)
            }
        }
        PRIM_MODULO => {
            if r == 0 {
                None
            } else {
                arithmetic(l % r)
            }
        }
        PRIM_LESS => Some(bool_object(vm, l < r)),
        PRIM_EQUAL => Some(bool_object(vm, l == r)),
        _ => None,
    }
}

/// 1-based Smalltalk index into the byte body.
unsafe fn byte_index(v: Value, index: Value) -> Option<usize> {
    let i = index.as_i32();
    if i >= 1 && (i as usize) <= object::size_of(v) {
        Some(i as usize - 1)
    } else {
        None
    }
}

/// 1-based Smalltalk index into the field body.
unsafe fn field_index(v: Value, index: Value) -> Option<usize> {
    let i = index.as_i32();
    if i >= 1 && (i as usize) <= object::size_of(v) {
        Some(i as usize - 1)
    } else {
        None
    }
}

fn bool_object(vm: &Vm, which: bool) -> Value {
    if which {
        vm.special.true_obj
    } else {
        vm.special.false_obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_vm;

    fn small(n: i32) -> Value {
        Value::from_i32(n)
    }

    #[test]
    fn arithmetic_produces_small_integers() {
        let mut vm = test_vm();
        unsafe {
            assert_eq!(
                call(&mut vm, PRIM_ADD, &[small(3), small(4)]).unwrap(),
                Some(small(7))
            );
            assert_eq!(
                call(&mut vm, PRIM_SUBTRACT, &[small(3), small(4)]).unwrap(),
                Some(small(-1))
            );
            assert_eq!(
                call(&mut vm, PRIM_MULTIPLY, &[small(6), small(7)]).unwrap(),
                Some(small(42))
            );
            assert_eq!(
                call(&mut vm, PRIM_DIVIDE, &[small(9), small(2)]).unwrap(),
                Some(small(4))
            );
            assert_eq!(
                call(&mut vm, PRIM_MODULO, &[small(9), small(2)]).unwrap(),
                Some(small(1))
            );
        }
    }

    #[test]
    fn division_by_zero_and_overflow_fail_silently() {
        let mut vm = test_vm();
        unsafe {
            assert_eq!(
                call(&mut vm, PRIM_DIVIDE, &[small(1), small(0)]).unwrap(),
                None
            );
            assert_eq!(
                call(&mut vm, PRIM_MODULO, &[small(1), small(0)]).unwrap(),
                None
            );
            assert_eq!(
                call(
                    &mut vm,
                    PRIM_ADD,
                    &[small(object::SMALL_INT_MAX), small(1)]
                )
                .unwrap(),
                None
            );
            assert_eq!(
                call(
                    &mut vm,
                    PRIM_MULTIPLY,
                    &[small(object::SMALL_INT_MAX), small(2)]
                )
                .unwrap(),
                None
            );
            // Non-integer operands fail too.
            let nil = vm.nil();
            assert_eq!(
                call(&mut vm, PRIM_ADD, &[nil, small(1)]).unwrap(),
                None
            );
        }
    }

    #[test]
    fn comparisons_answer_the_boolean_singletons() {
        let mut vm = test_vm();
        unsafe {
            assert_eq!(
                call(&mut vm, PRIM_LESS, &[small(1), small(2)]).unwrap(),
                Some(vm.special.true_obj)
            );
            assert_eq!(
                call(&mut vm, PRIM_EQUAL, &[small(2), small(2)]).unwrap(),
                Some(vm.special.true_obj)
            );
            let nil = vm.nil();
            assert_eq!(
                call(&mut vm, PRIM_IDENTITY, &[nil, nil]).unwrap(),
                Some(vm.special.true_obj)
            );
            assert_eq!(
                call(&mut vm, PRIM_IDENTITY, &[nil, small(1)]).unwrap(),
                Some(vm.special.false_obj)
            );
        }
    }

    #[test]
    fn class_and_size_primitives() {
        let mut vm = test_vm();
        unsafe {
            assert_eq!(
                call(&mut vm, PRIM_CLASS, &[small(5)]).unwrap(),
                Some(vm.special.small_int_class)
            );
            let nil = vm.nil();
            let nil_class = object::header(nil).class();
            assert_eq!(
                call(&mut vm, PRIM_CLASS, &[nil]).unwrap(),
                Some(nil_class)
            );
            assert_eq!(
                call(&mut vm, PRIM_SIZE, &[small(5)]).unwrap(),
                Some(small(0))
            );
            let sym = crate::materialize::make_symbol(&mut vm, "abcd");
            assert_eq!(
                call(&mut vm, PRIM_SIZE, &[sym]).unwrap(),
                Some(small(4))
            );
        }
    }

    #[test]
    fn allocation_primitives_build_fresh_objects() {
        let mut vm = test_vm();
        unsafe {
            let class = vm.special.array_class;
            let arr = call(&mut vm, PRIM_NEW_ORDINARY, &[class, small(3)])
                .unwrap()
                .expect("allocates");
            assert_eq!(object::size_of(arr), 3);
            assert!(object::field_at(arr, 0).same_as(vm.nil()));

            let class = vm.special.string_class;
            let bin = call(&mut vm, PRIM_NEW_BINARY, &[class, small(5)])
                .unwrap()
                .expect("allocates");
            assert!(object::is_binary(bin));
            assert_eq!(object::size_of(bin), 5);
        }
    }

    #[test]
    fn byte_and_field_access_is_one_based_and_bounds_checked() {
        let mut vm = test_vm();
        unsafe {
            let sym = crate::materialize::make_symbol(&mut vm, "xy");
            assert_eq!(
                call(&mut vm, PRIM_BYTE_AT, &[sym, small(1)]).unwrap(),
                Some(small('x' as i32))
            );
            assert_eq!(
                call(&mut vm, PRIM_BYTE_AT, &[sym, small(3)]).unwrap(),
                None
            );
            assert_eq!(
                call(&mut vm, PRIM_BYTE_AT_PUT, &[sym, small(2), small(90)])
                    .unwrap(),
                Some(sym)
            );
            assert_eq!(object::bytes(sym), b"xZ");

            let arr =
                crate::materialize::make_array(&mut vm, &[small(10), small(20)]);
            assert_eq!(
                call(&mut vm, PRIM_FIELD_AT, &[arr, small(2)]).unwrap(),
                Some(small(20))
            );
            assert_eq!(
                call(&mut vm, PRIM_FIELD_AT, &[arr, small(0)]).unwrap(),
                None
            );
            assert_eq!(
                call(&mut vm, PRIM_FIELD_AT_PUT, &[arr, small(1), small(99)])
                    .unwrap(),
                Some(arr)
            );
            assert_eq!(object::field_at(arr, 0), small(99));
        }
    }

    #[test]
    fn flush_cache_empties_the_method_cache() {
        let mut vm = test_vm();
        let sel = crate::materialize::make_symbol(&mut vm, "x");
        let cls = vm.special.object_class;
        vm.cache.insert(sel, cls, Value::from_i32(1));
        let nil = vm.nil();
        unsafe {
            call(&mut vm, PRIM_FLUSH_CACHE, &[nil]).unwrap();
        }
        assert!(vm.cache.lookup(sel, cls).is_none());
    }
}
