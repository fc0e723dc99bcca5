use crate::{Header, Value, HEADER_BYTES};

// ── Raw object access ──────────────────────────────────────────────

/// View the header of a heap object.
///
/// # Safety
///
/// `v` must be a reference to a live heap object.
#[inline(always)]
pub unsafe fn header<'a>(v: Value) -> &'a Header {
    debug_assert!(v.is_ref());
    &*(v.as_ptr() as *const Header)
}

/// # Safety
///
/// As [`header`], and no other mutable reference to the object may be alive.
#[inline(always)]
pub unsafe fn header_mut<'a>(v: Value) -> &'a mut Header {
    debug_assert!(v.is_ref());
    &mut *(v.as_ptr() as *mut Header)
}

/// Field count of an ordinary object / byte count of a binary object.
///
/// # Safety
///
/// `v` must be a reference to a live heap object.
#[inline(always)]
pub unsafe fn size_of(v: Value) -> usize {
    header(v).count()
}

/// # Safety
///
/// `v` must be a reference to a live heap object.
#[inline(always)]
pub unsafe fn is_binary(v: Value) -> bool {
    header(v).is_binary()
}

/// The inline value body of an ordinary object.
///
/// # Safety
///
/// `v` must be a reference to a live ordinary heap object.
#[inline(always)]
pub unsafe fn fields<'a>(v: Value) -> &'a [Value] {
    let h = header(v);
    debug_assert!(!h.is_binary());
    let base = v.as_ptr().add(HEADER_BYTES) as *const Value;
    core::slice::from_raw_parts(base, h.count())
}

/// Pointer to field `index`, for root registration and barrier calls.
///
/// # Safety
///
/// `v` must be a reference to a live ordinary heap object and
/// `index < size_of(v)`.
#[inline(always)]
pub unsafe fn field_slot(v: Value, index: usize) -> *mut Value {
    debug_assert!(index < size_of(v));
    (v.as_ptr().add(HEADER_BYTES) as *mut Value).add(index)
}

/// # Safety
///
/// As [`field_slot`].
#[inline(always)]
pub unsafe fn field_at(v: Value, index: usize) -> Value {
    *field_slot(v, index)
}

/// Store without a write barrier. Only legal on freshly allocated objects
/// that have not been published yet, or through a caller that has already
/// run the barrier for this slot.
///
/// # Safety
///
/// As [`field_slot`].
#[inline(always)]
pub unsafe fn set_field_raw(v: Value, index: usize, value: Value) {
    *field_slot(v, index) = value;
}

/// The raw byte body of a binary object.
///
/// # Safety
///
/// `v` must be a reference to a live binary heap object.
#[inline(always)]
pub unsafe fn bytes<'a>(v: Value) -> &'a [u8] {
    let h = header(v);
    debug_assert!(h.is_binary());
    core::slice::from_raw_parts(v.as_ptr().add(HEADER_BYTES), h.count())
}

/// # Safety
///
/// As [`bytes`].
#[inline(always)]
pub unsafe fn bytes_mut<'a>(v: Value) -> &'a mut [u8] {
    let h = header(v);
    debug_assert!(h.is_binary());
    core::slice::from_raw_parts_mut(v.as_ptr().add(HEADER_BYTES), h.count())
}

/// # Safety
///
/// `v` must be a reference to a live binary heap object and
/// `index < size_of(v)`.
#[inline(always)]
pub unsafe fn byte_at(v: Value, index: usize) -> u8 {
    bytes(v)[index]
}

/// Class of any value: small integers resolve to the class passed in as
/// `small_int_class`, references to their header class.
///
/// # Safety
///
/// If `v` is a reference it must point to a live heap object.
#[inline(always)]
pub unsafe fn class_of(v: Value, small_int_class: Value) -> Value {
    if v.is_small_int() {
        small_int_class
    } else {
        header(v).class()
    }
}

/// Identity hash, stable across moves.
///
/// # Safety
///
/// `v` must be a reference to a live heap object.
#[inline(always)]
pub unsafe fn identity_hash(v: Value) -> u64 {
    header(v).hash()
}

// ── Typed views ────────────────────────────────────────────────────
//
// Smalltalk classes are runtime values, not host types. These wrappers only
// name the field indices of the handful of layouts the core manipulates
// directly; they do not own or type-check the object behind the value.

macro_rules! field_accessors {
    ($view:ident { $($idx:expr => $get:ident, $slot:ident;)* } count = $count:expr) => {
        #[derive(Clone, Copy, Debug)]
        pub struct $view(pub Value);

        impl $view {
            pub const FIELD_COUNT: usize = $count;

            $(
                /// # Safety
                ///
                /// The wrapped value must reference a live ordinary object
                /// with this layout.
                #[inline(always)]
                pub unsafe fn $get(self) -> Value {
                    field_at(self.0, $idx)
                }

                /// # Safety
                ///
                /// As the getter. The returned slot is only valid until the
                /// next collection.
                #[inline(always)]
                pub unsafe fn $slot(self) -> *mut Value {
                    field_slot(self.0, $idx)
                }
            )*
        }
    };
}

field_accessors!(Method {
    0 => selector, selector_slot;
    1 => class, class_slot;
    2 => bytecodes, bytecodes_slot;
    3 => literals, literals_slot;
    4 => arg_count, arg_count_slot;
    5 => temp_count, temp_count_slot;
    6 => stack_size, stack_size_slot;
} count = 7);

field_accessors!(Context {
    0 => method, method_slot;
    1 => byte_pointer, byte_pointer_slot;
    2 => stack_pointer, stack_pointer_slot;
    3 => arguments, arguments_slot;
    4 => temporaries, temporaries_slot;
    5 => stack, stack_slot;
    6 => sender, sender_slot;
    7 => creating, creating_slot;
} count = 8);

field_accessors!(Process {
    0 => context, context_slot;
    1 => result, result_slot;
} count = 2);

field_accessors!(Block {
    0 => argument_offset, argument_offset_slot;
    1 => byte_pointer, byte_pointer_slot;
    2 => creating, creating_slot;
    3 => method, method_slot;
} count = 4);

field_accessors!(ClassView {
    0 => name, name_slot;
    1 => parent, parent_slot;
    2 => methods, methods_slot;
    3 => instance_size, instance_size_slot;
} count = 4);

field_accessors!(DictionaryView {
    0 => keys, keys_slot;
    1 => values, values_slot;
} count = 2);

impl DictionaryView {
    /// Find the value stored under `key` (a symbol), comparing by identity
    /// first and by symbol bytes as a fallback.
    ///
    /// # Safety
    ///
    /// The wrapped value must reference a live dictionary whose keys array
    /// holds symbols (binary objects).
    pub unsafe fn lookup(self, key: Value) -> Option<Value> {
        let key_bytes = bytes(key);
        self.find(|candidate| {
            candidate.same_as(key)
                || (candidate.is_ref()
                    && is_binary(candidate)
                    && bytes(candidate) == key_bytes)
        })
    }

    /// Find the value whose key's symbol bytes equal `name`.
    ///
    /// # Safety
    ///
    /// As [`lookup`](DictionaryView::lookup).
    pub unsafe fn lookup_by_name(self, name: &str) -> Option<Value> {
        self.find(|candidate| {
            candidate.is_ref()
                && is_binary(candidate)
                && bytes(candidate) == name.as_bytes()
        })
    }

    unsafe fn find(self, matches: impl Fn(Value) -> bool) -> Option<Value> {
        if !self.0.is_ref()
            || is_binary(self.0)
            || size_of(self.0) < Self::FIELD_COUNT
        {
            return None;
        }
        let keys = self.keys();
        let values = self.values();
        if !keys.is_ref() || is_binary(keys) || !values.is_ref() {
            return None;
        }
        let count = size_of(keys).min(size_of(values));
        for i in 0..count {
            if matches(field_at(keys, i)) {
                return Some(field_at(values, i));
            }
        }
        None
    }
}

/// Symbol text, assuming well-formed image data.
///
/// # Safety
///
/// `v` must be a reference to a live binary heap object.
pub unsafe fn symbol_text<'a>(v: Value) -> &'a str {
    core::str::from_utf8(bytes(v)).unwrap_or("<non-utf8 symbol>")
}
