//! The uniform tagged object model: word-sized [`Value`]s that are either
//! tagged 31-bit integers or references to heap objects carrying a
//! three-word [`Header`], plus index-based views of the handful of layouts
//! the execution core manipulates directly.

mod header;
mod objects;
mod special;
mod value;

pub use header::{pad_to_word, Header, SizeFlags, HEADER_BYTES};
pub use objects::{
    byte_at, bytes, bytes_mut, class_of, field_at, field_slot, fields, header,
    header_mut, identity_hash, is_binary, set_field_raw, size_of, symbol_text,
    Block, ClassView, Context, DictionaryView, Method, Process,
};
pub use special::SpecialObjects;
pub use value::{Value, SMALL_INT_MAX, SMALL_INT_MIN};
