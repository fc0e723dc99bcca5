//! The image loader: memory-maps a serialized object graph and materializes
//! it through the memory manager.
//!
//! The stream is a sequence of records, one per named root, in the fixed
//! order of [`ROOT_NAMES`]. Each record is a tag byte followed by a payload;
//! words inside records are 32-bit big-endian. Ordinary and byte records
//! name their class by back-reference index into the `indirects` table, and
//! `previousObject` records resolve cycles through the same table. Parsing
//! is iterative (an explicit frame stack) — nested ordinary records nest
//! arbitrarily deep.
//!
//! Every materialized object is registered as a static root the moment it
//! exists, in chunked stable storage, so a collection triggered by any later
//! allocation finds and rewrites it. The chunks are released once the named
//! roots have been published through the (permanently rooted)
//! `SpecialObjects` table.

use std::io;
use std::path::Path;

use heap::MappedFile;
use object::{DictionaryView, Value};

use crate::Vm;

const TAG_INVALID: u8 = 0;
const TAG_ORDINARY: u8 = 1;
const TAG_INLINE_INTEGER: u8 = 2;
const TAG_BYTE_OBJECT: u8 = 3;
const TAG_PREVIOUS: u8 = 4;
const TAG_NIL: u8 = 5;

/// The named roots, in stream order.
pub const ROOT_NAMES: [&str; 15] = [
    "nilObject",
    "trueObject",
    "falseObject",
    "smallIntClass",
    "arrayClass",
    "blockClass",
    "contextClass",
    "stringClass",
    "integerClass",
    "globalsObject",
    "initialMethod",
    "badMethodSymbol",
    "binaryMessages[0]",
    "binaryMessages[1]",
    "binaryMessages[2]",
];

/// Load `path` into the VM's heap and publish the root table.
pub fn load_image(vm: &mut Vm, path: &Path) -> io::Result<()> {
    let map = MappedFile::open(path)?;
    let mut loader = Loader {
        vm,
        reader: Reader {
            bytes: map.as_slice(),
            pos: 0,
        },
        indirects: RootChunks::new(),
    };
    let result = loader.load();
    // Release the load-time roots whether or not the load succeeded.
    loader.indirects.release(loader.vm);
    result
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn read_u8(&mut self) -> io::Result<u8> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| invalid_data("truncated image"))?;
        self.pos += 1;
        Ok(b)
    }

    /// Words inside records are 32-bit big-endian.
    fn read_word(&mut self) -> io::Result<u32> {
        let end = self.pos + 4;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| invalid_data("truncated image word"))?;
        self.pos = end;
        Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    fn read_bytes(&mut self, count: usize) -> io::Result<&'a [u8]> {
        let end = self.pos + count;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| invalid_data("truncated image payload"))?;
        self.pos = end;
        Ok(slice)
    }
}

/// Stable storage for the back-reference table. Boxed chunks never move, so
/// each slot can be registered as a static root; the collector rewrites the
/// slots in place, which is exactly what makes `indirects` safe to read
/// after any allocation.
struct RootChunks {
    chunks: Vec<Box<[Value; Self::CHUNK]>>,
    len: usize,
}

impl RootChunks {
    const CHUNK: usize = 64;

    fn new() -> Self {
        Self {
            chunks: Vec::new(),
            len: 0,
        }
    }

    fn push(&mut self, vm: &mut Vm, value: Value) -> usize {
        let index = self.len;
        let within = index % Self::CHUNK;
        if within == 0 {
            self.chunks.push(Box::new([Value::EMPTY; Self::CHUNK]));
        }
        let chunk = self.chunks.last_mut().expect("chunk just pushed");
        chunk[within] = value;
        vm.memory.register_static_root(&mut chunk[within]);
        self.len += 1;
        index
    }

    fn get(&self, index: usize) -> io::Result<Value> {
        if index >= self.len {
            return Err(invalid_data("unresolved back reference"));
        }
        Ok(self.chunks[index / Self::CHUNK][index % Self::CHUNK])
    }

    fn release(&mut self, vm: &mut Vm) {
        for (i, chunk) in self.chunks.iter_mut().enumerate() {
            let used = (self.len - i * Self::CHUNK).min(Self::CHUNK);
            for slot in chunk[..used].iter_mut() {
                vm.memory.unregister_static_root(slot);
            }
        }
        self.chunks.clear();
        self.len = 0;
    }
}

struct Loader<'a, 'vm> {
    vm: &'vm mut Vm,
    reader: Reader<'a>,
    indirects: RootChunks,
}

/// An ordinary record whose children are still being materialized.
struct Frame {
    /// Index into `indirects` — never a raw pointer; children may collect.
    object_index: usize,
    next_field: usize,
    field_count: usize,
}

impl<'a, 'vm> Loader<'a, 'vm> {
    fn load(&mut self) -> io::Result<()> {
        for i in 0..ROOT_NAMES.len() {
            let root = self.parse_record()?;
            self.publish_root(i, root);
        }
        self.resolve_distinguished_classes()?;
        tracing::debug!(
            objects = self.indirects.len,
            bytes = self.reader.bytes.len(),
            "image loaded"
        );
        Ok(())
    }

    /// Store a named root into the special table as soon as it is parsed;
    /// the table's slots are static roots, so the root survives every later
    /// allocation. nil doubles as the allocator's field fill.
    fn publish_root(&mut self, index: usize, value: Value) {
        match index {
            0 => {
                self.vm.special.nil = value;
                self.vm.memory.set_nil(value);
            }
            1 => self.vm.special.true_obj = value,
            2 => self.vm.special.false_obj = value,
            3 => self.vm.special.small_int_class = value,
            4 => self.vm.special.array_class = value,
            5 => self.vm.special.block_class = value,
            6 => self.vm.special.context_class = value,
            7 => self.vm.special.string_class = value,
            8 => self.vm.special.integer_class = value,
            9 => self.vm.special.globals = value,
            10 => self.vm.special.initial_method = value,
            11 => self.vm.special.bad_method_symbol = value,
            n => self.vm.special.binary_selectors[n - 12] = value,
        }
    }

    /// Parse one complete record, including nested children.
    fn parse_record(&mut self) -> io::Result<Value> {
        let mut frames: Vec<Frame> = Vec::new();
        loop {
            let tag = self.reader.read_u8()?;
            let value = match tag {
                TAG_INVALID => {
                    return Err(invalid_data("invalid object record"))
                }
                TAG_ORDINARY => {
                    let class_index = self.reader.read_word()? as usize;
                    let field_count = self.reader.read_word()? as usize;
                    let object =
                        self.materialize_ordinary(class_index, field_count)?;
                    if field_count > 0 {
                        frames.push(Frame {
                            object_index: self.indirects.len - 1,
                            next_field: 0,
                            field_count,
                        });
                        continue;
                    }
                    object
                }
                TAG_INLINE_INTEGER => {
                    let word = self.reader.read_word()? as i32;
                    Value::try_from_i32(word).ok_or_else(|| {
                        invalid_data("inline integer outside the 31-bit range")
                    })?
                }
                TAG_BYTE_OBJECT => {
                    let class_index = self.reader.read_word()? as usize;
                    let length = self.reader.read_word()? as usize;
                    self.materialize_bytes(class_index, length)?
                }
                TAG_PREVIOUS => {
                    let index = self.reader.read_word()? as usize;
                    self.indirects.get(index)?
                }
                TAG_NIL => {
                    // The nil singleton is the image's first materialized
                    // object.
                    self.indirects.get(0)?
                }
                _ => return Err(invalid_data("unknown record tag")),
            };

            // Deliver the completed value to the innermost open record,
            // closing parents as they fill up.
            let mut completed = value;
            loop {
                let Some(frame) = frames.last_mut() else {
                    return Ok(completed);
                };
                let parent = self.indirects.get(frame.object_index)?;
                self.vm.store_field(parent, frame.next_field, completed);
                frame.next_field += 1;
                if frame.next_field == frame.field_count {
                    completed = parent;
                    frames.pop();
                } else {
                    break;
                }
            }
        }
    }

    /// Allocate and root an ordinary object. The class back-reference may
    /// name the object's own index (the image's bootstrap self-reference:
    /// nil's class before UndefinedObject exists).
    fn materialize_ordinary(
        &mut self,
        class_index: usize,
        field_count: usize,
    ) -> io::Result<Value> {
        let class = if class_index == self.indirects.len {
            Value::EMPTY // patched to self right after allocation
        } else {
            self.indirects.get(class_index)?
        };
        let object = self.vm.allocate_ordinary(class, field_count);
        if class.is_empty() {
            unsafe {
                object::header_mut(object).set_class(object);
            }
        }
        self.indirects.push(self.vm, object);
        Ok(object)
    }

    fn materialize_bytes(
        &mut self,
        class_index: usize,
        length: usize,
    ) -> io::Result<Value> {
        let class = self.indirects.get(class_index)?;
        // Payload is padded up to a word boundary in the stream. The slice
        // borrows the file mapping, which never moves, so it stays valid
        // across the allocation.
        let padded = (length + 3) & !3;
        let payload = self.reader.read_bytes(padded)?;
        let object = self.vm.allocate_binary(class, length);
        unsafe {
            object::bytes_mut(object).copy_from_slice(&payload[..length]);
        }
        self.indirects.push(self.vm, object);
        Ok(object)
    }

    /// The named roots cover only part of the distinguished classes; the
    /// rest are resolved from the globals dictionary, including the proper
    /// classes of the three singletons (materialized with bootstrap
    /// self-references).
    fn resolve_distinguished_classes(&mut self) -> io::Result<()> {
        let globals = self.vm.special.globals;
        if !globals.is_ref() {
            return Err(invalid_data("globals root is not an object"));
        }
        unsafe {
            let dict = DictionaryView(globals);
            let mut fetch = |name: &str| dict.lookup_by_name(name);
            if let Some(v) = fetch("Object") {
                self.vm.special.object_class = v;
            }
            if let Some(v) = fetch("Class") {
                self.vm.special.class_class = v;
            }
            if let Some(v) = fetch("Method") {
                self.vm.special.method_class = v;
            }
            if let Some(v) = fetch("Process") {
                self.vm.special.process_class = v;
            }
            if let Some(v) = fetch("Dictionary") {
                self.vm.special.dictionary_class = v;
            }
            if let Some(v) = fetch("Symbol") {
                self.vm.special.symbol_class = v;
            }
            for (name, singleton) in [
                ("UndefinedObject", self.vm.special.nil),
                ("True", self.vm.special.true_obj),
                ("False", self.vm.special.false_obj),
            ] {
                if let (Some(class), true) = (fetch(name), singleton.is_ref())
                {
                    object::header_mut(singleton).set_class(class);
                }
            }
        }
        // Classes the image's globals did not carry default to nil so no
        // empty sentinel survives into live state.
        let nil = self.vm.special.nil;
        for slot in [
            &mut self.vm.special.object_class,
            &mut self.vm.special.class_class,
            &mut self.vm.special.method_class,
            &mut self.vm.special.process_class,
            &mut self.vm.special.dictionary_class,
            &mut self.vm.special.symbol_class,
        ] {
            if slot.is_empty() {
                *slot = nil;
            }
        }
        Ok(())
    }
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::interpreter::{execute, ExecuteResult};
    use crate::materialize::{get_global, make_process};
    use crate::tests::test_settings;
    use bytecode::{BytecodeBuilder, BINARY_ADD};
    use heap::GenerationalHeap;
    use object::{ClassView, Process};
    use std::path::PathBuf;

    /// Writes well-formed image streams for the loader tests.
    pub(crate) struct ImageBuilder {
        bytes: Vec<u8>,
        next_index: u32,
    }

    impl ImageBuilder {
        pub(crate) fn new() -> Self {
            Self {
                bytes: Vec::new(),
                next_index: 0,
            }
        }

        fn word(&mut self, w: u32) {
            self.bytes.extend_from_slice(&w.to_be_bytes());
        }

        /// Begin an ordinary record; the caller must append exactly
        /// `field_count` child records. Returns the object's back-reference
        /// index.
        pub(crate) fn ordinary(&mut self, class: u32, field_count: u32) -> u32 {
            self.bytes.push(TAG_ORDINARY);
            self.word(class);
            self.word(field_count);
            let index = self.next_index;
            self.next_index += 1;
            index
        }

        pub(crate) fn inline_integer(&mut self, n: i32) {
            self.bytes.push(TAG_INLINE_INTEGER);
            self.word(n as u32);
        }

        pub(crate) fn byte_object(&mut self, class: u32, data: &[u8]) -> u32 {
            self.bytes.push(TAG_BYTE_OBJECT);
            self.word(class);
            self.word(data.len() as u32);
            self.bytes.extend_from_slice(data);
            while self.bytes.len() % 4 != 0 {
                self.bytes.push(0);
            }
            let index = self.next_index;
            self.next_index += 1;
            index
        }

        pub(crate) fn previous(&mut self, index: u32) {
            self.bytes.push(TAG_PREVIOUS);
            self.word(index);
        }

        pub(crate) fn nil(&mut self) {
            self.bytes.push(TAG_NIL);
        }

        pub(crate) fn raw_tag(&mut self, tag: u8) {
            self.bytes.push(tag);
        }

        pub(crate) fn write_to_temp(&self, name: &str) -> PathBuf {
            let mut path = std::env::temp_dir();
            path.push(format!(
                "smalt-image-{}-{}-{name}.img",
                std::process::id(),
                self.bytes.len()
            ));
            std::fs::write(&path, &self.bytes).expect("write test image");
            path
        }
    }

    /// A class record with an empty method dictionary:
    /// {name, parent, methods {keys, values}, instance size}.
    fn write_class(b: &mut ImageBuilder, name: &str) -> u32 {
        let class = b.ordinary(0, 4);
        b.byte_object(0, name.as_bytes());
        b.nil();
        b.ordinary(0, 2);
        b.ordinary(0, 0);
        b.ordinary(0, 0);
        b.inline_integer(0);
        class
    }

    /// The smallest well-formed image: every named root present, a globals
    /// dictionary with one entry, and an initial method computing `3 + 4`.
    fn minimal_image() -> ImageBuilder {
        let mut b = ImageBuilder::new();

        // Root 0, nilObject: class is the bootstrap self-reference.
        b.ordinary(0, 0);
        // Roots 1..2: the boolean singletons, nil-classed for simplicity.
        b.ordinary(0, 0);
        b.ordinary(0, 0);
        // Roots 3..8: the named classes.
        write_class(&mut b, "SmallInt");
        write_class(&mut b, "Array");
        write_class(&mut b, "Block");
        write_class(&mut b, "Context");
        write_class(&mut b, "String");
        write_class(&mut b, "Integer");

        // Root 9, globalsObject: {keys: [#Answer], values: [17]}.
        b.ordinary(0, 2);
        b.ordinary(0, 1);
        b.byte_object(0, b"Answer");
        b.ordinary(0, 1);
        b.inline_integer(17);

        // Root 10, initialMethod: ^ 3 + 4.
        let mut code = BytecodeBuilder::new();
        code.push_small_constant(3);
        code.push_small_constant(4);
        code.send_binary(BINARY_ADD);
        code.stack_return();
        let bytecode = code.finish();

        b.ordinary(0, 7);
        b.byte_object(0, b"boot"); // selector
        b.nil(); // owning class
        b.byte_object(0, &bytecode);
        b.ordinary(0, 0); // literals
        b.inline_integer(1); // argument count
        b.inline_integer(0); // temporary count
        b.inline_integer(4); // stack size

        // Roots 11..14: selectors.
        b.byte_object(0, b"doesNotUnderstand:");
        b.byte_object(0, b"<");
        b.byte_object(0, b"<=");
        b.byte_object(0, b"+");
        b
    }

    fn fresh_vm() -> Vm {
        Vm::new(Box::new(GenerationalHeap::new(test_settings())))
    }

    #[test]
    fn minimal_image_loads_and_publishes_roots() {
        let path = minimal_image().write_to_temp("minimal");
        let mut vm = fresh_vm();
        load_image(&mut vm, &path).expect("load");
        let _ = std::fs::remove_file(&path);

        assert!(vm.nil().is_ref());
        unsafe {
            // nil's bootstrap class is itself.
            assert!(object::header(vm.nil()).class().same_as(vm.nil()));
            assert_eq!(
                object::symbol_text(ClassView(vm.special.small_int_class).name()),
                "SmallInt"
            );
            assert_eq!(
                object::symbol_text(vm.special.bad_method_symbol),
                "doesNotUnderstand:"
            );
            assert_eq!(object::symbol_text(vm.special.binary_selectors[2]), "+");
        }
        assert_eq!(get_global(&vm, "Answer"), Some(Value::from_i32(17)));
        assert_eq!(get_global(&vm, "Nothing"), None);
    }

    #[test]
    fn initial_method_from_the_image_executes() {
        let path = minimal_image().write_to_temp("exec");
        let mut vm = fresh_vm();
        load_image(&mut vm, &path).expect("load");
        let _ = std::fs::remove_file(&path);

        let method = vm.special.initial_method;
        let process = make_process(&mut vm, method);
        let result = execute(&mut vm, process, 100);
        assert_eq!(result, ExecuteResult::Returned);
        unsafe {
            assert_eq!(Process(process).result(), Value::from_i32(7));
        }
    }

    #[test]
    fn previous_object_records_resolve_to_identical_objects() {
        // nilObject is a two-field holder whose fields are the same byte
        // object, the second via a back reference.
        let mut b = ImageBuilder::new();
        let holder = b.ordinary(0, 2);
        assert_eq!(holder, 0);
        let shared = b.byte_object(0, b"shared");
        b.previous(shared);
        for _ in 1..ROOT_NAMES.len() {
            b.nil();
        }

        let path = b.write_to_temp("prev");
        let mut vm = fresh_vm();
        load_image(&mut vm, &path).expect("load");
        let _ = std::fs::remove_file(&path);

        unsafe {
            let nil = vm.nil();
            let first = object::field_at(nil, 0);
            let second = object::field_at(nil, 1);
            assert!(first.same_as(second), "back reference must not copy");
            assert_eq!(object::bytes(first), b"shared");
        }
    }

    #[test]
    fn cycles_resolve_through_the_back_reference_table() {
        // nilObject holds a field referencing itself via previousObject.
        let mut b = ImageBuilder::new();
        b.ordinary(0, 1);
        b.previous(0);
        // Remaining roots: all back references to nil.
        for _ in 1..ROOT_NAMES.len() {
            b.nil();
        }
        let path = b.write_to_temp("cycle");
        let mut vm = fresh_vm();
        load_image(&mut vm, &path).expect("load");
        let _ = std::fs::remove_file(&path);

        let nil = vm.nil();
        unsafe {
            assert!(object::field_at(nil, 0).same_as(nil), "cycle broken");
        }
    }

    #[test]
    fn malformed_images_are_rejected() {
        // Tag 0 aborts.
        let mut b = ImageBuilder::new();
        b.raw_tag(TAG_INVALID);
        let path = b.write_to_temp("tag0");
        assert!(load_image(&mut fresh_vm(), &path).is_err());
        let _ = std::fs::remove_file(&path);

        // Forward back-reference aborts.
        let mut b = ImageBuilder::new();
        b.previous(7);
        let path = b.write_to_temp("fwd");
        assert!(load_image(&mut fresh_vm(), &path).is_err());
        let _ = std::fs::remove_file(&path);

        // Unknown tag aborts.
        let mut b = ImageBuilder::new();
        b.raw_tag(9);
        let path = b.write_to_temp("tag9");
        assert!(load_image(&mut fresh_vm(), &path).is_err());
        let _ = std::fs::remove_file(&path);

        // Truncated stream aborts.
        let mut b = ImageBuilder::new();
        b.ordinary(0, 3);
        b.inline_integer(1);
        let path = b.write_to_temp("trunc");
        assert!(load_image(&mut fresh_vm(), &path).is_err());
        let _ = std::fs::remove_file(&path);

        // Out-of-range inline integer aborts.
        let mut b = ImageBuilder::new();
        b.ordinary(0, 1);
        b.inline_integer(i32::MIN);
        let path = b.write_to_temp("range");
        assert!(load_image(&mut fresh_vm(), &path).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn loaded_image_survives_collection_pressure() {
        let path = minimal_image().write_to_temp("pressure");
        let mut vm = Vm::new(Box::new(GenerationalHeap::new(
            heap::HeapSettings {
                heap_size: 16 * 1024,
                poison: true,
            },
        )));
        load_image(&mut vm, &path).expect("load");
        let _ = std::fs::remove_file(&path);

        // Churn garbage so minor collections move the image's object graph
        // around repeatedly.
        for _ in 0..2000 {
            vm.allocate_ordinary(vm.special.array_class, 8);
        }
        assert!(vm.memory.stats().collections > 0);
        unsafe {
            assert_eq!(
                object::symbol_text(ClassView(vm.special.array_class).name()),
                "Array"
            );
            assert_eq!(
                object::symbol_text(vm.special.binary_selectors[0]),
                "<"
            );
        }
        assert_eq!(get_global(&vm, "Answer"), Some(Value::from_i32(17)));
    }
}
