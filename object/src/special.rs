use crate::Value;

/// Well-known singletons and distinguished classes, resolved once at image
/// load and handed by reference to every component.
///
/// `nil`, `true` and `false` are relied upon by identity throughout the
/// interpreter. **Objects are not allocated here** — the image loader (or the
/// bootstrap) stores tagged references after materializing them, and the VM
/// registers every slot of this struct as a static GC root.
pub struct SpecialObjects {
    // ── Singletons ─────────────────────────────────────────────────
    pub nil: Value,
    pub true_obj: Value,
    pub false_obj: Value,

    // ── Image roots ────────────────────────────────────────────────
    /// The global name table (a Dictionary).
    pub globals: Value,
    /// Method the host wraps in the bootstrap Process.
    pub initial_method: Value,
    /// Selector sent on a total lookup miss (`doesNotUnderstand:`).
    pub bad_method_symbol: Value,
    /// Selectors for the three inlined binary operations: `<`, `<=`, `+`.
    pub binary_selectors: [Value; 3],

    // ── Distinguished classes ──────────────────────────────────────
    pub object_class: Value,
    pub small_int_class: Value,
    pub class_class: Value,
    pub method_class: Value,
    pub context_class: Value,
    pub process_class: Value,
    pub array_class: Value,
    pub dictionary_class: Value,
    pub block_class: Value,
    pub string_class: Value,
    pub symbol_class: Value,
    pub integer_class: Value,
}

impl SpecialObjects {
    /// A table with every slot set to [`Value::EMPTY`], to be filled by the
    /// image loader or the bootstrap.
    pub fn empty() -> Self {
        Self {
            nil: Value::EMPTY,
            true_obj: Value::EMPTY,
            false_obj: Value::EMPTY,
            globals: Value::EMPTY,
            initial_method: Value::EMPTY,
            bad_method_symbol: Value::EMPTY,
            binary_selectors: [Value::EMPTY; 3],
            object_class: Value::EMPTY,
            small_int_class: Value::EMPTY,
            class_class: Value::EMPTY,
            method_class: Value::EMPTY,
            context_class: Value::EMPTY,
            process_class: Value::EMPTY,
            array_class: Value::EMPTY,
            dictionary_class: Value::EMPTY,
            block_class: Value::EMPTY,
            string_class: Value::EMPTY,
            symbol_class: Value::EMPTY,
            integer_class: Value::EMPTY,
        }
    }

    /// Every slot of the table, for static-root registration. The struct
    /// must live at a stable address (the VM boxes it).
    pub fn slots(&mut self) -> Vec<*mut Value> {
        let mut slots: Vec<*mut Value> = vec![
            &mut self.nil,
            &mut self.true_obj,
            &mut self.false_obj,
            &mut self.globals,
            &mut self.initial_method,
            &mut self.bad_method_symbol,
            &mut self.object_class,
            &mut self.small_int_class,
            &mut self.class_class,
            &mut self.method_class,
            &mut self.context_class,
            &mut self.process_class,
            &mut self.array_class,
            &mut self.dictionary_class,
            &mut self.block_class,
            &mut self.string_class,
            &mut self.symbol_class,
            &mut self.integer_class,
        ];
        for sel in self.binary_selectors.iter_mut() {
            slots.push(sel);
        }
        slots
    }
}
