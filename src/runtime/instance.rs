//! A class instance (spec.md §4.4): fields in declaration order, with
//! field *names* resolved to slot indices at compile time by the
//! resolver/compiler (via `ClassDescriptor`) so the VM never does a
//! name lookup on the hot path.
//!
//! Grounded on the teacher's instance representation in `value.rs`/
//! `types/class.rs`: a tag identifying the class plus a flat field-slot
//! array, rather than a `HashMap<String, Value>` per instance.

use crate::runtime::value::Value;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Instance {
    pub class_name: String,
    /// Field values in the class's declaration order (including
    /// inherited fields, base class first), matching the slot indices
    /// `ClassDescriptor::field` hands out.
    pub fields: Vec<Value>,
}

impl Instance {
    #[must_use]
    pub fn new(class_name: String, field_count: usize) -> Self {
        Self { class_name, fields: vec![Value::Null; field_count] }
    }

    #[must_use]
    pub fn field(&self, index: u32) -> &Value {
        &self.fields[index as usize]
    }

    pub fn set_field(&mut self, index: u32, value: Value) {
        self.fields[index as usize] = value;
    }
}
