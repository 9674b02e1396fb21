//! A function-value: a function id plus the capture cells it closed
//! over at the point it was created (spec.md §9). Plain top-level
//! functions never need one (they're called by id directly); a closure
//! literal, an inner function referring to an enclosing local, or a
//! bound method reference all produce one.
//!
//! Grounded on the teacher's `function.rs` closure-value shape: a
//! function pointer/id plus its captured environment, rather than a
//! reified heap-allocated stack frame.

use crate::runtime::heap::HeapId;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FunctionValue {
    pub fn_id: u32,
    /// Capture cells, in the order the compiler assigned capture-slot
    /// indices for this function body. Each points at a
    /// `HeapObject::Cell` shared with whatever frame owns the captured
    /// variable (and with any sibling closure that captured it too).
    pub captures: Vec<HeapId>,
    /// Set for bound method references (`obj.&method`): the receiver is
    /// passed as an implicit leading argument at call time.
    pub bound_receiver: Option<crate::runtime::value::Value>,
}

impl FunctionValue {
    #[must_use]
    pub fn new(fn_id: u32, captures: Vec<HeapId>) -> Self {
        Self { fn_id, captures, bound_receiver: None }
    }

    #[must_use]
    pub fn bound(fn_id: u32, captures: Vec<HeapId>, receiver: crate::runtime::value::Value) -> Self {
        Self { fn_id, captures, bound_receiver: Some(receiver) }
    }
}
