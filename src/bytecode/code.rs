//! The compiled form of one function/closure/method body (spec.md §4.5):
//! its instruction stream, constant pool, and the frame-shape metadata the
//! VM needs to allocate locals and the analyser already computed.
//!
//! Grounded on the teacher's per-function `Code` object (`bytecode::mod.rs`
//! / `function.rs`): a function is identified by a stable id, not a name
//! lookup, at call time; its name is kept only for diagnostics and for the
//! checkpoint wire format's "stable fully-qualified name + arity hash"
//! function id (spec.md §4.6).

use crate::bytecode::op::Op;
use crate::runtime::value::Value;
use crate::types::Type;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Code {
    pub fn_id: u32,
    pub qualified_name: String,
    pub arity: u32,
    pub ops: Vec<Op>,
    pub constants: Vec<Value>,
    /// Number of local slots this frame needs (parameters first).
    pub num_locals: u32,
    /// Number of capture cells this function allocates for *its own*
    /// variables that some nested closure closes over (spec.md §9) —
    /// distinct from the cells it itself receives via `captures`.
    pub num_owned_cells: u32,
    pub is_async: bool,
    pub param_types: Vec<Type>,
}

impl Code {
    #[must_use]
    pub fn new(fn_id: u32, qualified_name: String, arity: u32) -> Self {
        Self {
            fn_id,
            qualified_name,
            arity,
            ops: Vec::new(),
            constants: Vec::new(),
            num_locals: 0,
            num_owned_cells: 0,
            is_async: false,
            param_types: Vec::new(),
        }
    }

    /// Stable id used by the checkpoint wire format (spec.md §4.6): the
    /// function's qualified name plus its arity, hashed, so a restore can
    /// sanity-check the destination `Context`'s class/function registry
    /// still agrees with what was serialized.
    #[must_use]
    pub fn stable_id(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = ahash::AHasher::default();
        self.qualified_name.hash(&mut hasher);
        self.arity.hash(&mut hasher);
        hasher.finish()
    }
}
