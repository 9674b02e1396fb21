//! The concrete opcode set this crate targets. Spec.md §4.5 deliberately
//! doesn't enumerate opcodes ("the spec defines the semantic bytecode and
//! the continuation ABI, not the exact opcodes") — this is this crate's
//! own closed choice, grounded on the teacher's `bytecode::mod.rs`/
//! `bytecode::builder.rs` split between a flat instruction enum and a
//! builder that patches forward jumps.

use crate::ast::BinOp;
use crate::intern::StringId;
use crate::types::Type;

/// One bytecode instruction. Operands that index into a function's
/// constant pool, local-slot array, or capture-cell array are plain
/// `u32`s; `Code::disassemble` (test-only) turns them back into readable
/// text.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Op {
    /// Push a constant from the function's constant pool.
    Const(u32),
    PushNull,
    PushTrue,
    PushFalse,
    Pop,
    Dup,
    /// Swap the top two operand-stack slots (needed by postfix `++`/`--`,
    /// which must leave the pre-increment value on the stack).
    Swap,

    LoadLocal(u32),
    StoreLocal(u32),
    /// Read/write through a capture cell (spec.md §9's heap-allocated
    /// capture cells — shared by every closure over the same variable).
    LoadCaptured(u32),
    StoreCaptured(u32),
    LoadGlobal(StringId),
    StoreGlobal(StringId),
    LoadField(u32),
    StoreField(u32),
    /// Writes a named field on a dynamically (`ANY`-typed) dispatched
    /// receiver, resolved against the receiver's runtime class at
    /// execution time via `FunctionTable::lookup_field`. Field *reads* on
    /// a dynamic receiver instead fall through `CallMethod`'s zero-arg
    /// property-access convention.
    StoreFieldByName(StringId),
    /// `this` for instance methods.
    LoadThis,

    /// Allocates a fresh heap cell holding the popped value and records it
    /// as this frame's owned capture cell `u32` (spec.md §9) — emitted
    /// exactly once, at the declaration site of a local some nested
    /// closure captures (a `VarDecl` init, or a captured parameter's
    /// prologue copy).
    MakeOwnedCell(u32),
    /// Reads this frame's own capture cell `u32` — used instead of
    /// `LoadLocal` for every later reference to a captured-own local
    /// within its declaring function.
    LoadOwnedCell(u32),
    /// Writes through this frame's own capture cell `u32` in place,
    /// leaving every closure that captured it seeing the update.
    StoreOwnedCell(u32),

    Binary(BinOp),
    Neg,
    Not,
    BitNot,
    PreIncr,
    PreDecr,
    PostIncr,
    PostDecr,

    Jump(u32),
    JumpIfFalse(u32),
    JumpIfTrue(u32),
    /// Jumps if the top of stack is `null`, without popping it — used by
    /// `?:`/`?.`/`?[` null-safe chains.
    JumpIfNull(u32),

    MakeList(u32),
    MakeMap(u32),
    /// Allocates a `function-value` capturing the `u32` named capture
    /// cells (by current-frame capture-cell/local index, resolved at
    /// compile time) for function id `u32`.
    MakeClosure { fn_id: u32, captures: Vec<CaptureSource> },

    /// Calls the value on top of the operand stack (below which are its
    /// `argc` positional arguments), or — when the analyser marked the
    /// call statically known and non-dynamic — a direct call to `fn_id`.
    CallDynamic(u32),
    CallDirect { fn_id: u32, argc: u32 },
    /// A call where the caller used named arguments. The compiler has
    /// already resolved each name to the callee's parameter slot (via its
    /// `FunctionDescriptor`), so `arg_slots[i]` is where the VM stores the
    /// `i`-th popped value; slots with no corresponding entry keep the
    /// `Null` the callee's own default-value prologue will overwrite.
    CallNamed { fn_id: u32, arg_slots: Vec<u32> },
    CallMethod { name: StringId, argc: u32 },
    CallBuiltin { name: StringId, argc: u32 },
    /// Allocates a new instance of `class` with `field_count` fields, all
    /// initially `Null`, and pushes it. Construction proper happens in a
    /// follow-up `CallInit` — this opcode only reserves the heap slot so
    /// the init function can see `this` before any field is set.
    New { class: String, field_count: u32 },
    /// Calls the synthetic per-class `init` function `fn_id` with `this`
    /// (already on the stack, pushed by a preceding `New`) and `argc`
    /// positional arguments above it; leaves the constructed instance on
    /// the stack (spec.md §4.5's "new X(...) compiles to an init call").
    CallInit { fn_id: u32, argc: u32 },

    Cast(Type),
    ConvertTo(Type),
    InstanceOf(String),

    ArrayGet,
    /// Pops value, index, array (in that order, matching `StoreField`'s
    /// value-then-receiver convention) and writes `array[index] = value`.
    ArraySet,
    ArrayLength,

    Return,
    Print { newline: bool },
    Die,

    RegexMatch { negated: bool },
    RegexSubst,

    /// The uniform "load pending result" opcode emitted at every
    /// resumption point (spec.md §4.5 point 3): after any call, pushes
    /// whatever value the VM placed in the frame's pending-result slot.
    LoadPendingResult,
}

/// Where `MakeClosure` reads a captured cell from: the defining frame's
/// own capture-cell array (for a variable captured transitively) or one
/// of its locals (for a variable this frame itself promoted to a cell).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub enum CaptureSource {
    FromLocalCell(u32),
    FromOuterCapture(u32),
}
