//! Bytecode representation and emission (spec.md §4.5): a flat opcode
//! enum (`op`), the per-function compiled unit it's grouped into
//! (`code`), a jump-patching emitter (`builder`), and the AST-to-bytecode
//! pass itself (`compiler`).

pub mod builder;
pub mod code;
pub mod compiler;
pub mod op;
