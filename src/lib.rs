//! Jactl core: an embeddable dynamic scripting language whose bytecode
//! VM can suspend mid-call at an async built-in, serialize its full
//! call stack and heap to bytes, and resume from that snapshot later
//! (possibly in a different process).
//!
//! The pipeline runs lexer → parser → resolver → analyser → compiler
//! into a [`runtime::vm::FunctionTable`], which [`Context`] loads into
//! a [`Script`] a host drives with [`Script::run_sync`] or
//! [`Script::run`]. A script that reaches `_checkpoint` produces a
//! [`runtime::vm::Continuation`] the host can serialize via
//! [`checkpoint::encode`] and later restore with
//! [`Context::recover_checkpoint`].

pub mod analyser;
pub mod ast;
pub mod builtins;
pub mod bytecode;
pub mod checkpoint;
pub mod class;
pub mod context;
pub mod error;
pub mod intern;
pub mod lexer;
pub mod parser;
pub mod regex_lit;
pub mod resolver;
pub mod resource;
pub mod runtime;
pub mod script;
pub mod token;
pub mod tracer;
pub mod types;

pub use builtins::Registry;
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore};
pub use context::{compile_class, compile_script, eval, Context, ContextBuilder};
pub use error::{CheckpointError, Diagnostic, Exception, ExcKind, RuntimeError};
pub use runtime::value::{Decimal, Value};
pub use script::Script;
