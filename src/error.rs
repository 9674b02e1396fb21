//! Error/diagnostic surface (spec.md §7).
//!
//! Grounded on the teacher's `exception_private.rs`/`exception_public.rs`
//! split: a closed, `strum`-derived `ExcKind` taxonomy internally, and a
//! public, self-contained `Diagnostic`/`RuntimeError`/`CheckpointError`
//! surface that owns its message text and source position rather than
//! borrowing from the interner, so it can outlive a `Context` borrow and be
//! handed straight to a host's `completion` callback.

use std::fmt;

use strum::IntoStaticStr;

use crate::ast::Pos;

/// The closed taxonomy of error causes this crate can produce. Matches
/// `Display`/`EnumString`-style closed enums in the teacher's
/// `exception_private::ExcType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum ExcKind {
    // Lexer
    UnterminatedString,
    UnterminatedComment,
    UnexpectedChar,
    NumberOverflow,
    DollarKeyword,
    // Parser/resolver
    UnknownVariable,
    BuiltinClash,
    StaticAccessToInstanceField,
    MissingMandatoryField,
    TooManyArguments,
    InvalidParameterName,
    DuplicateImport,
    PackageMismatch,
    CyclicInheritance,
    FieldClash,
    FinalMethodOverride,
    UninitializedCapture,
    ConstNotSimple,
    DuplicateConstant,
    AutoCreateAsyncRejected,
    // Runtime
    NullDereference,
    DivisionByZero,
    CastFailure,
    IndexOutOfBounds,
    NumberTooLarge,
    BadFormatString,
    NonNumericElement,
    MissingMandatoryArgument,
    RegexFailure,
    // Checkpoint protocol
    OutOfOrderSeq,
    DuplicateDelete,
    UnknownClassOnRestore,
    MalformedByteStream,
    UnsupportedWireVersion,
    /// A combinator builtin's closure argument tried to suspend (`sleep`,
    /// `_checkpoint`) while running nested inside that builtin's own call,
    /// where there is no frame-stack position to resume into.
    CheckpointInsideCombinator,
}

impl fmt::Display for ExcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: &'static str = self.into();
        write!(f, "{s}")
    }
}

/// One compile-time diagnostic. `compileScript`/`compileClass` return a
/// `Vec<Diagnostic>` rather than stopping at the first error, matching
/// spec.md §7 ("surfaced as a collection of diagnostics").
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: ExcKind,
    pub message: String,
    pub pos: Pos,
}

impl Diagnostic {
    #[must_use]
    pub fn new(kind: ExcKind, message: impl Into<String>, pos: Pos) -> Self {
        Self { kind, message: message.into(), pos }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at line {}, column {}: {}", self.kind, self.pos.line + 1, self.pos.column + 1, self.message)
    }
}

impl std::error::Error for Diagnostic {}

/// A runtime error, terminal to the script that raised it and delivered to
/// the host's `completion` callback (spec.md §7). Script code cannot catch
/// this.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: ExcKind,
    pub message: String,
    pub source: String,
    pub offset: usize,
}

impl RuntimeError {
    #[must_use]
    pub fn new(kind: ExcKind, message: impl Into<String>, source: impl Into<String>, offset: usize) -> Self {
        Self { kind, message: message.into(), source: source.into(), offset }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (at offset {} in {})", self.kind, self.message, self.offset, self.source)
    }
}

impl std::error::Error for RuntimeError {}

/// Checkpoint-protocol errors, surfaced to the host rather than the script
/// (spec.md §7 category 3).
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointError {
    pub kind: ExcKind,
    pub message: String,
}

impl CheckpointError {
    #[must_use]
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CheckpointError {}

/// What a `Script` run terminates with when it doesn't produce a value:
/// either a script-visible `RuntimeError`, or compile diagnostics if the
/// caller is driving `eval`'s compile-then-run convenience path.
#[derive(Debug, Clone, PartialEq)]
pub enum Exception {
    Runtime(RuntimeError),
    Compile(Vec<Diagnostic>),
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exception::Runtime(e) => write!(f, "{e}"),
            Exception::Compile(diags) => {
                for (i, d) in diags.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{d}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for Exception {}

impl From<RuntimeError> for Exception {
    fn from(e: RuntimeError) -> Self {
        Self::Runtime(e)
    }
}

impl From<Vec<Diagnostic>> for Exception {
    fn from(diags: Vec<Diagnostic>) -> Self {
        Self::Compile(diags)
    }
}
