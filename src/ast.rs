//! Untyped-then-typed AST produced by the parser and annotated in place by
//! the resolver/analyser (spec.md §3, §4.2).
//!
//! `Expr` carries a `result_type` cell the resolver fills in and a
//! `result_used` flag, false by default, that the parser sets on the
//! trailing expression-statement of a function/script body so the
//! compiler leaves its value on the stack as the implicit return instead
//! of popping it.

use std::cell::{Cell, RefCell};

use crate::class::{CallKind, Resolved};
use crate::intern::StringId;
use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    UShr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Compare,
    Identity,
    NotIdentity,
    Instanceof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
    Incr,
    Decr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Byte(u8),
    Int(i32),
    Long(i64),
    Double(f64),
    /// Raw decimal text as scanned; parsed into `coefficient * 10^exponent`
    /// form by `crate::runtime::value::Decimal::parse` at constant-folding
    /// or first use.
    Decimal(String),
    Str(StringId),
}

/// A `MapLiteral`/named-argument entry: a statically-known key or, for
/// computed-key map literals, an arbitrary key expression.
#[derive(Debug)]
pub enum MapKey {
    Name(StringId),
    Computed(Box<Expr>),
}

#[derive(Debug)]
pub struct MapEntry {
    pub key: MapKey,
    pub value: Box<Expr>,
}

/// One chunk of an interpolated string: literal text or an embedded
/// expression (the `${...}`/`$ident` escapes, already fully parsed).
#[derive(Debug)]
pub enum StringPart {
    Literal(StringId),
    Interpolated(Box<Expr>),
}

#[derive(Debug)]
pub struct Param {
    pub name: StringId,
    pub declared_type: Type,
    pub default: Option<Box<Expr>>,
    pub is_mandatory: bool,
}

/// A function/closure's signature and body, shared by `FunDecl`,
/// `Closure`, and class method declarations.
#[derive(Debug)]
pub struct FunBody {
    pub name: Option<StringId>,
    pub params: Vec<Param>,
    pub return_type: Type,
    pub is_static: bool,
    pub is_final: bool,
    pub body: Vec<Stmt>,
    /// `it`-style single-parameter lambda shorthand (spec.md §4.2).
    pub implicit_it_param: bool,
    /// Set by the resolver to this function's id in the compilation unit's
    /// function table (indexes into `Resolver::functions`); consumed by the
    /// analyser's fixed-point pass and the compiler.
    pub fn_id: Cell<u32>,
    /// Whether the analyser determined this function's body may suspend
    /// (spec.md §4.4). Written once, after the fixed-point pass converges.
    pub is_async: Cell<bool>,
    /// Names this function closes over, in capture-cell order, filled in
    /// by the resolver (spec.md §3's `FunctionDescriptor.captured_vars`).
    pub captured_vars: RefCell<Vec<StringId>>,
    /// Names of this function's *own* locals that some nested closure
    /// captures, in first-capture order. The compiler uses the index of a
    /// name in this list as that local's owned-cell slot (spec.md §9: one
    /// heap cell per distinct captured variable).
    pub owned_captured_vars: RefCell<Vec<StringId>>,
}

#[derive(Debug)]
pub struct NamedArg {
    pub entries: Vec<MapEntry>,
}

#[derive(Debug)]
pub enum ExprKind {
    Literal(Literal),
    Identifier(StringId),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    PrefixUnary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    PostfixUnary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        named_args: Option<NamedArg>,
    },
    MethodCall {
        receiver: Box<Expr>,
        method: StringId,
        args: Vec<Expr>,
        named_args: Option<NamedArg>,
        /// Set by the resolver when the receiver's static type makes this
        /// a non-virtual/known dispatch; read by the analyser (spec.md §4.4).
        is_any_receiver: Cell<bool>,
    },
    ListLiteral(Vec<Expr>),
    MapLiteral {
        entries: Vec<MapEntry>,
        is_named_args: bool,
    },
    ExprString(Vec<StringPart>),
    RegexMatch {
        target: Box<Expr>,
        pattern: Vec<StringPart>,
        flags: String,
        negated: bool,
        /// Implicit-capture assignment bindings (`x =~ /(?<y>...)/`).
        capture_vars: Vec<StringId>,
    },
    RegexSubst {
        target: Box<Expr>,
        pattern: Vec<StringPart>,
        replacement: Vec<StringPart>,
        flags: String,
    },
    VarDecl {
        name: StringId,
        declared_type: Type,
        init: Option<Box<Expr>>,
        is_const: bool,
        /// Local slot the resolver assigned this declaration (filled in
        /// alongside the `Stmt::VarDecl` counterpart below).
        slot: Cell<u32>,
    },
    VarAssign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    VarOpAssign {
        target: Box<Expr>,
        op: BinOp,
        value: Box<Expr>,
        /// `?=` — only assign if target is currently null (spec.md §7).
        null_safe: bool,
    },
    FieldAssign {
        receiver: Box<Expr>,
        field: StringId,
        value: Box<Expr>,
        null_safe: bool,
    },
    FieldOpAssign {
        receiver: Box<Expr>,
        field: StringId,
        op: BinOp,
        value: Box<Expr>,
    },
    FunDecl(Box<FunBody>),
    Closure(Box<FunBody>),
    Return(Option<Box<Expr>>),
    Break,
    Continue,
    Block(Vec<Stmt>),
    Cast {
        target_type: Type,
        operand: Box<Expr>,
    },
    InstanceOf {
        operand: Box<Expr>,
        class_name: String,
        negated: bool,
    },
    ConvertTo {
        target_type: Type,
        operand: Box<Expr>,
    },
    InvokeNew {
        class_name: String,
        args: Vec<Expr>,
        named_args: Option<NamedArg>,
    },
    InvokeInit {
        args: Vec<Expr>,
        named_args: Option<NamedArg>,
    },
    InvokeFunDecl {
        decl: StringId,
        args: Vec<Expr>,
    },
    ClassPath(Vec<StringId>),
    TypeExpr(Type),
    /// A field/variable reference's compile-time-known default, used by
    /// the auto-create expansion (spec.md §4.3) and named-argument binding.
    DefaultValue(Type),
    ArrayGet {
        array: Box<Expr>,
        index: Box<Expr>,
        null_safe: bool,
    },
    ArrayLength(Box<Expr>),
    /// Reads a parameter's already-bound value inside an argument-binding
    /// wrapper (spec.md §4.5's synthetic `init` wrapper).
    LoadParamValue(StringId),
    Noop,
    Eval {
        source: Box<Expr>,
        globals: Option<Box<Expr>>,
    },
    Print {
        value: Box<Expr>,
        newline: bool,
    },
    Die(Box<Expr>),
}

#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub pos: Pos,
    pub result_type: RefCell<Type>,
    pub result_used: Cell<bool>,
    /// What an `Identifier`/`FieldAssign`/`FieldOpAssign`/`ClassPath` node
    /// resolves to (spec.md §4.3). Left `Unresolved` on every other kind.
    pub resolved: RefCell<Resolved>,
    /// How a `Call`/`MethodCall`/`InvokeNew` dispatches (spec.md §4.4).
    /// Left `Unknown` on every other kind.
    pub call_kind: RefCell<CallKind>,
}

impl Expr {
    #[must_use]
    pub fn new(kind: ExprKind, pos: Pos) -> Self {
        Self {
            kind,
            pos,
            result_type: RefCell::new(Type::Any),
            result_used: Cell::new(false),
            resolved: RefCell::new(Resolved::Unresolved),
            call_kind: RefCell::new(CallKind::Unknown),
        }
    }

    pub fn set_type(&self, ty: Type) {
        *self.result_type.borrow_mut() = ty;
    }

    #[must_use]
    pub fn ty(&self) -> Type {
        self.result_type.borrow().clone()
    }

    pub fn set_resolved(&self, r: Resolved) {
        *self.resolved.borrow_mut() = r;
    }

    pub fn set_call_kind(&self, k: CallKind) {
        *self.call_kind.borrow_mut() = k;
    }
}

#[derive(Debug)]
pub enum Stmt {
    Stmts(Vec<Stmt>),
    Block(Vec<Stmt>),
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
        /// `unless` is parsed as `If` with `negate_cond = true` rather than
        /// a distinct AST node (spec.md §6's "unless" surface syntax).
        negate_cond: bool,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
        /// `until` shares this node with `negate_cond = true`.
        negate_cond: bool,
        is_do_while: bool,
    },
    Return(Option<Expr>),
    ExprStmt(Expr),
    VarDecl {
        name: StringId,
        declared_type: Type,
        init: Option<Expr>,
        is_const: bool,
        /// Local slot this declaration occupies in its enclosing
        /// function's frame, filled in by the resolver (spec.md §4.3) and
        /// consumed by the compiler to emit the matching `StoreLocal`.
        slot: Cell<u32>,
    },
    FunDecl(Box<FunBody>),
    ClassDecl {
        name: String,
        base: Option<String>,
        is_sealed: bool,
        fields: Vec<(StringId, Type, Option<Expr>, bool)>,
        methods: Vec<FunBody>,
        inner_classes: Vec<Box<Stmt>>,
        /// True for the synthetic outer class wrapping a top-level script
        /// body (spec.md §4.2).
        script_main: Option<Vec<Stmt>>,
    },
    Import {
        path: Vec<String>,
        alias: Option<String>,
        is_static: bool,
    },
    ThrowError(Expr),
}
