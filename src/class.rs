//! Class, function, and scope descriptors produced by the resolver
//! (spec.md §3, §4.3). Grounded on the teacher's `types::class`,
//! `function.rs`, and `signature.rs` split: a class owns an ordered field
//! map and a method table, a function owns an ordered parameter signature,
//! and scopes are a stack of slot bindings the resolver pushes/pops as it
//! walks blocks.

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::intern::StringId;
use crate::types::Type;

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub ty: Type,
    pub default_text: Option<String>,
    pub is_const: bool,
    pub declared_order: usize,
}

/// A function or method's signature plus the async-ness the analyser
/// computes (spec.md §3's `FunctionDescriptor`). `is_async` starts `false`
/// and is updated in place by the fixed-point pass in `crate::analyser`.
#[derive(Debug, Clone)]
pub struct FunctionDescriptor {
    pub name: String,
    pub params: Vec<ParamDescriptor>,
    pub return_type: Type,
    pub is_static: bool,
    pub is_final: bool,
    pub is_async: bool,
    pub captured_vars: Vec<StringId>,
    pub declaring_class: Option<String>,
    pub wrapper_is_async: bool,
    /// Local-slot count the compiler allocates this function's `Frame`
    /// with, filled in by the resolver once it has walked the whole body
    /// (spec.md §4.5's frame-shape metadata).
    pub num_locals: u32,
    /// Count of this function's own locals some nested closure captures,
    /// i.e. `owned_captured_vars.len()` (spec.md §9).
    pub num_owned_cells: u32,
}

#[derive(Debug, Clone)]
pub struct ParamDescriptor {
    pub name: StringId,
    pub ty: Type,
    pub has_default: bool,
    pub is_mandatory: bool,
}

impl FunctionDescriptor {
    /// Arity used as part of a stable function id for checkpoint
    /// serialization (spec.md §4.6: "a stable fully-qualified name + arity
    /// hash").
    #[must_use]
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn mandatory_count(&self) -> usize {
        self.params.iter().filter(|p| p.is_mandatory).count()
    }
}

#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    pub fq_name: String,
    pub base: Option<String>,
    pub fields: IndexMap<String, FieldDescriptor>,
    pub methods: AHashMap<String, FunctionDescriptor>,
    pub inner_classes: Vec<String>,
    pub is_sealed: bool,
    /// True once every override of every method has been seen for this
    /// compilation unit — gates the analyser's "final method, no async
    /// override" shortcut (spec.md §4.4).
    pub final_method_set_closed: bool,
}

impl ClassDescriptor {
    /// A field name must not clash with a method name, a superclass field,
    /// or (checked by the caller against the builtin table) a built-in
    /// method name (spec.md §3).
    pub fn check_no_field_method_clash(&self) -> Result<(), String> {
        for name in self.fields.keys() {
            if self.methods.contains_key(name) {
                return Err(format!("field '{name}' clashes with a method of the same name"));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn method(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.methods.get(name)
    }
}

/// Total field count for `class_name` including every inherited field,
/// walking the `base` chain (spec.md §3: fields are laid out base-first so
/// a subclass's own fields never disturb its parent's slot indices).
#[must_use]
pub fn total_field_count(classes: &AHashMap<String, ClassDescriptor>, class_name: &str) -> usize {
    let Some(c) = classes.get(class_name) else { return 0 };
    let base_count = c.base.as_deref().map(|b| total_field_count(classes, b)).unwrap_or(0);
    base_count + c.fields.len()
}

/// The flattened base-first field order for `class_name`: each entry is
/// `(declaring_class, field_name)`. The compiler uses this to build the
/// synthetic `init` function's parameter/field-store order and `New`'s
/// field count; `field_index_by_name` below must stay in lockstep with it.
#[must_use]
pub fn flattened_fields(classes: &AHashMap<String, ClassDescriptor>, class_name: &str) -> Vec<(String, String)> {
    let Some(c) = classes.get(class_name) else { return Vec::new() };
    let mut out = c.base.as_deref().map(|b| flattened_fields(classes, b)).unwrap_or_default();
    for name in c.fields.keys() {
        out.push((class_name.to_owned(), name.clone()));
    }
    out
}

/// A field's absolute slot index within `class_name`'s (and its bases')
/// combined layout, or `None` if no class in the chain declares it.
#[must_use]
pub fn field_index_by_name(classes: &AHashMap<String, ClassDescriptor>, class_name: &str, field_name: &str) -> Option<u32> {
    let c = classes.get(class_name)?;
    if let Some(base) = &c.base {
        if let Some(idx) = field_index_by_name(classes, base, field_name) {
            return Some(idx);
        }
    }
    let base_count = c.base.as_deref().map(|b| total_field_count(classes, b)).unwrap_or(0);
    c.fields.get_index_of(field_name).map(|i| (base_count + i) as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Local,
    Parameter,
    /// Promoted to a heap cell because an inner function closes over it
    /// (spec.md §4.3/§9).
    Captured,
    Field,
    ClassConst,
    Global,
}

/// What an `Expr::Identifier`/field access resolves to, recorded on the
/// AST node itself (spec.md §4.3: "for each `Expr.Identifier` reference it
/// records the target slot"). `Unresolved` is the default before the
/// resolver visits the node; the compiler and analyser both assume every
/// reachable node has been overwritten by resolve time.
#[derive(Debug, Clone, Default)]
pub enum Resolved {
    #[default]
    Unresolved,
    Local {
        slot: u32,
    },
    /// A captured local: `slot` is this function's index into its
    /// captured-cell tuple (spec.md §9's "one allocation per distinct
    /// captured variable").
    Captured {
        slot: u32,
    },
    Field {
        index: u32,
    },
    ClassConst {
        class: String,
        field: String,
    },
    Global,
    /// A reference to a declared function (not a call) — e.g. a bare
    /// function name used as a value.
    Function(u32),
}

/// How a `Call`/`MethodCall`/`InvokeNew` node dispatches, computed by the
/// resolver and consumed by both the analyser (§4.4's `is_async`
/// propagation) and the compiler (§4.5's async-prelude placement).
#[derive(Debug, Clone, Default)]
pub enum CallKind {
    #[default]
    Unknown,
    /// Direct call to a statically-known function/method, by id into the
    /// compilation unit's function table.
    Direct(u32),
    /// Call through a non-final function-typed variable — always async
    /// per spec.md §4.4 ("the binding could change later").
    ThroughVariable,
    /// Method call on an `ANY`-typed receiver — always async per spec.md
    /// §4.4 (dispatch target unknown until runtime).
    AnyReceiver,
    /// Virtual dispatch on a known class; async unless every override in
    /// the known subclass set is non-async and the method is `final`.
    Virtual {
        class: String,
        method: String,
    },
    /// Call to a registered built-in, tagged with its `async_when` rule.
    Builtin(BuiltinAsync),
}

/// The built-in async-tagging rule from spec.md §4.4's registration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinAsync {
    Never,
    Always,
    /// Async exactly when the closure passed at this argument index is
    /// itself async (e.g. `map`/`filter`/`sort`).
    IfClosureArgAsync(usize),
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub name: StringId,
    pub ty: Type,
    pub slot: usize,
    pub kind: SlotKind,
    pub initialized: bool,
}

/// One lexical scope's bindings. The resolver keeps a `Vec<Scope>` stack,
/// pushing on block entry and popping on exit; `captured` accumulates the
/// names this scope's bindings were captured under so the compiler knows
/// which locals to box.
#[derive(Debug, Default)]
pub struct Scope {
    bindings: Vec<Binding>,
    pub captured: Vec<StringId>,
}

impl Scope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: StringId, ty: Type, slot: usize, kind: SlotKind) {
        self.bindings.push(Binding {
            name,
            ty,
            slot,
            kind,
            initialized: kind != SlotKind::Local,
        });
    }

    pub fn mark_initialized(&mut self, name: StringId) {
        if let Some(b) = self.bindings.iter_mut().rev().find(|b| b.name == name) {
            b.initialized = true;
        }
    }

    #[must_use]
    pub fn lookup(&self, name: StringId) -> Option<&Binding> {
        self.bindings.iter().rev().find(|b| b.name == name)
    }

    pub fn mark_captured(&mut self, name: StringId) {
        if let Some(b) = self.bindings.iter_mut().rev().find(|b| b.name == name) {
            b.kind = SlotKind::Captured;
        }
        if !self.captured.contains(&name) {
            self.captured.push(name);
        }
    }
}

/// A stack of lexical scopes plus a flat class registry, threaded through
/// the resolver for one compilation unit.
#[derive(Debug, Default)]
pub struct ScopeStack {
    scopes: Vec<Scope>,
}

impl ScopeStack {
    #[must_use]
    pub fn new() -> Self {
        Self { scopes: vec![Scope::new()] }
    }

    pub fn push(&mut self) {
        self.scopes.push(Scope::new());
    }

    pub fn pop(&mut self) -> Scope {
        self.scopes.pop().expect("scope stack underflow")
    }

    #[must_use]
    pub fn resolve(&self, name: StringId) -> Option<(&Binding, usize)> {
        for (depth, scope) in self.scopes.iter().rev().enumerate() {
            if let Some(b) = scope.lookup(name) {
                return Some((b, depth));
            }
        }
        None
    }

    pub fn declare(&mut self, name: StringId, ty: Type, slot: usize, kind: SlotKind) {
        self.scopes.last_mut().expect("no active scope").declare(name, ty, slot, kind);
    }

    pub fn mark_initialized(&mut self, name: StringId) {
        for scope in self.scopes.iter_mut().rev() {
            if scope.lookup(name).is_some() {
                scope.mark_initialized(name);
                return;
            }
        }
    }

    /// Marks `name` captured in whichever scope owns it (`depth` scopes up
    /// from the top, as returned by `resolve`), so the compiler boxes that
    /// slot into a heap cell.
    pub fn mark_captured_at(&mut self, name: StringId, depth: usize) {
        let idx = self.scopes.len() - 1 - depth;
        self.scopes[idx].mark_captured(name);
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }
}
