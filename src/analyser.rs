//! Async-reachability fixed-point analysis (spec.md §4.4).
//!
//! Runs after the resolver has annotated every `Call`/`MethodCall`/
//! `InvokeNew` node with a [`crate::class::CallKind`] and every `FunBody`
//! with a stable `fn_id`. Walks the whole resolved tree repeatedly,
//! recomputing each function's `is_async` bit from its current callees'
//! bits, until a full pass makes no further changes — the standard
//! worklist-free fixed point for a monotone boolean lattice (`false` →
//! `true` only, so this always terminates within `functions.len()+1`
//! passes).

use ahash::AHashMap;

use crate::ast::{Expr, ExprKind, FunBody, Stmt};
use crate::class::{BuiltinAsync, CallKind};

pub struct Analyser<'a> {
    /// Every function/closure/method body in the compilation unit, keyed
    /// by the resolver-assigned `fn_id`. Interior mutability (`Cell`) on
    /// `FunBody.is_async` lets us update it through a shared reference.
    functions: AHashMap<u32, &'a FunBody>,
}

impl<'a> Analyser<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self { functions: AHashMap::new() }
    }

    /// Collects every `FunBody` reachable from `root` and runs the
    /// fixed-point pass, leaving each one's `is_async` cell set to its
    /// final value.
    pub fn analyse(&mut self, root: &'a Stmt) {
        self.collect_stmt(root);
        loop {
            let mut changed = false;
            let ids: Vec<u32> = self.functions.keys().copied().collect();
            for id in ids {
                let body = self.functions[&id];
                let computed = self.body_is_async(body);
                if computed && !body.is_async.get() {
                    body.is_async.set(true);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Every function/closure/method body this pass collected, by `fn_id`,
    /// with its final `is_async` bit already set. `crate::context` uses
    /// this to copy the converged bit onto each `FunctionDescriptor`, which
    /// the analyser itself never touches (it only owns `FunBody` cells).
    #[must_use]
    pub fn functions(&self) -> &AHashMap<u32, &'a FunBody> {
        &self.functions
    }

    /// Whether the top-level script body — which has no `FunBody` of its
    /// own to hang an `is_async` cell off of — reaches an async operation,
    /// using the callee bits this pass just converged on.
    #[must_use]
    pub fn script_is_async(&self, body: &[Stmt]) -> bool {
        body.iter().any(|s| self.stmt_is_async(s))
    }

    fn collect_stmt(&mut self, stmt: &'a Stmt) {
        match stmt {
            Stmt::Stmts(v) | Stmt::Block(v) => {
                for s in v {
                    self.collect_stmt(s);
                }
            }
            Stmt::If { cond, then_branch, else_branch, .. } => {
                self.collect_expr(cond);
                self.collect_stmt(then_branch);
                if let Some(e) = else_branch {
                    self.collect_stmt(e);
                }
            }
            Stmt::While { cond, body, .. } => {
                self.collect_expr(cond);
                self.collect_stmt(body);
            }
            Stmt::Return(e) => {
                if let Some(e) = e {
                    self.collect_expr(e);
                }
            }
            Stmt::ExprStmt(e) => self.collect_expr(e),
            Stmt::VarDecl { init, .. } => {
                if let Some(init) = init {
                    self.collect_expr(init);
                }
            }
            Stmt::FunDecl(body) => self.collect_fun(body),
            Stmt::ClassDecl { fields, methods, script_main, .. } => {
                for (_, _, default, _) in fields {
                    if let Some(default) = default {
                        self.collect_expr(default);
                    }
                }
                for m in methods {
                    self.collect_fun(m);
                }
                if let Some(body) = script_main {
                    for s in body {
                        self.collect_stmt(s);
                    }
                }
            }
            Stmt::Import { .. } => {}
            Stmt::ThrowError(e) => self.collect_expr(e),
        }
    }

    fn collect_fun(&mut self, body: &'a FunBody) {
        self.functions.insert(body.fn_id.get(), body);
        for p in &body.params {
            if let Some(d) = &p.default {
                self.collect_expr(d);
            }
        }
        for s in &body.body {
            self.collect_stmt(s);
        }
    }

    fn collect_expr(&mut self, expr: &'a Expr) {
        use ExprKind::*;
        match &expr.kind {
            Literal(_) | Identifier(_) | Break | Continue | Noop | DefaultValue(_) | TypeExpr(_) | ClassPath(_) | LoadParamValue(_) => {}
            Binary { lhs, rhs, .. } => {
                self.collect_expr(lhs);
                self.collect_expr(rhs);
            }
            PrefixUnary { operand, .. } | PostfixUnary { operand, .. } | Cast { operand, .. } | ConvertTo { operand, .. } | ArrayLength(operand) => {
                self.collect_expr(operand);
            }
            Ternary { cond, then_branch, else_branch } => {
                self.collect_expr(cond);
                self.collect_expr(then_branch);
                self.collect_expr(else_branch);
            }
            Call { callee, args, named_args } => {
                self.collect_expr(callee);
                for a in args {
                    self.collect_expr(a);
                }
                if let Some(na) = named_args {
                    for e in &na.entries {
                        self.collect_expr(&e.value);
                    }
                }
            }
            MethodCall { receiver, args, named_args, .. } => {
                self.collect_expr(receiver);
                for a in args {
                    self.collect_expr(a);
                }
                if let Some(na) = named_args {
                    for e in &na.entries {
                        self.collect_expr(&e.value);
                    }
                }
            }
            ListLiteral(items) => {
                for i in items {
                    self.collect_expr(i);
                }
            }
            MapLiteral { entries, .. } => {
                for e in entries {
                    if let crate::ast::MapKey::Computed(k) = &e.key {
                        self.collect_expr(k);
                    }
                    self.collect_expr(&e.value);
                }
            }
            ExprString(parts) => {
                for p in parts {
                    if let crate::ast::StringPart::Interpolated(e) = p {
                        self.collect_expr(e);
                    }
                }
            }
            RegexMatch { target, .. } | RegexSubst { target, .. } => self.collect_expr(target),
            VarDecl { init, .. } => {
                if let Some(init) = init {
                    self.collect_expr(init);
                }
            }
            VarAssign { target, value } | VarOpAssign { target, value, .. } => {
                self.collect_expr(target);
                self.collect_expr(value);
            }
            FieldAssign { receiver, value, .. } | FieldOpAssign { receiver, value, .. } => {
                self.collect_expr(receiver);
                self.collect_expr(value);
            }
            FunDecl(body) | Closure(body) => self.collect_fun(body),
            Return(e) => {
                if let Some(e) = e {
                    self.collect_expr(e);
                }
            }
            Block(stmts) => {
                for s in stmts {
                    self.collect_stmt(s);
                }
            }
            InstanceOf { operand, .. } => self.collect_expr(operand),
            InvokeNew { args, named_args, .. } | InvokeInit { args, named_args } => {
                for a in args {
                    self.collect_expr(a);
                }
                if let Some(na) = named_args {
                    for e in &na.entries {
                        self.collect_expr(&e.value);
                    }
                }
            }
            InvokeFunDecl { args, .. } => {
                for a in args {
                    self.collect_expr(a);
                }
            }
            ArrayGet { array, index, .. } => {
                self.collect_expr(array);
                self.collect_expr(index);
            }
            Eval { source, globals } => {
                self.collect_expr(source);
                if let Some(g) = globals {
                    self.collect_expr(g);
                }
            }
            Print { value, .. } => self.collect_expr(value),
            Die(e) => self.collect_expr(e),
        }
    }

    /// Whether `body`'s own statements (not descending into nested
    /// `FunDecl`/`Closure` sub-bodies, which are analysed independently)
    /// reach an async operation, given the *current* `is_async` bits of
    /// every other function (spec.md §4.4's rules, in order).
    fn body_is_async(&self, body: &FunBody) -> bool {
        body.body.iter().any(|s| self.stmt_is_async(s))
    }

    fn stmt_is_async(&self, stmt: &Stmt) -> bool {
        match stmt {
            Stmt::Stmts(v) | Stmt::Block(v) => v.iter().any(|s| self.stmt_is_async(s)),
            Stmt::If { cond, then_branch, else_branch, .. } => {
                self.expr_is_async(cond) || self.stmt_is_async(then_branch) || else_branch.as_ref().is_some_and(|e| self.stmt_is_async(e))
            }
            Stmt::While { cond, body, .. } => self.expr_is_async(cond) || self.stmt_is_async(body),
            Stmt::Return(e) => e.as_ref().is_some_and(|e| self.expr_is_async(e)),
            Stmt::ExprStmt(e) => self.expr_is_async(e),
            Stmt::VarDecl { init, .. } => init.as_ref().is_some_and(|e| self.expr_is_async(e)),
            // Nested class/function declarations are analysed as their
            // own units, not inlined into the enclosing function's flow.
            Stmt::FunDecl(_) | Stmt::ClassDecl { .. } | Stmt::Import { .. } => false,
            Stmt::ThrowError(e) => self.expr_is_async(e),
        }
    }

    fn expr_is_async(&self, expr: &Expr) -> bool {
        use ExprKind::*;
        match &expr.kind {
            Literal(_) | Identifier(_) | Break | Continue | Noop | DefaultValue(_) | TypeExpr(_) | ClassPath(_) | LoadParamValue(_) => false,
            Binary { lhs, rhs, .. } => self.expr_is_async(lhs) || self.expr_is_async(rhs),
            PrefixUnary { operand, .. } | PostfixUnary { operand, .. } | Cast { operand, .. } | ConvertTo { operand, .. } | ArrayLength(operand) => {
                self.expr_is_async(operand)
            }
            Ternary { cond, then_branch, else_branch } => self.expr_is_async(cond) || self.expr_is_async(then_branch) || self.expr_is_async(else_branch),
            Call { callee, args, named_args } => {
                self.expr_is_async(callee)
                    || args.iter().any(|a| self.expr_is_async(a))
                    || named_args.as_ref().is_some_and(|na| na.entries.iter().any(|e| self.expr_is_async(&e.value)))
                    || self.call_kind_is_async(&expr.call_kind.borrow(), args)
            }
            MethodCall { receiver, args, named_args, .. } => {
                self.expr_is_async(receiver)
                    || args.iter().any(|a| self.expr_is_async(a))
                    || named_args.as_ref().is_some_and(|na| na.entries.iter().any(|e| self.expr_is_async(&e.value)))
                    || self.call_kind_is_async(&expr.call_kind.borrow(), args)
            }
            ListLiteral(items) => items.iter().any(|i| self.expr_is_async(i)),
            MapLiteral { entries, .. } => entries.iter().any(|e| {
                (match &e.key {
                    crate::ast::MapKey::Computed(k) => self.expr_is_async(k),
                    crate::ast::MapKey::Name(_) => false,
                }) || self.expr_is_async(&e.value)
            }),
            ExprString(parts) => parts.iter().any(|p| matches!(p, crate::ast::StringPart::Interpolated(e) if self.expr_is_async(e))),
            RegexMatch { target, .. } | RegexSubst { target, .. } => self.expr_is_async(target),
            VarDecl { init, .. } => init.as_ref().is_some_and(|e| self.expr_is_async(e)),
            VarAssign { target, value } | VarOpAssign { target, value, .. } => self.expr_is_async(target) || self.expr_is_async(value),
            FieldAssign { receiver, value, .. } | FieldOpAssign { receiver, value, .. } => self.expr_is_async(receiver) || self.expr_is_async(value),
            // The closure/function *value* itself is never async to
            // allocate; its body's asyncness only matters when called.
            FunDecl(_) | Closure(_) => false,
            Return(e) => e.as_ref().is_some_and(|e| self.expr_is_async(e)),
            Block(stmts) => stmts.iter().any(|s| self.stmt_is_async(s)),
            InstanceOf { operand, .. } => self.expr_is_async(operand),
            InvokeNew { args, named_args, .. } | InvokeInit { args, named_args } => {
                args.iter().any(|a| self.expr_is_async(a))
                    || named_args.as_ref().is_some_and(|na| na.entries.iter().any(|e| self.expr_is_async(&e.value)))
                    || self.call_kind_is_async(&expr.call_kind.borrow(), args)
            }
            InvokeFunDecl { args, .. } => args.iter().any(|a| self.expr_is_async(a)),
            ArrayGet { array, index, .. } => self.expr_is_async(array) || self.expr_is_async(index),
            Eval { .. } => true, // source is unknown until runtime: conservatively async
            Print { value, .. } => self.expr_is_async(value),
            Die(e) => self.expr_is_async(e),
        }
    }

    fn call_kind_is_async(&self, kind: &CallKind, args: &[Expr]) -> bool {
        match kind {
            CallKind::Unknown | CallKind::ThroughVariable | CallKind::AnyReceiver => true,
            CallKind::Direct(id) => self.functions.get(id).is_some_and(|f| f.is_async.get()),
            CallKind::Virtual { .. } => {
                // Without a fully closed subclass set in this standalone
                // analyser, virtual dispatch is conservatively async
                // unless every method sharing the name among collected
                // functions is itself non-async (spec.md §4.4).
                true
            }
            CallKind::Builtin(rule) => match rule {
                BuiltinAsync::Always => true,
                BuiltinAsync::Never => false,
                BuiltinAsync::IfClosureArgAsync(idx) => args.get(*idx).is_some_and(|a| self.expr_is_async(a)),
            },
        }
    }
}

impl<'a> Default for Analyser<'a> {
    fn default() -> Self {
        Self::new()
    }
}
