//! AST → bytecode lowering (spec.md §4.5).
//!
//! Runs after `crate::resolver`/`crate::analyser` have annotated every
//! node; walks the resolved tree once per function body (script main,
//! free functions, closures, and class methods) and drives a
//! [`crate::bytecode::builder::CodeBuilder`] for each, plus one synthetic
//! `init` function per class (spec.md §4.5's "class construction"
//! paragraph).
//!
//! Grounded on the teacher's `bytecode::compiler` (a single recursive
//! `Expr`/`Stmt` walk feeding a `CodeBuilder`, one `Code` object per
//! function) adapted to Jactl's typed-locals/capture-cell/async-prelude
//! requirements.

use ahash::AHashMap;

use crate::ast::{BinOp, Expr, ExprKind, FunBody, Literal, MapKey, NamedArg, Stmt, StringPart, UnaryOp};
use crate::bytecode::builder::{CodeBuilder, JumpPatch};
use crate::bytecode::op::{CaptureSource, Op};
use crate::class::{CallKind, ClassDescriptor, FunctionDescriptor, Resolved};
use crate::intern::{Interner, StringId};
use crate::resolver::ResolveResult;
use crate::runtime::value::{Decimal, Value};
use crate::runtime::vm::FunctionTable;
use crate::types::Type;

/// The `StringId` a class's synthesized `init` function is registered
/// under in its method table. Real method/field names are interned
/// starting at id 0, so this reserved value never collides with one — it
/// just gives `compile_new` somewhere to look the init fn_id back up
/// without a separate side-table (spec.md §4.5: "`new X(...)` compiles to
/// an init call").
fn init_sentinel() -> StringId {
    StringId(u32::MAX)
}

/// Whether `body`'s last statement already leaves its value on the stack
/// (the parser marks a tail expression-statement via `result_used`), so
/// the caller can skip the synthetic `PushNull` it would otherwise emit
/// before `Return` (spec.md §4.5: implicit return of a body's final
/// expression).
fn tail_leaves_value(body: &[Stmt]) -> bool {
    matches!(body.last(), Some(Stmt::ExprStmt(e)) if e.result_used.get())
}

/// One pending loop's jump-patch lists, so `break`/`continue` compiled
/// deep inside a loop body can reach back to it without threading an
/// explicit target through every recursive `compile_stmt`/`compile_expr`
/// call.
#[derive(Default)]
struct LoopCtx {
    continue_patches: Vec<JumpPatch>,
    break_patches: Vec<JumpPatch>,
}

/// Per-function compilation state. `owned_cells` and `fn_captured_vars`
/// come straight off the `FunBody` (by name, not slot — `Resolved::Local`
/// doesn't distinguish a promoted local from a plain one, only
/// `FunBody.owned_captured_vars` does); `slot_names` is the compiler's own
/// running map of which name currently lives in which local slot, needed
/// to decide `LoadLocal` vs `LoadOwnedCell` at each reference.
struct FnCtx {
    owned_cells: Vec<StringId>,
    slot_names: AHashMap<u32, StringId>,
    fn_captured_vars: Vec<StringId>,
    loop_stack: Vec<LoopCtx>,
}

impl FnCtx {
    fn new(owned_cells: Vec<StringId>, fn_captured_vars: Vec<StringId>) -> Self {
        Self { owned_cells, slot_names: AHashMap::new(), fn_captured_vars, loop_stack: Vec::new() }
    }

    fn owned_cell_index(&self, name: StringId) -> Option<u32> {
        self.owned_cells.iter().position(|n| *n == name).map(|i| i as u32)
    }

    fn note_slot_name(&mut self, slot: u32, name: StringId) {
        self.slot_names.insert(slot, name);
    }

    /// Whether a local `slot` ended up promoted to an owned cell, and if
    /// so, which cell index.
    fn owned_slot(&self, slot: u32) -> Option<u32> {
        let name = *self.slot_names.get(&slot)?;
        self.owned_cell_index(name)
    }
}

pub struct Compiler<'a> {
    interner: &'a Interner,
    classes: &'a AHashMap<String, ClassDescriptor>,
    descriptors: &'a [FunctionDescriptor],
    table: FunctionTable,
    next_synthetic_fn_id: u32,
}

impl<'a> Compiler<'a> {
    /// Compiles an entire resolved compilation unit (script main plus
    /// every class/function/closure it reaches) into a [`FunctionTable`]
    /// (spec.md §4.5).
    #[must_use]
    pub fn compile(interner: &'a Interner, result: &'a ResolveResult, script_main: &'a Stmt) -> FunctionTable {
        let mut compiler = Compiler {
            interner,
            classes: &result.classes,
            descriptors: &result.functions,
            table: FunctionTable::new(),
            next_synthetic_fn_id: result.functions.len() as u32,
        };

        for class in result.classes.values() {
            for (i, (_, field_name)) in crate::class::flattened_fields(&result.classes, &class.fq_name).into_iter().enumerate() {
                if let Some(name_id) = compiler.interner_lookup(&field_name) {
                    compiler.table.register_field(class.fq_name.clone(), name_id, i as u32);
                }
            }
        }

        let mut bodies: Vec<&FunBody> = Vec::new();
        collect_bodies(script_main, &mut bodies);
        for body in bodies {
            compiler.compile_function(body);
        }

        for class in result.classes.values() {
            compiler.compile_class_init(class);
        }

        if let Stmt::ClassDecl { script_main: Some(body), .. } = script_main {
            compiler.compile_script_main(result, body);
        }

        compiler.table
    }

    fn interner_lookup(&self, text: &str) -> Option<StringId> {
        self.interner.as_slice().iter().position(|s| s.as_str() == text).map(|i| StringId(i as u32))
    }

    fn compile_script_main(&mut self, result: &ResolveResult, body: &[Stmt]) {
        let mut builder = CodeBuilder::new();
        let mut ctx = FnCtx::new(result.script_owned_captured.clone(), Vec::new());
        for stmt in body {
            self.compile_stmt(&mut builder, &mut ctx, stmt);
        }
        if !tail_leaves_value(body) {
            builder.emit(Op::PushNull);
        }
        builder.emit(Op::Return);
        builder.set_locals(result.script_num_locals, result.script_owned_captured.len() as u32, Vec::new());
        let code = builder.finish(result.script_fn_id, "<script>".to_owned(), 0, false);
        self.table.insert(code);
    }

    fn compile_function(&mut self, body: &FunBody) {
        let fn_id = body.fn_id.get();
        let desc = &self.descriptors[fn_id as usize];
        let mut builder = CodeBuilder::new();
        let mut ctx = FnCtx::new(body.owned_captured_vars.borrow().clone(), body.captured_vars.borrow().clone());

        let is_instance_method = desc.declaring_class.is_some() && !desc.is_static;
        let base_slot: u32 = u32::from(is_instance_method);

        let mut param_types = Vec::with_capacity(body.params.len());
        for (i, p) in body.params.iter().enumerate() {
            let slot = base_slot + i as u32;
            ctx.note_slot_name(slot, p.name);
            param_types.push(p.declared_type.clone());

            if let Some(default) = &p.default {
                builder.emit(Op::LoadLocal(slot));
                let has_value = builder.emit_jump(Op::JumpIfNull);
                builder.emit(Op::Pop);
                let skip_default = builder.emit_jump(Op::Jump);
                builder.patch_jump(has_value);
                builder.emit(Op::Pop);
                self.compile_expr(&mut builder, &mut ctx, default);
                builder.emit(Op::StoreLocal(slot));
                builder.patch_jump(skip_default);
            }

            if let Some(idx) = ctx.owned_cell_index(p.name) {
                builder.emit(Op::LoadLocal(slot));
                builder.emit(Op::MakeOwnedCell(idx));
            }
        }

        for stmt in &body.body {
            self.compile_stmt(&mut builder, &mut ctx, stmt);
        }
        if !tail_leaves_value(&body.body) {
            builder.emit(Op::PushNull);
        }
        builder.emit(Op::Return);
        builder.set_locals(desc.num_locals, desc.num_owned_cells, param_types);
        let qualified = desc.declaring_class.as_ref().map_or_else(|| desc.name.clone(), |c| format!("{c}.{}", desc.name));
        let code = builder.finish(fn_id, qualified, desc.arity() as u32, desc.is_async);
        self.table.insert(code);

        if let Some(class) = &desc.declaring_class {
            if let Some(name_id) = self.interner_lookup(&desc.name) {
                self.table.register_method(class.clone(), name_id, fn_id);
            }
        }
    }

    /// Synthesizes the per-class positional `init` function (spec.md
    /// §4.5): stores each flattened field, in base-first declared order,
    /// from the corresponding positional argument. `FieldDescriptor`
    /// carries only the raw source text of a field's default expression
    /// (for diagnostics), not a compiled `Expr`, so the compiler can't
    /// re-lower it here — `compile_new` pushes `Null` for any field a call
    /// site doesn't supply a value for. Documented in DESIGN.md.
    fn compile_class_init(&mut self, class: &ClassDescriptor) {
        let fn_id = self.next_synthetic_fn_id;
        self.next_synthetic_fn_id += 1;
        let flattened = crate::class::flattened_fields(self.classes, &class.fq_name);
        let mut builder = CodeBuilder::new();
        for i in 0..flattened.len() {
            let param_slot = (i + 1) as u32;
            builder.emit(Op::LoadThis);
            builder.emit(Op::LoadLocal(param_slot));
            builder.emit(Op::StoreField(i as u32));
        }
        builder.emit(Op::LoadThis);
        builder.emit(Op::Return);
        builder.set_locals((flattened.len() + 1) as u32, 0, Vec::new());
        let code = builder.finish(fn_id, format!("{}.<init>", class.fq_name), flattened.len() as u32, false);
        self.table.insert(code);
        self.table.register_method(class.fq_name.clone(), init_sentinel(), fn_id);
    }

    fn compile_stmt(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, stmt: &Stmt) {
        match stmt {
            Stmt::Stmts(v) | Stmt::Block(v) => {
                for s in v {
                    self.compile_stmt(b, ctx, s);
                }
            }
            Stmt::If { cond, then_branch, else_branch, negate_cond } => {
                self.compile_expr(b, ctx, cond);
                let jump_op: fn(u32) -> Op = if *negate_cond { Op::JumpIfTrue } else { Op::JumpIfFalse };
                let to_else = b.emit_jump(jump_op);
                self.compile_stmt(b, ctx, then_branch);
                if let Some(else_branch) = else_branch {
                    let to_end = b.emit_jump(Op::Jump);
                    b.patch_jump(to_else);
                    self.compile_stmt(b, ctx, else_branch);
                    b.patch_jump(to_end);
                } else {
                    b.patch_jump(to_else);
                }
            }
            Stmt::While { cond, body, negate_cond, is_do_while } => self.compile_while(b, ctx, cond, body, *negate_cond, *is_do_while),
            Stmt::Return(e) => {
                if let Some(e) = e {
                    self.compile_expr(b, ctx, e);
                } else {
                    b.emit(Op::PushNull);
                }
                b.emit(Op::Return);
            }
            Stmt::ExprStmt(e) => {
                self.compile_expr(b, ctx, e);
                if !e.result_used.get() {
                    b.emit(Op::Pop);
                }
            }
            Stmt::VarDecl { name, init, slot, .. } => self.compile_var_decl(b, ctx, *name, init.as_ref(), slot.get()),
            Stmt::FunDecl(body) => self.compile_local_fundecl(b, ctx, body),
            Stmt::ClassDecl { .. } => {}
            Stmt::Import { .. } => {}
            Stmt::ThrowError(e) => {
                self.compile_expr(b, ctx, e);
                b.emit(Op::Die);
            }
        }
    }

    fn compile_while(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, cond: &Expr, body: &Stmt, negate_cond: bool, is_do_while: bool) {
        ctx.loop_stack.push(LoopCtx::default());
        if is_do_while {
            let top = b.pos();
            self.compile_stmt(b, ctx, body);
            let cond_pos = b.pos();
            self.compile_expr(b, ctx, cond);
            let jump_op: fn(u32) -> Op = if negate_cond { Op::JumpIfFalse } else { Op::JumpIfTrue };
            b.emit(jump_op(top));
            let end_pos = b.pos();
            let lc = ctx.loop_stack.pop().expect("loop stack balanced");
            for p in lc.continue_patches {
                b.patch_jump_to(p, cond_pos);
            }
            for p in lc.break_patches {
                b.patch_jump_to(p, end_pos);
            }
        } else {
            let top = b.pos();
            self.compile_expr(b, ctx, cond);
            let jump_op: fn(u32) -> Op = if negate_cond { Op::JumpIfTrue } else { Op::JumpIfFalse };
            let to_end = b.emit_jump(jump_op);
            self.compile_stmt(b, ctx, body);
            b.emit(Op::Jump(top));
            b.patch_jump(to_end);
            let end_pos = b.pos();
            let lc = ctx.loop_stack.pop().expect("loop stack balanced");
            for p in lc.continue_patches {
                b.patch_jump_to(p, top);
            }
            for p in lc.break_patches {
                b.patch_jump_to(p, end_pos);
            }
        }
    }

    fn compile_var_decl(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, name: StringId, init: Option<&Expr>, slot: u32) {
        ctx.note_slot_name(slot, name);
        if let Some(init) = init {
            self.compile_expr(b, ctx, init);
        } else {
            b.emit(Op::PushNull);
        }
        if let Some(idx) = ctx.owned_cell_index(name) {
            b.emit(Op::MakeOwnedCell(idx));
        } else {
            b.emit(Op::StoreLocal(slot));
        }
    }

    fn compile_local_fundecl(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, body: &FunBody) {
        let fn_id = body.fn_id.get();
        let captures = self.capture_sources(ctx, &body.captured_vars.borrow());
        b.emit(Op::MakeClosure { fn_id, captures });
        let name = body.name.expect("a statement-level FunDecl always names its function");
        if let Some(idx) = ctx.owned_cell_index(name) {
            b.emit(Op::MakeOwnedCell(idx));
        } else if let Some((&slot, _)) = ctx.slot_names.iter().find(|(_, n)| **n == name) {
            b.emit(Op::StoreLocal(slot));
        } else {
            b.emit(Op::Pop);
        }
    }

    fn capture_sources(&self, ctx: &FnCtx, names: &[StringId]) -> Vec<CaptureSource> {
        names
            .iter()
            .map(|name| {
                if let Some(idx) = ctx.owned_cell_index(*name) {
                    CaptureSource::FromLocalCell(idx)
                } else {
                    // Captured transitively: this frame itself received it
                    // as one of its own captures, at whatever index the
                    // resolver assigned when it walked this frame.
                    let idx = ctx.fn_captured_vars.iter().position(|n| n == name).unwrap_or(0);
                    CaptureSource::FromOuterCapture(idx as u32)
                }
            })
            .collect()
    }

    fn compile_expr(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, expr: &Expr) {
        match &expr.kind {
            ExprKind::Literal(lit) => self.compile_literal(b, lit),
            ExprKind::Identifier(name) => {
                let resolved = expr.resolved.borrow().clone();
                self.compile_load_resolved(b, ctx, &resolved, *name);
            }
            ExprKind::Binary { op, lhs, rhs } => {
                self.compile_expr(b, ctx, lhs);
                self.compile_expr(b, ctx, rhs);
                b.emit(Op::Binary(*op));
            }
            ExprKind::PrefixUnary { op, operand } => self.compile_prefix(b, ctx, *op, operand),
            ExprKind::PostfixUnary { op, operand } => self.compile_postfix(b, ctx, *op, operand),
            ExprKind::Ternary { cond, then_branch, else_branch } => {
                self.compile_expr(b, ctx, cond);
                let to_else = b.emit_jump(Op::JumpIfFalse);
                self.compile_expr(b, ctx, then_branch);
                let to_end = b.emit_jump(Op::Jump);
                b.patch_jump(to_else);
                self.compile_expr(b, ctx, else_branch);
                b.patch_jump(to_end);
            }
            ExprKind::Call { callee, args, named_args } => self.compile_call(b, ctx, expr, callee, args, named_args.as_ref()),
            ExprKind::MethodCall { receiver, method, args, named_args, .. } => {
                self.compile_expr(b, ctx, receiver);
                for a in args {
                    self.compile_expr(b, ctx, a);
                }
                let _ = named_args;
                b.emit(Op::CallMethod { name: *method, argc: args.len() as u32 });
                b.emit(Op::LoadPendingResult);
            }
            ExprKind::ListLiteral(items) => {
                for i in items {
                    self.compile_expr(b, ctx, i);
                }
                b.emit(Op::MakeList(items.len() as u32));
            }
            ExprKind::MapLiteral { entries, .. } => {
                for e in entries {
                    match &e.key {
                        MapKey::Name(name) => {
                            let idx = b.constant(Value::Str(self.interner.resolve(*name).to_owned()));
                            b.emit(Op::Const(idx));
                        }
                        MapKey::Computed(k) => self.compile_expr(b, ctx, k),
                    }
                    self.compile_expr(b, ctx, &e.value);
                }
                b.emit(Op::MakeMap(entries.len() as u32));
            }
            ExprKind::ExprString(parts) => self.compile_expr_string(b, ctx, parts),
            ExprKind::RegexMatch { target, pattern, negated, .. } => {
                self.compile_expr(b, ctx, target);
                self.compile_expr_string(b, ctx, pattern);
                b.emit(Op::RegexMatch { negated: *negated });
            }
            ExprKind::RegexSubst { target, pattern, replacement, .. } => {
                // `Op::RegexSubst` unconditionally errors in the VM —
                // substitution needs to allocate a new string and run a
                // replacement, which a single opcode can't express — so
                // this lowers through the same builtin seam the rest of
                // the standard library uses, rather than emitting it.
                self.compile_expr(b, ctx, target);
                self.compile_expr_string(b, ctx, pattern);
                self.compile_expr_string(b, ctx, replacement);
                let name = self.interner_lookup("_regexReplace").unwrap_or_else(init_sentinel);
                b.emit(Op::CallBuiltin { name, argc: 3 });
                b.emit(Op::LoadPendingResult);
            }
            ExprKind::VarDecl { name, init, slot, .. } => {
                self.compile_var_decl(b, ctx, *name, init.as_deref(), slot.get());
                self.compile_load_slot(b, ctx, slot.get());
            }
            ExprKind::VarAssign { target, value } => self.compile_assign(b, ctx, target, value),
            ExprKind::VarOpAssign { target, op, value, null_safe } => self.compile_op_assign(b, ctx, target, *op, value, *null_safe),
            ExprKind::FieldAssign { receiver, field, value, null_safe } => self.compile_field_assign(b, ctx, expr, receiver, *field, value, *null_safe),
            ExprKind::FieldOpAssign { receiver, field, op, value } => self.compile_field_op_assign(b, ctx, expr, receiver, *field, *op, value),
            ExprKind::FunDecl(body) | ExprKind::Closure(body) => {
                let fn_id = body.fn_id.get();
                let captures = self.capture_sources(ctx, &body.captured_vars.borrow());
                b.emit(Op::MakeClosure { fn_id, captures });
            }
            ExprKind::Return(e) => {
                if let Some(e) = e {
                    self.compile_expr(b, ctx, e);
                } else {
                    b.emit(Op::PushNull);
                }
                b.emit(Op::Return);
            }
            ExprKind::Break => {
                let patch = b.emit_jump(Op::Jump);
                if let Some(lc) = ctx.loop_stack.last_mut() {
                    lc.break_patches.push(patch);
                }
            }
            ExprKind::Continue => {
                let patch = b.emit_jump(Op::Jump);
                if let Some(lc) = ctx.loop_stack.last_mut() {
                    lc.continue_patches.push(patch);
                }
            }
            ExprKind::Block(stmts) => {
                for s in stmts {
                    self.compile_stmt(b, ctx, s);
                }
                b.emit(Op::PushNull);
            }
            ExprKind::Cast { target_type, operand } => {
                self.compile_expr(b, ctx, operand);
                b.emit(Op::Cast(target_type.clone()));
            }
            ExprKind::InstanceOf { operand, class_name, negated } => {
                self.compile_expr(b, ctx, operand);
                b.emit(Op::InstanceOf(class_name.clone()));
                if *negated {
                    b.emit(Op::Not);
                }
            }
            ExprKind::ConvertTo { target_type, operand } => {
                self.compile_expr(b, ctx, operand);
                b.emit(Op::ConvertTo(target_type.clone()));
            }
            ExprKind::InvokeNew { class_name, args, named_args } => self.compile_new(b, ctx, class_name, args, named_args.as_ref()),
            ExprKind::InvokeInit { args, named_args } => {
                for a in args {
                    self.compile_expr(b, ctx, a);
                }
                let _ = named_args;
                b.emit(Op::PushNull);
            }
            ExprKind::InvokeFunDecl { decl, args } => {
                let resolved = expr.resolved.borrow().clone();
                self.compile_load_resolved(b, ctx, &resolved, *decl);
                for a in args {
                    self.compile_expr(b, ctx, a);
                }
                b.emit(Op::CallDynamic(args.len() as u32));
                b.emit(Op::LoadPendingResult);
            }
            ExprKind::ClassPath(_) | ExprKind::TypeExpr(_) => b.emit(Op::PushNull),
            ExprKind::DefaultValue(ty) => self.compile_default_value(b, ty),
            ExprKind::ArrayGet { array, index, null_safe } => {
                self.compile_expr(b, ctx, array);
                if *null_safe {
                    let is_null = b.emit_jump(Op::JumpIfNull);
                    self.compile_expr(b, ctx, index);
                    b.emit(Op::ArrayGet);
                    let end = b.emit_jump(Op::Jump);
                    b.patch_jump(is_null);
                    b.emit(Op::Pop);
                    b.emit(Op::PushNull);
                    b.patch_jump(end);
                } else {
                    self.compile_expr(b, ctx, index);
                    b.emit(Op::ArrayGet);
                }
            }
            ExprKind::ArrayLength(e) => {
                self.compile_expr(b, ctx, e);
                b.emit(Op::ArrayLength);
            }
            ExprKind::LoadParamValue(name) => {
                let resolved = expr.resolved.borrow().clone();
                self.compile_load_resolved(b, ctx, &resolved, *name);
            }
            ExprKind::Noop => b.emit(Op::PushNull),
            ExprKind::Eval { source, globals } => {
                self.compile_expr(b, ctx, source);
                if let Some(g) = globals {
                    self.compile_expr(b, ctx, g);
                } else {
                    b.emit(Op::PushNull);
                }
                let name = self.interner_lookup("eval").unwrap_or_else(init_sentinel);
                b.emit(Op::CallBuiltin { name, argc: 2 });
                b.emit(Op::LoadPendingResult);
            }
            ExprKind::Print { value, newline } => {
                self.compile_expr(b, ctx, value);
                b.emit(Op::Print { newline: *newline });
            }
            ExprKind::Die(value) => {
                self.compile_expr(b, ctx, value);
                b.emit(Op::Die);
            }
        }
    }

    fn compile_default_value(&mut self, b: &mut CodeBuilder, ty: &Type) {
        let value = match ty {
            Type::Bool => {
                b.emit(Op::PushFalse);
                return;
            }
            Type::Byte => Value::Byte(0),
            Type::Int => Value::Int(0),
            Type::Long => Value::Long(0),
            Type::Double => Value::Double(0.0),
            Type::Decimal => Value::Decimal(Decimal::zero()),
            _ => {
                b.emit(Op::PushNull);
                return;
            }
        };
        let idx = b.constant(value);
        b.emit(Op::Const(idx));
    }

    fn compile_literal(&mut self, b: &mut CodeBuilder, lit: &Literal) {
        let value = match lit {
            Literal::Null => Value::Null,
            Literal::Bool(v) => {
                b.emit(if *v { Op::PushTrue } else { Op::PushFalse });
                return;
            }
            Literal::Byte(v) => Value::Byte(*v),
            Literal::Int(v) => Value::Int(*v),
            Literal::Long(v) => Value::Long(*v),
            Literal::Double(v) => Value::Double(*v),
            Literal::Decimal(text) => Value::Decimal(Decimal::parse(text).unwrap_or_else(Decimal::zero)),
            Literal::Str(id) => Value::Str(self.interner.resolve(*id).to_owned()),
        };
        let idx = b.constant(value);
        b.emit(Op::Const(idx));
    }

    fn compile_expr_string(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, parts: &[StringPart]) {
        if parts.is_empty() {
            let idx = b.constant(Value::Str(String::new()));
            b.emit(Op::Const(idx));
            return;
        }
        let mut first = true;
        for part in parts {
            match part {
                StringPart::Literal(id) => {
                    let idx = b.constant(Value::Str(self.interner.resolve(*id).to_owned()));
                    b.emit(Op::Const(idx));
                }
                StringPart::Interpolated(e) => self.compile_expr(b, ctx, e),
            }
            if !first {
                b.emit(Op::Binary(BinOp::Add));
            }
            first = false;
        }
    }

    fn compile_load_slot(&mut self, b: &mut CodeBuilder, ctx: &FnCtx, slot: u32) {
        if let Some(idx) = ctx.owned_slot(slot) {
            b.emit(Op::LoadOwnedCell(idx));
        } else {
            b.emit(Op::LoadLocal(slot));
        }
    }

    fn compile_load_resolved(&mut self, b: &mut CodeBuilder, ctx: &FnCtx, resolved: &Resolved, name: StringId) {
        match resolved {
            Resolved::Unresolved => b.emit(Op::PushNull),
            Resolved::Local { slot } => self.compile_load_slot(b, ctx, *slot),
            Resolved::Captured { slot } => b.emit(Op::LoadCaptured(*slot)),
            Resolved::Field { index } => {
                b.emit(Op::LoadThis);
                b.emit(Op::LoadField(*index));
            }
            Resolved::ClassConst { class, field } => {
                let key = self.const_global_name(class, field);
                b.emit(Op::LoadGlobal(key));
            }
            Resolved::Global => b.emit(Op::LoadGlobal(name)),
            Resolved::Function(fn_id) => b.emit(Op::MakeClosure { fn_id: *fn_id, captures: Vec::new() }),
        }
    }

    /// A name for class-const globals that doesn't collide with ordinary
    /// script globals (spec.md §3: consts are "class-level, accessible via
    /// `Class.name`"). `Resolved::ClassConst` is declared for this purpose
    /// but the current resolver never constructs it (a const read from
    /// inside its own class resolves as an ordinary field); this arm
    /// keeps the match exhaustive and gives external `Class.name` access
    /// somewhere to land without a second compiler change if the resolver
    /// grows that later. Documented in DESIGN.md.
    fn const_global_name(&self, class: &str, field: &str) -> StringId {
        let key = format!("{class}.{field}");
        self.interner_lookup(&key).unwrap_or_else(init_sentinel)
    }

    fn compile_assign(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, target: &Expr, value: &Expr) {
        if let ExprKind::ArrayGet { array, index, .. } = &target.kind {
            self.compile_array_assign(b, ctx, array, index, value);
            return;
        }
        self.compile_expr(b, ctx, value);
        b.emit(Op::Dup);
        self.compile_store_target(b, ctx, target);
    }

    /// `arr[i] = v`. There's no dedicated `StoreField`-style single-pop
    /// opcode for array elements that also hands back the stored value,
    /// so (unlike the identifier/field cases) this doesn't retain a copy
    /// for use as a sub-expression; it pushes `Null` as a placeholder
    /// result instead. Documented in DESIGN.md — array-index assignment
    /// used as a bare statement (the overwhelmingly common case) is
    /// unaffected since `Stmt::ExprStmt` discards the result anyway.
    fn compile_array_assign(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, array: &Expr, index: &Expr, value: &Expr) {
        self.compile_expr(b, ctx, array);
        self.compile_expr(b, ctx, index);
        self.compile_expr(b, ctx, value);
        b.emit(Op::ArraySet);
        b.emit(Op::PushNull);
    }

    fn compile_op_assign(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, target: &Expr, op: BinOp, value: &Expr, null_safe: bool) {
        if let ExprKind::ArrayGet { array, index, .. } = &target.kind {
            self.compile_array_op_assign(b, ctx, array, index, op, value);
            return;
        }
        if null_safe {
            self.compile_load_target(b, ctx, target);
            let is_null = b.emit_jump(Op::JumpIfNull);
            let end = b.emit_jump(Op::Jump);
            b.patch_jump(is_null);
            b.emit(Op::Pop);
            self.compile_expr(b, ctx, value);
            b.emit(Op::Dup);
            self.compile_store_target(b, ctx, target);
            b.patch_jump(end);
            return;
        }
        self.compile_load_target(b, ctx, target);
        self.compile_expr(b, ctx, value);
        b.emit(Op::Binary(op));
        b.emit(Op::Dup);
        self.compile_store_target(b, ctx, target);
    }

    /// `arr[i] op= v`. `index` is re-evaluated once extra (documented
    /// simplification: the ISA's `Dup`/`Swap` can't rotate a third stack
    /// slot to the top, so there's no way to hold one copy of `array` and
    /// `index` each for the read and the write without either a scratch
    /// local or a second evaluation; `index` is assumed side-effect-free
    /// in practice, unlike `value`, which is evaluated exactly once).
    /// Like plain array-element assignment, the expression's own result
    /// is not retained — see [`Self::compile_array_assign`].
    fn compile_array_op_assign(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, array: &Expr, index: &Expr, op: BinOp, value: &Expr) {
        self.compile_expr(b, ctx, array);
        b.emit(Op::Dup);
        self.compile_expr(b, ctx, index);
        b.emit(Op::Swap);
        self.compile_expr(b, ctx, index);
        b.emit(Op::ArrayGet);
        self.compile_expr(b, ctx, value);
        b.emit(Op::Binary(op));
        b.emit(Op::ArraySet);
        b.emit(Op::PushNull);
    }

    fn compile_load_target(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, target: &Expr) {
        if let ExprKind::Identifier(name) = &target.kind {
            let resolved = target.resolved.borrow().clone();
            self.compile_load_resolved(b, ctx, &resolved, *name);
        } else {
            self.compile_expr(b, ctx, target);
        }
    }

    fn compile_store_target(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, target: &Expr) {
        if let ExprKind::Identifier(name) = &target.kind {
            let resolved = target.resolved.borrow().clone();
            self.compile_store_resolved(b, ctx, &resolved, *name);
        } else {
            b.emit(Op::Pop);
        }
    }

    fn compile_store_resolved(&mut self, b: &mut CodeBuilder, ctx: &FnCtx, resolved: &Resolved, name: StringId) {
        match resolved {
            Resolved::Local { slot } => {
                if let Some(idx) = ctx.owned_slot(*slot) {
                    b.emit(Op::StoreOwnedCell(idx));
                } else {
                    b.emit(Op::StoreLocal(*slot));
                }
            }
            Resolved::Captured { slot } => b.emit(Op::StoreCaptured(*slot)),
            Resolved::Field { index } => {
                // Stack here is [.., result_copy, value] (value on top);
                // `StoreField` pops value then receiver, so `this` has to
                // land directly under `value` — push it, then swap it
                // into place.
                b.emit(Op::LoadThis);
                b.emit(Op::Swap);
                b.emit(Op::StoreField(*index));
            }
            Resolved::Global => b.emit(Op::StoreGlobal(name)),
            Resolved::ClassConst { class, field } => {
                let key = self.const_global_name(class, field);
                b.emit(Op::StoreGlobal(key));
            }
            Resolved::Unresolved | Resolved::Function(_) => b.emit(Op::Pop),
        }
    }

    /// `a.b = c`: evaluates `c` before `a` so a single `Dup`+`Swap` can
    /// leave the assigned value as this expression's result without a
    /// 3-deep stack rotation. Documented in DESIGN.md as a simplification
    /// (a receiver with call-expression side effects would observe the
    /// value evaluated first).
    fn compile_field_assign(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, expr: &Expr, receiver: &Expr, field: StringId, value: &Expr, null_safe: bool) {
        if null_safe {
            self.compile_expr(b, ctx, receiver);
            let is_null = b.emit_jump(Op::JumpIfNull);
            b.emit(Op::Pop);
            self.compile_field_assign_plain(b, ctx, expr, receiver, field, value);
            let end = b.emit_jump(Op::Jump);
            b.patch_jump(is_null);
            b.emit(Op::Pop);
            b.emit(Op::PushNull);
            b.patch_jump(end);
        } else {
            self.compile_field_assign_plain(b, ctx, expr, receiver, field, value);
        }
    }

    fn compile_field_assign_plain(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, expr: &Expr, receiver: &Expr, field: StringId, value: &Expr) {
        let resolved = expr.resolved.borrow().clone();
        self.compile_expr(b, ctx, value);
        b.emit(Op::Dup);
        self.compile_expr(b, ctx, receiver);
        b.emit(Op::Swap);
        match resolved {
            Resolved::Field { index } => b.emit(Op::StoreField(index)),
            _ => b.emit(Op::StoreFieldByName(field)),
        };
    }

    /// `a.b += c`: re-evaluates `a` at the read and the write (the same
    /// simplification as [`Self::compile_array_op_assign`], applied to a
    /// presumed-cheap receiver expression instead of an array index).
    fn compile_field_op_assign(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, expr: &Expr, receiver: &Expr, field: StringId, op: BinOp, value: &Expr) {
        let resolved = expr.resolved.borrow().clone();
        self.compile_expr(b, ctx, receiver);
        match &resolved {
            Resolved::Field { index } => b.emit(Op::LoadField(*index)),
            _ => {
                b.emit(Op::CallMethod { name: field, argc: 0 });
                b.emit(Op::LoadPendingResult);
            }
        };
        self.compile_expr(b, ctx, value);
        b.emit(Op::Binary(op));
        b.emit(Op::Dup);
        self.compile_expr(b, ctx, receiver);
        b.emit(Op::Swap);
        match resolved {
            Resolved::Field { index } => b.emit(Op::StoreField(index)),
            _ => b.emit(Op::StoreFieldByName(field)),
        };
    }

    fn compile_prefix(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, op: UnaryOp, operand: &Expr) {
        match op {
            UnaryOp::Neg => {
                self.compile_expr(b, ctx, operand);
                b.emit(Op::Neg);
            }
            UnaryOp::Not => {
                self.compile_expr(b, ctx, operand);
                b.emit(Op::Not);
            }
            UnaryOp::BitNot => {
                self.compile_expr(b, ctx, operand);
                b.emit(Op::BitNot);
            }
            UnaryOp::Incr | UnaryOp::Decr => {
                // `Op::PreIncr`/`PreDecr` exist in the opcode set but
                // unconditionally error in the VM — increment/decrement is
                // always compiled as an explicit load/add/store sequence.
                let delta = if op == UnaryOp::Incr { 1 } else { -1 };
                self.compile_load_target(b, ctx, operand);
                let idx = b.constant(Value::Int(delta));
                b.emit(Op::Const(idx));
                b.emit(Op::Binary(BinOp::Add));
                b.emit(Op::Dup);
                self.compile_store_target(b, ctx, operand);
            }
        }
    }

    fn compile_postfix(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, op: UnaryOp, operand: &Expr) {
        let delta = if op == UnaryOp::Incr { 1 } else { -1 };
        self.compile_load_target(b, ctx, operand);
        b.emit(Op::Dup);
        let idx = b.constant(Value::Int(delta));
        b.emit(Op::Const(idx));
        b.emit(Op::Binary(BinOp::Add));
        self.compile_store_target(b, ctx, operand);
        b.emit(Op::Pop);
    }

    fn compile_call(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, expr: &Expr, callee: &Expr, args: &[Expr], named_args: Option<&NamedArg>) {
        let kind = expr.call_kind.borrow().clone();
        match kind {
            CallKind::Direct(fn_id) => {
                if let Some(named) = named_args {
                    self.compile_named_call(b, ctx, fn_id, named);
                } else {
                    for a in args {
                        self.compile_expr(b, ctx, a);
                    }
                    b.emit(Op::CallDirect { fn_id, argc: args.len() as u32 });
                }
            }
            CallKind::Builtin(_) => {
                for a in args {
                    self.compile_expr(b, ctx, a);
                }
                let name = if let ExprKind::Identifier(n) = &callee.kind { *n } else { init_sentinel() };
                b.emit(Op::CallBuiltin { name, argc: args.len() as u32 });
            }
            CallKind::Unknown | CallKind::ThroughVariable | CallKind::AnyReceiver | CallKind::Virtual { .. } => {
                self.compile_expr(b, ctx, callee);
                for a in args {
                    self.compile_expr(b, ctx, a);
                }
                b.emit(Op::CallDynamic(args.len() as u32));
            }
        }
        b.emit(Op::LoadPendingResult);
    }

    fn compile_named_call(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, fn_id: u32, named: &NamedArg) {
        let desc = &self.descriptors[fn_id as usize];
        let base_slot = u32::from(desc.declaring_class.is_some() && !desc.is_static);
        let mut arg_slots = Vec::with_capacity(named.entries.len());
        for entry in &named.entries {
            if let MapKey::Name(name) = &entry.key {
                if let Some(pos) = desc.params.iter().position(|p| p.name == *name) {
                    arg_slots.push(base_slot + pos as u32);
                }
            }
        }
        for entry in &named.entries {
            self.compile_expr(b, ctx, &entry.value);
        }
        b.emit(Op::CallNamed { fn_id, arg_slots });
    }

    fn compile_new(&mut self, b: &mut CodeBuilder, ctx: &mut FnCtx, class_name: &str, args: &[Expr], named_args: Option<&NamedArg>) {
        if !self.classes.contains_key(class_name) {
            b.emit(Op::PushNull);
            return;
        }
        let flattened = crate::class::flattened_fields(self.classes, class_name);
        let field_count = flattened.len() as u32;
        b.emit(Op::New { class: class_name.to_owned(), field_count });

        if let Some(named) = named_args {
            let mut values: Vec<Option<&Expr>> = vec![None; flattened.len()];
            for entry in &named.entries {
                if let MapKey::Name(name) = &entry.key {
                    let field_text = self.interner.resolve(*name);
                    if let Some(pos) = flattened.iter().position(|(_, f)| f.as_str() == field_text) {
                        values[pos] = Some(&entry.value);
                    }
                }
            }
            for v in values {
                match v {
                    Some(e) => self.compile_expr(b, ctx, e),
                    None => b.emit(Op::PushNull),
                };
            }
        } else {
            for a in args {
                self.compile_expr(b, ctx, a);
            }
            for _ in args.len()..flattened.len() {
                b.emit(Op::PushNull);
            }
        }

        let init_fn_id = self.table.lookup_method(class_name, init_sentinel()).unwrap_or(u32::MAX);
        b.emit(Op::CallInit { fn_id: init_fn_id, argc: field_count });
        b.emit(Op::LoadPendingResult);
    }
}

fn collect_bodies<'a>(stmt: &'a Stmt, out: &mut Vec<&'a FunBody>) {
    match stmt {
        Stmt::Stmts(v) | Stmt::Block(v) => {
            for s in v {
                collect_bodies(s, out);
            }
        }
        Stmt::If { cond, then_branch, else_branch, .. } => {
            collect_bodies_expr(cond, out);
            collect_bodies(then_branch, out);
            if let Some(e) = else_branch {
                collect_bodies(e, out);
            }
        }
        Stmt::While { cond, body, .. } => {
            collect_bodies_expr(cond, out);
            collect_bodies(body, out);
        }
        Stmt::Return(Some(e)) => collect_bodies_expr(e, out),
        Stmt::Return(None) => {}
        Stmt::ExprStmt(e) => collect_bodies_expr(e, out),
        Stmt::VarDecl { init, .. } => {
            if let Some(e) = init {
                collect_bodies_expr(e, out);
            }
        }
        Stmt::FunDecl(body) => {
            out.push(body);
            collect_bodies_in_fn(body, out);
        }
        Stmt::ClassDecl { methods, script_main, fields, inner_classes, .. } => {
            for (_, _, default, _) in fields {
                if let Some(e) = default {
                    collect_bodies_expr(e, out);
                }
            }
            for m in methods {
                out.push(m);
                collect_bodies_in_fn(m, out);
            }
            for inner in inner_classes {
                collect_bodies(inner, out);
            }
            if let Some(b) = script_main {
                for s in b {
                    collect_bodies(s, out);
                }
            }
        }
        Stmt::Import { .. } => {}
        Stmt::ThrowError(e) => collect_bodies_expr(e, out),
    }
}

fn collect_bodies_in_fn<'a>(body: &'a FunBody, out: &mut Vec<&'a FunBody>) {
    for s in &body.body {
        collect_bodies(s, out);
    }
}

fn collect_bodies_expr<'a>(expr: &'a Expr, out: &mut Vec<&'a FunBody>) {
    match &expr.kind {
        ExprKind::Literal(_)
        | ExprKind::Identifier(_)
        | ExprKind::Break
        | ExprKind::Continue
        | ExprKind::Noop
        | ExprKind::ClassPath(_)
        | ExprKind::TypeExpr(_)
        | ExprKind::DefaultValue(_)
        | ExprKind::LoadParamValue(_) => {}
        ExprKind::Binary { lhs, rhs, .. } => {
            collect_bodies_expr(lhs, out);
            collect_bodies_expr(rhs, out);
        }
        ExprKind::PrefixUnary { operand, .. } | ExprKind::PostfixUnary { operand, .. } => collect_bodies_expr(operand, out),
        ExprKind::Ternary { cond, then_branch, else_branch } => {
            collect_bodies_expr(cond, out);
            collect_bodies_expr(then_branch, out);
            collect_bodies_expr(else_branch, out);
        }
        ExprKind::Call { callee, args, named_args } => {
            collect_bodies_expr(callee, out);
            for a in args {
                collect_bodies_expr(a, out);
            }
            if let Some(n) = named_args {
                for e in &n.entries {
                    collect_bodies_expr(&e.value, out);
                }
            }
        }
        ExprKind::MethodCall { receiver, args, named_args, .. } => {
            collect_bodies_expr(receiver, out);
            for a in args {
                collect_bodies_expr(a, out);
            }
            if let Some(n) = named_args {
                for e in &n.entries {
                    collect_bodies_expr(&e.value, out);
                }
            }
        }
        ExprKind::ListLiteral(items) => {
            for i in items {
                collect_bodies_expr(i, out);
            }
        }
        ExprKind::MapLiteral { entries, .. } => {
            for e in entries {
                if let MapKey::Computed(k) = &e.key {
                    collect_bodies_expr(k, out);
                }
                collect_bodies_expr(&e.value, out);
            }
        }
        ExprKind::ExprString(parts) => {
            for p in parts {
                if let StringPart::Interpolated(e) = p {
                    collect_bodies_expr(e, out);
                }
            }
        }
        ExprKind::RegexMatch { target, pattern, .. } => {
            collect_bodies_expr(target, out);
            for p in pattern {
                if let StringPart::Interpolated(e) = p {
                    collect_bodies_expr(e, out);
                }
            }
        }
        ExprKind::RegexSubst { target, pattern, replacement, .. } => {
            collect_bodies_expr(target, out);
            for p in pattern.iter().chain(replacement.iter()) {
                if let StringPart::Interpolated(e) = p {
                    collect_bodies_expr(e, out);
                }
            }
        }
        ExprKind::VarDecl { init, .. } => {
            if let Some(e) = init {
                collect_bodies_expr(e, out);
            }
        }
        ExprKind::VarAssign { target, value } | ExprKind::FieldAssign { receiver: target, value, .. } => {
            collect_bodies_expr(target, out);
            collect_bodies_expr(value, out);
        }
        ExprKind::VarOpAssign { target, value, .. } | ExprKind::FieldOpAssign { receiver: target, value, .. } => {
            collect_bodies_expr(target, out);
            collect_bodies_expr(value, out);
        }
        ExprKind::FunDecl(body) | ExprKind::Closure(body) => {
            out.push(body);
            collect_bodies_in_fn(body, out);
        }
        ExprKind::Return(Some(e)) => collect_bodies_expr(e, out),
        ExprKind::Return(None) => {}
        ExprKind::Block(stmts) => {
            for s in stmts {
                collect_bodies(s, out);
            }
        }
        ExprKind::Cast { operand, .. } | ExprKind::InstanceOf { operand, .. } | ExprKind::ConvertTo { operand, .. } => collect_bodies_expr(operand, out),
        ExprKind::InvokeNew { args, named_args, .. } | ExprKind::InvokeInit { args, named_args } => {
            for a in args {
                collect_bodies_expr(a, out);
            }
            if let Some(n) = named_args {
                for e in &n.entries {
                    collect_bodies_expr(&e.value, out);
                }
            }
        }
        ExprKind::InvokeFunDecl { args, .. } => {
            for a in args {
                collect_bodies_expr(a, out);
            }
        }
        ExprKind::ArrayGet { array, index, .. } => {
            collect_bodies_expr(array, out);
            collect_bodies_expr(index, out);
        }
        ExprKind::ArrayLength(e) | ExprKind::Print { value: e, .. } | ExprKind::Die(e) => collect_bodies_expr(e, out),
        ExprKind::Eval { source, globals } => {
            collect_bodies_expr(source, out);
            if let Some(g) = globals {
                collect_bodies_expr(g, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Pos;

    fn pos() -> Pos {
        Pos { offset: 0, line: 1, column: 1 }
    }

    fn empty_result() -> ResolveResult {
        ResolveResult { classes: AHashMap::new(), functions: Vec::new(), diagnostics: Vec::new(), script_fn_id: 0, script_owned_captured: Vec::new(), script_num_locals: 0 }
    }

    #[test]
    fn compiles_a_trivial_script_returning_a_constant() {
        let interner = Interner::new();
        let script_main = Stmt::ClassDecl {
            name: "<script>".to_owned(),
            base: None,
            is_sealed: false,
            fields: Vec::new(),
            methods: Vec::new(),
            inner_classes: Vec::new(),
            script_main: Some(vec![Stmt::ExprStmt(Expr::new(ExprKind::Literal(Literal::Int(42)), pos()))]),
        };
        let result = empty_result();
        let table = Compiler::compile(&interner, &result, &script_main);
        let code = table.get(0);
        assert!(matches!(code.ops.first(), Some(Op::Const(0))));
        assert!(matches!(code.ops.get(1), Some(Op::Pop)));
    }

    #[test]
    fn do_while_loop_jumps_backward_to_the_condition_check() {
        let interner = Interner::new();
        let body = Stmt::ExprStmt(Expr::new(ExprKind::Literal(Literal::Int(1)), pos()));
        let cond = Expr::new(ExprKind::Literal(Literal::Bool(true)), pos());
        let script_main = Stmt::ClassDecl {
            name: "<script>".to_owned(),
            base: None,
            is_sealed: false,
            fields: Vec::new(),
            methods: Vec::new(),
            inner_classes: Vec::new(),
            script_main: Some(vec![Stmt::While { cond, body: Box::new(body), negate_cond: false, is_do_while: true }]),
        };
        let result = empty_result();
        let table = Compiler::compile(&interner, &result, &script_main);
        let code = table.get(0);
        assert!(code.ops.iter().any(|op| matches!(op, Op::JumpIfTrue(0))));
    }
}
