//! Built-in function/method registration and the standard library surface
//! script code calls (spec.md §6): a fluent DSL an embedding host uses to
//! add its own native functions, methods, and foreign classes, plus a
//! [`Registry::standard`] built entirely through that same DSL.
//!
//! Grounded on the teacher's `builtins/mod.rs` closed dispatch table (one
//! matched-by-name entry point per callable rather than reflection) for
//! the *shape* of dispatch; the fluent registration surface itself is this
//! crate's own, since the teacher's standard library is a fixed enum a
//! host can't extend, whereas spec.md §6 requires a host-open table.
//!
//! Only the registration contract and async-tagging of the standard
//! library are in scope here, not exhaustive method bodies — `sleep` and
//! `_checkpoint` are the two entries the continuation ABI actually turns
//! on; the list/map combinators and scalar helpers below exist so the
//! async-fidelity scenarios in spec.md §8 have something concrete to run
//! against.

use ahash::AHashMap;

use crate::error::{ExcKind, RuntimeError};
use crate::intern::StringId;
use crate::resource::ResourceTracker;
use crate::runtime::heap::{Heap, HeapObject, JMap};
use crate::runtime::value::{Decimal, Value};
use crate::runtime::vm::{BuiltinOutcome, BuiltinRegistry, FunctionTable, SuspendedCall, Vm};

/// Which family of receiver a registered method applies to. `Any` matches
/// regardless of receiver shape — used for `toString`-style methods every
/// value supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverType {
    List,
    Map,
    String,
    Any,
}

fn receiver_type(value: &Value, heap: &Heap) -> ReceiverType {
    match value {
        Value::Str(_) => ReceiverType::String,
        Value::Ref(id) => match heap.get(*id) {
            HeapObject::List(_) | HeapObject::Array(_) => ReceiverType::List,
            HeapObject::Map(_) => ReceiverType::Map,
            _ => ReceiverType::Any,
        },
        _ => ReceiverType::Any,
    }
}

/// Everything a native implementation needs beyond its own arguments: the
/// running VM (to call back into a closure argument via
/// [`Vm::call_value`]), the function table and resource tracker that call
/// needs, and the registry itself (so a combinator can re-enter dispatch).
pub struct BuiltinCtx<'x, 'v> {
    pub vm: &'x mut Vm<'v>,
    pub functions: &'x FunctionTable,
    pub resource: &'x mut dyn ResourceTracker,
    pub registry: &'x Registry,
}

impl<'x, 'v> BuiltinCtx<'x, 'v> {
    fn call_closure(&mut self, closure: Value, args: Vec<Value>) -> Result<Value, RuntimeError> {
        self.vm.call_value(self.functions, self.registry, self.resource, closure, args)
    }
}

pub type NativeFn = fn(BuiltinCtx<'_, '_>, Vec<Value>) -> Result<BuiltinOutcome, RuntimeError>;
pub type NativeMethod = fn(BuiltinCtx<'_, '_>, Value, Vec<Value>) -> Result<BuiltinOutcome, RuntimeError>;

#[derive(Clone)]
pub struct ParamSpec {
    pub name: String,
    pub default: Option<Value>,
}

struct FunctionEntry {
    params: Vec<ParamSpec>,
    is_async: bool,
    imp: NativeFn,
}

struct MethodEntry {
    params: Vec<ParamSpec>,
    is_async: bool,
    imp: NativeMethod,
}

/// A host-registered foreign type the checkpoint wire format knows how to
/// round-trip via callbacks rather than `serde` derive (spec.md §6's
/// `createClass(...).checkpoint(...).restore(...)`). Instances of a
/// foreign class travel through script code as an ordinary `Value::Str`
/// handle (an opaque key the host's callbacks interpret); this crate
/// doesn't otherwise know their shape.
pub struct ForeignClassEntry {
    pub java_class: Option<String>,
    pub auto_import: bool,
    pub checkpoint: Option<Box<dyn Fn(&Value) -> Vec<u8> + Send + Sync>>,
    pub restore: Option<Box<dyn Fn(&[u8]) -> Value + Send + Sync>>,
}

/// The built-in table a [`crate::context::Context`] dispatches through.
/// Empty by default; [`Registry::standard`] is the one a `Context` uses
/// unless a host supplies its own via `ContextBuilder::builtins`.
#[derive(Default)]
pub struct Registry {
    functions: AHashMap<String, FunctionEntry>,
    methods: AHashMap<(ReceiverType, String), MethodEntry>,
    foreign_classes: AHashMap<String, ForeignClassEntry>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard library this crate ships, with `_checkpoint` suspending
    /// for real. Equivalent to `Registry::standard_with_checkpoint(true)`.
    #[must_use]
    pub fn standard() -> Self {
        Self::standard_with_checkpoint(true)
    }

    /// The standard library this crate ships, registered entirely through
    /// the fluent DSL below rather than inserted directly, so the DSL
    /// itself is exercised by real entries and not just host examples.
    ///
    /// When `checkpoint_enabled` is false (a `Context` built with
    /// `.checkpoint(false)`, spec.md §4.4), `_checkpoint` compiles down to
    /// an identity function instead of suspending — chosen here, at
    /// registration time, rather than in the compiler, since it only
    /// changes which native implementation `_checkpoint` dispatches to,
    /// not anything about call-site codegen.
    #[must_use]
    pub fn standard_with_checkpoint(checkpoint_enabled: bool) -> Self {
        let mut r = Self::new();

        r.function().name("sleep").param("duration_ms", None).param("value", Some(Value::Null)).is_async(true).imp(fn_sleep).register();
        if checkpoint_enabled {
            r.function().name("_checkpoint").param("value", Some(Value::Null)).is_async(true).imp(fn_checkpoint).register();
        } else {
            r.function().name("_checkpoint").param("value", Some(Value::Null)).is_async(false).imp(fn_checkpoint_identity).register();
        }
        r.function().name("sprintf").param("format", None).imp(fn_sprintf).register();
        r.function().name("println").param("value", Some(Value::Null)).imp(fn_println).register();
        r.function().name("print").param("value", Some(Value::Null)).imp(fn_print).register();
        r.function().name("abs").param("value", None).imp(fn_abs).register();
        r.function().name("_regexReplace").param("target", None).param("pattern", None).param("replacement", None).imp(fn_regex_replace).register();

        r.method(ReceiverType::Any).name("toString").imp(method_to_string).register();
        r.method(ReceiverType::Any).name("size").imp(method_size).register();
        r.method(ReceiverType::List).name("size").imp(method_size).register();
        r.method(ReceiverType::Map).name("size").imp(method_size).register();
        r.method(ReceiverType::String).name("size").imp(method_size).register();

        r.method(ReceiverType::List).name("map").param("mapper", None).is_async(true).imp(method_map).register();
        r.method(ReceiverType::List).name("filter").param("predicate", None).is_async(true).imp(method_filter).register();
        r.method(ReceiverType::List).name("each").param("action", None).is_async(true).imp(method_each).register();
        r.method(ReceiverType::List).name("collect").param("mapper", None).is_async(true).imp(method_map).register();
        r.method(ReceiverType::List).name("sort").param("comparator", Some(Value::Null)).is_async(true).imp(method_sort).register();
        r.method(ReceiverType::List).name("reduce").param("initial", None).param("accumulator", None).is_async(true).imp(method_reduce).register();
        r.method(ReceiverType::List).name("sum").imp(method_sum).register();
        r.method(ReceiverType::List).name("avg").imp(method_avg).register();
        r.method(ReceiverType::List).name("min").imp(method_min).register();
        r.method(ReceiverType::List).name("max").imp(method_max).register();

        r
    }

    #[must_use]
    pub fn function(&mut self) -> FunctionBuilder<'_> {
        FunctionBuilder { registry: self, name: String::new(), params: Vec::new(), is_async: false, imp: None }
    }

    #[must_use]
    pub fn method(&mut self, receiver: ReceiverType) -> MethodBuilder<'_> {
        MethodBuilder { registry: self, receiver, name: String::new(), params: Vec::new(), is_async: false, imp: None }
    }

    #[must_use]
    pub fn create_class(&mut self, fq_name: impl Into<String>) -> ClassBuilder<'_> {
        ClassBuilder { registry: self, fq_name: fq_name.into(), java_class: None, auto_import: false, checkpoint: None, restore: None }
    }

    #[must_use]
    pub fn foreign_class(&self, fq_name: &str) -> Option<&ForeignClassEntry> {
        self.foreign_classes.get(fq_name)
    }
}

pub struct FunctionBuilder<'r> {
    registry: &'r mut Registry,
    name: String,
    params: Vec<ParamSpec>,
    is_async: bool,
    imp: Option<NativeFn>,
}

impl<'r> FunctionBuilder<'r> {
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn param(mut self, name: impl Into<String>, default: Option<Value>) -> Self {
        self.params.push(ParamSpec { name: name.into(), default });
        self
    }

    #[must_use]
    pub fn is_async(mut self, flag: bool) -> Self {
        self.is_async = flag;
        self
    }

    #[must_use]
    pub fn imp(mut self, f: NativeFn) -> Self {
        self.imp = Some(f);
        self
    }

    pub fn register(self) {
        let imp = self.imp.expect("built-in function registered without an implementation");
        self.registry.functions.insert(self.name, FunctionEntry { params: self.params, is_async: self.is_async, imp });
    }
}

pub struct MethodBuilder<'r> {
    registry: &'r mut Registry,
    receiver: ReceiverType,
    name: String,
    params: Vec<ParamSpec>,
    is_async: bool,
    imp: Option<NativeMethod>,
}

impl<'r> MethodBuilder<'r> {
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn param(mut self, name: impl Into<String>, default: Option<Value>) -> Self {
        self.params.push(ParamSpec { name: name.into(), default });
        self
    }

    #[must_use]
    pub fn is_async(mut self, flag: bool) -> Self {
        self.is_async = flag;
        self
    }

    #[must_use]
    pub fn imp(mut self, f: NativeMethod) -> Self {
        self.imp = Some(f);
        self
    }

    pub fn register(self) {
        let imp = self.imp.expect("built-in method registered without an implementation");
        self.registry.methods.insert((self.receiver, self.name), MethodEntry { params: self.params, is_async: self.is_async, imp });
    }
}

pub struct ClassBuilder<'r> {
    registry: &'r mut Registry,
    fq_name: String,
    java_class: Option<String>,
    auto_import: bool,
    checkpoint: Option<Box<dyn Fn(&Value) -> Vec<u8> + Send + Sync>>,
    restore: Option<Box<dyn Fn(&[u8]) -> Value + Send + Sync>>,
}

impl<'r> ClassBuilder<'r> {
    #[must_use]
    pub fn java_class(mut self, name: impl Into<String>) -> Self {
        self.java_class = Some(name.into());
        self
    }

    #[must_use]
    pub fn auto_import(mut self, flag: bool) -> Self {
        self.auto_import = flag;
        self
    }

    #[must_use]
    pub fn checkpoint(mut self, f: impl Fn(&Value) -> Vec<u8> + Send + Sync + 'static) -> Self {
        self.checkpoint = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn restore(mut self, f: impl Fn(&[u8]) -> Value + Send + Sync + 'static) -> Self {
        self.restore = Some(Box::new(f));
        self
    }

    pub fn register(self) {
        self.registry.foreign_classes.insert(
            self.fq_name,
            ForeignClassEntry { java_class: self.java_class, auto_import: self.auto_import, checkpoint: self.checkpoint, restore: self.restore },
        );
    }
}

impl BuiltinRegistry for Registry {
    fn call(
        &self,
        name: StringId,
        args: Vec<Value>,
        vm: &mut Vm<'_>,
        functions: &FunctionTable,
        resource: &mut dyn ResourceTracker,
    ) -> Result<BuiltinOutcome, RuntimeError> {
        let key = vm.interner.resolve(name).to_owned();
        let Some(entry) = self.functions.get(&key) else {
            return Err(RuntimeError::new(ExcKind::UnknownVariable, format!("no such built-in function '{key}'"), String::new(), 0));
        };
        let imp = entry.imp;
        let args = bind_defaults(&entry.params, args);
        let ctx = BuiltinCtx { vm, functions, resource, registry: self };
        imp(ctx, args)
    }

    fn call_method(
        &self,
        name: StringId,
        receiver: Value,
        args: Vec<Value>,
        vm: &mut Vm<'_>,
        functions: &FunctionTable,
        resource: &mut dyn ResourceTracker,
    ) -> Result<BuiltinOutcome, RuntimeError> {
        let key = vm.interner.resolve(name).to_owned();
        let tag = receiver_type(&receiver, &vm.heap);
        let entry = self.methods.get(&(tag, key.clone())).or_else(|| self.methods.get(&(ReceiverType::Any, key.clone())));
        let Some(entry) = entry else {
            return Err(RuntimeError::new(ExcKind::UnknownVariable, format!("no such method '{key}' on a {}", receiver.type_name()), String::new(), 0));
        };
        let imp = entry.imp;
        let args = bind_defaults(&entry.params, args);
        let ctx = BuiltinCtx { vm, functions, resource, registry: self };
        imp(ctx, receiver, args)
    }
}

/// Pads a call's positional arguments out to `params.len()` using each
/// parameter's registered default, the same convention `Op::CallNamed`
/// relies on for user-defined functions (spec.md §4.3's default-value
/// prologue) but evaluated here rather than compiled, since native
/// implementations have no bytecode of their own.
fn bind_defaults(params: &[ParamSpec], mut args: Vec<Value>) -> Vec<Value> {
    while args.len() < params.len() {
        let default = params[args.len()].default.clone().unwrap_or(Value::Null);
        args.push(default);
    }
    args
}

fn fn_sleep(_ctx: BuiltinCtx<'_, '_>, mut args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    let value = args.pop().unwrap_or(Value::Null);
    let duration_ms = args.first().and_then(Value::as_i64).unwrap_or(0).max(0) as u64;
    Ok(BuiltinOutcome::Suspend(SuspendedCall::Sleep { duration_ms, value }))
}

fn fn_checkpoint(_ctx: BuiltinCtx<'_, '_>, mut args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    let value = args.pop().unwrap_or(Value::Null);
    Ok(BuiltinOutcome::Suspend(SuspendedCall::Checkpoint { value }))
}

/// `_checkpoint` with checkpointing disabled on the `Context` (spec.md
/// §4.4): returns its argument unchanged rather than suspending.
fn fn_checkpoint_identity(_ctx: BuiltinCtx<'_, '_>, mut args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    Ok(BuiltinOutcome::Value(args.pop().unwrap_or(Value::Null)))
}

fn fn_sprintf(ctx: BuiltinCtx<'_, '_>, mut args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    if args.is_empty() {
        return Ok(BuiltinOutcome::Value(Value::Str(String::new())));
    }
    let format = args.remove(0);
    let Value::Str(format) = format else {
        return Err(RuntimeError::new(ExcKind::CastFailure, "sprintf's first argument must be a string", String::new(), 0));
    };
    Ok(BuiltinOutcome::Value(Value::Str(format_sprintf(&format, &args, ctx.vm))))
}

fn fn_println(ctx: BuiltinCtx<'_, '_>, args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    let value = args.into_iter().next().unwrap_or(Value::Null);
    println!("{}", ctx.vm.heap.display(&value));
    Ok(BuiltinOutcome::Value(Value::Null))
}

fn fn_print(ctx: BuiltinCtx<'_, '_>, args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    let value = args.into_iter().next().unwrap_or(Value::Null);
    print!("{}", ctx.vm.heap.display(&value));
    Ok(BuiltinOutcome::Value(Value::Null))
}

fn fn_abs(_ctx: BuiltinCtx<'_, '_>, args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    let value = args.into_iter().next().unwrap_or(Value::Null);
    let result = match value {
        Value::Int(i) => Value::Int(i.abs()),
        Value::Long(l) => Value::Long(l.abs()),
        Value::Byte(b) => Value::Byte(b),
        Value::Double(d) => Value::Double(d.abs()),
        Value::Decimal(d) => {
            let zero = Decimal::zero();
            if d.cmp(&zero) == std::cmp::Ordering::Less {
                Value::Decimal(zero.sub(&d))
            } else {
                Value::Decimal(d)
            }
        }
        _ => return Err(RuntimeError::new(ExcKind::CastFailure, "abs() requires a numeric argument", String::new(), 0)),
    };
    Ok(BuiltinOutcome::Value(result))
}

fn fn_regex_replace(ctx: BuiltinCtx<'_, '_>, args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    let mut it = args.into_iter();
    let target = it.next().unwrap_or(Value::Null);
    let pattern = it.next().unwrap_or(Value::Null);
    let replacement = it.next().unwrap_or(Value::Null);
    let target_text = ctx.vm.heap.display(&target);
    let pattern_text = ctx.vm.heap.display(&pattern);
    let replacement_text = ctx.vm.heap.display(&replacement);
    let replaced = crate::regex_lit::replace_all(&target_text, &pattern_text, &replacement_text)
        .map_err(|e| RuntimeError::new(ExcKind::RegexFailure, e, String::new(), 0))?;
    Ok(BuiltinOutcome::Value(Value::Str(replaced)))
}

fn method_to_string(ctx: BuiltinCtx<'_, '_>, receiver: Value, _args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    Ok(BuiltinOutcome::Value(Value::Str(ctx.vm.heap.display(&receiver))))
}

fn method_size(ctx: BuiltinCtx<'_, '_>, receiver: Value, _args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    let len = match &receiver {
        Value::Str(s) => s.chars().count(),
        Value::Ref(id) => match ctx.vm.heap.get(*id) {
            HeapObject::List(items) | HeapObject::Array(items) => items.len(),
            HeapObject::Map(map) => map.len(),
            _ => return Err(RuntimeError::new(ExcKind::CastFailure, "size() is not supported on this value", String::new(), 0)),
        },
        _ => return Err(RuntimeError::new(ExcKind::CastFailure, "size() is not supported on this value", String::new(), 0)),
    };
    Ok(BuiltinOutcome::Value(Value::Int(len as i32)))
}

fn list_items(heap: &Heap, receiver: &Value) -> Result<Vec<Value>, RuntimeError> {
    let Value::Ref(id) = receiver else {
        return Err(RuntimeError::new(ExcKind::CastFailure, "expected a list", String::new(), 0));
    };
    match heap.get(*id) {
        HeapObject::List(items) | HeapObject::Array(items) => Ok(items.clone()),
        _ => Err(RuntimeError::new(ExcKind::CastFailure, "expected a list", String::new(), 0)),
    }
}

fn method_map(mut ctx: BuiltinCtx<'_, '_>, receiver: Value, args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    let items = list_items(&ctx.vm.heap, &receiver)?;
    let closure = args.into_iter().next().unwrap_or(Value::Null);
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(ctx.call_closure(closure.clone(), vec![item])?);
    }
    let id = ctx.vm.heap.alloc(HeapObject::List(out));
    Ok(BuiltinOutcome::Value(Value::Ref(id)))
}

fn method_filter(mut ctx: BuiltinCtx<'_, '_>, receiver: Value, args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    let items = list_items(&ctx.vm.heap, &receiver)?;
    let closure = args.into_iter().next().unwrap_or(Value::Null);
    let mut out = Vec::new();
    for item in items {
        if ctx.call_closure(closure.clone(), vec![item.clone()])?.truthy() {
            out.push(item);
        }
    }
    let id = ctx.vm.heap.alloc(HeapObject::List(out));
    Ok(BuiltinOutcome::Value(Value::Ref(id)))
}

fn method_each(mut ctx: BuiltinCtx<'_, '_>, receiver: Value, args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    let items = list_items(&ctx.vm.heap, &receiver)?;
    let closure = args.into_iter().next().unwrap_or(Value::Null);
    for item in items {
        ctx.call_closure(closure.clone(), vec![item])?;
    }
    Ok(BuiltinOutcome::Value(receiver))
}

fn method_sort(mut ctx: BuiltinCtx<'_, '_>, receiver: Value, args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    let mut items = list_items(&ctx.vm.heap, &receiver)?;
    let comparator = args.into_iter().next().unwrap_or(Value::Null);
    if matches!(comparator, Value::Null) {
        let mut err = None;
        items.sort_by(|a, b| match ctx.vm.compare_values(a, b) {
            Ok(ord) => ord,
            Err(e) => {
                err.get_or_insert(e);
                std::cmp::Ordering::Equal
            }
        });
        if let Some(e) = err {
            return Err(e);
        }
    } else {
        // A closure comparator can't suspend mid-sort (`sort_by` doesn't
        // give us a way to bail out cleanly), so any error from calling it
        // aborts the sort with that error rather than silently ignoring it.
        let mut err = None;
        items.sort_by(|a, b| {
            if err.is_some() {
                return std::cmp::Ordering::Equal;
            }
            match ctx.call_closure(comparator.clone(), vec![a.clone(), b.clone()]) {
                Ok(v) => (v.as_i64().unwrap_or(0)).cmp(&0),
                Err(e) => {
                    err = Some(e);
                    std::cmp::Ordering::Equal
                }
            }
        });
        if let Some(e) = err {
            return Err(e);
        }
    }
    let id = ctx.vm.heap.alloc(HeapObject::List(items));
    Ok(BuiltinOutcome::Value(Value::Ref(id)))
}

fn method_reduce(mut ctx: BuiltinCtx<'_, '_>, receiver: Value, args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    let items = list_items(&ctx.vm.heap, &receiver)?;
    let mut it = args.into_iter();
    let mut acc = it.next().unwrap_or(Value::Null);
    let closure = it.next().unwrap_or(Value::Null);
    for item in items {
        acc = ctx.call_closure(closure.clone(), vec![acc, item])?;
    }
    Ok(BuiltinOutcome::Value(acc))
}

fn method_sum(ctx: BuiltinCtx<'_, '_>, receiver: Value, _args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    let items = list_items(&ctx.vm.heap, &receiver)?;
    numeric_fold(&items, Value::Int(0), |acc, v| add_numeric(acc, v))
}

fn method_avg(ctx: BuiltinCtx<'_, '_>, receiver: Value, _args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    let items = list_items(&ctx.vm.heap, &receiver)?;
    if items.is_empty() {
        return Err(RuntimeError::new(ExcKind::DivisionByZero, "avg() of an empty list", String::new(), 0));
    }
    let BuiltinOutcome::Value(total) = numeric_fold(&items, Value::Int(0), |acc, v| add_numeric(acc, v))? else {
        unreachable!("numeric_fold always returns Value")
    };
    let total = total.as_f64().unwrap_or(0.0);
    Ok(BuiltinOutcome::Value(Value::Double(total / items.len() as f64)))
}

fn method_min(ctx: BuiltinCtx<'_, '_>, receiver: Value, _args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    extremum(ctx, receiver, std::cmp::Ordering::Less)
}

fn method_max(ctx: BuiltinCtx<'_, '_>, receiver: Value, _args: Vec<Value>) -> Result<BuiltinOutcome, RuntimeError> {
    extremum(ctx, receiver, std::cmp::Ordering::Greater)
}

fn extremum(ctx: BuiltinCtx<'_, '_>, receiver: Value, want: std::cmp::Ordering) -> Result<BuiltinOutcome, RuntimeError> {
    let items = list_items(&ctx.vm.heap, &receiver)?;
    let mut best: Option<Value> = None;
    for item in items {
        best = Some(match best {
            None => item,
            Some(current) => {
                if ctx.vm.compare_values(&item, &current)? == want {
                    item
                } else {
                    current
                }
            }
        });
    }
    Ok(BuiltinOutcome::Value(best.unwrap_or(Value::Null)))
}

fn numeric_fold(items: &[Value], init: Value, f: impl Fn(Value, &Value) -> Result<Value, RuntimeError>) -> Result<BuiltinOutcome, RuntimeError> {
    let mut acc = init;
    for item in items {
        acc = f(acc, item)?;
    }
    Ok(BuiltinOutcome::Value(acc))
}

fn add_numeric(acc: Value, v: &Value) -> Result<Value, RuntimeError> {
    match (&acc, v) {
        (Value::Decimal(_), _) | (_, Value::Decimal(_)) => {
            let to_decimal = |x: &Value| match x {
                Value::Decimal(d) => d.clone(),
                other => Decimal::parse(&other.as_f64().unwrap_or(0.0).to_string()).unwrap_or_else(Decimal::zero),
            };
            Ok(Value::Decimal(to_decimal(&acc).add(&to_decimal(v))))
        }
        (Value::Double(_), _) | (_, Value::Double(_)) => {
            let a = acc.as_f64().ok_or_else(|| RuntimeError::new(ExcKind::NonNumericElement, "sum() over a non-numeric element", String::new(), 0))?;
            let b = v.as_f64().ok_or_else(|| RuntimeError::new(ExcKind::NonNumericElement, "sum() over a non-numeric element", String::new(), 0))?;
            Ok(Value::Double(a + b))
        }
        _ => {
            let a = acc.as_i64().ok_or_else(|| RuntimeError::new(ExcKind::NonNumericElement, "sum() over a non-numeric element", String::new(), 0))?;
            let b = v.as_i64().ok_or_else(|| RuntimeError::new(ExcKind::NonNumericElement, "sum() over a non-numeric element", String::new(), 0))?;
            Ok(Value::Long(a + b))
        }
    }
}

/// A deliberately small `%s`/`%d`/`%f`/`%%` substitution, enough for
/// scripts to format diagnostic text. Anything past these four verbs falls
/// back to `%s`-style display rather than erroring, matching the
/// teacher's permissive formatter philosophy.
fn format_sprintf(format: &str, args: &[Value], vm: &Vm<'_>) -> String {
    let mut out = String::new();
    let mut chars = format.chars().peekable();
    let mut arg_iter = args.iter();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('d') => {
                let v = arg_iter.next().cloned().unwrap_or(Value::Null);
                out.push_str(&v.as_i64().unwrap_or(0).to_string());
            }
            Some('f') => {
                let v = arg_iter.next().cloned().unwrap_or(Value::Null);
                out.push_str(&format!("{:.6}", v.as_f64().unwrap_or(0.0)));
            }
            Some('s') | None => {
                let v = arg_iter.next().cloned().unwrap_or(Value::Null);
                out.push_str(&vm.heap.display(&v));
            }
            Some(other) => {
                out.push('%');
                out.push(other);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interner;

    #[test]
    fn sleep_suspends_with_its_value() {
        let interner = Interner::new();
        let mut vm = Vm::new(&interner);
        let functions = FunctionTable::new();
        let mut resource = crate::resource::NoLimitTracker::new();
        let registry = Registry::standard();
        let ctx = BuiltinCtx { vm: &mut vm, functions: &functions, resource: &mut resource, registry: &registry };
        let outcome = fn_sleep(ctx, vec![Value::Int(5), Value::Str("done".into())]).unwrap();
        match outcome {
            BuiltinOutcome::Suspend(SuspendedCall::Sleep { duration_ms, value }) => {
                assert_eq!(duration_ms, 5);
                match value {
                    Value::Str(s) => assert_eq!(s, "done"),
                    _ => panic!("expected the carried value to round-trip as a string"),
                }
            }
            _ => panic!("expected a Sleep suspension"),
        }
    }

    #[test]
    fn format_sprintf_substitutes_known_verbs() {
        let interner = Interner::new();
        let vm = Vm::new(&interner);
        let rendered = format_sprintf("%s scored %d (%.2f%%)", &[Value::Str("Ann".into()), Value::Int(9), Value::Double(91.5)], &vm);
        assert_eq!(rendered, "Ann scored 9 (91.500000%)");
    }
}
