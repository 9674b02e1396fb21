//! The frame-stack bytecode interpreter (spec.md §4.5, §9) and its
//! suspension/resumption contract (spec.md §4.6).
//!
//! Every call — direct, dynamic, method, or builtin — goes through the
//! same `Call*` → `LoadPendingResult` shape: a function that happens to
//! never reach an async builtin never suspends, without the compiler
//! needing a second "guaranteed-sync" calling convention (SPEC_FULL.md
//! §4.5 point 5's chosen simplification, recorded in DESIGN.md).
//!
//! Grounded on the teacher's `bytecode::vm` explicit `Vec<Frame>` loop
//! (no native recursion for script calls, so the whole call stack can be
//! snapshotted) and its `resource.rs` tracker threading.

use crate::ast::BinOp;
use crate::bytecode::code::Code;
use crate::bytecode::op::{CaptureSource, Op};
use crate::error::{ExcKind, RuntimeError};
use crate::intern::{Interner, StringId};
use crate::resource::ResourceTracker;
use crate::runtime::closures::FunctionValue;
use crate::runtime::heap::{Heap, HeapId, HeapObject, JMap};
use crate::runtime::value::{Decimal, Value};
use crate::tracer::{NoopTracer, VmTracer};

/// Every compiled function, addressed by the stable id the resolver
/// handed out (spec.md §4.4's function ids, not names).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct FunctionTable {
    by_id: Vec<Code>,
    /// Receiver-class-name + method-name → `fn_id`, built by the compiler
    /// from every `ClassDescriptor`'s method table. Consulted by
    /// `Op::CallMethod` before falling back to `BuiltinRegistry`, so a
    /// dynamically-dispatched call on an `ANY` receiver still reaches a
    /// user-defined instance method (spec.md §4.4's virtual dispatch).
    by_class_method: ahash::AHashMap<(String, StringId), u32>,
    /// Receiver-class-name + field-name → field slot index. A bare
    /// `obj.field` read parses as a zero-arg `MethodCall` (this crate's
    /// uniform property-access convention, grounded on the teacher's
    /// attribute-lookup fallback in `vm::attr`); `Op::CallMethod` falls
    /// back to this table, then to `BuiltinRegistry`, when no method by
    /// that name exists.
    by_class_field: ahash::AHashMap<(String, StringId), u32>,
}

impl FunctionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: Code) {
        let id = code.fn_id as usize;
        if self.by_id.len() <= id {
            self.by_id.resize_with(id + 1, || Code::new(u32::MAX, String::new(), 0));
        }
        self.by_id[id] = code;
    }

    #[must_use]
    pub fn get(&self, fn_id: u32) -> &Code {
        &self.by_id[fn_id as usize]
    }

    pub fn get_mut(&mut self, fn_id: u32) -> &mut Code {
        &mut self.by_id[fn_id as usize]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn register_method(&mut self, class_name: String, method_name: StringId, fn_id: u32) {
        self.by_class_method.insert((class_name, method_name), fn_id);
    }

    #[must_use]
    pub fn lookup_method(&self, class_name: &str, method_name: StringId) -> Option<u32> {
        self.by_class_method.get(&(class_name.to_owned(), method_name)).copied()
    }

    pub fn register_field(&mut self, class_name: String, field_name: StringId, index: u32) {
        self.by_class_field.insert((class_name, field_name), index);
    }

    #[must_use]
    pub fn lookup_field(&self, class_name: &str, field_name: StringId) -> Option<u32> {
        self.by_class_field.get(&(class_name.to_owned(), field_name)).copied()
    }

    /// Every `(slot, name)` pair declared for `class_name`, names resolved
    /// to text via `interner`. Used by `Heap::structural_eq` to compare an
    /// instance against a map by field set (spec.md §3).
    #[must_use]
    pub fn field_names(&self, class_name: &str, interner: &Interner) -> Vec<(u32, String)> {
        self.by_class_field
            .iter()
            .filter(|entry| entry.0 .0 == class_name)
            .map(|entry| (*entry.1, interner.resolve(entry.0 .1).to_owned()))
            .collect()
    }
}

/// What an async builtin call suspends on. The VM itself never sleeps or
/// talks to storage: it just stops and hands the host this description
/// (spec.md §4.2's host-driven `sleep`/checkpoint contract).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum SuspendedCall {
    /// `sleep(duration_ms, value)`: the host waits (or schedules a wake-up)
    /// for `duration_ms` and then resumes with `value` — the builtin
    /// itself never computes the resumption value, so it travels with the
    /// suspension (spec.md §4.4: `sleep` is always async).
    Sleep { duration_ms: u64, value: Value },
    /// `_checkpoint(value)`: the host is handed the serialized
    /// continuation plus `value` (spec.md §4.6) and resumes with whatever
    /// `resumer(...)` argument it later supplies.
    Checkpoint { value: Value },
}

/// What a builtin call resolves to: either an ordinary return value, or
/// a request to suspend the whole call stack.
pub enum BuiltinOutcome {
    Value(Value),
    Suspend(SuspendedCall),
}

/// Implemented by `crate::builtins::Registry`. Kept as a trait here so
/// the VM's suspension contract doesn't depend on the concrete set of
/// built-in functions.
///
/// Both methods receive `functions`/`resource` alongside `vm` so a
/// combinator builtin (`map`/`filter`/`each`/`sort`/`reduce`) can call back
/// into the interpreter via [`Vm::call_value`] to invoke a closure argument.
pub trait BuiltinRegistry {
    fn call(
        &self,
        name: StringId,
        args: Vec<Value>,
        vm: &mut Vm<'_>,
        functions: &FunctionTable,
        resource: &mut dyn ResourceTracker,
    ) -> Result<BuiltinOutcome, RuntimeError>;

    fn call_method(
        &self,
        name: StringId,
        receiver: Value,
        args: Vec<Value>,
        vm: &mut Vm<'_>,
        functions: &FunctionTable,
        resource: &mut dyn ResourceTracker,
    ) -> Result<BuiltinOutcome, RuntimeError>;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Frame {
    pub fn_id: u32,
    pub ip: usize,
    pub locals: Vec<Value>,
    /// This frame's own capture cells (variables *it* declared that some
    /// nested closure captured), indexed by the slot the compiler
    /// assigned when promoting that local to a cell.
    pub owned_cells: Vec<HeapId>,
    /// Capture cells this frame received from its creator, because it is
    /// itself running as a closure over an enclosing scope.
    pub captures: Vec<HeapId>,
    pub stack: Vec<Value>,
    pub pending_result: Value,
}

impl Frame {
    fn new(fn_id: u32, num_locals: u32, num_owned_cells: u32, captures: Vec<HeapId>) -> Self {
        Self {
            fn_id,
            ip: 0,
            locals: vec![Value::Null; num_locals as usize],
            owned_cells: vec![HeapId(u32::MAX); num_owned_cells as usize],
            captures,
            stack: Vec::new(),
            pending_result: Value::Null,
        }
    }
}

/// A frozen call stack plus the heap it references, captured the moment
/// an async builtin asked to suspend (spec.md §4.6). Round-trips through
/// `crate::checkpoint`'s postcard wire format unchanged; the id-addressed
/// heap means a cyclic object graph serializes as a flat array, no
/// pointer-following walk required.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Continuation {
    pub heap: Heap,
    pub frames: Vec<Frame>,
    pub globals: JMap,
    pub suspended_on: SuspendedCall,
}

pub enum RunOutcome {
    Value(Value),
    Suspended(Continuation),
    Error(RuntimeError),
}

pub struct Vm<'a> {
    pub heap: Heap,
    pub frames: Vec<Frame>,
    pub interner: &'a Interner,
    /// Script-level globals (spec.md §4.3), keyed by name rather than a
    /// compile-time slot since a `Context`'s global set can grow across
    /// separately compiled scripts sharing one `Vm`.
    pub globals: JMap,
    /// Execution tracer (SPEC_FULL.md §4.5 ambient observability);
    /// `NoopTracer` by default so a `Context` that never calls `debug()`
    /// pays nothing for it.
    tracer: Box<dyn VmTracer>,
    /// While a nested call made via [`Self::call_value`] is running, a
    /// `sleep` that would otherwise suspend the whole stack instead
    /// resolves immediately with its resumption value, and a `_checkpoint`
    /// is rejected. Built-in method bodies are outside the continuation
    /// ABI's scope (the registration contract and async-tagging are what's
    /// covered); this keeps a combinator like `map` over an async closure
    /// returning the right value without pretending it can suspend the
    /// host mid-iteration. Recorded as an open design decision in
    /// DESIGN.md.
    suppress_suspension: bool,
}

impl<'a> Vm<'a> {
    #[must_use]
    pub fn new(interner: &'a Interner) -> Self {
        Self { heap: Heap::new(), frames: Vec::new(), interner, globals: JMap::new(), tracer: Box::new(NoopTracer), suppress_suspension: false }
    }

    pub fn set_tracer(&mut self, tracer: Box<dyn VmTracer>) {
        self.tracer = tracer;
    }

    /// Starts a fresh call to `fn_id` with `args` and runs until the
    /// script returns, errors, or suspends.
    pub fn call(
        &mut self,
        functions: &FunctionTable,
        builtins: &dyn BuiltinRegistry,
        resource: &mut dyn ResourceTracker,
        fn_id: u32,
        args: Vec<Value>,
    ) -> RunOutcome {
        let code = functions.get(fn_id);
        let mut frame = Frame::new(fn_id, code.num_locals, code.num_owned_cells, Vec::new());
        for (i, arg) in args.into_iter().enumerate() {
            frame.locals[i] = arg;
        }
        self.frames.push(frame);
        self.run(functions, builtins, resource)
    }

    /// Resumes a previously-suspended continuation by restoring its
    /// frames/heap and feeding `resume_value` back to whichever frame is
    /// waiting on its `LoadPendingResult` (spec.md §4.6: the resumer
    /// value is host-supplied, not reconstructed from the serialized
    /// state).
    pub fn resume(
        &mut self,
        functions: &FunctionTable,
        builtins: &dyn BuiltinRegistry,
        resource: &mut dyn ResourceTracker,
        continuation: Continuation,
        resume_value: Value,
    ) -> RunOutcome {
        self.heap = continuation.heap;
        self.frames = continuation.frames;
        self.globals = continuation.globals;
        if let Some(top) = self.frames.last_mut() {
            top.pending_result = resume_value;
        }
        self.run(functions, builtins, resource)
    }

    fn run(&mut self, functions: &FunctionTable, builtins: &dyn BuiltinRegistry, resource: &mut dyn ResourceTracker) -> RunOutcome {
        loop {
            if let Err(e) = resource.check_operation() {
                return RunOutcome::Error(self.resource_error(&e));
            }
            let Some(frame) = self.frames.last() else {
                return RunOutcome::Value(Value::Null);
            };
            let code = functions.get(frame.fn_id);
            if frame.ip >= code.ops.len() {
                return RunOutcome::Value(Value::Null);
            }
            let op = code.ops[frame.ip].clone();
            let fn_id = frame.fn_id;
            let ip = frame.ip;
            self.frames.last_mut().unwrap().ip += 1;
            self.tracer.on_instruction(fn_id, ip, &op);

            match self.step(functions, builtins, resource, &op) {
                Ok(StepResult::Continue) => {}
                Ok(StepResult::Returned(value)) => {
                    self.tracer.on_return(self.frames.len());
                    if self.frames.is_empty() {
                        return RunOutcome::Value(value);
                    }
                }
                Ok(StepResult::Suspended(call)) => {
                    self.tracer.on_suspend(self.frames.len());
                    return RunOutcome::Suspended(Continuation {
                        heap: std::mem::take(&mut self.heap),
                        frames: std::mem::take(&mut self.frames),
                        globals: std::mem::take(&mut self.globals),
                        suspended_on: call,
                    });
                }
                Err(e) => return RunOutcome::Error(e),
            }
        }
    }

    fn resource_error(&self, e: &crate::resource::ResourceError) -> RuntimeError {
        RuntimeError::new(ExcKind::NumberTooLarge, e.to_string(), String::new(), 0)
    }

    fn err(&self, kind: ExcKind, message: impl Into<String>) -> RuntimeError {
        RuntimeError::new(kind, message, String::new(), 0)
    }

    fn step(
        &mut self,
        functions: &FunctionTable,
        builtins: &dyn BuiltinRegistry,
        resource: &mut dyn ResourceTracker,
        op: &Op,
    ) -> Result<StepResult, RuntimeError> {
        match op {
            Op::Const(idx) => {
                let code = functions.get(self.top().fn_id);
                let value = code.constants[*idx as usize].clone();
                self.push(value);
            }
            Op::PushNull => self.push(Value::Null),
            Op::PushTrue => self.push(Value::Bool(true)),
            Op::PushFalse => self.push(Value::Bool(false)),
            Op::Pop => {
                self.pop()?;
            }
            Op::Dup => {
                let v = self.peek()?.clone();
                self.push(v);
            }
            Op::Swap => {
                let len = self.top().stack.len();
                if len < 2 {
                    return Err(self.err(ExcKind::IndexOutOfBounds, "stack underflow on swap"));
                }
                self.top_mut().stack.swap(len - 1, len - 2);
            }
            Op::LoadLocal(slot) => {
                let v = self.top().locals[*slot as usize].clone();
                self.push(v);
            }
            Op::StoreLocal(slot) => {
                let v = self.pop()?;
                self.top_mut().locals[*slot as usize] = v;
            }
            Op::LoadCaptured(slot) => {
                let id = self.top().captures[*slot as usize];
                let HeapObject::Cell(v) = self.heap.get(id) else {
                    return Err(self.err(ExcKind::NullDereference, "capture slot is not a cell"));
                };
                self.push(v.clone());
            }
            Op::StoreCaptured(slot) => {
                let v = self.pop()?;
                let id = self.top().captures[*slot as usize];
                *self.heap.get_mut(id) = HeapObject::Cell(v);
            }
            Op::LoadGlobal(name) => {
                let key = self.interner.resolve(*name);
                let v = self.globals.get(key).cloned().unwrap_or(Value::Null);
                self.push(v);
            }
            Op::StoreGlobal(name) => {
                let v = self.pop()?;
                let key = self.interner.resolve(*name).to_owned();
                self.globals.insert(key, v);
            }
            Op::LoadField(index) => {
                let receiver = self.pop()?;
                let Value::Ref(id) = receiver else {
                    return Err(self.err(ExcKind::NullDereference, "field access on non-instance"));
                };
                let HeapObject::Instance(inst) = self.heap.get(id) else {
                    return Err(self.err(ExcKind::NullDereference, "field access on non-instance"));
                };
                self.push(inst.field(*index).clone());
            }
            Op::StoreField(index) => {
                let value = self.pop()?;
                let receiver = self.pop()?;
                let Value::Ref(id) = receiver else {
                    return Err(self.err(ExcKind::NullDereference, "field assign on non-instance"));
                };
                let HeapObject::Instance(inst) = self.heap.get_mut(id) else {
                    return Err(self.err(ExcKind::NullDereference, "field assign on non-instance"));
                };
                inst.set_field(*index, value);
            }
            Op::StoreFieldByName(name) => {
                let value = self.pop()?;
                let receiver = self.pop()?;
                let Value::Ref(id) = receiver else {
                    return Err(self.err(ExcKind::NullDereference, "field assign on non-instance"));
                };
                let class_name = match self.heap.get(id) {
                    HeapObject::Instance(inst) => inst.class_name.clone(),
                    _ => return Err(self.err(ExcKind::NullDereference, "field assign on non-instance")),
                };
                let Some(index) = functions.lookup_field(&class_name, *name) else {
                    return Err(self.err(ExcKind::MissingMandatoryField, format!("no such field '{}' on {class_name}", self.interner.resolve(*name))));
                };
                let HeapObject::Instance(inst) = self.heap.get_mut(id) else {
                    return Err(self.err(ExcKind::NullDereference, "field assign on non-instance"));
                };
                inst.set_field(index, value);
            }
            Op::LoadThis => {
                let v = self.top().locals[0].clone();
                self.push(v);
            }
            Op::MakeOwnedCell(slot) => {
                resource.on_allocate().map_err(|e| self.resource_error(&e))?;
                let v = self.pop()?;
                let id = self.heap.alloc(HeapObject::Cell(v));
                self.top_mut().owned_cells[*slot as usize] = id;
            }
            Op::LoadOwnedCell(slot) => {
                let id = self.top().owned_cells[*slot as usize];
                let HeapObject::Cell(v) = self.heap.get(id) else {
                    return Err(self.err(ExcKind::NullDereference, "owned cell slot is not a cell"));
                };
                self.push(v.clone());
            }
            Op::StoreOwnedCell(slot) => {
                let v = self.pop()?;
                let id = self.top().owned_cells[*slot as usize];
                *self.heap.get_mut(id) = HeapObject::Cell(v);
            }
            Op::Binary(bin_op) => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let result = self.binary(*bin_op, lhs, rhs, functions)?;
                self.push(result);
            }
            Op::Neg => {
                let v = self.pop()?;
                self.push(self.negate(v)?);
            }
            Op::Not => {
                let v = self.pop()?;
                self.push(Value::Bool(!v.truthy()));
            }
            Op::BitNot => {
                let v = self.pop()?;
                let i = v.as_i64().ok_or_else(|| self.err(ExcKind::CastFailure, "bitwise not on non-integer"))?;
                self.push(Value::Long(!i));
            }
            Op::PreIncr | Op::PreDecr | Op::PostIncr | Op::PostDecr => {
                return Err(self.err(ExcKind::CastFailure, "increment/decrement must be compiled to load/store pairs"));
            }
            Op::Jump(target) => {
                self.top_mut().ip = *target as usize;
            }
            Op::JumpIfFalse(target) => {
                let v = self.pop()?;
                if !v.truthy() {
                    self.top_mut().ip = *target as usize;
                }
            }
            Op::JumpIfTrue(target) => {
                let v = self.pop()?;
                if v.truthy() {
                    self.top_mut().ip = *target as usize;
                }
            }
            Op::JumpIfNull(target) => {
                if matches!(self.peek()?, Value::Null) {
                    self.top_mut().ip = *target as usize;
                }
            }
            Op::MakeList(count) => {
                resource.on_allocate().map_err(|e| self.resource_error(&e))?;
                let items = self.pop_n(*count as usize)?;
                let id = self.heap.alloc(HeapObject::List(items));
                self.push(Value::Ref(id));
            }
            Op::MakeMap(count) => {
                resource.on_allocate().map_err(|e| self.resource_error(&e))?;
                let mut entries = self.pop_n(*count as usize * 2)?;
                let mut map: JMap = JMap::new();
                let mut iter = entries.drain(..);
                while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                    let Value::Str(k) = key else {
                        return Err(self.err(ExcKind::CastFailure, "map keys must be strings"));
                    };
                    map.insert(k, value);
                }
                let id = self.heap.alloc(HeapObject::Map(map));
                self.push(Value::Ref(id));
            }
            Op::MakeClosure { fn_id, captures } => {
                resource.on_allocate().map_err(|e| self.resource_error(&e))?;
                let cells = captures
                    .iter()
                    .map(|c| match c {
                        CaptureSource::FromLocalCell(slot) => self.top().owned_cells[*slot as usize],
                        CaptureSource::FromOuterCapture(slot) => self.top().captures[*slot as usize],
                    })
                    .collect();
                let id = self.heap.alloc(HeapObject::FunctionValue(FunctionValue::new(*fn_id, cells)));
                self.push(Value::Ref(id));
            }
            Op::CallDynamic(argc) => {
                let args = self.pop_n(*argc as usize)?;
                let callee = self.pop()?;
                return self.invoke_dynamic(functions, resource, callee, args);
            }
            Op::CallDirect { fn_id, argc } => {
                let args = self.pop_n(*argc as usize)?;
                return self.invoke_direct(functions, resource, *fn_id, args);
            }
            Op::CallInit { fn_id, argc } => {
                let args = self.pop_n(*argc as usize)?;
                let this = self.pop()?;
                resource.check_recursion_depth(self.frames.len()).map_err(|e| self.resource_error(&e))?;
                let code = functions.get(*fn_id);
                let mut frame = Frame::new(*fn_id, code.num_locals, code.num_owned_cells, Vec::new());
                frame.locals[0] = this;
                for (i, arg) in args.into_iter().enumerate() {
                    frame.locals[i + 1] = arg;
                }
                self.frames.push(frame);
                self.tracer.on_call(*fn_id, self.frames.len());
                return Ok(StepResult::Continue);
            }
            Op::CallNamed { fn_id, arg_slots } => {
                let values = self.pop_n(arg_slots.len())?;
                let code = functions.get(*fn_id);
                let mut args = vec![Value::Null; code.num_locals as usize];
                for (slot, value) in arg_slots.iter().zip(values) {
                    args[*slot as usize] = value;
                }
                return self.invoke_direct(functions, resource, *fn_id, args);
            }
            Op::CallMethod { name, argc } => {
                let args = self.pop_n(*argc as usize)?;
                let receiver = self.pop()?;
                if let Value::Ref(id) = &receiver {
                    let class_name = match self.heap.get(*id) {
                        HeapObject::Instance(inst) => Some(inst.class_name.clone()),
                        _ => None,
                    };
                    if let Some(class_name) = class_name {
                        if let Some(fn_id) = functions.lookup_method(&class_name, *name) {
                            let mut all_args = Vec::with_capacity(args.len() + 1);
                            all_args.push(receiver);
                            all_args.extend(args);
                            return self.invoke_direct(functions, resource, fn_id, all_args);
                        }
                        if args.is_empty() {
                            if let Some(index) = functions.lookup_field(&class_name, *name) {
                                let HeapObject::Instance(inst) = self.heap.get(*id) else {
                                    unreachable!("class_name was read from this same instance above")
                                };
                                let v = inst.field(index).clone();
                                return Ok(StepResult::Returned(self.deliver(v)));
                            }
                        }
                    }
                }
                match builtins.call_method(*name, receiver, args, self, functions, resource)? {
                    BuiltinOutcome::Value(v) => return Ok(StepResult::Returned(self.deliver(v))),
                    BuiltinOutcome::Suspend(call) => return self.resolve_or_suspend(call),
                }
            }
            Op::CallBuiltin { name, argc } => {
                let args = self.pop_n(*argc as usize)?;
                match builtins.call(*name, args, self, functions, resource)? {
                    BuiltinOutcome::Value(v) => return Ok(StepResult::Returned(self.deliver(v))),
                    BuiltinOutcome::Suspend(call) => return self.resolve_or_suspend(call),
                }
            }
            Op::New { class, field_count } => {
                resource.on_allocate().map_err(|e| self.resource_error(&e))?;
                let instance = crate::runtime::instance::Instance::new(class.clone(), *field_count as usize);
                let id = self.heap.alloc(HeapObject::Instance(instance));
                self.push(Value::Ref(id));
            }
            Op::Cast(ty) | Op::ConvertTo(ty) => {
                let v = self.pop()?;
                self.push(self.cast(v, ty)?);
            }
            Op::InstanceOf(class_name) => {
                let v = self.pop()?;
                let is = match v {
                    Value::Ref(id) => matches!(self.heap.get(id), HeapObject::Instance(i) if &i.class_name == class_name),
                    _ => false,
                };
                self.push(Value::Bool(is));
            }
            Op::ArrayGet => {
                let index = self.pop()?;
                let array = self.pop()?;
                let idx = index.as_i64().ok_or_else(|| self.err(ExcKind::CastFailure, "index must be numeric"))?;
                let Value::Ref(id) = array else {
                    return Err(self.err(ExcKind::NullDereference, "indexing a non-collection"));
                };
                match self.heap.get(id) {
                    HeapObject::List(items) | HeapObject::Array(items) => {
                        let i = Self::normalize_index(idx, items.len())?;
                        self.push(items[i].clone());
                    }
                    _ => return Err(self.err(ExcKind::CastFailure, "indexing a non-list")),
                }
            }
            Op::ArraySet => {
                let value = self.pop()?;
                let index = self.pop()?;
                let array = self.pop()?;
                let idx = index.as_i64().ok_or_else(|| self.err(ExcKind::CastFailure, "index must be numeric"))?;
                let Value::Ref(id) = array else {
                    return Err(self.err(ExcKind::NullDereference, "indexing a non-collection"));
                };
                match self.heap.get_mut(id) {
                    HeapObject::List(items) | HeapObject::Array(items) => {
                        let i = Self::normalize_index(idx, items.len())?;
                        items[i] = value;
                    }
                    _ => return Err(self.err(ExcKind::CastFailure, "indexing a non-list")),
                }
            }
            Op::ArrayLength => {
                let array = self.pop()?;
                let Value::Ref(id) = array else {
                    return Err(self.err(ExcKind::NullDereference, "length of a non-collection"));
                };
                let len = match self.heap.get(id) {
                    HeapObject::List(items) | HeapObject::Array(items) => items.len(),
                    HeapObject::Map(map) => map.len(),
                    _ => return Err(self.err(ExcKind::CastFailure, "length of a non-collection")),
                };
                self.push(Value::Int(len as i32));
            }
            Op::Return => {
                let value = self.pop().unwrap_or(Value::Null);
                self.frames.pop();
                return Ok(StepResult::Returned(self.deliver(value)));
            }
            Op::Print { newline } => {
                let v = self.pop()?;
                let text = self.heap.display(&v);
                if *newline {
                    println!("{text}");
                } else {
                    print!("{text}");
                }
                self.push(Value::Null);
            }
            Op::Die => {
                let v = self.pop()?;
                return Err(self.err(ExcKind::BadFormatString, self.heap.display(&v)));
            }
            Op::RegexMatch { negated } => {
                let pattern = self.pop()?;
                let subject = self.pop()?;
                let matched = crate::regex_lit::matches(&self.heap.display(&subject), &self.heap.display(&pattern))
                    .map_err(|e| self.err(ExcKind::RegexFailure, e))?;
                self.push(Value::Bool(matched != *negated));
            }
            Op::RegexSubst => {
                return Err(self.err(ExcKind::RegexFailure, "substitution operator must be compiled to a builtin call"));
            }
            Op::LoadPendingResult => {
                let v = std::mem::replace(&mut self.top_mut().pending_result, Value::Null);
                self.push(v);
            }
        }
        Ok(StepResult::Continue)
    }

    /// Turns a builtin's suspend request into a real `StepResult::Suspended`
    /// unless we're inside a [`Self::call_value`] nested call, in which case
    /// it resolves inline instead of unwinding the whole stack.
    fn resolve_or_suspend(&mut self, call: SuspendedCall) -> Result<StepResult, RuntimeError> {
        if !self.suppress_suspension {
            return Ok(StepResult::Suspended(call));
        }
        match call {
            SuspendedCall::Sleep { value, .. } => Ok(StepResult::Returned(self.deliver(value))),
            SuspendedCall::Checkpoint { .. } => Err(self.err(
                ExcKind::CheckpointInsideCombinator,
                "_checkpoint cannot suspend from inside a built-in combinator closure",
            )),
        }
    }

    /// Invokes `callee` (a closure or bound method reference) with `args`
    /// and runs it to completion before returning, for use by combinator
    /// builtins (`map`/`filter`/`each`/`sort`/`reduce`) that need to call a
    /// closure argument without themselves becoming part of the bytecode
    /// call graph. See [`Self::suppress_suspension`] for what this means
    /// for a closure that itself calls `sleep`/`_checkpoint`.
    pub fn call_value(
        &mut self,
        functions: &FunctionTable,
        builtins: &dyn BuiltinRegistry,
        resource: &mut dyn ResourceTracker,
        callee: Value,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        let depth = self.frames.len();
        self.invoke_dynamic(functions, resource, callee, args)?;
        let previous = self.suppress_suspension;
        self.suppress_suspension = true;
        let result = loop {
            if let Err(e) = resource.check_operation() {
                break Err(self.resource_error(&e));
            }
            let Some(frame) = self.frames.last() else {
                break Ok(Value::Null);
            };
            let code = functions.get(frame.fn_id);
            if frame.ip >= code.ops.len() {
                break Ok(Value::Null);
            }
            let op = code.ops[frame.ip].clone();
            self.frames.last_mut().unwrap().ip += 1;
            match self.step(functions, builtins, resource, &op) {
                Ok(StepResult::Continue) => {}
                Ok(StepResult::Returned(value)) => {
                    if self.frames.len() == depth {
                        break Ok(value);
                    }
                }
                Ok(StepResult::Suspended(_)) => unreachable!("suspension is suppressed for call_value"),
                Err(e) => break Err(e),
            }
        };
        self.suppress_suspension = previous;
        result
    }

    fn deliver(&mut self, value: Value) -> Value {
        if let Some(caller) = self.frames.last_mut() {
            caller.pending_result = value.clone();
        }
        value
    }

    fn invoke_direct(
        &mut self,
        functions: &FunctionTable,
        resource: &mut dyn ResourceTracker,
        fn_id: u32,
        args: Vec<Value>,
    ) -> Result<StepResult, RuntimeError> {
        resource.check_recursion_depth(self.frames.len()).map_err(|e| self.resource_error(&e))?;
        let code = functions.get(fn_id);
        let mut frame = Frame::new(fn_id, code.num_locals, code.num_owned_cells, Vec::new());
        for (i, arg) in args.into_iter().enumerate() {
            frame.locals[i] = arg;
        }
        self.frames.push(frame);
        self.tracer.on_call(fn_id, self.frames.len());
        Ok(StepResult::Continue)
    }

    fn invoke_dynamic(
        &mut self,
        functions: &FunctionTable,
        resource: &mut dyn ResourceTracker,
        callee: Value,
        mut args: Vec<Value>,
    ) -> Result<StepResult, RuntimeError> {
        let Value::Ref(id) = callee else {
            return Err(self.err(ExcKind::NullDereference, "calling a non-function value"));
        };
        let HeapObject::FunctionValue(f) = self.heap.get(id).clone() else {
            return Err(self.err(ExcKind::NullDereference, "calling a non-function value"));
        };
        if let Some(receiver) = f.bound_receiver.clone() {
            args.insert(0, receiver);
        }
        resource.check_recursion_depth(self.frames.len()).map_err(|e| self.resource_error(&e))?;
        let code = functions.get(f.fn_id);
        let mut frame = Frame::new(f.fn_id, code.num_locals, code.num_owned_cells, f.captures.clone());
        for (i, arg) in args.into_iter().enumerate() {
            frame.locals[i] = arg;
        }
        self.frames.push(frame);
        self.tracer.on_call(f.fn_id, self.frames.len());
        Ok(StepResult::Continue)
    }

    fn normalize_index(idx: i64, len: usize) -> Result<usize, RuntimeError> {
        let resolved = if idx < 0 { idx + len as i64 } else { idx };
        if resolved < 0 || resolved as usize >= len {
            return Err(RuntimeError::new(ExcKind::IndexOutOfBounds, format!("index {idx} out of bounds for length {len}"), String::new(), 0));
        }
        Ok(resolved as usize)
    }

    fn top(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    fn top_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    fn push(&mut self, v: Value) {
        self.top_mut().stack.push(v);
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.top_mut().stack.pop().ok_or_else(|| RuntimeError::new(ExcKind::IndexOutOfBounds, "operand stack underflow", String::new(), 0))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, RuntimeError> {
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(self.pop()?);
        }
        values.reverse();
        Ok(values)
    }

    fn peek(&self) -> Result<&Value, RuntimeError> {
        self.top().stack.last().ok_or_else(|| RuntimeError::new(ExcKind::IndexOutOfBounds, "operand stack underflow", String::new(), 0))
    }

    fn negate(&self, v: Value) -> Result<Value, RuntimeError> {
        match v {
            Value::Int(i) => Ok(Value::Int(-i)),
            Value::Long(l) => Ok(Value::Long(-l)),
            Value::Double(d) => Ok(Value::Double(-d)),
            Value::Decimal(d) => Ok(Value::Decimal(d.neg())),
            _ => Err(self.err(ExcKind::CastFailure, "unary minus on non-numeric value")),
        }
    }

    fn cast(&self, v: Value, ty: &crate::types::Type) -> Result<Value, RuntimeError> {
        use crate::types::Type;
        match (ty, &v) {
            (Type::Int, _) => v.as_i64().map(|i| Value::Int(i as i32)).ok_or_else(|| self.err(ExcKind::CastFailure, "cannot cast to int")),
            (Type::Long, _) => v.as_i64().map(Value::Long).ok_or_else(|| self.err(ExcKind::CastFailure, "cannot cast to long")),
            (Type::Double, _) => v.as_f64().map(Value::Double).ok_or_else(|| self.err(ExcKind::CastFailure, "cannot cast to double")),
            _ => Ok(v),
        }
    }

    fn binary(&self, op: BinOp, lhs: Value, rhs: Value, functions: &FunctionTable) -> Result<Value, RuntimeError> {
        match op {
            BinOp::Add if matches!(lhs, Value::Str(_)) || matches!(rhs, Value::Str(_)) => {
                Ok(Value::Str(format!("{}{}", self.heap.display(&lhs), self.heap.display(&rhs))))
            }
            BinOp::Add => self.arith(lhs, rhs, |a, b| a + b, |a, b| a + b, Decimal::add),
            BinOp::Sub => self.arith(lhs, rhs, |a, b| a - b, |a, b| a - b, Decimal::sub),
            BinOp::Mul => self.arith(lhs, rhs, |a, b| a * b, |a, b| a * b, Decimal::mul),
            BinOp::Div => {
                if let (Value::Decimal(a), Value::Decimal(b)) = (&lhs, &rhs) {
                    if b.coefficient == num_bigint::BigInt::from(0) {
                        return Err(self.err(ExcKind::DivisionByZero, "division by zero"));
                    }
                    let _ = a;
                }
                let a = lhs.as_f64().ok_or_else(|| self.err(ExcKind::CastFailure, "division on non-numeric value"))?;
                let b = rhs.as_f64().ok_or_else(|| self.err(ExcKind::CastFailure, "division on non-numeric value"))?;
                if b == 0.0 && matches!(rhs, Value::Int(_) | Value::Long(_) | Value::Byte(_)) {
                    return Err(self.err(ExcKind::DivisionByZero, "division by zero"));
                }
                Ok(Value::Double(a / b))
            }
            BinOp::Mod => {
                let a = lhs.as_i64().ok_or_else(|| self.err(ExcKind::CastFailure, "modulo on non-integer value"))?;
                let b = rhs.as_i64().ok_or_else(|| self.err(ExcKind::CastFailure, "modulo on non-integer value"))?;
                if b == 0 {
                    return Err(self.err(ExcKind::DivisionByZero, "modulo by zero"));
                }
                Ok(Value::Long(a % b))
            }
            BinOp::Pow => {
                let a = lhs.as_f64().ok_or_else(|| self.err(ExcKind::CastFailure, "power on non-numeric value"))?;
                let b = rhs.as_f64().ok_or_else(|| self.err(ExcKind::CastFailure, "power on non-numeric value"))?;
                Ok(Value::Double(a.powf(b)))
            }
            BinOp::And => Ok(Value::Bool(lhs.truthy() && rhs.truthy())),
            BinOp::Or => Ok(Value::Bool(lhs.truthy() || rhs.truthy())),
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr | BinOp::UShr => {
                let a = lhs.as_i64().ok_or_else(|| self.err(ExcKind::CastFailure, "bitwise op on non-integer value"))?;
                let b = rhs.as_i64().ok_or_else(|| self.err(ExcKind::CastFailure, "bitwise op on non-integer value"))?;
                Ok(Value::Long(match op {
                    BinOp::BitAnd => a & b,
                    BinOp::BitOr => a | b,
                    BinOp::BitXor => a ^ b,
                    BinOp::Shl => a << (b & 63),
                    BinOp::Shr => a >> (b & 63),
                    BinOp::UShr => ((a as u64) >> (b & 63)) as i64,
                    _ => unreachable!(),
                }))
            }
            BinOp::Eq => Ok(Value::Bool(self.heap.structural_eq(&lhs, &rhs, functions, self.interner))),
            BinOp::Ne => Ok(Value::Bool(!self.heap.structural_eq(&lhs, &rhs, functions, self.interner))),
            BinOp::Identity => Ok(Value::Bool(Self::identical(&lhs, &rhs))),
            BinOp::NotIdentity => Ok(Value::Bool(!Self::identical(&lhs, &rhs))),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Compare => {
                let ordering = self.compare(&lhs, &rhs)?;
                Ok(match op {
                    BinOp::Lt => Value::Bool(ordering.is_lt()),
                    BinOp::Le => Value::Bool(ordering.is_le()),
                    BinOp::Gt => Value::Bool(ordering.is_gt()),
                    BinOp::Ge => Value::Bool(ordering.is_ge()),
                    BinOp::Compare => Value::Int(ordering as i32),
                    _ => unreachable!(),
                })
            }
            BinOp::Instanceof => Err(self.err(ExcKind::CastFailure, "instanceof must be compiled to InstanceOf")),
        }
    }

    /// Exposed for built-in methods (`sort`, `min`, `max`) that need the
    /// same ordering rules `<`/`>` use without reimplementing numeric
    /// widening and `Decimal`/`String` comparison themselves.
    pub fn compare_values(&self, lhs: &Value, rhs: &Value) -> Result<std::cmp::Ordering, RuntimeError> {
        self.compare(lhs, rhs)
    }

    fn identical(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Ref(x), Value::Ref(y)) => x == y,
            _ => false,
        }
    }

    fn compare(&self, lhs: &Value, rhs: &Value) -> Result<std::cmp::Ordering, RuntimeError> {
        if let (Value::Decimal(a), Value::Decimal(b)) = (lhs, rhs) {
            return Ok(a.cmp(b));
        }
        if let (Value::Str(a), Value::Str(b)) = (lhs, rhs) {
            return Ok(a.cmp(b));
        }
        let a = lhs.as_f64().ok_or_else(|| self.err(ExcKind::CastFailure, "comparison on non-comparable value"))?;
        let b = rhs.as_f64().ok_or_else(|| self.err(ExcKind::CastFailure, "comparison on non-comparable value"))?;
        a.partial_cmp(&b).ok_or_else(|| self.err(ExcKind::CastFailure, "comparison produced NaN"))
    }

    fn arith(
        &self,
        lhs: Value,
        rhs: Value,
        f_int: fn(i64, i64) -> i64,
        f_float: fn(f64, f64) -> f64,
        f_decimal: fn(&Decimal, &Decimal) -> Decimal,
    ) -> Result<Value, RuntimeError> {
        match (&lhs, &rhs) {
            (Value::Decimal(_), _) | (_, Value::Decimal(_)) => {
                let to_decimal = |v: &Value| match v {
                    Value::Decimal(d) => d.clone(),
                    _ => Decimal::parse(&self.heap.display(v)).unwrap_or_else(Decimal::zero),
                };
                Ok(Value::Decimal(f_decimal(&to_decimal(&lhs), &to_decimal(&rhs))))
            }
            (Value::Double(_), _) | (_, Value::Double(_)) => {
                let a = lhs.as_f64().ok_or_else(|| self.err(ExcKind::CastFailure, "arithmetic on non-numeric value"))?;
                let b = rhs.as_f64().ok_or_else(|| self.err(ExcKind::CastFailure, "arithmetic on non-numeric value"))?;
                Ok(Value::Double(f_float(a, b)))
            }
            (Value::Long(_), _) | (_, Value::Long(_)) => {
                let a = lhs.as_i64().ok_or_else(|| self.err(ExcKind::CastFailure, "arithmetic on non-numeric value"))?;
                let b = rhs.as_i64().ok_or_else(|| self.err(ExcKind::CastFailure, "arithmetic on non-numeric value"))?;
                Ok(Value::Long(f_int(a, b)))
            }
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(f_int(i64::from(*a), i64::from(*b)) as i32)),
            (Value::Byte(a), Value::Byte(b)) => Ok(Value::Int(f_int(i64::from(*a), i64::from(*b)) as i32)),
            _ => Err(self.err(ExcKind::CastFailure, "arithmetic on non-numeric value")),
        }
    }
}

enum StepResult {
    Continue,
    Returned(Value),
    Suspended(SuspendedCall),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::code::Code;

    struct EmptyBuiltins;
    impl BuiltinRegistry for EmptyBuiltins {
        fn call(&self, _name: StringId, _args: Vec<Value>, _vm: &mut Vm<'_>, _functions: &FunctionTable, _resource: &mut dyn ResourceTracker) -> Result<BuiltinOutcome, RuntimeError> {
            Err(RuntimeError::new(ExcKind::UnknownVariable, "no builtins registered", String::new(), 0))
        }
        fn call_method(
            &self,
            _name: StringId,
            _receiver: Value,
            _args: Vec<Value>,
            _vm: &mut Vm<'_>,
            _functions: &FunctionTable,
            _resource: &mut dyn ResourceTracker,
        ) -> Result<BuiltinOutcome, RuntimeError> {
            Err(RuntimeError::new(ExcKind::UnknownVariable, "no builtins registered", String::new(), 0))
        }
    }

    #[test]
    fn adds_two_constants_and_returns() {
        let interner = Interner::new();
        let mut code = Code::new(0, "main".into(), 0);
        code.constants.push(Value::Int(2));
        code.constants.push(Value::Int(3));
        code.num_locals = 0;
        code.ops = vec![Op::Const(0), Op::Const(1), Op::Binary(BinOp::Add), Op::Return];
        let mut functions = FunctionTable::new();
        functions.insert(code);

        let mut vm = Vm::new(&interner);
        let mut resource = crate::resource::NoLimitTracker::new();
        let builtins = EmptyBuiltins;
        match vm.call(&functions, &builtins, &mut resource, 0, Vec::new()) {
            RunOutcome::Value(Value::Int(n)) => assert_eq!(n, 5),
            _ => panic!("expected Value(Int(5))"),
        }
    }
}
