//! Embedding surface (spec.md §6): `Context`/`ContextBuilder`, and the
//! `compileScript`/`compileClass`/`eval` entry points that drive the
//! lexer → parser → resolver → analyser → compiler pipeline.
//!
//! Grounded on the teacher's `Context`/`CompilerOptions` split: a
//! `Context` owns the options a compile needs plus a registry later
//! compiles can extend, while the actual pipeline wiring lives in one
//! free function per entry point rather than as `Context` methods, so it
//! stays easy to unit test a single stage without constructing a whole
//! `Context`.

use std::sync::{Arc, RwLock};

use ahash::AHashMap;

use crate::analyser::Analyser;
use crate::ast::Stmt;
use crate::builtins::Registry;
use crate::checkpoint::CheckpointStore;
use crate::class::ClassDescriptor;
use crate::error::{Diagnostic, Exception};
use crate::intern::Interner;
use crate::parser::Parser;
use crate::resolver::Resolver;
use crate::runtime::value::Value;
use crate::runtime::vm::FunctionTable;
use crate::script::Script;
use crate::tracer::{NoopTracer, StderrTracer, VmTracer};

/// Chainable compile-time options (spec.md §6). Mirrors the teacher's
/// `CompilerOptions` struct in spirit: a small bag of flags a `Context`
/// carries through every `compileScript`/`compileClass` call, rather than
/// the caller re-specifying them per compile.
#[derive(Clone)]
struct ContextOptions {
    environment: Option<String>,
    evaluate_const_exprs: bool,
    repl_mode: bool,
    class_access_to_globals: bool,
    debug_level: u8,
    checkpoint: bool,
    restore: bool,
    auto_create_async: bool,
    package: Option<String>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            environment: None,
            evaluate_const_exprs: true,
            repl_mode: false,
            class_access_to_globals: false,
            debug_level: 0,
            checkpoint: true,
            restore: true,
            auto_create_async: true,
            package: None,
        }
    }
}

/// Builder returned by [`Context::create`]. `build()` finalizes the
/// options into an immutable [`Context`].
pub struct ContextBuilder {
    options: ContextOptions,
    builtins: Option<Registry>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
}

impl ContextBuilder {
    fn new() -> Self {
        Self { options: ContextOptions::default(), builtins: None, checkpoint_store: None }
    }

    #[must_use]
    pub fn environment(mut self, env: impl Into<String>) -> Self {
        self.options.environment = Some(env.into());
        self
    }

    #[must_use]
    pub fn evaluate_const_exprs(mut self, flag: bool) -> Self {
        self.options.evaluate_const_exprs = flag;
        self
    }

    #[must_use]
    pub fn repl_mode(mut self, flag: bool) -> Self {
        self.options.repl_mode = flag;
        self
    }

    #[must_use]
    pub fn class_access_to_globals(mut self, flag: bool) -> Self {
        self.options.class_access_to_globals = flag;
        self
    }

    #[must_use]
    pub fn debug(mut self, level: u8) -> Self {
        self.options.debug_level = level;
        self
    }

    #[must_use]
    pub fn checkpoint(mut self, flag: bool) -> Self {
        self.options.checkpoint = flag;
        self
    }

    #[must_use]
    pub fn restore(mut self, flag: bool) -> Self {
        self.options.restore = flag;
        self
    }

    /// Governs whether an async field default reached through an
    /// auto-create chain (spec.md §4.3, §4.4) is accepted or rejected at
    /// resolve time. Not part of spec.md §6's enumerated chain but
    /// required by §4.4's conservatism rules, so it's exposed the same
    /// fluent way as the rest.
    #[must_use]
    pub fn auto_create_async(mut self, flag: bool) -> Self {
        self.options.auto_create_async = flag;
        self
    }

    #[must_use]
    pub fn package(mut self, package: impl Into<String>) -> Self {
        self.options.package = Some(package.into());
        self
    }

    /// Overrides the built-in function/method table a `Context` uses.
    /// Defaults to [`Registry::standard_with_checkpoint`] (governed by
    /// [`Self::checkpoint`]) if never called.
    #[must_use]
    pub fn builtins(mut self, registry: Registry) -> Self {
        self.builtins = Some(registry);
        self
    }

    /// Host-supplied persistence for suspended scripts (spec.md §4.6).
    /// Shared by every `Script` this `Context` produces, so two scripts
    /// checkpointing concurrently still land in the same store. Defaults
    /// to [`crate::checkpoint::MemoryCheckpointStore`] if never called.
    #[must_use]
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    #[must_use]
    pub fn build(self) -> Context {
        let builtins = self.builtins.unwrap_or_else(|| Registry::standard_with_checkpoint(self.options.checkpoint));
        let checkpoint_store = self.checkpoint_store.unwrap_or_else(|| Arc::new(crate::checkpoint::MemoryCheckpointStore::new()));
        Context {
            options: Arc::new(self.options),
            classes: Arc::new(RwLock::new(AHashMap::new())),
            builtins: Arc::new(builtins),
            programs: Arc::new(RwLock::new(AHashMap::new())),
            checkpoint_store,
        }
    }
}

/// A compiled script's function table and interner, kept alive for the
/// lifetime of the owning `Context` (spec.md §4.6: a recovered checkpoint
/// must be resolved against the exact script it suspended from, located
/// by `script_id`). Shared via `Arc` between every `Script` created from
/// the same source and every future `recoverCheckpoint` call against it.
pub struct CompiledProgram {
    pub functions: FunctionTable,
    pub interner: Interner,
    pub entry_fn_id: u32,
    pub script_num_locals: u32,
}

/// A compilation/execution environment scripts share a class registry
/// and built-in table through (spec.md §2: "resolves across separately
/// compiled classes via a shared class registry on the Context"). Cheap
/// to clone — every field is `Arc`-backed — so a host can hand one
/// `Context` to many threads compiling and running scripts concurrently.
#[derive(Clone)]
pub struct Context {
    options: Arc<ContextOptions>,
    classes: Arc<RwLock<AHashMap<String, ClassDescriptor>>>,
    builtins: Arc<Registry>,
    /// Compiled programs this `Context` has produced, keyed by the stable
    /// id `compile_unit` derives from the source text, so a later
    /// `recoverCheckpoint` can find the exact `FunctionTable` a saved
    /// continuation's frames are addressed against.
    programs: Arc<RwLock<AHashMap<String, Arc<CompiledProgram>>>>,
    checkpoint_store: Arc<dyn CheckpointStore>,
}

impl Context {
    #[must_use]
    pub fn create() -> ContextBuilder {
        ContextBuilder::new()
    }

    #[must_use]
    pub fn builtins(&self) -> Arc<Registry> {
        Arc::clone(&self.builtins)
    }

    #[must_use]
    pub fn checkpoint_store(&self) -> Arc<dyn CheckpointStore> {
        Arc::clone(&self.checkpoint_store)
    }

    fn tracer(&self) -> Box<dyn VmTracer> {
        if self.options.debug_level > 0 {
            Box::new(StderrTracer::new(self.options.debug_level))
        } else {
            Box::new(NoopTracer)
        }
    }

    /// Resumes a serialized continuation produced by an earlier
    /// suspension (spec.md §4.6, §6), observing the original
    /// pre-suspension `_checkpoint` argument as its resumption value.
    /// The destination `Context` must have already compiled (in this
    /// process) an equal-or-newer version of whichever script produced
    /// the checkpoint, under the same source text's stable id.
    pub fn recover_checkpoint(&self, bytes: &[u8]) -> Result<Script, Exception> {
        self.recover_checkpoint_with(bytes, None)
    }

    /// Like [`Self::recover_checkpoint`], but lets the host substitute
    /// `resume_value` for whichever value `_checkpoint` was called with
    /// (spec.md §9's "resumes with `value` when the host calls
    /// `resumer(value)`", applied to a restored-after-restart
    /// continuation where no live `resumer` closure survives): a host
    /// that wants to replay a checkpoint with a corrected value passes
    /// it here instead of reusing the pre-suspension argument.
    pub fn recover_checkpoint_with(&self, bytes: &[u8], resume_value: Option<Value>) -> Result<Script, Exception> {
        let pending = crate::checkpoint::decode(bytes).map_err(exception_of)?;
        let program = {
            let programs = self.programs.read().expect("program registry lock poisoned");
            programs
                .get(&pending.script_id)
                .cloned()
                .ok_or_else(|| {
                    exception_of(crate::error::CheckpointError::new(
                        crate::error::ExcKind::UnknownClassOnRestore,
                        format!("no compiled script matches checkpoint script id '{}'; recompile it on this Context before recovering", pending.script_id),
                    ))
                })?
        };
        let script_id = pending.script_id.clone();
        let continuation = crate::checkpoint::resolve(pending, &program.functions).map_err(exception_of)?;
        Ok(Script::from_continuation(self.clone(), script_id, program, continuation, resume_value))
    }
}

fn exception_of(e: crate::error::CheckpointError) -> Exception {
    Exception::Runtime(crate::error::RuntimeError::new(e.kind, e.message, String::new(), 0))
}

/// `compileScript(source, globals, context, package?) → Script` (spec.md
/// §6). `globals` seeds the VM's global map; a `Script` is runnable
/// immediately via `runSync`/`run`.
pub fn compile_script(source: &str, globals: AHashMap<String, Value>, context: &Context) -> Result<Script, Vec<Diagnostic>> {
    let (script_id, program) = compile_unit(source, context)?;
    Ok(Script::new(context.clone(), script_id, program, globals))
}

/// `compileClass(source, context)` (spec.md §6): compiles a class
/// declaration (with no executable script body) and merges it into the
/// `Context`'s shared class registry for subsequent compiles to resolve
/// against.
pub fn compile_class(source: &str, context: &Context) -> Result<(), Vec<Diagnostic>> {
    compile_unit(source, context)?;
    Ok(())
}

/// `eval(source, [globals], [context], [package])` (spec.md §6):
/// convenience that compiles and runs synchronously in one step.
pub fn eval(source: &str, globals: AHashMap<String, Value>, context: &Context) -> Result<Value, Exception> {
    let script = compile_script(source, globals.clone(), context).map_err(Exception::Compile)?;
    script.run_sync(globals)
}

/// A stable identifier for `source`, used both as the checkpoint wire
/// format's `script_id` and as the key into `Context::programs`. Grounded
/// on `Code::stable_id`'s same ahash-of-identity approach, applied here
/// to the whole source text rather than one function's qualified name.
fn script_id_for(source: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = ahash::AHasher::default();
    source.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn compile_unit(source: &str, context: &Context) -> Result<(String, Arc<CompiledProgram>), Vec<Diagnostic>> {
    let mut interner = Interner::new();
    let script_main: Stmt = {
        let parser = Parser::new(source, &mut interner);
        parser.parse_script()?
    };

    let existing = context.classes.read().expect("class registry lock poisoned").clone();
    let mut resolver = Resolver::new(&mut interner, context.options.class_access_to_globals, context.options.auto_create_async);
    resolver.seed_classes(existing);
    let mut result = resolver.resolve_script(&script_main);
    if !result.diagnostics.is_empty() {
        return Err(result.diagnostics);
    }

    let mut analyser = Analyser::new();
    analyser.analyse(&script_main);
    for (fn_id, body) in analyser.functions() {
        result.functions[*fn_id as usize].is_async = body.is_async.get();
    }
    let script_body_is_async = if let Stmt::ClassDecl { script_main: Some(body), .. } = &script_main {
        analyser.script_is_async(body)
    } else {
        false
    };

    let mut functions = crate::bytecode::compiler::Compiler::compile(&interner, &result, &script_main);
    if result.script_fn_id != u32::MAX {
        functions.get_mut(result.script_fn_id).is_async = script_body_is_async;
    }

    {
        let mut classes = context.classes.write().expect("class registry lock poisoned");
        for (name, descriptor) in result.classes {
            classes.insert(name, descriptor);
        }
    }

    let program = Arc::new(CompiledProgram {
        functions,
        interner,
        entry_fn_id: result.script_fn_id,
        script_num_locals: result.script_num_locals,
    });
    let script_id = script_id_for(source);
    context.programs.write().expect("program registry lock poisoned").insert(script_id.clone(), Arc::clone(&program));

    Ok((script_id, program))
}

impl Context {
    /// Exposes the tracer a `Script` should install on its `Vm`, kept as
    /// a method rather than a public field since the choice of
    /// concrete tracer is derived from `debug_level`, not stored directly.
    pub(crate) fn make_tracer(&self) -> Box<dyn VmTracer> {
        self.tracer()
    }

    pub(crate) fn restore_enabled(&self) -> bool {
        self.options.restore
    }
}
