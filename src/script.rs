//! `Script`: a compiled unit ready to run (spec.md §6). Owns the compiled
//! program it was produced from and drives a [`Vm`] through suspension
//! and resumption until the script returns, errors, or (on `runSync`
//! with no interactive host) resolves every checkpoint itself.
//!
//! Grounded on the teacher's `Interpreter::run` driving loop: one `Vm`
//! constructed per execution, fed `RunOutcome`s in a loop, with
//! `Suspended` handled by re-entering rather than unwinding back to the
//! caller.

use std::sync::{Arc, Mutex};

use ahash::AHashMap;

use crate::checkpoint::{self, CheckpointStore, SeqCounter};
use crate::context::{CompiledProgram, Context};
use crate::error::Exception;
use crate::resource::NoLimitTracker;
use crate::runtime::value::Value;
use crate::runtime::vm::{Continuation, RunOutcome, SuspendedCall, Vm};

/// What a `Script` starts execution from: either fresh globals seeded at
/// `compileScript` time, or a continuation recovered from a checkpoint
/// via `Context::recoverCheckpoint`.
enum ScriptState {
    Fresh { globals: AHashMap<String, Value> },
    Resuming { continuation: Continuation, resume_value: Option<Value> },
    Done,
}

/// A compiled, runnable unit (spec.md §6). Cheap to clone (everything is
/// `Arc`-backed) so `run`'s background-thread form can move an owned copy
/// without the caller losing its handle.
#[derive(Clone)]
pub struct Script {
    context: Context,
    script_id: String,
    program: Arc<CompiledProgram>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    seq: Arc<SeqCounter>,
    state: Arc<Mutex<ScriptState>>,
}

impl Script {
    pub(crate) fn new(context: Context, script_id: String, program: Arc<CompiledProgram>, globals: AHashMap<String, Value>) -> Self {
        let checkpoint_store = context.checkpoint_store();
        Self {
            context,
            script_id,
            program,
            checkpoint_store,
            seq: Arc::new(SeqCounter::new()),
            state: Arc::new(Mutex::new(ScriptState::Fresh { globals })),
        }
    }

    /// `resume_value` overrides the value the restored top frame observes
    /// (spec.md §9 decision 3); `None` falls back to the value the
    /// suspended `_checkpoint`/`sleep` call was originally invoked with.
    pub(crate) fn from_continuation(
        context: Context,
        script_id: String,
        program: Arc<CompiledProgram>,
        continuation: Continuation,
        resume_value: Option<Value>,
    ) -> Self {
        let checkpoint_store = context.checkpoint_store();
        Self {
            context,
            script_id,
            program,
            checkpoint_store,
            seq: Arc::new(SeqCounter::new()),
            state: Arc::new(Mutex::new(ScriptState::Resuming { continuation, resume_value })),
        }
    }

    /// Runs this script to completion on the calling thread (spec.md §6's
    /// `Script.runSync`). A script that suspends on `_checkpoint` is
    /// resumed immediately with the value it was passed, since there is
    /// no interactive host to hand the continuation to on this path; see
    /// DESIGN.md for why that's the chosen reading of the open question
    /// around `_checkpoint`'s visible resumption value.
    pub fn run_sync(&self, globals: AHashMap<String, Value>) -> Result<Value, Exception> {
        let state = {
            let mut guard = self.state.lock().expect("script state lock poisoned");
            std::mem::replace(&mut *guard, ScriptState::Done)
        };
        match state {
            ScriptState::Done => Err(Exception::Runtime(crate::error::RuntimeError::new(
                crate::error::ExcKind::MalformedByteStream,
                "script has already run to completion",
                String::new(),
                0,
            ))),
            ScriptState::Fresh { globals: seeded } => self.drive_fresh(if globals.is_empty() { seeded } else { globals }),
            ScriptState::Resuming { continuation, resume_value } => self.drive_resume(continuation, resume_value),
        }
    }

    /// Spawns a background thread running the same logic as
    /// [`Self::run_sync`], invoking `completion` with the final result
    /// (spec.md §6's `Script.run(globals, completion)`).
    pub fn run(&self, globals: AHashMap<String, Value>, completion: impl FnOnce(Result<Value, Exception>) + Send + 'static) {
        let script = self.clone();
        std::thread::spawn(move || {
            let result = script.run_sync(globals);
            completion(result);
        });
    }

    fn drive_fresh(&self, globals: AHashMap<String, Value>) -> Result<Value, Exception> {
        let builtins = self.context.builtins();
        let mut vm = Vm::new(&self.program.interner);
        vm.set_tracer(self.context.make_tracer());
        for (name, value) in globals {
            vm.globals.insert(name, value);
        }
        let mut resource = NoLimitTracker::new();
        let outcome = vm.call(&self.program.functions, builtins.as_ref(), &mut resource, self.program.entry_fn_id, Vec::new());
        self.drive_loop(vm, outcome)
    }

    fn drive_resume(&self, continuation: Continuation, resume_value: Option<Value>) -> Result<Value, Exception> {
        let builtins = self.context.builtins();
        let mut vm = Vm::new(&self.program.interner);
        vm.set_tracer(self.context.make_tracer());
        let mut resource = NoLimitTracker::new();
        let resume_value = resume_value.unwrap_or_else(|| match &continuation.suspended_on {
            SuspendedCall::Sleep { value, .. } | SuspendedCall::Checkpoint { value } => value.clone(),
        });
        let outcome = vm.resume(&self.program.functions, builtins.as_ref(), &mut resource, continuation, resume_value);
        self.drive_loop(vm, outcome)
    }

    /// Repeatedly resumes `vm` until it produces a value or an error,
    /// resolving every suspension along the way. `Sleep` blocks the
    /// calling thread for its duration; `Checkpoint` is persisted via the
    /// `Context`'s `CheckpointStore` before resuming.
    fn drive_loop(&self, mut vm: Vm<'_>, mut outcome: RunOutcome) -> Result<Value, Exception> {
        let builtins = self.context.builtins();
        let mut resource = NoLimitTracker::new();
        loop {
            match outcome {
                RunOutcome::Value(value) => return Ok(value),
                RunOutcome::Error(err) => return Err(Exception::Runtime(err)),
                RunOutcome::Suspended(continuation) => {
                    let resume_value = match self.settle_suspension(&continuation) {
                        Ok(value) => value,
                        Err(exc) => return Err(exc),
                    };
                    outcome = vm.resume(&self.program.functions, builtins.as_ref(), &mut resource, continuation, resume_value);
                }
            }
        }
    }

    /// Resolves one suspension, returning the value the resumed frame
    /// should observe. `Sleep` is honored by actually blocking; a
    /// `_checkpoint` suspension is saved to the `CheckpointStore` then
    /// immediately released with the checkpointed value, since `runSync`
    /// and the background form of `run` have no separate host resumer to
    /// wait on.
    fn settle_suspension(&self, continuation: &Continuation) -> Result<Value, Exception> {
        match &continuation.suspended_on {
            SuspendedCall::Sleep { duration_ms, value } => {
                std::thread::sleep(std::time::Duration::from_millis(*duration_ms));
                Ok(value.clone())
            }
            SuspendedCall::Checkpoint { value } => {
                let seq = self.seq.next();
                let bytes = checkpoint::encode(&self.script_id, continuation, &self.program.functions)
                    .map_err(|e| Exception::Runtime(crate::error::RuntimeError::new(e.kind, e.message, String::new(), 0)))?;
                self.checkpoint_store
                    .save(&self.script_id, seq, &bytes)
                    .map_err(|e| Exception::Runtime(crate::error::RuntimeError::new(e.kind, e.message, String::new(), 0)))?;
                let _ = self.checkpoint_store.delete(&self.script_id, seq);
                Ok(value.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::compile_script;

    #[test]
    fn runs_a_trivial_script_to_completion() {
        let context = Context::create().build();
        let script = compile_script("return 1 + 2;", AHashMap::new(), &context).unwrap();
        let value = script.run_sync(AHashMap::new()).unwrap();
        assert_eq!(value.as_i64(), Some(3));
    }

    #[test]
    fn resumes_through_a_sleep_suspension() {
        let context = Context::create().build();
        let script = compile_script("return sleep(0, 5) + 1;", AHashMap::new(), &context).unwrap();
        let value = script.run_sync(AHashMap::new()).unwrap();
        assert_eq!(value.as_i64(), Some(6));
    }

    #[test]
    fn rejects_rerunning_a_completed_script() {
        let context = Context::create().build();
        let script = compile_script("return 1;", AHashMap::new(), &context).unwrap();
        script.run_sync(AHashMap::new()).unwrap();
        let err = script.run_sync(AHashMap::new());
        assert!(err.is_err());
    }

    #[test]
    fn checkpoint_identity_mode_never_suspends() {
        let context = Context::create().checkpoint(false).build();
        let script = compile_script("return _checkpoint(7) + 1;", AHashMap::new(), &context).unwrap();
        let value = script.run_sync(AHashMap::new()).unwrap();
        assert_eq!(value.as_i64(), Some(8));
    }

    /// Drives a freshly compiled `Script` by hand, one step short of where
    /// `run_sync` would auto-resolve the `_checkpoint` suspension, so the
    /// resulting continuation can be encoded and fed to
    /// `Context::recoverCheckpointWith` directly.
    #[test]
    fn recover_checkpoint_with_lets_a_host_replace_the_resume_value() {
        let context = Context::create().build();
        let script = compile_script("return _checkpoint(7) + 1;", AHashMap::new(), &context).unwrap();

        let builtins = context.builtins();
        let mut resource = NoLimitTracker::new();
        let mut vm = Vm::new(&script.program.interner);
        let outcome = vm.call(&script.program.functions, builtins.as_ref(), &mut resource, script.program.entry_fn_id, Vec::new());
        let continuation = match outcome {
            RunOutcome::Suspended(c) => c,
            RunOutcome::Value(_) => panic!("expected the script to suspend on _checkpoint, it ran to completion instead"),
            RunOutcome::Error(_) => panic!("expected the script to suspend on _checkpoint, it errored instead"),
        };
        let bytes = checkpoint::encode(&script.script_id, &continuation, &script.program.functions).unwrap();

        let replayed_original = context.recover_checkpoint(&bytes).unwrap();
        assert_eq!(replayed_original.run_sync(AHashMap::new()).unwrap().as_i64(), Some(8));

        let replayed_override = context.recover_checkpoint_with(&bytes, Some(Value::Int(99))).unwrap();
        assert_eq!(replayed_override.run_sync(AHashMap::new()).unwrap().as_i64(), Some(100));
    }
}
