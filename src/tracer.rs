//! VM execution tracing (SPEC_FULL.md §4.5 ambient observability).
//!
//! Grounded on the teacher's `tracer.rs`: a trait-based hook system with a
//! zero-cost [`NoopTracer`] default, so an embedder that never calls
//! `debug()` pays nothing for tracing on the VM's hot path. This crate has
//! no GC and no cell-specific opcodes distinct from ordinary locals, so the
//! hook set is trimmed to call/return/instruction/suspend events — the
//! ones a host actually needs to diagnose a stuck or misbehaving script.
//!
//! This is explicitly not the built-in method library (out of scope per
//! spec.md §1); it's the "logging" ambient concern SPEC_FULL.md §3 calls
//! for in place of a logging crate, since the VM has no I/O of its own to
//! log through.

use crate::bytecode::op::Op;

/// Hook points a [`crate::runtime::vm::Vm`] calls during execution.
/// Every method has a no-op default so implementations only override what
/// they care about.
pub trait VmTracer {
    fn on_instruction(&mut self, _fn_id: u32, _ip: usize, _op: &Op) {}
    fn on_call(&mut self, _fn_id: u32, _depth: usize) {}
    fn on_return(&mut self, _depth: usize) {}
    fn on_suspend(&mut self, _depth: usize) {}
}

/// Production default: every hook compiles away, identical in spirit to
/// [`crate::resource::NoLimitTracker`] eliminating resource-check overhead.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Human-readable execution log to stderr, for interactive debugging of a
/// `Context` built with `debug(level)` set above zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrTracer {
    level: u8,
}

impl StderrTracer {
    #[must_use]
    pub fn new(level: u8) -> Self {
        Self { level }
    }
}

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, fn_id: u32, ip: usize, op: &Op) {
        if self.level >= 2 {
            eprintln!("[jactl] fn#{fn_id} ip={ip}: {op:?}");
        }
    }

    fn on_call(&mut self, fn_id: u32, depth: usize) {
        if self.level >= 1 {
            eprintln!("[jactl] call fn#{fn_id} depth={depth}");
        }
    }

    fn on_return(&mut self, depth: usize) {
        if self.level >= 1 {
            eprintln!("[jactl] return depth={depth}");
        }
    }

    fn on_suspend(&mut self, depth: usize) {
        if self.level >= 1 {
            eprintln!("[jactl] suspend depth={depth}");
        }
    }
}

/// Opcode-frequency counters, handy for spotting a hot loop a host wants
/// to budget via [`crate::resource::ResourceTracker`].
#[derive(Debug, Clone, Default)]
pub struct ProfilingTracer {
    instruction_count: u64,
    call_count: u64,
    max_depth: usize,
}

impl ProfilingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    #[must_use]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}

impl VmTracer for ProfilingTracer {
    fn on_instruction(&mut self, _fn_id: u32, _ip: usize, _op: &Op) {
        self.instruction_count += 1;
    }

    fn on_call(&mut self, _fn_id: u32, depth: usize) {
        self.call_count += 1;
        self.max_depth = self.max_depth.max(depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiling_tracer_counts_instructions_and_depth() {
        let mut tracer = ProfilingTracer::new();
        tracer.on_instruction(0, 0, &Op::PushNull);
        tracer.on_instruction(0, 1, &Op::Pop);
        tracer.on_call(1, 3);
        assert_eq!(tracer.instruction_count(), 2);
        assert_eq!(tracer.max_depth(), 3);
    }
}
