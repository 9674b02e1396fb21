//! Resource-limiting hooks threaded through the VM (SPEC_FULL.md §5
//! ambient additions): an embedder can bound allocation count,
//! instruction count, and call-stack depth without the core interpreter
//! loop knowing anything about *why* a limit exists.
//!
//! Grounded on the teacher's `resource.rs` `ResourceTracker` trait and its
//! `NoLimitTracker` default impl, trimmed to the checks this crate's VM
//! actually calls: this crate has no garbage collector to schedule, so
//! the teacher's `should_gc`/`on_free` hooks are dropped.

use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceError {
    Allocation { limit: usize, count: usize },
    Operation { limit: usize, count: usize },
    Time { limit: Duration, elapsed: Duration },
    Recursion { limit: usize, depth: usize },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation { limit, count } => write!(f, "allocation limit exceeded: {count} > {limit}"),
            Self::Operation { limit, count } => write!(f, "operation limit exceeded: {count} > {limit}"),
            Self::Time { limit, elapsed } => write!(f, "time limit exceeded: {elapsed:?} > {limit:?}"),
            Self::Recursion { limit, depth } => write!(f, "recursion depth exceeded: {depth} > {limit}"),
        }
    }
}

impl std::error::Error for ResourceError {}

/// Hooks the VM calls before allocating, before executing each
/// instruction, and before pushing a call frame. An embedding host
/// implements this to sandbox untrusted scripts; [`NoLimitTracker`] is
/// the permissive default a bare `Context` uses.
pub trait ResourceTracker: fmt::Debug {
    fn on_allocate(&mut self) -> Result<(), ResourceError>;
    fn check_operation(&mut self) -> Result<(), ResourceError>;
    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceLimits {
    pub max_operations: Option<usize>,
    pub max_allocations: Option<usize>,
    pub max_duration: Option<Duration>,
    pub max_recursion_depth: Option<usize>,
}

#[derive(Debug, Default)]
pub struct NoLimitTracker {
    limits: ResourceLimits,
    operation_count: usize,
    allocation_count: usize,
    start: Option<Instant>,
}

impl NoLimitTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_limits(limits: ResourceLimits) -> Self {
        Self { limits, operation_count: 0, allocation_count: 0, start: None }
    }
}

impl ResourceTracker for NoLimitTracker {
    fn on_allocate(&mut self) -> Result<(), ResourceError> {
        self.allocation_count += 1;
        if let Some(limit) = self.limits.max_allocations {
            if self.allocation_count > limit {
                return Err(ResourceError::Allocation { limit, count: self.allocation_count });
            }
        }
        Ok(())
    }

    fn check_operation(&mut self) -> Result<(), ResourceError> {
        self.operation_count += 1;
        if let Some(limit) = self.limits.max_operations {
            if self.operation_count > limit {
                return Err(ResourceError::Operation { limit, count: self.operation_count });
            }
        }
        if let Some(limit) = self.limits.max_duration {
            let start = *self.start.get_or_insert_with(Instant::now);
            let elapsed = start.elapsed();
            if elapsed > limit {
                return Err(ResourceError::Time { limit, elapsed });
            }
        }
        Ok(())
    }

    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError> {
        let limit = self.limits.max_recursion_depth.unwrap_or(2000);
        if current_depth >= limit {
            return Err(ResourceError::Recursion { limit, depth: current_depth });
        }
        Ok(())
    }
}
