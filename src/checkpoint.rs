//! Checkpoint wire format and host persistence hooks (spec.md §4.6, §7
//! category 3).
//!
//! Grounded on the teacher's `binary_serde` layer (`tests/binary_serde.rs`
//! exercises a versioned `postcard` envelope the same way): a one-byte
//! wire version ahead of the `postcard`-encoded payload, so a future
//! format change can be rejected cleanly instead of silently
//! misinterpreted.
//!
//! Each frame's function reference is written as a stable
//! `qualified_name + arity` hash (spec.md §4.6), not the in-process
//! `u32` table index `crate::runtime::vm::Frame` actually runs on — the
//! index is only meaningful against the exact `FunctionTable` that
//! produced it, while the hash survives a restore against any
//! equal-or-newer recompile of the same script (spec.md §4.6's "required
//! to contain an equal-or-newer definition" guarantee, extended from
//! classes to functions/methods). [`resolve`] does that translation once
//! a destination `FunctionTable` is available; [`decode`] alone only gets
//! you as far as the wire-level [`PendingRestore`].
//!
//! `saveCheckpoint`/`deleteCheckpoint`/`recoverCheckpoint` (spec.md §4.6)
//! are host responsibilities; this module owns only the bytes a host
//! stores, the sequence-number bookkeeping spec.md §7 requires of a
//! conforming host, and the frame-id translation above.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, ExcKind};
use crate::runtime::heap::{Heap, HeapId, JMap};
use crate::runtime::value::Value;
use crate::runtime::vm::{Continuation, Frame, FunctionTable, SuspendedCall};

/// Current wire format version. Bump this when the wire frame shape
/// changes in a way that breaks `postcard` compatibility; a reader that
/// sees any other byte rejects the checkpoint rather than guessing.
pub const WIRE_VERSION: u8 = 1;

/// One frame as it travels over the wire: identical to
/// [`crate::runtime::vm::Frame`] except `fn_id` is replaced by the stable
/// hash spec.md §4.6 calls for.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFrame {
    fn_stable_id: u64,
    ip: usize,
    locals: Vec<Value>,
    owned_cells: Vec<HeapId>,
    captures: Vec<HeapId>,
    stack: Vec<Value>,
    pending_result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireContinuation {
    heap: Heap,
    frames: Vec<WireFrame>,
    globals: JMap,
    suspended_on: SuspendedCall,
}

/// The script identity (spec.md §4.6's `script_id`) a checkpoint was
/// saved under, plus its still-to-be-translated wire frames. A host
/// locates the matching compiled script by `script_id` before calling
/// [`resolve`].
pub struct PendingRestore {
    pub script_id: String,
    wire: WireContinuation,
}

/// Serializes a continuation to the versioned wire format a host stores
/// via [`CheckpointStore::save`].
pub fn encode(script_id: &str, continuation: &Continuation, functions: &FunctionTable) -> Result<Vec<u8>, CheckpointError> {
    let frames = continuation
        .frames
        .iter()
        .map(|f| WireFrame {
            fn_stable_id: functions.get(f.fn_id).stable_id(),
            ip: f.ip,
            locals: f.locals.clone(),
            owned_cells: f.owned_cells.clone(),
            captures: f.captures.clone(),
            stack: f.stack.clone(),
            pending_result: f.pending_result.clone(),
        })
        .collect();
    let wire = WireContinuation {
        heap: continuation.heap.clone(),
        frames,
        globals: continuation.globals.clone(),
        suspended_on: continuation.suspended_on.clone(),
    };
    let envelope = (script_id.to_owned(), wire);
    let mut bytes = postcard::to_allocvec(&envelope).map_err(|e| CheckpointError::new(ExcKind::MalformedByteStream, e.to_string()))?;
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.push(WIRE_VERSION);
    out.append(&mut bytes);
    Ok(out)
}

/// Parses bytes a host previously got from [`encode`], rejecting any
/// wire version this build doesn't recognise. Returns the `script_id` and
/// unresolved wire frames; pass the result to [`resolve`] once the
/// matching `FunctionTable` has been located.
pub fn decode(bytes: &[u8]) -> Result<PendingRestore, CheckpointError> {
    let Some((&version, payload)) = bytes.split_first() else {
        return Err(CheckpointError::new(ExcKind::MalformedByteStream, "empty checkpoint byte stream"));
    };
    if version != WIRE_VERSION {
        return Err(CheckpointError::new(
            ExcKind::UnsupportedWireVersion,
            format!("checkpoint wire version {version} is not supported by this build (expected {WIRE_VERSION})"),
        ));
    }
    let (script_id, wire): (String, WireContinuation) =
        postcard::from_bytes(payload).map_err(|e| CheckpointError::new(ExcKind::MalformedByteStream, e.to_string()))?;
    Ok(PendingRestore { script_id, wire })
}

/// Translates a [`PendingRestore`]'s stable function ids into the raw
/// indices of `functions`, producing a runnable [`Continuation`]. Errors
/// if `functions` has no function whose `stable_id()` matches a frame
/// that was saved — the destination script is not an equal-or-newer
/// recompile of the one that suspended.
pub fn resolve(pending: PendingRestore, functions: &FunctionTable) -> Result<Continuation, CheckpointError> {
    let frames = pending
        .wire
        .frames
        .into_iter()
        .map(|wf| {
            let fn_id = (0..functions.len())
                .find(|&i| functions.get(i as u32).stable_id() == wf.fn_stable_id)
                .ok_or_else(|| CheckpointError::new(ExcKind::UnknownClassOnRestore, "no function in the destination script matches a saved frame"))?;
            Ok(Frame {
                fn_id: fn_id as u32,
                ip: wf.ip,
                locals: wf.locals,
                owned_cells: wf.owned_cells,
                captures: wf.captures,
                stack: wf.stack,
                pending_result: wf.pending_result,
            })
        })
        .collect::<Result<Vec<_>, CheckpointError>>()?;
    Ok(Continuation { heap: pending.wire.heap, frames, globals: pending.wire.globals, suspended_on: pending.wire.suspended_on })
}

/// Host-implemented persistence for suspended scripts (spec.md §4.6's
/// `saveCheckpoint`/`deleteCheckpoint`/`recoverCheckpoint` trio). A
/// `Context` calls `save` whenever `_checkpoint` suspends a script and
/// `delete` once a resumed script either finishes or reaches its next
/// checkpoint, mirroring the "resume exactly once" contract spec.md §7
/// describes.
pub trait CheckpointStore: Send + Sync {
    /// Persists `bytes` (an [`encode`]d continuation) under `id`, tagged
    /// with a monotonically increasing `seq` the host can use to detect
    /// an out-of-order resume of a stale checkpoint.
    fn save(&self, id: &str, seq: u64, bytes: &[u8]) -> Result<(), CheckpointError>;

    /// Removes a previously saved checkpoint. Called once its continuation
    /// has been consumed (script resumed to completion or to its next
    /// suspension).
    fn delete(&self, id: &str, seq: u64) -> Result<(), CheckpointError>;

    /// Loads back the bytes for `id`, for `Context::recoverCheckpoint`
    /// (spec.md §4.6) after a process restart.
    fn load(&self, id: &str) -> Result<Vec<u8>, CheckpointError>;
}

/// In-memory [`CheckpointStore`] for embedding and testing without a real
/// persistence layer; not suitable across a process restart since nothing
/// here is written to disk.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: std::sync::Mutex<ahash::AHashMap<String, (u64, Vec<u8>)>>,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, id: &str, seq: u64, bytes: &[u8]) -> Result<(), CheckpointError> {
        let mut entries = self.entries.lock().unwrap();
        if let Some((existing_seq, _)) = entries.get(id) {
            if seq <= *existing_seq {
                return Err(CheckpointError::new(
                    ExcKind::OutOfOrderSeq,
                    format!("checkpoint '{id}' received seq {seq} after already storing seq {existing_seq}"),
                ));
            }
        }
        entries.insert(id.to_owned(), (seq, bytes.to_vec()));
        Ok(())
    }

    fn delete(&self, id: &str, seq: u64) -> Result<(), CheckpointError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(id) {
            Some((existing_seq, _)) if *existing_seq == seq => {
                entries.remove(id);
                Ok(())
            }
            Some(_) => Err(CheckpointError::new(ExcKind::OutOfOrderSeq, format!("delete of '{id}' at seq {seq} does not match the stored seq"))),
            None => Err(CheckpointError::new(ExcKind::DuplicateDelete, format!("checkpoint '{id}' was already deleted or never saved"))),
        }
    }

    fn load(&self, id: &str) -> Result<Vec<u8>, CheckpointError> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(id)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| CheckpointError::new(ExcKind::UnknownClassOnRestore, format!("no checkpoint stored under '{id}'")))
    }
}

/// Issues the strictly increasing sequence numbers a [`CheckpointStore`]
/// uses to reject an out-of-order save or a duplicate delete. One
/// `SeqCounter` is shared per suspendable script instance, not per
/// `Context` — two unrelated scripts checkpointing concurrently must not
/// contend on the same counter.
#[derive(Debug, Default)]
pub struct SeqCounter(AtomicU64);

impl SeqCounter {
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::heap::Heap;

    fn sample_continuation() -> Continuation {
        Continuation {
            heap: Heap::new(),
            frames: Vec::new(),
            globals: JMap::new(),
            suspended_on: SuspendedCall::Sleep { duration_ms: 10, value: Value::Int(1) },
        }
    }

    #[test]
    fn round_trips_through_encode_decode_resolve() {
        let functions = FunctionTable::new();
        let continuation = sample_continuation();
        let bytes = encode("script-1", &continuation, &functions).unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);
        let pending = decode(&bytes).unwrap();
        assert_eq!(pending.script_id, "script-1");
        let restored = resolve(pending, &functions).unwrap();
        match restored.suspended_on {
            SuspendedCall::Sleep { duration_ms, .. } => assert_eq!(duration_ms, 10),
            SuspendedCall::Checkpoint { .. } => panic!("expected a Sleep suspension"),
        }
    }

    #[test]
    fn rejects_unknown_wire_version() {
        let functions = FunctionTable::new();
        let mut bytes = encode("script-1", &sample_continuation(), &functions).unwrap();
        bytes[0] = WIRE_VERSION + 1;
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err.kind, ExcKind::UnsupportedWireVersion);
    }

    #[test]
    fn memory_store_rejects_out_of_order_save_and_duplicate_delete() {
        let store = MemoryCheckpointStore::new();
        store.save("s1", 1, b"a").unwrap();
        assert_eq!(store.save("s1", 1, b"b").unwrap_err().kind, ExcKind::OutOfOrderSeq);
        store.save("s1", 2, b"c").unwrap();
        store.delete("s1", 2).unwrap();
        assert_eq!(store.delete("s1", 2).unwrap_err().kind, ExcKind::DuplicateDelete);
    }

    #[test]
    fn seq_counter_is_monotonic() {
        let counter = SeqCounter::new();
        let a = counter.next();
        let b = counter.next();
        assert!(b > a);
    }
}
