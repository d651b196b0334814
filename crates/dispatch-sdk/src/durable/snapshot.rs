// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Snapshot and restore of durable coroutines.
//!
//! A snapshot captures the complete frame chain of a suspended coroutine:
//! instruction pointers, operand stacks with explicit NULL markers, locals,
//! handler blocks, and nested child frames. Snapshots carry the interpreter
//! state version and each frame carries its program's fingerprint, so a
//! snapshot restored under different code is refused as incompatible state
//! rather than misbehaving.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::durable::coroutine::{DurableCoroutine, ProgramResolver};
use crate::durable::frame::{Frame, FrameState, Slot};
use crate::error::{Result, SdkError};

/// Version of the interpreter's frame layout. Bumped whenever the
/// instruction set or frame encoding changes shape.
pub const STATE_VERSION: &str = "dispatch-sdk/vm1";

#[derive(Serialize, Deserialize)]
struct VersionedState<T> {
    state_version: String,
    payload: T,
}

/// Encode a payload under the interpreter state version header.
pub(crate) fn encode_versioned<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    let versioned = VersionedState {
        state_version: STATE_VERSION.to_string(),
        payload,
    };
    bincode::serialize(&versioned).map_err(|e| SdkError::Serialization(e.to_string()))
}

/// Decode a payload, refusing snapshots from a different interpreter version.
pub(crate) fn decode_versioned<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let versioned: VersionedState<T> = bincode::deserialize(bytes).map_err(|e| {
        SdkError::IncompatibleState(format!("snapshot could not be decoded: {}", e))
    })?;
    if versioned.state_version != STATE_VERSION {
        return Err(SdkError::IncompatibleState(format!(
            "snapshot version {:?} does not match runtime version {:?}",
            versioned.state_version, STATE_VERSION
        )));
    }
    Ok(versioned.payload)
}

/// Serialize a suspended coroutine to bytes.
pub fn snapshot(coroutine: &DurableCoroutine, trace: bool) -> Result<Vec<u8>> {
    if trace {
        trace_dump(coroutine);
    }
    encode_versioned(coroutine)
}

/// Rehydrate a coroutine in this process.
///
/// The restored frame chain is checked against the currently registered
/// programs: unknown programs, changed fingerprints, version drift, and
/// out-of-range pointers are all refused as incompatible state.
pub fn restore(resolver: &dyn ProgramResolver, bytes: &[u8]) -> Result<DurableCoroutine> {
    let coroutine: DurableCoroutine = decode_versioned(bytes)?;
    validate_coroutine(resolver, &coroutine)?;
    Ok(coroutine)
}

/// Check a rehydrated coroutine against the registered programs.
pub(crate) fn validate_coroutine(
    resolver: &dyn ProgramResolver,
    coroutine: &DurableCoroutine,
) -> Result<()> {
    let identity = coroutine.identity();
    let program = resolver.resolve(&identity.name).ok_or_else(|| {
        SdkError::IncompatibleState(format!("function {:?} is not registered", identity.name))
    })?;
    if program.version() != identity.version {
        warn!(
            function = %identity.name,
            snapshot_version = %identity.version,
            current_version = %program.version(),
            "refusing snapshot taken under another function version"
        );
        return Err(SdkError::IncompatibleState(format!(
            "function {:?} is at version {:?}, snapshot was taken under {:?}",
            identity.name,
            program.version(),
            identity.version
        )));
    }
    validate_frame(resolver, coroutine.frame())
}

fn validate_frame(resolver: &dyn ProgramResolver, frame: &Frame) -> Result<()> {
    let program = resolver.resolve(&frame.function).ok_or_else(|| {
        SdkError::IncompatibleState(format!("program {:?} is not registered", frame.function))
    })?;
    if program.fingerprint() != frame.fingerprint {
        return Err(SdkError::IncompatibleState(format!(
            "program {:?} changed since the snapshot was taken",
            frame.function
        )));
    }
    if frame.state == FrameState::Executing {
        return Err(SdkError::IncompatibleState(format!(
            "frame of {:?} was captured mid-execution",
            frame.function
        )));
    }
    if frame.ip as usize > program.len() {
        return Err(SdkError::IncompatibleState(format!(
            "instruction pointer {} out of range for {:?}",
            frame.ip, frame.function
        )));
    }
    if frame.locals.len() != program.n_locals() as usize {
        return Err(SdkError::IncompatibleState(format!(
            "frame of {:?} has {} locals, program declares {}",
            frame.function,
            frame.locals.len(),
            program.n_locals()
        )));
    }
    for block in &frame.blocks {
        if block.handler as usize >= program.len() || block.depth as usize > frame.stack.len() {
            return Err(SdkError::IncompatibleState(format!(
                "handler block out of range in frame of {:?}",
                frame.function
            )));
        }
    }
    if frame.state == FrameState::SuspendedYieldFrom && frame.child().is_none() {
        return Err(SdkError::IncompatibleState(format!(
            "delegating frame of {:?} has no child slot",
            frame.function
        )));
    }
    for slot in frame.locals.iter() {
        if let Slot::Frame(_) = slot {
            return Err(SdkError::IncompatibleState(format!(
                "frame slot in locals of {:?}",
                frame.function
            )));
        }
    }
    for slot in frame.stack.iter() {
        if let Slot::Frame(child) = slot {
            validate_frame(resolver, child)?;
        }
    }
    Ok(())
}

/// Dump the frame chain to stderr. Enabled by the `trace` configuration
/// option for debugging snapshot contents.
pub(crate) fn trace_dump(coroutine: &DurableCoroutine) {
    let identity = coroutine.identity();
    eprintln!(
        "\n[DURABLE] COROUTINE STATE ({} {})",
        identity.name, identity.version
    );
    dump_frame(coroutine.frame(), 0);
    eprintln!();
}

fn dump_frame(frame: &Frame, depth: usize) {
    let pad = "  ".repeat(depth + 1);
    eprintln!(
        "{}frame {} ip={} sp={} state={:?} fingerprint={:016x}",
        pad,
        frame.function,
        frame.ip,
        frame.stack.len(),
        frame.state,
        frame.fingerprint
    );
    for (i, slot) in frame.locals.iter().enumerate() {
        match slot {
            Slot::Null => eprintln!("{}locals[{}] = NULL", pad, i),
            Slot::Value(value) => eprintln!("{}locals[{}] = {}", pad, i, value),
            Slot::Frame(_) => eprintln!("{}locals[{}] = <frame>", pad, i),
        }
    }
    for (i, slot) in frame.stack.iter().enumerate() {
        match slot {
            Slot::Null => eprintln!("{}stack[{}] = NULL", pad, i),
            Slot::Value(value) => eprintln!("{}stack[{}] = {}", pad, i, value),
            Slot::Frame(child) => {
                eprintln!("{}stack[{}] = <frame {}>", pad, i, child.function);
                dump_frame(child, depth + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::coroutine::{Pending, ResumeInput, StepOutcome};
    use crate::durable::program::Program;
    use crate::value::Value;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct Table(HashMap<String, Arc<Program>>);

    impl Table {
        fn new(programs: Vec<Program>) -> Self {
            Self(
                programs
                    .into_iter()
                    .map(|p| (p.name().to_string(), Arc::new(p)))
                    .collect(),
            )
        }
    }

    impl ProgramResolver for Table {
        fn resolve(&self, name: &str) -> Option<Arc<Program>> {
            self.0.get(name).cloned()
        }
    }

    fn pipeline() -> Program {
        Program::builder("app.pipeline")
            .const_("app.double")
            .load(0)
            .make_call()
            .await_call()
            .ret()
            .build()
            .unwrap()
    }

    #[test]
    fn test_round_trip_at_suspension_point() {
        let program = pipeline();
        let table = Table::new(vec![program.clone()]);
        let mut original = DurableCoroutine::new(&program, Value::Int(10));
        assert!(matches!(
            original.resume(&table, ResumeInput::Start),
            StepOutcome::Pending(Pending::Call(_))
        ));

        let bytes = snapshot(&original, false).unwrap();
        let mut restored = restore(&table, &bytes).unwrap();
        assert_eq!(original, restored);

        let a = original.resume(&table, ResumeInput::Value(Value::Int(20)));
        let b = restored.resume(&table, ResumeInput::Value(Value::Int(20)));
        assert_eq!(a, b);
        assert_eq!(a, StepOutcome::Return(Value::Int(20)));
    }

    #[test]
    fn test_snapshot_bytes_are_deterministic() {
        let program = pipeline();
        let table = Table::new(vec![program.clone()]);
        let mut coroutine = DurableCoroutine::new(&program, Value::Int(10));
        coroutine.resume(&table, ResumeInput::Start);
        assert_eq!(
            snapshot(&coroutine, false).unwrap(),
            snapshot(&coroutine, false).unwrap()
        );
    }

    #[test]
    fn test_restore_refuses_unknown_function() {
        let program = pipeline();
        let table = Table::new(vec![program.clone()]);
        let mut coroutine = DurableCoroutine::new(&program, Value::Int(1));
        coroutine.resume(&table, ResumeInput::Start);
        let bytes = snapshot(&coroutine, false).unwrap();

        let empty = Table::new(vec![]);
        match restore(&empty, &bytes) {
            Err(SdkError::IncompatibleState(_)) => {}
            other => panic!("expected incompatible state, got {:?}", other),
        }
    }

    #[test]
    fn test_restore_refuses_version_drift() {
        let program = pipeline();
        let table = Table::new(vec![program.clone()]);
        let mut coroutine = DurableCoroutine::new(&program, Value::Int(1));
        coroutine.resume(&table, ResumeInput::Start);
        let bytes = snapshot(&coroutine, false).unwrap();

        let v2 = Program::builder("app.pipeline")
            .version("v2")
            .const_("app.double")
            .load(0)
            .make_call()
            .await_call()
            .ret()
            .build()
            .unwrap();
        let drifted = Table::new(vec![v2]);
        match restore(&drifted, &bytes) {
            Err(SdkError::IncompatibleState(message)) => {
                assert!(message.contains("version"), "unexpected message {message:?}")
            }
            other => panic!("expected incompatible state, got {:?}", other),
        }
    }

    #[test]
    fn test_restore_refuses_changed_body() {
        let program = pipeline();
        let table = Table::new(vec![program.clone()]);
        let mut coroutine = DurableCoroutine::new(&program, Value::Int(1));
        coroutine.resume(&table, ResumeInput::Start);
        let bytes = snapshot(&coroutine, false).unwrap();

        let changed = Program::builder("app.pipeline")
            .const_("app.triple")
            .load(0)
            .make_call()
            .await_call()
            .ret()
            .build()
            .unwrap();
        assert!(matches!(
            restore(&Table::new(vec![changed]), &bytes),
            Err(SdkError::IncompatibleState(_))
        ));
    }

    #[test]
    fn test_restore_refuses_garbage() {
        let table = Table::new(vec![pipeline()]);
        assert!(matches!(
            restore(&table, b"not a snapshot"),
            Err(SdkError::IncompatibleState(_))
        ));
    }

    #[test]
    fn test_nested_chain_round_trip() {
        let inner = Program::builder("app.inner")
            .const_("app.remote")
            .load(0)
            .make_call()
            .await_call()
            .ret()
            .build()
            .unwrap();
        let outer = Program::builder("app.outer")
            .const_("app.inner")
            .load(0)
            .make_sub()
            .invoke()
            .ret()
            .build()
            .unwrap();
        let table = Table::new(vec![inner, outer.clone()]);
        let mut original = DurableCoroutine::new(&outer, Value::Int(3));
        original.resume(&table, ResumeInput::Start);

        let bytes = snapshot(&original, false).unwrap();
        let mut restored = restore(&table, &bytes).unwrap();
        assert_eq!(
            restored.frame().child().map(|c| c.function.as_str()),
            Some("app.inner")
        );
        let a = original.resume(&table, ResumeInput::Value(Value::Int(8)));
        let b = restored.resume(&table, ResumeInput::Value(Value::Int(8)));
        assert_eq!(a, b);
        assert_eq!(a, StepOutcome::Return(Value::Int(8)));
    }
}
