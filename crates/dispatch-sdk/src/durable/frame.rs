// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interpreter frames.
//!
//! A frame is the complete execution state of one program activation:
//! instruction pointer, operand stack, locals, and handler blocks. Frames
//! nest: when a program invokes a subroutine, the child frame lives in a
//! slot on the parent's operand stack until it completes, which is how the
//! whole chain of suspended activations serializes as one tree.

use serde::{Deserialize, Serialize};

use crate::durable::program::Program;
use crate::value::Value;

/// One operand stack or local slot.
///
/// `Null` marks a slot that was uninitialized at capture time. It is distinct
/// from [`Value::Nil`], which is an application-level value, and the
/// distinction survives every round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Slot {
    Null,
    Value(Value),
    /// A nested coroutine frame awaiting completion.
    Frame(Box<Frame>),
}

/// Lifecycle of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameState {
    /// Built but never stepped.
    Created,
    /// Stopped at an await, waiting for a resume value.
    Suspended,
    /// Delegating to a child frame on the operand stack.
    SuspendedYieldFrom,
    /// Currently running. Never valid inside a snapshot.
    Executing,
    /// Returned, raised, or tail-called.
    Completed,
}

/// An entered error handler block.
///
/// `depth` records the operand stack height at entry; unwinding truncates
/// the stack back to it before jumping to `handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub handler: u32,
    pub depth: u32,
}

/// The execution state of one program activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Name of the program this frame executes.
    pub function: String,
    /// Fingerprint of the program at capture time.
    pub fingerprint: u64,
    pub ip: u32,
    pub state: FrameState,
    pub locals: Vec<Slot>,
    pub stack: Vec<Slot>,
    pub blocks: Vec<Block>,
}

impl Frame {
    /// Fresh frame for a program. Local 0 holds the input; the remaining
    /// locals start uninitialized.
    pub fn new(program: &Program, input: Value) -> Self {
        let mut locals = vec![Slot::Null; program.n_locals() as usize];
        locals[0] = Slot::Value(input);
        Self {
            function: program.name().to_string(),
            fingerprint: program.fingerprint(),
            ip: 0,
            state: FrameState::Created,
            locals,
            stack: Vec::new(),
            blocks: Vec::new(),
        }
    }

    /// The nested child frame, when this frame is delegating.
    pub fn child(&self) -> Option<&Frame> {
        match self.stack.last() {
            Some(Slot::Frame(child)) => Some(child),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> Program {
        Program::builder("app.f").locals(3).load(0).ret().build().unwrap()
    }

    #[test]
    fn test_new_frame_layout() {
        let frame = Frame::new(&program(), Value::Int(5));
        assert_eq!(frame.state, FrameState::Created);
        assert_eq!(frame.ip, 0);
        assert_eq!(frame.locals.len(), 3);
        assert_eq!(frame.locals[0], Slot::Value(Value::Int(5)));
        assert_eq!(frame.locals[1], Slot::Null);
        assert!(frame.stack.is_empty());
        assert!(frame.blocks.is_empty());
    }

    #[test]
    fn test_null_slot_is_not_nil_value() {
        assert_ne!(Slot::Null, Slot::Value(Value::Nil));
        let bytes = bincode::serialize(&Slot::Null).unwrap();
        let restored: Slot = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored, Slot::Null);
    }

    #[test]
    fn test_nested_frame_round_trip() {
        let mut parent = Frame::new(&program(), Value::Int(1));
        let mut child = Frame::new(&program(), Value::Int(2));
        child.state = FrameState::Suspended;
        parent.state = FrameState::SuspendedYieldFrom;
        parent.stack.push(Slot::Frame(Box::new(child)));

        let bytes = bincode::serialize(&parent).unwrap();
        let restored: Frame = bincode::deserialize(&bytes).unwrap();
        assert_eq!(parent, restored);
        assert_eq!(restored.child().unwrap().state, FrameState::Suspended);
    }
}
