// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The durable coroutine: a resumable interpreter over [`Program`]s.
//!
//! Each resume advances the frame chain until it either completes or reaches
//! a suspension point, surfacing exactly one [`StepOutcome`]. All state the
//! advance produced lives back in the frames, so a snapshot taken at the
//! suspension point replays identically in another process.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::durable::frame::{Block, Frame, FrameState, Slot};
use crate::durable::program::{GatherPolicy, Instr, Program};
use crate::error::ErrorValue;
use crate::types::Call;
use crate::value::Value;

/// Resolves program names at execution and restore time.
///
/// Implemented by the function registry; tests plug in their own table.
pub trait ProgramResolver {
    fn resolve(&self, name: &str) -> Option<Arc<Program>>;
}

/// Stable identity of a durable function: wire name plus version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionIdentity {
    pub name: String,
    pub version: String,
}

/// What a resume feeds into the coroutine.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeInput {
    /// First advance; the input is already in local 0.
    Start,
    /// Result of the awaited operation.
    Value(Value),
    /// Failure of the awaited operation, delivered to handler blocks.
    Error(ErrorValue),
}

/// Something a coroutine can wait on.
#[derive(Debug, Clone, PartialEq)]
pub enum Awaitable {
    /// A remote function call, completed by the scheduler.
    Call(Call),
    /// A local durable subroutine, run by this process.
    Sub { function: String, input: Value },
}

const AWAITABLE_MARKER_KEY: &str = "$awaitable";
const AWAITABLE_CALL: &str = "call";
const AWAITABLE_SUB: &str = "subroutine";

impl Awaitable {
    /// Encode as a value so awaitables can travel on the operand stack.
    pub fn to_value(&self) -> Value {
        let mut entries = std::collections::BTreeMap::new();
        match self {
            Awaitable::Call(call) => {
                entries.insert(
                    AWAITABLE_MARKER_KEY.to_string(),
                    Value::Str(AWAITABLE_CALL.to_string()),
                );
                entries.insert("function".to_string(), Value::Str(call.function.clone()));
                entries.insert("input".to_string(), call.input.clone());
                if let Some(endpoint) = &call.endpoint {
                    entries.insert("endpoint".to_string(), Value::Str(endpoint.clone()));
                }
                if let Some(version) = &call.version {
                    entries.insert("version".to_string(), Value::Str(version.clone()));
                }
                if let Some(expiration) = call.expiration {
                    entries.insert(
                        "expiration_ms".to_string(),
                        Value::Int(expiration.as_millis() as i64),
                    );
                }
            }
            Awaitable::Sub { function, input } => {
                entries.insert(
                    AWAITABLE_MARKER_KEY.to_string(),
                    Value::Str(AWAITABLE_SUB.to_string()),
                );
                entries.insert("function".to_string(), Value::Str(function.clone()));
                entries.insert("input".to_string(), input.clone());
            }
        }
        Value::Map(entries)
    }

    /// Decode an awaitable from the operand stack.
    pub fn from_value(value: Value) -> Result<Self, ErrorValue> {
        let entries = match &value {
            Value::Map(entries) => entries,
            other => {
                return Err(ErrorValue::invalid_argument(format!(
                    "expected an awaitable, got {}",
                    other.type_name()
                )))
            }
        };
        let marker = entries
            .get(AWAITABLE_MARKER_KEY)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ErrorValue::invalid_argument("expected an awaitable"))?;
        let function = entries
            .get("function")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ErrorValue::invalid_argument("awaitable is missing its function name"))?
            .to_string();
        let input = entries.get("input").cloned().unwrap_or(Value::Nil);
        match marker {
            AWAITABLE_CALL => {
                let mut call = Call::new(function, input);
                if let Some(endpoint) = entries.get("endpoint").and_then(|v| v.as_str()) {
                    call = call.with_endpoint(endpoint);
                }
                if let Some(version) = entries.get("version").and_then(|v| v.as_str()) {
                    call = call.with_version(version);
                }
                if let Some(ms) = entries.get("expiration_ms").and_then(|v| v.as_int()) {
                    call = call.with_expiration(std::time::Duration::from_millis(ms.max(0) as u64));
                }
                Ok(Awaitable::Call(call))
            }
            AWAITABLE_SUB => Ok(Awaitable::Sub { function, input }),
            other => Err(ErrorValue::invalid_argument(format!(
                "unknown awaitable kind {:?}",
                other
            ))),
        }
    }
}

/// A reached suspension point.
#[derive(Debug, Clone, PartialEq)]
pub enum Pending {
    /// The coroutine awaited exactly one remote call.
    Call(Call),
    /// The coroutine awaited a concurrency combinator.
    Gather {
        policy: GatherPolicy,
        awaitables: Vec<Awaitable>,
    },
    /// The coroutine cancelled its own scope; resume with nil.
    Cancel,
}

/// The protocol-level result of advancing a coroutine once.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Pending(Pending),
    Return(Value),
    Raise(ErrorValue),
    TailCall(Call),
}

/// A user coroutine plus the identity its snapshots carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableCoroutine {
    identity: FunctionIdentity,
    frame: Frame,
}

impl DurableCoroutine {
    pub fn new(program: &Program, input: Value) -> Self {
        Self {
            identity: FunctionIdentity {
                name: program.name().to_string(),
                version: program.version().to_string(),
            },
            frame: Frame::new(program, input),
        }
    }

    pub fn identity(&self) -> &FunctionIdentity {
        &self.identity
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Advance until the next suspension point or completion.
    pub fn resume(&mut self, resolver: &dyn ProgramResolver, input: ResumeInput) -> StepOutcome {
        let input = match (self.frame.state, input) {
            (FrameState::Created, ResumeInput::Start) => FrameInput::Start,
            (FrameState::Created, _) => {
                return StepOutcome::Raise(interpreter_error(
                    "a new coroutine must be resumed with start",
                ))
            }
            (_, ResumeInput::Start) => {
                return StepOutcome::Raise(interpreter_error(
                    "a suspended coroutine cannot be restarted",
                ))
            }
            (_, ResumeInput::Value(v)) => FrameInput::Send(v),
            (_, ResumeInput::Error(e)) => FrameInput::Throw(e),
        };
        resume_frame(&mut self.frame, resolver, input)
    }
}

enum FrameInput {
    Start,
    Send(Value),
    Throw(ErrorValue),
}

enum Unwind {
    Caught,
    Uncaught(ErrorValue),
}

fn interpreter_error(message: impl Into<String>) -> ErrorValue {
    ErrorValue::new("InterpreterError", message)
}

/// Deliver a resume into a frame chain and run to the next outcome.
fn resume_frame(frame: &mut Frame, resolver: &dyn ProgramResolver, input: FrameInput) -> StepOutcome {
    match frame.state {
        FrameState::Created => {
            frame.state = FrameState::Executing;
            execute(frame, resolver)
        }
        FrameState::Suspended => {
            frame.state = FrameState::Executing;
            match input {
                FrameInput::Send(value) => {
                    frame.stack.push(Slot::Value(value));
                    execute(frame, resolver)
                }
                FrameInput::Throw(error) => match handle_raise(frame, error) {
                    Unwind::Caught => execute(frame, resolver),
                    Unwind::Uncaught(error) => {
                        frame.state = FrameState::Completed;
                        StepOutcome::Raise(error)
                    }
                },
                FrameInput::Start => {
                    frame.state = FrameState::Completed;
                    StepOutcome::Raise(interpreter_error("suspended frame resumed with start"))
                }
            }
        }
        FrameState::SuspendedYieldFrom => {
            let outcome = match frame.stack.last_mut() {
                Some(Slot::Frame(child)) => resume_frame(child, resolver, input),
                _ => {
                    frame.state = FrameState::Completed;
                    return StepOutcome::Raise(interpreter_error(
                        "delegating frame has no child on its stack",
                    ));
                }
            };
            match outcome {
                StepOutcome::Pending(pending) => StepOutcome::Pending(pending),
                StepOutcome::Return(value) => {
                    frame.stack.pop();
                    frame.stack.push(Slot::Value(value));
                    frame.state = FrameState::Executing;
                    execute(frame, resolver)
                }
                StepOutcome::Raise(error) => {
                    frame.stack.pop();
                    frame.state = FrameState::Executing;
                    match handle_raise(frame, error) {
                        Unwind::Caught => execute(frame, resolver),
                        Unwind::Uncaught(error) => {
                            frame.state = FrameState::Completed;
                            StepOutcome::Raise(error)
                        }
                    }
                }
                StepOutcome::TailCall(call) => {
                    frame.stack.pop();
                    frame.state = FrameState::Completed;
                    StepOutcome::TailCall(call)
                }
            }
        }
        FrameState::Executing => {
            frame.state = FrameState::Completed;
            StepOutcome::Raise(interpreter_error("frame is already executing"))
        }
        FrameState::Completed => {
            StepOutcome::Raise(interpreter_error("frame has already completed"))
        }
    }
}

/// Unwind to the innermost handler block, if any.
fn handle_raise(frame: &mut Frame, error: ErrorValue) -> Unwind {
    match frame.blocks.pop() {
        Some(block) => {
            frame.stack.truncate(block.depth as usize);
            frame.stack.push(Slot::Value(error.to_value()));
            frame.ip = block.handler;
            Unwind::Caught
        }
        None => Unwind::Uncaught(error),
    }
}

fn pop_slot(frame: &mut Frame) -> Result<Slot, ErrorValue> {
    frame
        .stack
        .pop()
        .ok_or_else(|| interpreter_error("operand stack underflow"))
}

fn pop_value(frame: &mut Frame) -> Result<Value, ErrorValue> {
    match pop_slot(frame)? {
        Slot::Value(value) => Ok(value),
        Slot::Null => Err(interpreter_error("uninitialized slot on operand stack")),
        Slot::Frame(_) => Err(interpreter_error("frame slot where a value was expected")),
    }
}

/// Run the frame's instruction stream until an outcome is produced.
fn execute(frame: &mut Frame, resolver: &dyn ProgramResolver) -> StepOutcome {
    let program = match resolver.resolve(&frame.function) {
        Some(program) => program,
        None => {
            frame.state = FrameState::Completed;
            return StepOutcome::Raise(ErrorValue::incompatible_state(format!(
                "program {:?} is not registered in this process",
                frame.function
            )));
        }
    };
    if program.fingerprint() != frame.fingerprint {
        frame.state = FrameState::Completed;
        return StepOutcome::Raise(ErrorValue::incompatible_state(format!(
            "program {:?} changed since this frame was captured",
            frame.function
        )));
    }

    loop {
        let ip = frame.ip as usize;
        if ip >= program.len() {
            frame.state = FrameState::Completed;
            return StepOutcome::Return(Value::Nil);
        }
        frame.ip += 1;
        let instr = program
            .instr(ip)
            .cloned()
            .unwrap_or(Instr::Return);
        match run_instr(frame, resolver, &program, instr) {
            Ok(None) => {}
            Ok(Some(outcome)) => return outcome,
            Err(error) => match handle_raise(frame, error) {
                Unwind::Caught => {}
                Unwind::Uncaught(error) => {
                    frame.state = FrameState::Completed;
                    return StepOutcome::Raise(error);
                }
            },
        }
    }
}

fn run_instr(
    frame: &mut Frame,
    resolver: &dyn ProgramResolver,
    program: &Program,
    instr: Instr,
) -> Result<Option<StepOutcome>, ErrorValue> {
    match instr {
        Instr::Const(value) => {
            frame.stack.push(Slot::Value(value));
            Ok(None)
        }
        Instr::Pop => {
            pop_slot(frame)?;
            Ok(None)
        }
        Instr::Dup => {
            let value = pop_value(frame)?;
            frame.stack.push(Slot::Value(value.clone()));
            frame.stack.push(Slot::Value(value));
            Ok(None)
        }
        Instr::LoadLocal(i) => match frame.locals.get(i as usize) {
            Some(Slot::Value(value)) => {
                let value = value.clone();
                frame.stack.push(Slot::Value(value));
                Ok(None)
            }
            Some(Slot::Null) => Err(interpreter_error(format!("local {} is unbound", i))),
            Some(Slot::Frame(_)) => Err(interpreter_error("frame slot in locals")),
            None => Err(interpreter_error(format!("local {} out of range", i))),
        },
        Instr::StoreLocal(i) => {
            let value = pop_value(frame)?;
            match frame.locals.get_mut(i as usize) {
                Some(slot) => {
                    *slot = Slot::Value(value);
                    Ok(None)
                }
                None => Err(interpreter_error(format!("local {} out of range", i))),
            }
        }
        Instr::MakeList(n) => {
            let mut items = Vec::with_capacity(n as usize);
            for _ in 0..n {
                items.push(pop_value(frame)?);
            }
            items.reverse();
            frame.stack.push(Slot::Value(Value::List(items)));
            Ok(None)
        }
        Instr::Index(i) => {
            let value = pop_value(frame)?;
            let items = value.as_list().ok_or_else(|| {
                ErrorValue::invalid_argument(format!("cannot index a {}", value.type_name()))
            })?;
            let item = items.get(i as usize).cloned().ok_or_else(|| {
                ErrorValue::invalid_argument(format!(
                    "index {} out of range for list of {}",
                    i,
                    items.len()
                ))
            })?;
            frame.stack.push(Slot::Value(item));
            Ok(None)
        }
        Instr::Native(index) => {
            let native = program
                .native(index as usize)
                .ok_or_else(|| interpreter_error(format!("native {} out of range", index)))?;
            let mut args = Vec::with_capacity(native.arity());
            for _ in 0..native.arity() {
                args.push(pop_value(frame)?);
            }
            args.reverse();
            let result = native.invoke(&args)?;
            frame.stack.push(Slot::Value(result));
            Ok(None)
        }
        Instr::Jump(target) => {
            frame.ip = target;
            Ok(None)
        }
        Instr::JumpIfFalse(target) => {
            let value = pop_value(frame)?;
            if !value.is_truthy() {
                frame.ip = target;
            }
            Ok(None)
        }
        Instr::MakeCall => {
            let input = pop_value(frame)?;
            let function = pop_function_name(frame)?;
            let awaitable = Awaitable::Call(Call::new(function, input));
            frame.stack.push(Slot::Value(awaitable.to_value()));
            Ok(None)
        }
        Instr::MakeSub => {
            let input = pop_value(frame)?;
            let function = pop_function_name(frame)?;
            let awaitable = Awaitable::Sub { function, input };
            frame.stack.push(Slot::Value(awaitable.to_value()));
            Ok(None)
        }
        Instr::Await => {
            let awaitable = Awaitable::from_value(pop_value(frame)?)?;
            match awaitable {
                Awaitable::Call(call) => {
                    frame.state = FrameState::Suspended;
                    Ok(Some(StepOutcome::Pending(Pending::Call(call))))
                }
                Awaitable::Sub { .. } => Err(ErrorValue::invalid_argument(
                    "await requires a call awaitable; use invoke for subroutines",
                )),
            }
        }
        Instr::Gather(policy) => {
            let list = pop_value(frame)?;
            let items = list.as_list().ok_or_else(|| {
                ErrorValue::invalid_argument(format!(
                    "gather expects a list of awaitables, got {}",
                    list.type_name()
                ))
            })?;
            let mut awaitables = Vec::with_capacity(items.len());
            for item in items {
                awaitables.push(Awaitable::from_value(item.clone())?);
            }
            frame.state = FrameState::Suspended;
            Ok(Some(StepOutcome::Pending(Pending::Gather {
                policy,
                awaitables,
            })))
        }
        Instr::Invoke => {
            let awaitable = Awaitable::from_value(pop_value(frame)?)?;
            let (function, input) = match awaitable {
                Awaitable::Sub { function, input } => (function, input),
                Awaitable::Call(_) => {
                    return Err(ErrorValue::invalid_argument(
                        "invoke requires a subroutine awaitable; use await for calls",
                    ))
                }
            };
            let child_program = resolver.resolve(&function).ok_or_else(|| {
                ErrorValue::not_found(format!("subroutine {:?} is not registered", function))
            })?;
            let mut child = Frame::new(&child_program, input);
            match resume_frame(&mut child, resolver, FrameInput::Start) {
                StepOutcome::Return(value) => {
                    frame.stack.push(Slot::Value(value));
                    Ok(None)
                }
                StepOutcome::Raise(error) => Err(error),
                StepOutcome::Pending(pending) => {
                    frame.stack.push(Slot::Frame(Box::new(child)));
                    frame.state = FrameState::SuspendedYieldFrom;
                    Ok(Some(StepOutcome::Pending(pending)))
                }
                StepOutcome::TailCall(call) => {
                    frame.state = FrameState::Completed;
                    Ok(Some(StepOutcome::TailCall(call)))
                }
            }
        }
        Instr::TailCall => {
            let awaitable = Awaitable::from_value(pop_value(frame)?)?;
            match awaitable {
                Awaitable::Call(call) => {
                    frame.state = FrameState::Completed;
                    Ok(Some(StepOutcome::TailCall(call)))
                }
                Awaitable::Sub { .. } => Err(ErrorValue::invalid_argument(
                    "tail call requires a call awaitable",
                )),
            }
        }
        Instr::Return => {
            let value = pop_value(frame)?;
            frame.state = FrameState::Completed;
            Ok(Some(StepOutcome::Return(value)))
        }
        Instr::Raise => {
            let value = pop_value(frame)?;
            Err(ErrorValue::from_value(value))
        }
        Instr::CancelScope => {
            frame.state = FrameState::Suspended;
            Ok(Some(StepOutcome::Pending(Pending::Cancel)))
        }
        Instr::PushHandler(target) => {
            frame.blocks.push(Block {
                handler: target,
                depth: frame.stack.len() as u32,
            });
            Ok(None)
        }
        Instr::PopHandler => {
            frame
                .blocks
                .pop()
                .ok_or_else(|| interpreter_error("no handler block to pop"))?;
            Ok(None)
        }
    }
}

fn pop_function_name(frame: &mut Frame) -> Result<String, ErrorValue> {
    let value = pop_value(frame)?;
    match value {
        Value::Str(name) => Ok(name),
        other => Err(ErrorValue::invalid_argument(format!(
            "function name must be a string, got {}",
            other.type_name()
        ))),
    }
}
