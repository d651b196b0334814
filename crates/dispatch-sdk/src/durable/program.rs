// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable programs: the instruction set coroutines execute.
//!
//! A durable coroutine does not run native Rust control flow; it interprets a
//! [`Program`], a compact stack-machine instruction list. Application logic
//! lives in named native operations registered on the program, so everything
//! the interpreter owns (instruction pointer, operand stack, locals, handler
//! blocks) is plain data and can be snapshotted at any suspension point.
//!
//! Programs are identified by name and version; a fingerprint over the
//! instruction stream and native signatures guards restored snapshots against
//! code drift.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use crate::error::ErrorValue;
use crate::value::Value;

/// Completion policy of a gather suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatherPolicy {
    /// Wait for every child; results in submission order; first error wins.
    All,
    /// First success wins; errors aggregate when every child fails.
    Any,
    /// First completion wins, success or failure.
    Race,
    /// Wait for every child; completions in completion order, errors
    /// included as values.
    AllCompleted,
    /// First `n` successes, in completion order.
    NOfM(u32),
}

/// One interpreter instruction.
///
/// Jump targets are absolute instruction indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    /// Push a constant.
    Const(Value),
    Pop,
    Dup,
    /// Push a copy of a local. Loading an uninitialized local raises.
    LoadLocal(u16),
    /// Pop into a local.
    StoreLocal(u16),
    /// Pop `n` values, push them as a list (bottom-most first).
    MakeList(u16),
    /// Pop a list, push a copy of its `i`-th element.
    Index(u16),
    /// Invoke a native operation: pops its arity, pushes its result.
    Native(u16),
    Jump(u32),
    /// Pop a value; jump when it is falsy.
    JumpIfFalse(u32),
    /// Pop input then function name; push a call awaitable.
    MakeCall,
    /// Pop input then function name; push a subroutine awaitable.
    MakeSub,
    /// Pop a call awaitable and suspend until its result arrives.
    Await,
    /// Pop a list of awaitables and suspend until the policy is satisfied.
    Gather(GatherPolicy),
    /// Pop a subroutine awaitable and run it inline as a nested frame.
    Invoke,
    /// Pop a call awaitable and replace this execution with it.
    TailCall,
    /// Pop the return value and complete the frame.
    Return,
    /// Pop an error value and unwind to the innermost handler.
    Raise,
    /// Cancel the execution's cancellation scope, then continue.
    CancelScope,
    /// Enter an error handler block targeting the given instruction.
    PushHandler(u32),
    /// Leave the innermost handler block.
    PopHandler,
}

/// A named native operation: the escape hatch into Rust.
///
/// Natives must be deterministic and side-effect free with respect to
/// execution state; everything they return flows back through the operand
/// stack and is snapshotted with it.
#[derive(Clone)]
pub struct NativeOp {
    name: String,
    arity: u8,
    f: Arc<NativeFn>,
}

type NativeFn = dyn Fn(&[Value]) -> std::result::Result<Value, ErrorValue> + Send + Sync;

impl NativeOp {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity as usize
    }

    pub fn invoke(&self, args: &[Value]) -> std::result::Result<Value, ErrorValue> {
        (self.f)(args)
    }
}

impl fmt::Debug for NativeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeOp")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// Errors raised while assembling a program.
#[derive(Debug, ThisError)]
pub enum ProgramError {
    #[error("label {0} was never bound")]
    UnboundLabel(usize),

    #[error("unknown native operation {0:?}")]
    UnknownNative(String),

    #[error("native operation {0:?} declared twice")]
    DuplicateNative(String),
}

/// A compiled durable program.
#[derive(Debug, Clone)]
pub struct Program {
    name: String,
    version: String,
    n_locals: u16,
    instrs: Vec<Instr>,
    natives: Vec<NativeOp>,
    fingerprint: u64,
}

impl Program {
    pub fn builder(name: impl Into<String>) -> ProgramBuilder {
        ProgramBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Stable digest of the instruction stream and native signatures.
    /// Snapshots taken under a different fingerprint are refused.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn n_locals(&self) -> u16 {
        self.n_locals
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn instr(&self, ip: usize) -> Option<&Instr> {
        self.instrs.get(ip)
    }

    pub fn native(&self, index: usize) -> Option<&NativeOp> {
        self.natives.get(index)
    }

    fn compute_fingerprint(
        name: &str,
        version: &str,
        n_locals: u16,
        instrs: &[Instr],
        natives: &[NativeOp],
    ) -> u64 {
        // DefaultHasher::new() uses fixed keys, so the digest is stable
        // across processes built from the same toolchain.
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        name.hash(&mut hasher);
        version.hash(&mut hasher);
        n_locals.hash(&mut hasher);
        let encoded = bincode::serialize(instrs).unwrap_or_default();
        encoded.hash(&mut hasher);
        for native in natives {
            native.name.hash(&mut hasher);
            native.arity.hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// Forward jump target, bound once the destination is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Assembles a [`Program`].
///
/// # Example
///
/// ```ignore
/// let program = Program::builder("app.pipeline")
///     .declare_native("add_one", 1, |args| match &args[0] {
///         Value::Int(n) => Ok(Value::Int(n + 1)),
///         other => Err(ErrorValue::invalid_argument(other.type_name())),
///     })
///     .const_("app.double")
///     .load(0)
///     .make_call()
///     .await_call()
///     .call_native("add_one")
///     .ret()
///     .build()?;
/// ```
pub struct ProgramBuilder {
    name: String,
    version: String,
    n_locals: u16,
    instrs: Vec<Instr>,
    natives: Vec<NativeOp>,
    native_index: HashMap<String, u16>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, usize)>,
    error: Option<ProgramError>,
}

impl ProgramBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "v1".to_string(),
            n_locals: 1,
            instrs: Vec::new(),
            natives: Vec::new(),
            native_index: HashMap::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            error: None,
        }
    }

    /// Set the function version carried by snapshots. Defaults to `"v1"`.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Number of local slots. Local 0 always holds the coroutine input.
    pub fn locals(mut self, n: u16) -> Self {
        self.n_locals = n.max(1);
        self
    }

    /// Declare a native operation before referencing it.
    pub fn declare_native<F>(mut self, name: impl Into<String>, arity: u8, f: F) -> Self
    where
        F: Fn(&[Value]) -> std::result::Result<Value, ErrorValue> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.native_index.contains_key(&name) {
            self.error
                .get_or_insert(ProgramError::DuplicateNative(name));
            return self;
        }
        self.native_index
            .insert(name.clone(), self.natives.len() as u16);
        self.natives.push(NativeOp {
            name,
            arity,
            f: Arc::new(f),
        });
        self
    }

    /// Create an unbound label for a forward jump.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the next instruction.
    pub fn bind(mut self, label: Label) -> Self {
        self.labels[label.0] = Some(self.instrs.len() as u32);
        self
    }

    pub fn op(mut self, instr: Instr) -> Self {
        self.instrs.push(instr);
        self
    }

    pub fn const_(self, value: impl Into<Value>) -> Self {
        self.op(Instr::Const(value.into()))
    }

    pub fn pop(self) -> Self {
        self.op(Instr::Pop)
    }

    pub fn dup(self) -> Self {
        self.op(Instr::Dup)
    }

    pub fn load(self, local: u16) -> Self {
        self.op(Instr::LoadLocal(local))
    }

    pub fn store(self, local: u16) -> Self {
        self.op(Instr::StoreLocal(local))
    }

    pub fn make_list(self, n: u16) -> Self {
        self.op(Instr::MakeList(n))
    }

    pub fn index(self, i: u16) -> Self {
        self.op(Instr::Index(i))
    }

    /// Invoke a previously declared native operation.
    pub fn call_native(mut self, name: &str) -> Self {
        match self.native_index.get(name) {
            Some(&index) => self.op(Instr::Native(index)),
            None => {
                self.error
                    .get_or_insert(ProgramError::UnknownNative(name.to_string()));
                self
            }
        }
    }

    pub fn jump(mut self, label: Label) -> Self {
        self.fixups.push((self.instrs.len(), label.0));
        self.op(Instr::Jump(u32::MAX))
    }

    pub fn jump_if_false(mut self, label: Label) -> Self {
        self.fixups.push((self.instrs.len(), label.0));
        self.op(Instr::JumpIfFalse(u32::MAX))
    }

    pub fn make_call(self) -> Self {
        self.op(Instr::MakeCall)
    }

    pub fn make_sub(self) -> Self {
        self.op(Instr::MakeSub)
    }

    pub fn await_call(self) -> Self {
        self.op(Instr::Await)
    }

    pub fn gather(self, policy: GatherPolicy) -> Self {
        self.op(Instr::Gather(policy))
    }

    pub fn invoke(self) -> Self {
        self.op(Instr::Invoke)
    }

    pub fn tail_call(self) -> Self {
        self.op(Instr::TailCall)
    }

    pub fn ret(self) -> Self {
        self.op(Instr::Return)
    }

    pub fn raise(self) -> Self {
        self.op(Instr::Raise)
    }

    pub fn cancel_scope(self) -> Self {
        self.op(Instr::CancelScope)
    }

    pub fn push_handler(mut self, label: Label) -> Self {
        self.fixups.push((self.instrs.len(), label.0));
        self.op(Instr::PushHandler(u32::MAX))
    }

    pub fn pop_handler(self) -> Self {
        self.op(Instr::PopHandler)
    }

    pub fn build(mut self) -> std::result::Result<Program, ProgramError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        for (instr_index, label_index) in self.fixups {
            let target = self.labels[label_index].ok_or(ProgramError::UnboundLabel(label_index))?;
            match &mut self.instrs[instr_index] {
                Instr::Jump(t) | Instr::JumpIfFalse(t) | Instr::PushHandler(t) => *t = target,
                _ => {}
            }
        }
        let fingerprint = Program::compute_fingerprint(
            &self.name,
            &self.version,
            self.n_locals,
            &self.instrs,
            &self.natives,
        );
        Ok(Program {
            name: self.name,
            version: self.version,
            n_locals: self.n_locals,
            instrs: self.instrs,
            natives: self.natives,
            fingerprint,
        })
    }
}
