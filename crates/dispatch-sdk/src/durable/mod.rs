// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable coroutine machinery.
//!
//! Three pieces cooperate to make user workflows snapshottable:
//!
//! - [`program`] defines the instruction set workflows compile into and the
//!   builder used to assemble them;
//! - [`coroutine`] interprets programs, surfacing each suspension point as a
//!   single pending directive;
//! - [`snapshot`] serializes the complete frame chain at a suspension point
//!   and validates it on the way back in.

pub mod coroutine;
pub mod frame;
pub mod program;
pub mod snapshot;

pub use coroutine::{
    Awaitable, DurableCoroutine, FunctionIdentity, Pending, ProgramResolver, ResumeInput,
    StepOutcome,
};
pub use frame::{Block, Frame, FrameState, Slot};
pub use program::{GatherPolicy, Instr, NativeOp, Program, ProgramBuilder, ProgramError};
pub use snapshot::{restore, snapshot, STATE_VERSION};
