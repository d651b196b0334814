// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch SDK - Client SDK for the Dispatch durable execution service.
//!
//! This crate lets an application declare functions the remote scheduler can
//! run, retry across failures, suspend, persist, and resume on any worker,
//! with the illusion that execution flows as a single local program. The SDK
//! never schedules or stores anything itself: all durable state round-trips
//! through the scheduler as opaque `coroutine_state` bytes.
//!
//! # Features
//!
//! - **Function Registry**: Register one-shot functions and durable
//!   coroutines under stable wire names
//! - **Durable Coroutines**: Workflows compile into a small instruction set
//!   whose complete execution state snapshots at every await point
//! - **Concurrency Combinators**: `gather`, `any`, `race`, `all_completed`,
//!   and `n_of_m` multiplex child calls into one poll
//! - **Run Loop**: One request advances one execution by exactly one step
//! - **Dispatch Client**: Enqueue new executions with bounded retries
//!
//! # Quick Start
//!
//! ```ignore
//! use dispatch_sdk::{Config, Dispatch, GatherPolicy, Program, Registry, Value};
//!
//! let mut registry = Registry::new("https://functions.example.com");
//!
//! // A one-shot function runs to completion in a single request.
//! registry.register_one_shot("app.double", |v| match v {
//!     Value::Int(n) => Ok(Value::Int(n * 2)),
//!     other => Err(ErrorValue::invalid_argument(other.type_name())),
//! })?;
//!
//! // A durable coroutine awaits child calls and survives suspension.
//! registry.register_coroutine(
//!     Program::builder("app.pipeline")
//!         .declare_native("add_one", 1, |args| match &args[0] {
//!             Value::Int(n) => Ok(Value::Int(n + 1)),
//!             other => Err(ErrorValue::invalid_argument(other.type_name())),
//!         })
//!         .const_("app.double")
//!         .load(0)
//!         .make_call()
//!         .await_call()
//!         .call_native("add_one")
//!         .ret()
//!         .build()?,
//! )?;
//!
//! let dispatch = Dispatch::builder()
//!     .config(Config::from_env()?)
//!     .registry(registry)
//!     .build()?;
//!
//! // The host HTTP adapter hands each RunRequest body to the engine.
//! let response = dispatch.run_bytes(&request_body);
//! ```
//!
//! # Wire Protocol
//!
//! The scheduler advances an execution by POSTing a `RunRequest` carrying
//! either the initial input or the results of the previous poll. The SDK
//! answers with a `RunResponse` carrying exactly one directive:
//!
//! - **Exit**: a final value or error, or a tail call replacing the
//!   execution;
//! - **Poll**: the serialized coroutine snapshot plus the child calls to
//!   complete before resuming.
//!
//! Message shapes live in the `dispatch-proto` crate.
//!
//! # Durability model
//!
//! A durable coroutine interprets a [`Program`]; its instruction pointer,
//! operand stack, locals, handler blocks, and nested subroutine frames are
//! plain data. At each suspension the whole chain serializes into the poll,
//! and any worker holding the same registered programs can pick it back up.
//! Snapshots carry the interpreter state version and per-program
//! fingerprints; drift is refused as INCOMPATIBLE_STATE rather than
//! misexecuted.

mod client;
mod config;
mod envelope;
mod error;
mod registry;
mod scheduler;
mod service;
mod types;
mod value;

pub mod durable;

// Main types
pub use client::{Client, DispatchTransport, HttpTransport};
pub use config::Config;
pub use envelope::{box_bytes, box_value, unbox_bytes, unbox_value, RAW_TYPE_URL, VALUE_TYPE_URL};
pub use error::{ErrorValue, Result, SdkError, TransportError};
pub use registry::{FunctionDescriptor, FunctionHandle, FunctionKind, Registry};
pub use scheduler::{CancellationScope, SchedulerOptions};
pub use service::{register_dispatch, try_dispatch, Dispatch, DispatchBuilder};
pub use types::{Call, CallOutcome, DispatchId, RetryPolicy};
pub use value::Value;

// Durable machinery, re-exported at the root for convenience
pub use durable::{GatherPolicy, Program, ProgramBuilder, ProgramError};

// Re-export the wire status so callers classify errors without an extra
// dependency on the protocol crate.
pub use dispatch_proto::Status;
