// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch Protocol - Protobuf wire schema for the function run protocol
//!
//! This crate carries the message types exchanged between a function endpoint
//! and the Dispatch scheduler, plus the codec helpers to move them on and off
//! the wire:
//!
//! - The scheduler advances one execution by POSTing a [`RunRequest`] and
//!   reading back a [`RunResponse`].
//! - A client enqueues new executions by POSTing a [`DispatchRequest`] and
//!   reading back a [`DispatchResponse`].
//!
//! The message shapes mirror the `dispatch.sdk.v1` schema and are maintained
//! by hand; tags and enum values are stable build artifacts and must not be
//! renumbered.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      dispatch-proto                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Codec: encode / decode + oneof validation                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The transport itself (HTTP, request signing, allow-lists) lives with the
//! host application; this crate only deals in bytes.

pub mod codec;
pub mod sdk;

pub use codec::{
    decode_dispatch_response, decode_run_request, decode_run_response, encode_dispatch_request,
    encode_run_request, encode_run_response, exit_response, poll_response, ProtoError,
};
pub use sdk::{
    run_request, run_response, Call, CallResult, DispatchRequest, DispatchResponse, Envelope,
    Error, Exit, Poll, PollResult, Raw, RunRequest, RunResponse, Status,
};
