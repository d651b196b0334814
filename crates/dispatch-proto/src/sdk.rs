// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message types of the `dispatch.sdk.v1` schema.
//!
//! Field tags and enum values are fixed by the service; they are part of the
//! wire contract and must never be renumbered.

/// An opaque typed payload (`Any`-shaped).
///
/// The `type_url` names the envelope family; the `value` bytes are only
/// meaningful to whoever owns that family. The runtime round-trips envelopes
/// it does not interpret byte-for-byte.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// A structured error carried in place of an output.
///
/// `value` holds the encoded error object so the caller side can re-raise it
/// faithfully; `traceback` is an opaque capture of the failure site. Both are
/// optional and round-trip untouched.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(bytes = "vec", tag = "3")]
    pub value: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub traceback: Vec<u8>,
}

/// Instruction to call a function.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Call {
    /// Pairs this call with its eventual [`CallResult`]. Unique within the
    /// poll that issued it.
    #[prost(uint64, tag = "1")]
    pub correlation_id: u64,
    /// Endpoint hosting the function. Empty means the caller's own endpoint.
    #[prost(string, tag = "2")]
    pub endpoint: String,
    #[prost(string, tag = "3")]
    pub function: String,
    #[prost(message, optional, tag = "4")]
    pub input: Option<Envelope>,
    /// Upper bound on how long the execution may run before the scheduler
    /// cancels it.
    #[prost(message, optional, tag = "5")]
    pub expiration: Option<prost_types::Duration>,
    #[prost(string, tag = "6")]
    pub version: String,
}

/// Result of a [`Call`], delivered through a [`PollResult`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallResult {
    #[prost(uint64, tag = "1")]
    pub correlation_id: u64,
    #[prost(message, optional, tag = "2")]
    pub output: Option<Envelope>,
    #[prost(message, optional, tag = "3")]
    pub error: Option<Error>,
    /// Identifier the scheduler assigned to the dispatched execution.
    #[prost(string, tag = "4")]
    pub dispatch_id: String,
}

/// Terminal directive: the execution finished with a result, or replaced
/// itself with a tail call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Exit {
    #[prost(message, optional, tag = "1")]
    pub result: Option<CallResult>,
    #[prost(message, optional, tag = "2")]
    pub tail_call: Option<Call>,
}

/// Suspension directive: the execution is waiting on child calls.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Poll {
    /// Serialized snapshot of the suspended coroutine. Opaque to the
    /// scheduler; round-tripped verbatim into the next request.
    #[prost(bytes = "vec", tag = "1")]
    pub coroutine_state: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    pub calls: Vec<Call>,
    /// How many results the scheduler should wait for before resuming.
    #[prost(uint32, tag = "3")]
    pub min_results: u32,
    /// How many results a single resume may carry.
    #[prost(uint32, tag = "4")]
    pub max_results: u32,
    /// How long the scheduler may hold the execution suspended.
    #[prost(message, optional, tag = "5")]
    pub max_wait: Option<prost_types::Duration>,
}

/// Payload resuming a previously polled execution.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PollResult {
    #[prost(bytes = "vec", tag = "1")]
    pub coroutine_state: Vec<u8>,
    /// Results in the order the scheduler completed them.
    #[prost(message, repeated, tag = "2")]
    pub results: Vec<CallResult>,
    /// Set when the scheduler aborts the poll (timeout, cancellation).
    #[prost(message, optional, tag = "3")]
    pub error: Option<Error>,
}

/// One request to advance an execution by one step.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunRequest {
    #[prost(string, tag = "1")]
    pub function: String,
    #[prost(oneof = "run_request::Directive", tags = "2, 3")]
    pub directive: Option<run_request::Directive>,
}

pub mod run_request {
    /// Exactly one of `input` (first call) or `poll_result` (resume).
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Directive {
        #[prost(message, tag = "2")]
        Input(super::Envelope),
        #[prost(message, tag = "3")]
        PollResult(super::PollResult),
    }
}

/// The outcome of advancing an execution by one step.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunResponse {
    #[prost(enumeration = "Status", tag = "1")]
    pub status: i32,
    #[prost(oneof = "run_response::Directive", tags = "2, 3")]
    pub directive: Option<run_response::Directive>,
}

pub mod run_response {
    /// Exactly one of `exit` or `poll`.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Directive {
        #[prost(message, tag = "2")]
        Exit(super::Exit),
        #[prost(message, tag = "3")]
        Poll(super::Poll),
    }
}

/// Batch of calls to enqueue as new executions.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DispatchRequest {
    #[prost(message, repeated, tag = "1")]
    pub calls: Vec<Call>,
}

/// Identifiers for dispatched executions, in request order.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DispatchResponse {
    #[prost(string, repeated, tag = "1")]
    pub dispatch_ids: Vec<String>,
}

/// Raw-bytes envelope payload (`BytesValue`-shaped).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Raw {
    #[prost(bytes = "vec", tag = "1")]
    pub value: Vec<u8>,
}

/// Classification attached to every [`RunResponse`] and to call errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    Unspecified = 0,
    /// Execution finished as expected.
    Ok = 1,
    /// Execution hit a timeout and may be retried.
    Timeout = 2,
    /// Execution was throttled and may be retried later.
    Throttled = 3,
    /// Execution received an invalid type of input.
    InvalidArgument = 4,
    /// Execution received an unexpected response.
    InvalidResponse = 5,
    /// Execution hit a temporary error and may be retried.
    TemporaryError = 6,
    /// Execution hit a permanent error and should not be retried.
    PermanentError = 7,
    /// Execution received an incompatible coroutine snapshot. May be
    /// restarted from scratch.
    IncompatibleState = 8,
    DnsError = 9,
    TcpError = 10,
    TlsError = 11,
    HttpError = 12,
    /// An operation was attempted without authentication.
    Unauthenticated = 13,
    /// An operation was attempted without permission.
    PermissionDenied = 14,
    /// An operation referenced a non-existent resource.
    NotFound = 15,
}

impl Status {
    /// Name used on the wire and in logs.
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Status::Unspecified => "UNSPECIFIED",
            Status::Ok => "OK",
            Status::Timeout => "TIMEOUT",
            Status::Throttled => "THROTTLED",
            Status::InvalidArgument => "INVALID_ARGUMENT",
            Status::InvalidResponse => "INVALID_RESPONSE",
            Status::TemporaryError => "TEMPORARY_ERROR",
            Status::PermanentError => "PERMANENT_ERROR",
            Status::IncompatibleState => "INCOMPATIBLE_STATE",
            Status::DnsError => "DNS_ERROR",
            Status::TcpError => "TCP_ERROR",
            Status::TlsError => "TLS_ERROR",
            Status::HttpError => "HTTP_ERROR",
            Status::Unauthenticated => "UNAUTHENTICATED",
            Status::PermissionDenied => "PERMISSION_DENIED",
            Status::NotFound => "NOT_FOUND",
        }
    }

    /// True when the scheduler is expected to retry the execution.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Status::Timeout
                | Status::Throttled
                | Status::TemporaryError
                | Status::DnsError
                | Status::TcpError
                | Status::TlsError
                | Status::HttpError
        )
    }

    /// True when the failure is delivered to the caller without retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Status::PermanentError
                | Status::InvalidArgument
                | Status::InvalidResponse
                | Status::NotFound
                | Status::Unauthenticated
                | Status::PermissionDenied
                | Status::IncompatibleState
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_values_are_stable() {
        assert_eq!(Status::Unspecified as i32, 0);
        assert_eq!(Status::Ok as i32, 1);
        assert_eq!(Status::Timeout as i32, 2);
        assert_eq!(Status::IncompatibleState as i32, 8);
        assert_eq!(Status::NotFound as i32, 15);
    }

    #[test]
    fn test_status_round_trip() {
        for value in 0..=15 {
            let status = Status::try_from(value).unwrap();
            assert_eq!(status as i32, value);
        }
        assert!(Status::try_from(16).is_err());
    }

    #[test]
    fn test_transient_and_permanent_partition() {
        for value in 2..=15 {
            let status = Status::try_from(value).unwrap();
            assert!(
                status.is_transient() != status.is_permanent(),
                "{} must be exactly one of transient/permanent",
                status.as_str_name()
            );
        }
        assert!(!Status::Ok.is_transient());
        assert!(!Status::Ok.is_permanent());
    }
}
