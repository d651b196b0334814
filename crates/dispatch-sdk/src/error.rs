// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK error types and the status classification table.
//!
//! Two kinds of failure flow through the SDK:
//!
//! - [`SdkError`] is the ordinary Rust error returned by SDK entry points to
//!   the embedding application (bad configuration, transport failures,
//!   registration conflicts).
//! - [`ErrorValue`] is a *value*: the structured error a durable function
//!   raised or received. It crosses the wire inside an error envelope,
//!   carries the original type name, message, payload, and an optional
//!   traceback, and is classified into a [`Status`] for retry decisions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error as ThisError;

use dispatch_proto::{Error as ProtoError, Status};

use crate::value::Value;

/// Errors returned by SDK entry points.
#[derive(Debug, ThisError)]
pub enum SdkError {
    /// Configuration error (missing or invalid environment variable)
    #[error("configuration error: {0}")]
    Config(String),

    /// A function or argument was rejected up front
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A peer sent back something the SDK could not interpret
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Function name not present in the registry
    #[error("function not found: {0}")]
    NotFound(String),

    /// Conflicting registration for an already-registered function name
    #[error("registration conflict: {0}")]
    Registration(String),

    /// A coroutine snapshot does not match the code currently registered
    #[error("incompatible state: {0}")]
    IncompatibleState(String),

    /// Snapshot or envelope encoding failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Outbound request to the scheduler failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The scheduler answered a dispatch with an error
    #[error("dispatch rejected: {0}")]
    Dispatch(String),
}

impl SdkError {
    /// Status to attach when reporting this error on the wire.
    pub fn status(&self) -> Status {
        match self {
            SdkError::Config(_) => Status::InvalidArgument,
            SdkError::InvalidArgument(_) => Status::InvalidArgument,
            SdkError::InvalidResponse(_) => Status::InvalidResponse,
            SdkError::NotFound(_) => Status::NotFound,
            SdkError::Registration(_) => Status::InvalidArgument,
            SdkError::IncompatibleState(_) => Status::IncompatibleState,
            SdkError::Serialization(_) => Status::PermanentError,
            SdkError::Transport(e) => e.status(),
            SdkError::Dispatch(_) => Status::PermanentError,
        }
    }
}

/// Type alias for SDK results.
pub type Result<T> = std::result::Result<T, SdkError>;

/// Failures of the outbound request/response channel.
#[derive(Debug, ThisError)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("HTTP status {code}")]
    Http { code: u16 },

    #[error("malformed response body: {0}")]
    Body(String),
}

impl TransportError {
    pub fn status(&self) -> Status {
        match self {
            TransportError::Timeout => Status::Timeout,
            TransportError::Dns(_) => Status::DnsError,
            TransportError::Connect(_) => Status::TcpError,
            TransportError::Tls(_) => Status::TlsError,
            TransportError::Http { code: 401 } => Status::Unauthenticated,
            TransportError::Http { code: 403 } => Status::PermissionDenied,
            TransportError::Http { code: 404 } => Status::NotFound,
            TransportError::Http { code: 429 } => Status::Throttled,
            TransportError::Http { .. } => Status::HttpError,
            TransportError::Body(_) => Status::InvalidResponse,
        }
    }

    /// True when retrying the request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Http { code } => *code == 429 || *code >= 500,
            TransportError::Body(_) => false,
            _ => true,
        }
    }
}

// Well-known error type names. Anything else classifies as permanent.
pub(crate) const KIND_TIMEOUT: &str = "Timeout";
pub(crate) const KIND_CANCELLED: &str = "Cancelled";
pub(crate) const KIND_THROTTLED: &str = "Throttled";
pub(crate) const KIND_INVALID_ARGUMENT: &str = "InvalidArgument";
pub(crate) const KIND_INVALID_RESPONSE: &str = "InvalidResponse";
pub(crate) const KIND_TEMPORARY: &str = "Temporary";
pub(crate) const KIND_PERMANENT: &str = "Permanent";
pub(crate) const KIND_INCOMPATIBLE_STATE: &str = "IncompatibleState";
pub(crate) const KIND_NOT_FOUND: &str = "NotFound";
pub(crate) const KIND_PERMISSION_DENIED: &str = "PermissionDenied";
pub(crate) const KIND_CONNECTION: &str = "Connection";
pub(crate) const KIND_AGGREGATE: &str = "AggregateError";

const ERROR_MARKER_KEY: &str = "$error";

/// A structured error raised by or delivered to a durable function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorValue {
    /// Error type name, preserved across the wire for faithful re-raising.
    pub kind: String,
    pub message: String,
    /// Arbitrary payload carried with the error.
    pub value: Option<Value>,
    /// Opaque capture of the failure site.
    pub traceback: Option<String>,
    /// Explicit classification. When absent the kind name decides.
    status_code: Option<i32>,
}

impl ErrorValue {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            value: None,
            traceback: None,
            status_code: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(KIND_TIMEOUT, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(KIND_CANCELLED, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(KIND_INVALID_ARGUMENT, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(KIND_INVALID_RESPONSE, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(KIND_NOT_FOUND, message)
    }

    /// A connection-level failure, classified as a TCP error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(KIND_CONNECTION, message)
    }

    /// An error the scheduler should retry.
    pub fn temporary(message: impl Into<String>) -> Self {
        Self::new(KIND_TEMPORARY, message)
    }

    /// An error the scheduler must not retry.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(KIND_PERMANENT, message)
    }

    pub fn incompatible_state(message: impl Into<String>) -> Self {
        Self::new(KIND_INCOMPATIBLE_STATE, message)
    }

    /// Aggregate of several child errors, in submission order.
    pub fn aggregate(errors: Vec<ErrorValue>) -> Self {
        let message = errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let value = Value::List(errors.iter().map(|e| e.to_value()).collect());
        Self {
            kind: KIND_AGGREGATE.to_string(),
            message,
            value: Some(value),
            traceback: None,
            status_code: None,
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// Pin the classification, overriding the kind-name table.
    pub fn with_status(mut self, status: Status) -> Self {
        self.status_code = Some(status as i32);
        self
    }

    /// Classification for retry decisions. An explicit status wins;
    /// otherwise the kind name decides, defaulting to permanent.
    pub fn status(&self) -> Status {
        if let Some(code) = self.status_code {
            if let Ok(status) = Status::try_from(code) {
                if status != Status::Unspecified && status != Status::Ok {
                    return status;
                }
            }
        }
        match self.kind.as_str() {
            KIND_TIMEOUT | KIND_CANCELLED => Status::Timeout,
            KIND_THROTTLED => Status::Throttled,
            KIND_INVALID_ARGUMENT => Status::InvalidArgument,
            KIND_INVALID_RESPONSE => Status::InvalidResponse,
            KIND_TEMPORARY => Status::TemporaryError,
            KIND_CONNECTION => Status::TcpError,
            KIND_INCOMPATIBLE_STATE => Status::IncompatibleState,
            KIND_NOT_FOUND => Status::NotFound,
            KIND_PERMISSION_DENIED => Status::PermissionDenied,
            _ => Status::PermanentError,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.status().is_transient()
    }

    /// Encode as a value, so errors can live on the operand stack and be
    /// inspected by handler blocks.
    pub fn to_value(&self) -> Value {
        let mut entries = BTreeMap::new();
        entries.insert(ERROR_MARKER_KEY.to_string(), Value::Bool(true));
        entries.insert("kind".to_string(), Value::Str(self.kind.clone()));
        entries.insert("message".to_string(), Value::Str(self.message.clone()));
        if let Some(value) = &self.value {
            entries.insert("value".to_string(), value.clone());
        }
        if let Some(traceback) = &self.traceback {
            entries.insert("traceback".to_string(), Value::Str(traceback.clone()));
        }
        if let Some(code) = self.status_code {
            entries.insert("status".to_string(), Value::Int(code as i64));
        }
        Value::Map(entries)
    }

    /// Decode an error previously produced by [`to_value`]. A non-error
    /// value becomes a generic error carrying it as payload.
    ///
    /// [`to_value`]: ErrorValue::to_value
    pub fn from_value(value: Value) -> Self {
        if let Value::Map(entries) = &value {
            if entries.contains_key(ERROR_MARKER_KEY) {
                let kind = entries
                    .get("kind")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Error")
                    .to_string();
                let message = entries
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                return Self {
                    kind,
                    message,
                    value: entries.get("value").cloned(),
                    traceback: entries
                        .get("traceback")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    status_code: entries
                        .get("status")
                        .and_then(|v| v.as_int())
                        .map(|n| n as i32),
                };
            }
        }
        Self {
            kind: "Error".to_string(),
            message: value.to_string(),
            value: Some(value),
            traceback: None,
            status_code: None,
        }
    }

    /// Convert to the wire representation. The payload is encoded so the
    /// caller side can rehydrate and re-raise the original error.
    pub fn to_proto(&self) -> ProtoError {
        let value = match &self.value {
            Some(v) => bincode::serialize(v).unwrap_or_default(),
            None => Vec::new(),
        };
        ProtoError {
            r#type: self.kind.clone(),
            message: self.message.clone(),
            value,
            traceback: self
                .traceback
                .as_ref()
                .map(|t| t.as_bytes().to_vec())
                .unwrap_or_default(),
        }
    }

    /// Rehydrate from the wire representation. A payload that fails to
    /// decode is dropped rather than failing the whole delivery; the type
    /// name and message always survive.
    pub fn from_proto(proto: &ProtoError) -> Self {
        let value = if proto.value.is_empty() {
            None
        } else {
            bincode::deserialize(&proto.value).ok()
        };
        let traceback = if proto.traceback.is_empty() {
            None
        } else {
            String::from_utf8(proto.traceback.clone()).ok()
        };
        Self {
            kind: proto.r#type.clone(),
            message: proto.message.clone(),
            value,
            traceback,
            status_code: None,
        }
    }
}

impl std::fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_by_kind() {
        assert_eq!(ErrorValue::timeout("t").status(), Status::Timeout);
        assert_eq!(ErrorValue::cancelled("c").status(), Status::Timeout);
        assert_eq!(
            ErrorValue::invalid_argument("a").status(),
            Status::InvalidArgument
        );
        assert_eq!(ErrorValue::temporary("x").status(), Status::TemporaryError);
        assert_eq!(ErrorValue::not_found("n").status(), Status::NotFound);
        assert_eq!(
            ErrorValue::new("SomethingElse", "m").status(),
            Status::PermanentError
        );
    }

    #[test]
    fn test_connection_kind_is_a_tcp_error() {
        let error = ErrorValue::connection("connection refused");
        assert_eq!(error.kind, KIND_CONNECTION);
        assert_eq!(error.status(), Status::TcpError);
        assert!(error.is_transient());
        // The kind alone decides; no explicit status is attached.
        assert_eq!(
            ErrorValue::new(KIND_CONNECTION, "reset by peer").status(),
            Status::TcpError
        );
    }

    #[test]
    fn test_explicit_status_wins() {
        let error = ErrorValue::new("SomethingElse", "m").with_status(Status::Throttled);
        assert_eq!(error.status(), Status::Throttled);
        assert!(error.is_transient());
    }

    #[test]
    fn test_ok_status_override_is_ignored() {
        let error = ErrorValue::permanent("m").with_status(Status::Ok);
        assert_eq!(error.status(), Status::PermanentError);
    }

    #[test]
    fn test_value_round_trip() {
        let error = ErrorValue::temporary("boom")
            .with_value(Value::Int(7))
            .with_traceback("at line 3");
        let decoded = ErrorValue::from_value(error.to_value());
        assert_eq!(error, decoded);
    }

    #[test]
    fn test_plain_value_becomes_generic_error() {
        let decoded = ErrorValue::from_value(Value::Str("oops".into()));
        assert_eq!(decoded.kind, "Error");
        assert_eq!(decoded.value, Some(Value::Str("oops".into())));
    }

    #[test]
    fn test_proto_round_trip() {
        let error = ErrorValue::new("MyError", "it broke")
            .with_value(Value::List(vec![Value::Int(1), Value::Nil]))
            .with_traceback("frame 0\nframe 1");
        let restored = ErrorValue::from_proto(&error.to_proto());
        assert_eq!(restored.kind, "MyError");
        assert_eq!(restored.message, "it broke");
        assert_eq!(restored.value, error.value);
        assert_eq!(restored.traceback, error.traceback);
    }

    #[test]
    fn test_aggregate_preserves_order() {
        let aggregate =
            ErrorValue::aggregate(vec![ErrorValue::temporary("a"), ErrorValue::permanent("b")]);
        assert_eq!(aggregate.kind, KIND_AGGREGATE);
        assert_eq!(aggregate.message, "a; b");
        let items = match aggregate.value {
            Some(Value::List(items)) => items,
            other => panic!("expected list payload, got {:?}", other),
        };
        assert_eq!(ErrorValue::from_value(items[0].clone()).message, "a");
        assert_eq!(ErrorValue::from_value(items[1].clone()).message, "b");
    }

    #[test]
    fn test_transport_error_statuses() {
        assert_eq!(TransportError::Timeout.status(), Status::Timeout);
        assert_eq!(
            TransportError::Http { code: 401 }.status(),
            Status::Unauthenticated
        );
        assert_eq!(
            TransportError::Http { code: 429 }.status(),
            Status::Throttled
        );
        assert_eq!(
            TransportError::Http { code: 503 }.status(),
            Status::HttpError
        );
        assert!(TransportError::Http { code: 503 }.is_transient());
        assert!(!TransportError::Http { code: 400 }.is_transient());
        assert!(TransportError::Connect("refused".into()).is_transient());
    }
}
