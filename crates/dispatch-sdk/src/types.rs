// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! High-level types for the SDK.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use dispatch_proto as proto;

use crate::envelope::{box_value, unbox_value};
use crate::error::{ErrorValue, Result};
use crate::value::Value;

/// Unique identifier of a dispatched execution.
///
/// Assigned by the scheduler; treat it as an opaque value.
pub type DispatchId = String;

/// Instruction to call a function.
///
/// Calls can be built manually, but it is usually more convenient to go
/// through [`FunctionHandle::call`](crate::registry::FunctionHandle::call).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub function: String,
    pub input: Value,
    /// Endpoint hosting the function. `None` means the caller's own endpoint.
    pub endpoint: Option<String>,
    /// Upper bound on how long the execution may run.
    pub expiration: Option<Duration>,
    /// Version of the function to call, when pinned.
    pub version: Option<String>,
}

impl Call {
    pub fn new(function: impl Into<String>, input: Value) -> Self {
        Self {
            function: function.into(),
            input,
            endpoint: None,
            expiration: None,
            version: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Convert to the wire representation, boxing the input.
    pub fn to_proto(&self, correlation_id: u64) -> Result<proto::Call> {
        Ok(proto::Call {
            correlation_id,
            endpoint: self.endpoint.clone().unwrap_or_default(),
            function: self.function.clone(),
            input: Some(box_value(&self.input)?),
            expiration: self.expiration.map(duration_to_proto),
            version: self.version.clone().unwrap_or_default(),
        })
    }
}

/// Result of a call, after unboxing.
///
/// Exactly one of `output` or `error` is set when the call completed;
/// `dispatch_id` alone means the call was merely enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub correlation_id: u64,
    pub output: Option<Value>,
    pub error: Option<ErrorValue>,
    pub dispatch_id: Option<DispatchId>,
}

impl CallOutcome {
    /// Unbox a wire call result. An output envelope that fails to decode
    /// becomes an INVALID_RESPONSE error outcome rather than failing the
    /// whole poll delivery.
    pub fn from_proto(proto: &proto::CallResult) -> Self {
        let (output, error) = match (&proto.output, &proto.error) {
            (_, Some(e)) => (None, Some(ErrorValue::from_proto(e))),
            (Some(envelope), None) => match unbox_value(envelope) {
                Ok(value) => (Some(value), None),
                Err(e) => (None, Some(ErrorValue::invalid_response(e.to_string()))),
            },
            (None, None) => (None, None),
        };
        Self {
            correlation_id: proto.correlation_id,
            output,
            error,
            dispatch_id: if proto.dispatch_id.is_empty() {
                None
            } else {
                Some(proto.dispatch_id.clone())
            },
        }
    }
}

// ============================================================================
// Retry policy
// ============================================================================

/// Retry budget of the dispatch client.
///
/// Only transient transport failures qualify for another attempt; permanent
/// ones surface immediately. The wait doubles after every failure, starting
/// at `base_delay` and never exceeding `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, counting the first one. 1 disables retries.
    pub max_attempts: u32,
    /// Wait before the first retry.
    pub base_delay: Duration,
    /// Ceiling on the wait between attempts.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A policy that gives up after the first failure.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Whether another attempt may follow the given number of failures.
    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts
    }

    /// Wait after the n-th failure (1-indexed): one doubling per preceding
    /// failure, clamped to the ceiling.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let doublings = failed_attempts.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

pub(crate) fn duration_to_proto(d: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

pub(crate) fn error_call_result(correlation_id: u64, error: &ErrorValue) -> proto::CallResult {
    proto::CallResult {
        correlation_id,
        output: None,
        error: Some(error.to_proto()),
        dispatch_id: String::new(),
    }
}

pub(crate) fn value_call_result(correlation_id: u64, value: &Value) -> Result<proto::CallResult> {
    Ok(proto::CallResult {
        correlation_id,
        output: Some(box_value(value)?),
        error: None,
        dispatch_id: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_proto::Status;

    #[test]
    fn test_call_builder() {
        let call = Call::new("app.handler", Value::Int(7))
            .with_endpoint("https://other.example.com")
            .with_expiration(Duration::from_secs(60))
            .with_version("v3");
        assert_eq!(call.function, "app.handler");
        assert_eq!(call.endpoint.as_deref(), Some("https://other.example.com"));
        assert_eq!(call.expiration, Some(Duration::from_secs(60)));
        assert_eq!(call.version.as_deref(), Some("v3"));
    }

    #[test]
    fn test_call_to_proto() {
        let call = Call::new("app.double", Value::Int(10)).with_expiration(Duration::from_secs(5));
        let proto = call.to_proto(42).unwrap();
        assert_eq!(proto.correlation_id, 42);
        assert_eq!(proto.function, "app.double");
        assert_eq!(proto.endpoint, "");
        assert_eq!(proto.expiration.as_ref().unwrap().seconds, 5);
        let input = proto.input.unwrap();
        assert_eq!(unbox_value(&input).unwrap(), Value::Int(10));
    }

    #[test]
    fn test_call_outcome_from_output() {
        let result = value_call_result(3, &Value::Str("done".into())).unwrap();
        let outcome = CallOutcome::from_proto(&result);
        assert_eq!(outcome.correlation_id, 3);
        assert_eq!(outcome.output, Some(Value::Str("done".into())));
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_call_outcome_from_error() {
        let result = error_call_result(4, &ErrorValue::temporary("later"));
        let outcome = CallOutcome::from_proto(&result);
        assert!(outcome.output.is_none());
        let error = outcome.error.unwrap();
        assert_eq!(error.status(), Status::TemporaryError);
    }

    #[test]
    fn test_call_outcome_corrupt_output() {
        let result = proto::CallResult {
            correlation_id: 5,
            output: Some(proto::Envelope {
                type_url: "types.example.com/Nope".into(),
                value: vec![],
            }),
            error: None,
            dispatch_id: String::new(),
        };
        let outcome = CallOutcome::from_proto(&result);
        let error = outcome.error.unwrap();
        assert_eq!(error.status(), Status::InvalidResponse);
    }

    #[test]
    fn test_backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!RetryPolicy::no_retries().should_retry(1));
    }
}
