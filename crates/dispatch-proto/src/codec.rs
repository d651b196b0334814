// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Encode/decode helpers with oneof validation.
//!
//! Encoding is deterministic: prost writes fields in tag order and the
//! messages contain no maps. Decoding enforces the "exactly one" contracts
//! the schema cannot express on its own: a [`RunRequest`] carries either an
//! initial input or a poll result, and a [`RunResponse`] carries either an
//! exit or a poll.

use prost::Message;
use thiserror::Error as ThisError;

use crate::sdk::{
    run_response, Call, CallResult, DispatchRequest, DispatchResponse, Exit, Poll, RunRequest,
    RunResponse, Status,
};

/// Errors produced while moving messages on or off the wire.
#[derive(Debug, ThisError)]
pub enum ProtoError {
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("{message} must carry exactly one of {variants}")]
    MissingDirective {
        message: &'static str,
        variants: &'static str,
    },
}

impl ProtoError {
    /// Status to attach when reporting this error to the peer.
    pub fn status(&self) -> Status {
        match self {
            ProtoError::Decode(_) => Status::InvalidArgument,
            ProtoError::MissingDirective { .. } => Status::InvalidArgument,
        }
    }
}

/// Decode a [`RunRequest`], rejecting requests without a directive.
pub fn decode_run_request(bytes: &[u8]) -> Result<RunRequest, ProtoError> {
    let request = RunRequest::decode(bytes)?;
    if request.directive.is_none() {
        return Err(ProtoError::MissingDirective {
            message: "RunRequest",
            variants: "input, poll_result",
        });
    }
    Ok(request)
}

pub fn encode_run_request(request: &RunRequest) -> Vec<u8> {
    request.encode_to_vec()
}

/// Decode a [`RunResponse`], rejecting responses without a directive.
pub fn decode_run_response(bytes: &[u8]) -> Result<RunResponse, ProtoError> {
    let response = RunResponse::decode(bytes)?;
    if response.directive.is_none() {
        return Err(ProtoError::MissingDirective {
            message: "RunResponse",
            variants: "exit, poll",
        });
    }
    Ok(response)
}

pub fn encode_run_response(response: &RunResponse) -> Vec<u8> {
    response.encode_to_vec()
}

pub fn encode_dispatch_request(request: &DispatchRequest) -> Vec<u8> {
    request.encode_to_vec()
}

pub fn decode_dispatch_response(bytes: &[u8]) -> Result<DispatchResponse, ProtoError> {
    Ok(DispatchResponse::decode(bytes)?)
}

/// Build a terminal [`RunResponse`].
///
/// Exactly one of `result` or `tail_call` should be set; a bare exit with
/// neither is how an execution reports a nil result.
pub fn exit_response(status: Status, result: Option<CallResult>, tail_call: Option<Call>) -> RunResponse {
    RunResponse {
        status: status as i32,
        directive: Some(run_response::Directive::Exit(Exit { result, tail_call })),
    }
}

/// Build a suspension [`RunResponse`]. Polls always carry status OK; a
/// failure to suspend is reported as an exit instead.
pub fn poll_response(poll: Poll) -> RunResponse {
    RunResponse {
        status: Status::Ok as i32,
        directive: Some(run_response::Directive::Poll(poll)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::{run_request, Envelope, PollResult};

    fn envelope() -> Envelope {
        Envelope {
            type_url: "test/raw".to_string(),
            value: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_run_request_round_trip() {
        let request = RunRequest {
            function: "app.double".to_string(),
            directive: Some(run_request::Directive::Input(envelope())),
        };
        let bytes = encode_run_request(&request);
        let decoded = decode_run_request(&bytes).unwrap();
        assert_eq!(request, decoded);
    }

    #[test]
    fn test_run_request_without_directive_is_rejected() {
        let request = RunRequest {
            function: "app.double".to_string(),
            directive: None,
        };
        let bytes = encode_run_request(&request);
        let err = decode_run_request(&bytes).unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
    }

    #[test]
    fn test_run_request_poll_result_round_trip() {
        let request = RunRequest {
            function: "app.pipeline".to_string(),
            directive: Some(run_request::Directive::PollResult(PollResult {
                coroutine_state: vec![9, 9, 9],
                results: vec![CallResult {
                    correlation_id: (1u64 << 32) | 1,
                    output: Some(envelope()),
                    error: None,
                    dispatch_id: String::new(),
                }],
                error: None,
            })),
        };
        let bytes = encode_run_request(&request);
        let decoded = decode_run_request(&bytes).unwrap();
        assert_eq!(request, decoded);
    }

    #[test]
    fn test_run_response_without_directive_is_rejected() {
        let response = RunResponse {
            status: Status::Ok as i32,
            directive: None,
        };
        let bytes = encode_run_response(&response);
        assert!(decode_run_response(&bytes).is_err());
    }

    #[test]
    fn test_exit_response_shape() {
        let response = exit_response(Status::Ok, None, None);
        assert_eq!(response.status, Status::Ok as i32);
        match response.directive {
            Some(run_response::Directive::Exit(_)) => {}
            _ => panic!("expected exit directive"),
        }
    }

    #[test]
    fn test_poll_response_is_ok() {
        let response = poll_response(Poll {
            coroutine_state: vec![1],
            calls: vec![],
            min_results: 1,
            max_results: 1,
            max_wait: None,
        });
        assert_eq!(response.status, Status::Ok as i32);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let response = exit_response(
            Status::TemporaryError,
            Some(CallResult {
                correlation_id: 7,
                output: Some(envelope()),
                error: None,
                dispatch_id: "disp_1".to_string(),
            }),
            None,
        );
        assert_eq!(encode_run_response(&response), encode_run_response(&response));
    }

    #[test]
    fn test_opaque_payloads_round_trip() {
        let state = vec![0u8, 255, 4, 7, 0, 0, 1];
        let response = poll_response(Poll {
            coroutine_state: state.clone(),
            calls: vec![],
            min_results: 1,
            max_results: 1,
            max_wait: None,
        });
        let decoded = decode_run_response(&encode_run_response(&response)).unwrap();
        match decoded.directive {
            Some(run_response::Directive::Poll(poll)) => {
                assert_eq!(poll.coroutine_state, state);
            }
            _ => panic!("expected poll directive"),
        }
    }
}
