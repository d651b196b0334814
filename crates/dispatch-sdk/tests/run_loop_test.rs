// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests of the run loop: one RunRequest in, one RunResponse out.

mod common;

use common::*;
use dispatch_proto::{codec, Status};
use dispatch_sdk::{unbox_value, ErrorValue, Value};

#[test]
fn test_one_shot_success() {
    let dispatch = fixture_dispatch();
    let response = dispatch.run(input_request("app.double", &Value::Int(21)));
    assert_eq!(response.status, Status::Ok as i32);
    assert_eq!(exit_value(&response), Value::Int(42));
}

#[test]
fn test_one_shot_invalid_input() {
    let dispatch = fixture_dispatch();
    let response = dispatch.run(input_request("app.double", &Value::Str("nope".into())));
    assert_eq!(response.status, Status::InvalidArgument as i32);
}

#[test]
fn test_missing_function_is_not_found() {
    let dispatch = fixture_dispatch();
    let response = dispatch.run(input_request("app.missing", &Value::Nil));
    assert_eq!(response.status, Status::NotFound as i32);
    expect_exit(&response);
}

#[test]
fn test_single_child_await() {
    let dispatch = fixture_dispatch();

    // First request: the coroutine suspends on app.double(10).
    let response = dispatch.run(input_request("app.pipeline", &Value::Int(10)));
    let poll = expect_poll(&response);
    assert_eq!(poll.calls.len(), 1);
    assert_eq!(poll.min_results, 1);
    assert_eq!(poll.max_results, 1);
    let call = &poll.calls[0];
    assert_eq!(call.function, "app.double");
    assert_eq!(
        unbox_value(call.input.as_ref().unwrap()).unwrap(),
        Value::Int(10)
    );
    assert!(!poll.coroutine_state.is_empty());

    // Second request: the result arrives and the coroutine finishes.
    let response = dispatch.run(poll_result_request(
        "app.pipeline",
        poll.coroutine_state,
        vec![output_result(call.correlation_id, &Value::Int(20))],
        None,
    ));
    assert_eq!(response.status, Status::Ok as i32);
    assert_eq!(exit_value(&response), Value::Int(21));
}

#[test]
fn test_gather_preserves_submission_order() {
    let dispatch = fixture_dispatch();
    let input = Value::List(vec![Value::Int(3), Value::Int(4)]);

    let response = dispatch.run(input_request("app.sum_pair", &input));
    let poll = expect_poll(&response);
    assert_eq!(poll.calls.len(), 2);
    assert_eq!(poll.min_results, 2);
    assert_eq!(poll.max_results, 2);

    // Calls are issued in source order.
    assert_eq!(
        unbox_value(poll.calls[0].input.as_ref().unwrap()).unwrap(),
        Value::Int(3)
    );
    assert_eq!(
        unbox_value(poll.calls[1].input.as_ref().unwrap()).unwrap(),
        Value::Int(4)
    );
    let first = poll.calls[0].correlation_id;
    let second = poll.calls[1].correlation_id;
    assert_ne!(first, second);

    // Results come back in the opposite order; submission order still wins.
    let response = dispatch.run(poll_result_request(
        "app.sum_pair",
        poll.coroutine_state,
        vec![
            output_result(second, &Value::Int(8)),
            output_result(first, &Value::Int(6)),
        ],
        None,
    ));
    assert_eq!(exit_value(&response), Value::Int(14));
}

#[test]
fn test_transient_error_classification_and_redelivery() {
    let dispatch = fixture_dispatch();
    let request = input_request("app.flaky", &Value::Nil);

    let response = dispatch.run(request.clone());
    assert_eq!(response.status, Status::TemporaryError as i32);
    let error = exit_error(&response);
    assert_eq!(error.r#type, "Temporary");

    // The scheduler redelivers; the directive must be identical.
    let again = dispatch.run(request);
    assert_eq!(
        codec::encode_run_response(&response),
        codec::encode_run_response(&again)
    );
}

#[test]
fn test_tail_call_replacement() {
    let dispatch = fixture_dispatch();
    let response = dispatch.run(input_request("app.router", &Value::Str("a".into())));
    assert_eq!(response.status, Status::Ok as i32);

    let exit = expect_exit(&response);
    assert!(exit.result.is_none(), "tail call carries no result");
    let tail_call = exit.tail_call.expect("exit carries a tail call");
    assert_eq!(tail_call.function, "app.handler");
    assert_eq!(
        unbox_value(tail_call.input.as_ref().unwrap()).unwrap(),
        Value::Str("a".into())
    );
}

#[test]
fn test_cancellation_on_poll_error() {
    let dispatch = fixture_dispatch();

    let response = dispatch.run(input_request("app.fanout", &Value::Nil));
    let poll = expect_poll(&response);
    assert_eq!(poll.calls.len(), 2);

    // The scheduler reports a timeout instead of results. Both awaits are
    // resolved with the cancellation error and the coroutine exits TIMEOUT.
    let response = dispatch.run(poll_result_request(
        "app.fanout",
        poll.coroutine_state,
        vec![],
        Some(ErrorValue::timeout("poll timed out").to_proto()),
    ));
    assert_eq!(response.status, Status::Timeout as i32);
    let error = exit_error(&response);
    assert_eq!(error.r#type, "Timeout");
}

#[test]
fn test_run_bytes_rejects_malformed_request() {
    let dispatch = fixture_dispatch();
    let body = dispatch.run_bytes(b"\xFF\xFF\xFF");
    let response = codec::decode_run_response(&body).unwrap();
    assert_eq!(response.status, Status::InvalidArgument as i32);
}

#[test]
fn test_run_bytes_round_trip() {
    let dispatch = fixture_dispatch();
    let body = codec::encode_run_request(&input_request("app.double", &Value::Int(5)));
    let response = codec::decode_run_response(&dispatch.run_bytes(&body)).unwrap();
    assert_eq!(response.status, Status::Ok as i32);
    assert_eq!(exit_value(&response), Value::Int(10));
}

#[test]
fn test_one_shot_cannot_be_resumed() {
    let dispatch = fixture_dispatch();
    let response = dispatch.run(poll_result_request("app.double", vec![], vec![], None));
    assert_eq!(response.status, Status::InvalidArgument as i32);
}

#[test]
fn test_poll_result_against_foreign_state_is_incompatible() {
    let dispatch = fixture_dispatch();
    let response = dispatch.run(poll_result_request(
        "app.pipeline",
        b"garbage snapshot".to_vec(),
        vec![],
        None,
    ));
    assert_eq!(response.status, Status::IncompatibleState as i32);
}

#[test]
fn test_panic_becomes_error_response() {
    let mut registry = fixture_registry();
    registry
        .register_one_shot("app.panics", |_| panic!("boom"))
        .unwrap();
    let dispatch = dispatch_sdk::Dispatch::builder()
        .config(test_config())
        .registry(registry)
        .build()
        .unwrap();

    let response = dispatch.run(input_request("app.panics", &Value::Nil));
    assert_eq!(response.status, Status::PermanentError as i32);
    let error = exit_error(&response);
    assert_eq!(error.r#type, "Panic");
    assert_eq!(error.message, "boom");
    assert!(!error.traceback.is_empty());
}
