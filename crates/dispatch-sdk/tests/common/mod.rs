// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for run-loop tests.

use dispatch_proto::{self as proto, run_request, run_response};
use dispatch_sdk::{
    box_value, unbox_value, Config, Dispatch, ErrorValue, GatherPolicy, Program, Registry, Value,
};

pub fn test_config() -> Config {
    Config::new("https://api.dispatch.example.com").with_api_key("sk_test")
}

/// Registry with the fixture functions the scenarios exercise.
pub fn fixture_registry() -> Registry {
    let mut registry = Registry::new("https://functions.example.com");

    registry
        .register_one_shot("app.double", |v| match v {
            Value::Int(n) => Ok(Value::Int(n * 2)),
            other => Err(ErrorValue::invalid_argument(other.type_name())),
        })
        .unwrap();

    registry
        .register_one_shot("app.flaky", |_| {
            Err(ErrorValue::temporary("upstream unavailable"))
        })
        .unwrap();

    // Awaits app.double(x), returns the result plus one.
    registry
        .register_coroutine(
            Program::builder("app.pipeline")
                .declare_native("add_one", 1, |args| match &args[0] {
                    Value::Int(n) => Ok(Value::Int(n + 1)),
                    other => Err(ErrorValue::invalid_argument(other.type_name())),
                })
                .const_("app.double")
                .load(0)
                .make_call()
                .await_call()
                .call_native("add_one")
                .ret()
                .build()
                .unwrap(),
        )
        .unwrap();

    // Gathers app.double(a) and app.double(b), returns the sum.
    registry
        .register_coroutine(
            Program::builder("app.sum_pair")
                .declare_native("sum", 1, |args| match &args[0] {
                    Value::List(items) => {
                        let mut total = 0i64;
                        for item in items {
                            total += item.as_int().ok_or_else(|| {
                                ErrorValue::invalid_argument(item.type_name())
                            })?;
                        }
                        Ok(Value::Int(total))
                    }
                    other => Err(ErrorValue::invalid_argument(other.type_name())),
                })
                .const_("app.double")
                .load(0)
                .index(0)
                .make_call()
                .const_("app.double")
                .load(0)
                .index(1)
                .make_call()
                .make_list(2)
                .gather(GatherPolicy::All)
                .call_native("sum")
                .ret()
                .build()
                .unwrap(),
        )
        .unwrap();

    // Tail-calls app.handler with its own input.
    registry
        .register_coroutine(
            Program::builder("app.router")
                .const_("app.handler")
                .load(0)
                .make_call()
                .tail_call()
                .build()
                .unwrap(),
        )
        .unwrap();

    // Gathers two slow calls and returns whatever arrives.
    registry
        .register_coroutine(
            Program::builder("app.fanout")
                .const_("app.slow1")
                .const_(Value::Nil)
                .make_call()
                .const_("app.slow2")
                .const_(Value::Nil)
                .make_call()
                .make_list(2)
                .gather(GatherPolicy::All)
                .ret()
                .build()
                .unwrap(),
        )
        .unwrap();

    // Awaits app.double twice in sequence.
    registry
        .register_coroutine(
            Program::builder("app.two_step")
                .const_("app.double")
                .load(0)
                .make_call()
                .await_call()
                .store(0)
                .const_("app.double")
                .load(0)
                .make_call()
                .await_call()
                .ret()
                .build()
                .unwrap(),
        )
        .unwrap();

    // Catches the first await's failure, then tries a second await.
    registry
        .register_coroutine(
            {
                let mut builder = Program::builder("app.stubborn");
                let handler = builder.new_label();
                builder
                    .push_handler(handler)
                    .const_("app.slow1")
                    .const_(Value::Nil)
                    .make_call()
                    .await_call()
                    .pop_handler()
                    .ret()
                    .bind(handler)
                    .pop()
                    .const_("app.slow2")
                    .const_(Value::Nil)
                    .make_call()
                    .await_call()
                    .ret()
                    .build()
                    .unwrap()
            },
        )
        .unwrap();

    registry
}

pub fn fixture_dispatch() -> Dispatch {
    Dispatch::builder()
        .config(test_config())
        .registry(fixture_registry())
        .build()
        .unwrap()
}

pub fn input_request(function: &str, input: &Value) -> proto::RunRequest {
    proto::RunRequest {
        function: function.to_string(),
        directive: Some(run_request::Directive::Input(box_value(input).unwrap())),
    }
}

pub fn poll_result_request(
    function: &str,
    coroutine_state: Vec<u8>,
    results: Vec<proto::CallResult>,
    error: Option<proto::Error>,
) -> proto::RunRequest {
    proto::RunRequest {
        function: function.to_string(),
        directive: Some(run_request::Directive::PollResult(proto::PollResult {
            coroutine_state,
            results,
            error,
        })),
    }
}

pub fn output_result(correlation_id: u64, value: &Value) -> proto::CallResult {
    proto::CallResult {
        correlation_id,
        output: Some(box_value(value).unwrap()),
        error: None,
        dispatch_id: String::new(),
    }
}

pub fn expect_poll(response: &proto::RunResponse) -> proto::Poll {
    assert_eq!(response.status, proto::Status::Ok as i32, "polls carry OK");
    match &response.directive {
        Some(run_response::Directive::Poll(poll)) => poll.clone(),
        other => panic!("expected poll directive, got {:?}", other.is_some()),
    }
}

pub fn expect_exit(response: &proto::RunResponse) -> proto::Exit {
    match &response.directive {
        Some(run_response::Directive::Exit(exit)) => exit.clone(),
        other => panic!("expected exit directive, got {:?}", other.is_some()),
    }
}

pub fn exit_value(response: &proto::RunResponse) -> Value {
    let exit = expect_exit(response);
    let result = exit.result.expect("exit carries a result");
    assert!(result.error.is_none(), "exit result is not an error");
    unbox_value(&result.output.expect("exit result carries an output")).unwrap()
}

pub fn exit_error(response: &proto::RunResponse) -> proto::Error {
    let exit = expect_exit(response);
    exit.result
        .expect("exit carries a result")
        .error
        .expect("exit result carries an error")
}
