// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The run-loop engine: one `RunRequest` in, one `RunResponse` out.
//!
//! [`Dispatch`] owns the frozen registry and drives exactly one advance per
//! request: locate the function, revive or create its coroutine, deliver the
//! prior poll results, run to the first directive, and translate that
//! directive into the response. Nothing is retried here; retry is the
//! scheduler's job and the response status tells it how.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use dispatch_proto::{self as proto, codec, Status};

use crate::client::Client;
use crate::config::Config;
use crate::envelope::{box_value, unbox_value};
use crate::error::{ErrorValue, Result, SdkError};
use crate::registry::{FunctionDescriptor, FunctionKind, Registry};
use crate::scheduler::{OneShotScheduler, SchedulerOptions, SchedulerOutput};
use crate::types::{duration_to_proto, error_call_result, CallOutcome};

/// The SDK's inbound surface: holds the registered functions and advances
/// executions one request at a time.
///
/// # Example
///
/// ```ignore
/// use dispatch_sdk::{Config, Dispatch, Registry, Value};
///
/// let mut registry = Registry::new("https://functions.example.com");
/// registry.register_one_shot("app.double", |v| match v {
///     Value::Int(n) => Ok(Value::Int(n * 2)),
///     other => Err(ErrorValue::invalid_argument(other.type_name())),
/// })?;
///
/// let dispatch = Dispatch::builder()
///     .config(Config::from_env()?)
///     .registry(registry)
///     .build()?;
///
/// // The host HTTP adapter feeds request bodies in and writes responses out.
/// let response_body = dispatch.run_bytes(&request_body);
/// ```
pub struct Dispatch {
    registry: Arc<Registry>,
    config: Config,
    options: SchedulerOptions,
}

/// Builder for [`Dispatch`].
#[derive(Default)]
pub struct DispatchBuilder {
    registry: Option<Registry>,
    config: Option<Config>,
    poll_max_results: Option<u32>,
    poll_max_wait: Option<Duration>,
    execution_timeout: Option<Duration>,
}

impl DispatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the function registry (required). It is frozen on build.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Cap on call results delivered per resume. Default 10.
    pub fn poll_max_results(mut self, max: u32) -> Self {
        self.poll_max_results = Some(max);
        self
    }

    /// Constant bound on how long a poll may stay suspended.
    pub fn poll_max_wait(mut self, wait: Duration) -> Self {
        self.poll_max_wait = Some(wait);
        self
    }

    /// Deadline applied to each execution's cancellation scope.
    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<Dispatch> {
        let mut registry = self
            .registry
            .ok_or_else(|| SdkError::Config("a function registry is required".to_string()))?;
        let config = self
            .config
            .ok_or_else(|| SdkError::Config("a configuration is required".to_string()))?;
        registry.freeze();

        let mut options = SchedulerOptions {
            trace: config.trace,
            ..SchedulerOptions::default()
        };
        if let Some(max) = self.poll_max_results {
            options.poll_max_results = max.max(1);
        }
        options.poll_max_wait = self.poll_max_wait;
        options.execution_timeout = self.execution_timeout;

        Ok(Dispatch {
            registry: Arc::new(registry),
            config,
            options,
        })
    }
}

impl Dispatch {
    pub fn builder() -> DispatchBuilder {
        DispatchBuilder::new()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Client for dispatching top-level executions with this configuration.
    pub fn client(&self) -> Result<Client> {
        Client::new(&self.config)
    }

    /// Advance one execution from a wire-encoded request, returning the
    /// wire-encoded response. This is what the host HTTP adapter calls.
    pub fn run_bytes(&self, body: &[u8]) -> Vec<u8> {
        let response = match codec::decode_run_request(body) {
            Ok(request) => self.run(request),
            Err(e) => {
                error!(%e, "rejecting malformed run request");
                let error = ErrorValue::invalid_argument(e.to_string()).with_status(e.status());
                error_response(&error)
            }
        };
        codec::encode_run_response(&response)
    }

    /// Advance one execution by one step.
    ///
    /// Panics in user code are caught and reported as an error exit with a
    /// traceback-carrying envelope; they never take the worker down.
    pub fn run(&self, request: proto::RunRequest) -> proto::RunResponse {
        match panic::catch_unwind(AssertUnwindSafe(|| self.run_inner(&request))) {
            Ok(response) => response,
            Err(payload) => {
                let message = panic_message(payload);
                error!(function = %request.function, message, "function panicked");
                let error = ErrorValue::new("Panic", message)
                    .with_traceback(std::backtrace::Backtrace::force_capture().to_string())
                    .with_status(Status::PermanentError);
                error_response(&error)
            }
        }
    }

    fn run_inner(&self, request: &proto::RunRequest) -> proto::RunResponse {
        debug!(function = %request.function, "running function");
        let descriptor = match self.registry.lookup(&request.function) {
            Ok(descriptor) => descriptor,
            Err(e) => return error_response(&sdk_error_value(&e)),
        };
        let directive = match &request.directive {
            Some(directive) => directive,
            None => {
                return error_response(&ErrorValue::invalid_argument(
                    "run request carries neither input nor poll result",
                ))
            }
        };
        match descriptor.kind() {
            FunctionKind::OneShot => self.run_one_shot(descriptor, directive),
            FunctionKind::Coroutine => self.run_coroutine(descriptor, directive),
        }
    }

    fn run_one_shot(
        &self,
        descriptor: &FunctionDescriptor,
        directive: &proto::run_request::Directive,
    ) -> proto::RunResponse {
        let envelope = match directive {
            proto::run_request::Directive::Input(envelope) => envelope,
            proto::run_request::Directive::PollResult(_) => {
                return error_response(&ErrorValue::invalid_argument(
                    "a one-shot function cannot be resumed from a poll",
                ))
            }
        };
        let input = match unbox_value(envelope) {
            Ok(value) => value,
            Err(e) => return error_response(&sdk_error_value(&e)),
        };
        let entry = match descriptor.one_shot() {
            Some(entry) => entry,
            None => {
                return error_response(&ErrorValue::new(
                    "InterpreterError",
                    "descriptor kind does not match its entry",
                ))
            }
        };
        match (entry.as_ref())(input) {
            Ok(value) => value_exit_response(&value),
            Err(error) => error_response(&error),
        }
    }

    fn run_coroutine(
        &self,
        descriptor: &FunctionDescriptor,
        directive: &proto::run_request::Directive,
    ) -> proto::RunResponse {
        let program = match descriptor.program() {
            Some(program) => program.clone(),
            None => {
                return error_response(&ErrorValue::new(
                    "InterpreterError",
                    "descriptor kind does not match its entry",
                ))
            }
        };
        let scheduler = OneShotScheduler::new(&self.registry, program, &self.options);

        let output = match directive {
            proto::run_request::Directive::Input(envelope) => match unbox_value(envelope) {
                Ok(input) => scheduler.start(input),
                Err(e) => return error_response(&sdk_error_value(&e)),
            },
            proto::run_request::Directive::PollResult(poll_result) => {
                let results: Vec<CallOutcome> = poll_result
                    .results
                    .iter()
                    .map(CallOutcome::from_proto)
                    .collect();
                let poll_error = poll_result.error.as_ref().map(ErrorValue::from_proto);
                match scheduler.resume(&poll_result.coroutine_state, results, poll_error) {
                    Ok(output) => output,
                    Err(e) => return error_response(&sdk_error_value(&e)),
                }
            }
        };

        self.translate(output)
    }

    fn translate(&self, output: SchedulerOutput) -> proto::RunResponse {
        match output {
            SchedulerOutput::Exit(Ok(value)) => value_exit_response(&value),
            SchedulerOutput::Exit(Err(error)) => error_response(&error),
            SchedulerOutput::TailCall(call) => match call.to_proto(0) {
                Ok(tail_call) => codec::exit_response(Status::Ok, None, Some(tail_call)),
                Err(e) => error_response(&sdk_error_value(&e)),
            },
            SchedulerOutput::Poll {
                state,
                calls,
                min_results,
                max_results,
                max_wait,
            } => {
                let mut proto_calls = Vec::with_capacity(calls.len());
                for (correlation_id, call) in calls {
                    match call.to_proto(correlation_id) {
                        Ok(call) => proto_calls.push(call),
                        Err(e) => return error_response(&sdk_error_value(&e)),
                    }
                }
                codec::poll_response(proto::Poll {
                    coroutine_state: state,
                    calls: proto_calls,
                    min_results,
                    max_results,
                    max_wait: max_wait.map(duration_to_proto),
                })
            }
        }
    }
}

/// Terminal error response carrying the classified status and the error
/// envelope.
fn error_response(error: &ErrorValue) -> proto::RunResponse {
    codec::exit_response(error.status(), Some(error_call_result(0, error)), None)
}

fn value_exit_response(value: &crate::value::Value) -> proto::RunResponse {
    match box_value(value) {
        Ok(output) => codec::exit_response(
            Status::Ok,
            Some(proto::CallResult {
                correlation_id: 0,
                output: Some(output),
                error: None,
                dispatch_id: String::new(),
            }),
            None,
        ),
        Err(e) => error_response(&sdk_error_value(&e)),
    }
}

/// Convert an SDK-level failure into the error envelope reported on the wire.
fn sdk_error_value(e: &SdkError) -> ErrorValue {
    let kind = match e {
        SdkError::Config(_) | SdkError::InvalidArgument(_) | SdkError::Registration(_) => {
            "InvalidArgument"
        }
        SdkError::InvalidResponse(_) => "InvalidResponse",
        SdkError::NotFound(_) => "NotFound",
        SdkError::IncompatibleState(_) => "IncompatibleState",
        SdkError::Serialization(_) => "Permanent",
        SdkError::Transport(_) => "Connection",
        SdkError::Dispatch(_) => "Permanent",
    };
    ErrorValue::new(kind, e.to_string()).with_status(e.status())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "function panicked".to_string()
    }
}

// ============================================================================
// Global instance
// ============================================================================

/// Global storage for the service instance.
static DISPATCH_INSTANCE: once_cell::sync::OnceCell<Dispatch> = once_cell::sync::OnceCell::new();

/// Register a [`Dispatch`] globally, for hosts that route every request
/// through one process-wide instance. Should be called once at startup.
pub fn register_dispatch(dispatch: Dispatch) -> Result<()> {
    DISPATCH_INSTANCE
        .set(dispatch)
        .map_err(|_| SdkError::Registration("a Dispatch instance is already registered".into()))
}

/// The globally registered instance, when one exists.
pub fn try_dispatch() -> Option<&'static Dispatch> {
    DISPATCH_INSTANCE.get()
}
