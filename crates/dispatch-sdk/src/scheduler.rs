// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The one-shot scheduler: drives local coroutines between polls.
//!
//! It is "one-shot" because it only runs one round of scheduling per
//! request: every ready coroutine advances until all of them are suspended
//! on remote calls, at which point the scheduler yields back to the service
//! with a single poll. Combinator children run depth-first; remote calls
//! issued anywhere in the task tree are multiplexed into that one poll and
//! fanned back out by correlation id on the next request.
//!
//! Everything in [`State`] serializes into `coroutine_state`, including the
//! per-child futures, so a combinator restored in another process keeps its
//! identity and resolves exactly as it would have locally.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::durable::coroutine::ProgramResolver;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::durable::coroutine::{
    Awaitable, DurableCoroutine, Pending, ResumeInput, StepOutcome,
};
use crate::durable::program::{GatherPolicy, Program};
use crate::durable::snapshot;
use crate::error::{ErrorValue, Result, SdkError};
use crate::registry::Registry;
use crate::types::{Call, CallOutcome};
use crate::value::Value;

pub(crate) type CoroutineId = u32;
pub(crate) type CallId = u32;

/// Correlation ids pack the owning coroutine and its call counter, so a
/// result routes back to its awaiter without any extra table.
pub(crate) fn correlation_id(coroutine: CoroutineId, call: CallId) -> u64 {
    ((coroutine as u64) << 32) | call as u64
}

pub(crate) fn correlation_coroutine_id(correlation_id: u64) -> CoroutineId {
    (correlation_id >> 32) as u32
}

#[allow(dead_code)]
pub(crate) fn correlation_call_id(correlation_id: u64) -> CallId {
    (correlation_id & 0xFFFF_FFFF) as u32
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Cancellation scope
// ============================================================================

/// Per-execution cancellation scope: a deadline plus a cancel flag.
///
/// Once cancelled, every outstanding child is resolved with the cancel
/// reason on the next resume and no combinator in the scope resolves
/// successfully again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CancellationScope {
    deadline_unix_ms: Option<u64>,
    cancelled: Option<ErrorValue>,
}

impl CancellationScope {
    pub(crate) fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            deadline_unix_ms: timeout.map(|t| now_unix_ms() + t.as_millis() as u64),
            cancelled: None,
        }
    }

    /// Cancel the scope. The first reason wins.
    pub fn cancel(&mut self, reason: ErrorValue) {
        if self.cancelled.is_none() {
            self.cancelled = Some(reason);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_some()
    }

    pub fn reason(&self) -> Option<&ErrorValue> {
        self.cancelled.as_ref()
    }

    /// Cancel with a timeout error when the deadline has elapsed.
    pub(crate) fn check_deadline(&mut self) {
        if let Some(deadline) = self.deadline_unix_ms {
            if self.cancelled.is_none() && now_unix_ms() >= deadline {
                self.cancel(ErrorValue::timeout("execution deadline elapsed"));
            }
        }
    }

    /// Time left before the deadline, when one is set.
    pub fn remaining_time(&self) -> Option<Duration> {
        self.deadline_unix_ms
            .map(|deadline| Duration::from_millis(deadline.saturating_sub(now_unix_ms())))
    }
}

// ============================================================================
// Futures
// ============================================================================

/// A completed child, success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Completion {
    Value(Value),
    Error(ErrorValue),
}

/// Result of running a local coroutine to completion.
#[derive(Debug, Clone)]
struct CoroutineResult {
    coroutine_id: CoroutineId,
    outcome: std::result::Result<Value, ErrorValue>,
}

/// Future of a single awaited call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct CallFuture {
    result: Option<Value>,
    first_error: Option<ErrorValue>,
}

impl CallFuture {
    fn failed(error: ErrorValue) -> Self {
        Self {
            result: None,
            first_error: Some(error),
        }
    }

    fn resolved(value: Value) -> Self {
        Self {
            result: Some(value),
            first_error: None,
        }
    }
}

/// Future of a `gather` (policy all): results in submission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct AllFuture {
    order: Vec<CoroutineId>,
    waiting: BTreeSet<CoroutineId>,
    results: BTreeMap<CoroutineId, Value>,
    first_error: Option<ErrorValue>,
}

/// Future of an `any`: first success wins, errors aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct AnyFuture {
    order: Vec<CoroutineId>,
    waiting: BTreeSet<CoroutineId>,
    first_result: Option<Value>,
    errors: BTreeMap<CoroutineId, ErrorValue>,
    generic_error: Option<ErrorValue>,
}

/// Future of a `race`: first completion wins, success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct RaceFuture {
    waiting: BTreeSet<CoroutineId>,
    winner: Option<Completion>,
}

/// Future of an `all_completed`: every completion, in completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct AllCompletedFuture {
    waiting: BTreeSet<CoroutineId>,
    completions: Vec<Completion>,
    generic_error: Option<ErrorValue>,
}

/// Future of an `n_of_m` quorum: the first `n` successes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct NOfMFuture {
    n: u32,
    order: Vec<CoroutineId>,
    waiting: BTreeSet<CoroutineId>,
    successes: Vec<Value>,
    errors: BTreeMap<CoroutineId, ErrorValue>,
    generic_error: Option<ErrorValue>,
}

/// The task-graph object recorded on a suspended coroutine. Its identity
/// (not a pointer) is what survives across requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum FutureState {
    Call(CallFuture),
    All(AllFuture),
    Any(AnyFuture),
    Race(RaceFuture),
    AllCompleted(AllCompletedFuture),
    NOfM(NOfMFuture),
}

impl FutureState {
    fn for_policy(policy: GatherPolicy, children: &[CoroutineId]) -> Self {
        let order = children.to_vec();
        let waiting: BTreeSet<CoroutineId> = children.iter().copied().collect();
        match policy {
            GatherPolicy::All => FutureState::All(AllFuture {
                order,
                waiting,
                ..Default::default()
            }),
            GatherPolicy::Any => FutureState::Any(AnyFuture {
                order,
                waiting,
                ..Default::default()
            }),
            GatherPolicy::Race => FutureState::Race(RaceFuture {
                waiting,
                ..Default::default()
            }),
            GatherPolicy::AllCompleted => FutureState::AllCompleted(AllCompletedFuture {
                waiting,
                ..Default::default()
            }),
            GatherPolicy::NOfM(n) => FutureState::NOfM(NOfMFuture {
                n,
                order,
                waiting,
                ..Default::default()
            }),
        }
    }

    /// Deliver a remote call result. Only single-call futures receive these.
    fn add_call_result(&mut self, outcome: std::result::Result<Value, ErrorValue>) {
        match self {
            FutureState::Call(f) => match outcome {
                Ok(value) => {
                    if f.result.is_none() && f.first_error.is_none() {
                        f.result = Some(value);
                    }
                }
                Err(error) => {
                    if f.first_error.is_none() {
                        f.first_error = Some(error);
                    }
                }
            },
            other => {
                warn!("discarding call result delivered to a combinator future");
                let _ = other;
            }
        }
    }

    /// Deliver a completed child coroutine.
    fn add_child_result(&mut self, result: &CoroutineResult) {
        let id = result.coroutine_id;
        match self {
            FutureState::Call(_) => {
                warn!("discarding child result delivered to a call future");
            }
            FutureState::All(f) => {
                if !f.waiting.remove(&id) {
                    return;
                }
                match &result.outcome {
                    Ok(value) => {
                        f.results.insert(id, value.clone());
                    }
                    Err(error) => {
                        if f.first_error.is_none() {
                            f.first_error = Some(error.clone());
                        }
                    }
                }
            }
            FutureState::Any(f) => {
                if !f.waiting.remove(&id) {
                    return;
                }
                match &result.outcome {
                    Ok(value) => {
                        if f.first_result.is_none() {
                            f.first_result = Some(value.clone());
                        }
                    }
                    Err(error) => {
                        f.errors.insert(id, error.clone());
                    }
                }
            }
            FutureState::Race(f) => {
                if !f.waiting.remove(&id) {
                    return;
                }
                if f.winner.is_none() {
                    f.winner = Some(match &result.outcome {
                        Ok(value) => Completion::Value(value.clone()),
                        Err(error) => Completion::Error(error.clone()),
                    });
                }
            }
            FutureState::AllCompleted(f) => {
                if !f.waiting.remove(&id) {
                    return;
                }
                f.completions.push(match &result.outcome {
                    Ok(value) => Completion::Value(value.clone()),
                    Err(error) => Completion::Error(error.clone()),
                });
            }
            FutureState::NOfM(f) => {
                if !f.waiting.remove(&id) {
                    return;
                }
                match &result.outcome {
                    Ok(value) => f.successes.push(value.clone()),
                    Err(error) => {
                        f.errors.insert(id, error.clone());
                    }
                }
            }
        }
    }

    /// Inject a scope-wide error (cancellation, poll error).
    fn add_error(&mut self, error: &ErrorValue) {
        match self {
            FutureState::Call(f) => {
                if f.first_error.is_none() {
                    f.first_error = Some(error.clone());
                }
            }
            FutureState::All(f) => {
                if f.first_error.is_none() {
                    f.first_error = Some(error.clone());
                }
            }
            FutureState::Any(f) => {
                if f.generic_error.is_none() {
                    f.generic_error = Some(error.clone());
                }
            }
            FutureState::Race(f) => {
                if f.winner.is_none() {
                    f.winner = Some(Completion::Error(error.clone()));
                }
            }
            FutureState::AllCompleted(f) => {
                if f.generic_error.is_none() {
                    f.generic_error = Some(error.clone());
                }
            }
            FutureState::NOfM(f) => {
                if f.generic_error.is_none() {
                    f.generic_error = Some(error.clone());
                }
            }
        }
    }

    fn ready(&self) -> bool {
        match self {
            FutureState::Call(f) => f.result.is_some() || f.first_error.is_some(),
            FutureState::All(f) => f.first_error.is_some() || f.waiting.is_empty(),
            FutureState::Any(f) => {
                f.generic_error.is_some() || f.first_result.is_some() || f.waiting.is_empty()
            }
            FutureState::Race(f) => f.winner.is_some() || f.waiting.is_empty(),
            FutureState::AllCompleted(f) => f.generic_error.is_some() || f.waiting.is_empty(),
            FutureState::NOfM(f) => {
                f.generic_error.is_some()
                    || f.successes.len() >= f.n as usize
                    || f.waiting.len() + f.successes.len() < f.n as usize
            }
        }
    }

    /// Results still required before this future can become ready.
    fn needed(&self) -> u32 {
        if self.ready() {
            return 0;
        }
        match self {
            FutureState::Call(_) => 1,
            FutureState::All(f) => f.waiting.len() as u32,
            FutureState::Any(_) => 1,
            FutureState::Race(_) => 1,
            FutureState::AllCompleted(f) => f.waiting.len() as u32,
            FutureState::NOfM(f) => (f.n as usize).saturating_sub(f.successes.len()) as u32,
        }
    }

    /// Resolve the future. Only meaningful once [`ready`](Self::ready).
    fn outcome(&self) -> std::result::Result<Value, ErrorValue> {
        match self {
            FutureState::Call(f) => match (&f.first_error, &f.result) {
                (Some(error), _) => Err(error.clone()),
                (None, Some(value)) => Ok(value.clone()),
                (None, None) => Ok(Value::Nil),
            },
            FutureState::All(f) => {
                if let Some(error) = &f.first_error {
                    return Err(error.clone());
                }
                let mut values = Vec::with_capacity(f.order.len());
                for id in &f.order {
                    values.push(f.results.get(id).cloned().unwrap_or(Value::Nil));
                }
                Ok(Value::List(values))
            }
            FutureState::Any(f) => {
                if let Some(error) = &f.generic_error {
                    return Err(error.clone());
                }
                if let Some(value) = &f.first_result {
                    return Ok(value.clone());
                }
                if f.order.is_empty() {
                    return Ok(Value::Nil);
                }
                let mut errors: Vec<ErrorValue> = Vec::with_capacity(f.errors.len());
                for id in &f.order {
                    if let Some(error) = f.errors.get(id) {
                        errors.push(error.clone());
                    }
                }
                match errors.len() {
                    1 => Err(errors.into_iter().next().unwrap_or_else(|| {
                        ErrorValue::new("InterpreterError", "any future resolved without state")
                    })),
                    _ => Err(ErrorValue::aggregate(errors)),
                }
            }
            FutureState::Race(f) => match &f.winner {
                Some(Completion::Value(value)) => Ok(value.clone()),
                Some(Completion::Error(error)) => Err(error.clone()),
                None => Ok(Value::Nil),
            },
            FutureState::AllCompleted(f) => {
                if let Some(error) = &f.generic_error {
                    return Err(error.clone());
                }
                Ok(Value::List(
                    f.completions
                        .iter()
                        .map(|completion| match completion {
                            Completion::Value(value) => value.clone(),
                            Completion::Error(error) => error.to_value(),
                        })
                        .collect(),
                ))
            }
            FutureState::NOfM(f) => {
                if let Some(error) = &f.generic_error {
                    return Err(error.clone());
                }
                if f.successes.len() >= f.n as usize {
                    return Ok(Value::List(
                        f.successes.iter().take(f.n as usize).cloned().collect(),
                    ));
                }
                let mut errors: Vec<ErrorValue> = Vec::with_capacity(f.errors.len());
                for id in &f.order {
                    if let Some(error) = f.errors.get(id) {
                        errors.push(error.clone());
                    }
                }
                Err(ErrorValue::aggregate(errors))
            }
        }
    }
}

// ============================================================================
// Scheduler state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum TaskBody {
    /// A local durable coroutine.
    Coroutine(DurableCoroutine),
    /// A remote call tracked as a child of a combinator.
    RemoteCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Task {
    id: CoroutineId,
    parent_id: Option<CoroutineId>,
    body: TaskBody,
    future: Option<FutureState>,
}

/// State of the scheduler and the coroutines it is managing. Serialized in
/// full as the poll's `coroutine_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct State {
    scope: CancellationScope,
    suspended: BTreeMap<CoroutineId, Task>,
    next_coroutine_id: CoroutineId,
    next_call_id: CallId,
    outstanding_calls: u32,
}

/// Knobs of the run loop, set through the service builder.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Cap on results delivered per resume.
    pub poll_max_results: u32,
    /// Constant bound on suspension time, when configured.
    pub poll_max_wait: Option<Duration>,
    /// Deadline applied to each new execution's cancellation scope.
    pub execution_timeout: Option<Duration>,
    /// Dump frame state to stderr before each snapshot.
    pub trace: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            poll_max_results: 10,
            poll_max_wait: None,
            execution_timeout: None,
            trace: false,
        }
    }
}

/// What the scheduler tells the service to answer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SchedulerOutput {
    Exit(std::result::Result<Value, ErrorValue>),
    TailCall(Call),
    Poll {
        state: Vec<u8>,
        calls: Vec<(u64, Call)>,
        min_results: u32,
        max_results: u32,
        max_wait: Option<Duration>,
    },
}

/// Scheduler for the local coroutines of one execution.
pub(crate) struct OneShotScheduler<'a> {
    registry: &'a Registry,
    program: Arc<Program>,
    options: &'a SchedulerOptions,
}

impl<'a> OneShotScheduler<'a> {
    pub(crate) fn new(
        registry: &'a Registry,
        program: Arc<Program>,
        options: &'a SchedulerOptions,
    ) -> Self {
        Self {
            registry,
            program,
            options,
        }
    }

    /// First advance of a fresh execution.
    pub(crate) fn start(&self, input: Value) -> SchedulerOutput {
        debug!(function = %self.program.name(), "starting main coroutine");
        let mut state = State {
            scope: CancellationScope::with_timeout(self.options.execution_timeout),
            suspended: BTreeMap::new(),
            next_coroutine_id: 1,
            next_call_id: 1,
            outstanding_calls: 0,
        };
        let main = Task {
            id: 0,
            parent_id: None,
            body: TaskBody::Coroutine(DurableCoroutine::new(&self.program, input)),
            future: None,
        };
        let mut ready = VecDeque::new();
        ready.push_back(main);
        self.drive(&mut state, ready)
    }

    /// Resume a polled execution with delivered results.
    ///
    /// Fails with incompatible state when the snapshot cannot be trusted;
    /// the service converts that into the response status.
    pub(crate) fn resume(
        &self,
        state_bytes: &[u8],
        results: Vec<CallOutcome>,
        poll_error: Option<ErrorValue>,
    ) -> Result<SchedulerOutput> {
        debug!(function = %self.program.name(), "resuming main coroutine");
        let mut state: State = snapshot::decode_versioned(state_bytes)?;
        for task in state.suspended.values() {
            if let TaskBody::Coroutine(coroutine) = &task.body {
                snapshot::validate_coroutine(self.registry, coroutine)?;
            }
        }
        if let Some(main) = state.suspended.get(&0) {
            if let TaskBody::Coroutine(coroutine) = &main.body {
                if coroutine.identity().name != self.program.name() {
                    return Err(SdkError::IncompatibleState(format!(
                        "snapshot belongs to {:?}, not {:?}",
                        coroutine.identity().name,
                        self.program.name()
                    )));
                }
            }
        }

        let mut ready = VecDeque::new();

        if let Some(error) = poll_error {
            debug!(%error, "poll error received, cancelling execution scope");
            state.scope.cancel(error);
        }
        state.scope.check_deadline();

        debug!(count = results.len(), "dispatching call results");
        for outcome in results {
            let coroutine_id = correlation_coroutine_id(outcome.correlation_id);
            let Some(task) = state.suspended.get_mut(&coroutine_id) else {
                warn!(
                    correlation_id = outcome.correlation_id,
                    "discarding unexpected call result"
                );
                continue;
            };
            let Some(future) = task.future.as_mut() else {
                warn!(
                    correlation_id = outcome.correlation_id,
                    "discarding call result for a task without a future"
                );
                continue;
            };
            let delivered = match outcome.error {
                Some(error) => Err(error),
                None => Ok(outcome.output.unwrap_or(Value::Nil)),
            };
            future.add_call_result(delivered);
            state.outstanding_calls = state.outstanding_calls.saturating_sub(1);
            if future.ready() {
                let task = state
                    .suspended
                    .remove(&coroutine_id)
                    .expect("task was just borrowed from the suspended set");
                ready.push_back(task);
            }
        }

        if state.scope.is_cancelled() {
            Self::inject_cancellation(&mut state, &mut ready);
        }

        Ok(self.drive(&mut state, ready))
    }

    /// Resolve every suspended future with the scope's cancel reason.
    fn inject_cancellation(state: &mut State, ready: &mut VecDeque<Task>) {
        let reason = match state.scope.reason() {
            Some(reason) => reason.clone(),
            None => return,
        };
        let ids: Vec<CoroutineId> = state.suspended.keys().copied().collect();
        for id in ids {
            let Some(task) = state.suspended.get_mut(&id) else {
                continue;
            };
            if let Some(future) = task.future.as_mut() {
                future.add_error(&reason);
                if future.ready() {
                    let task = state
                        .suspended
                        .remove(&id)
                        .expect("task was just borrowed from the suspended set");
                    ready.push_back(task);
                }
            }
        }
    }

    /// Run every ready task until all are suspended, then poll or exit.
    fn drive(&self, state: &mut State, mut ready: VecDeque<Task>) -> SchedulerOutput {
        let mut pending_calls: Vec<(u64, Call)> = Vec::new();

        while let Some(mut task) = ready.pop_front() {
            let task_id = task.id;
            let parent_id = task.parent_id;

            let result = if matches!(task.body, TaskBody::RemoteCall) {
                let outcome = task
                    .future
                    .as_ref()
                    .map(|future| future.outcome())
                    .unwrap_or_else(|| {
                        Err(ErrorValue::new(
                            "InterpreterError",
                            "remote call task without a future",
                        ))
                    });
                CoroutineResult {
                    coroutine_id: task_id,
                    outcome,
                }
            } else {
                let input = match task.future.take() {
                    None => ResumeInput::Start,
                    Some(future) => match future.outcome() {
                        Ok(value) => ResumeInput::Value(value),
                        Err(error) => ResumeInput::Error(error),
                    },
                };
                debug!(coroutine = task_id, "running coroutine");
                let step = match &mut task.body {
                    TaskBody::Coroutine(coroutine) => coroutine.resume(self.registry, input),
                    TaskBody::RemoteCall => unreachable!("remote calls are handled above"),
                };
                match step {
                    StepOutcome::Pending(pending) => {
                        self.suspend(state, &mut ready, &mut pending_calls, task, pending);
                        continue;
                    }
                    StepOutcome::Return(value) => CoroutineResult {
                        coroutine_id: task_id,
                        outcome: Ok(value),
                    },
                    StepOutcome::Raise(error) => {
                        debug!(coroutine = task_id, %error, "coroutine raised");
                        CoroutineResult {
                            coroutine_id: task_id,
                            outcome: Err(error),
                        }
                    }
                    StepOutcome::TailCall(call) => {
                        if parent_id.is_none() {
                            return SchedulerOutput::TailCall(call);
                        }
                        CoroutineResult {
                            coroutine_id: task_id,
                            outcome: Err(ErrorValue::invalid_argument(
                                "tail call outside the main function",
                            )),
                        }
                    }
                }
            };

            match parent_id {
                None => return SchedulerOutput::Exit(result.outcome),
                Some(parent_id) => Self::deliver_to_parent(state, &mut ready, parent_id, &result),
            }
        }

        self.emit_poll(state, pending_calls)
    }

    /// Record a suspension: park the task on its new future and issue
    /// whatever calls or child coroutines the suspension requires.
    fn suspend(
        &self,
        state: &mut State,
        ready: &mut VecDeque<Task>,
        pending_calls: &mut Vec<(u64, Call)>,
        mut task: Task,
        pending: Pending,
    ) {
        match pending {
            Pending::Call(call) => {
                if let Some(reason) = state.scope.reason() {
                    // Cancelled scope: the call is never issued.
                    task.future = Some(FutureState::Call(CallFuture::failed(reason.clone())));
                    ready.push_front(task);
                    return;
                }
                let call_id = state.next_call_id;
                state.next_call_id += 1;
                let correlation = correlation_id(task.id, call_id);
                debug!(
                    coroutine = task.id,
                    call_id,
                    function = %call.function,
                    "enqueuing call"
                );
                pending_calls.push((correlation, call));
                task.future = Some(FutureState::Call(CallFuture::default()));
                state.outstanding_calls += 1;
                state.suspended.insert(task.id, task);
            }
            Pending::Gather { policy, awaitables } => {
                let mut child_ids = Vec::with_capacity(awaitables.len());
                let mut sub_children: Vec<Task> = Vec::new();
                let mut immediate: Vec<CoroutineResult> = Vec::new();

                for awaitable in awaitables {
                    let child_id = state.next_coroutine_id;
                    state.next_coroutine_id += 1;
                    child_ids.push(child_id);

                    match awaitable {
                        Awaitable::Call(call) => {
                            let future = if let Some(reason) = state.scope.reason() {
                                FutureState::Call(CallFuture::failed(reason.clone()))
                            } else {
                                let call_id = state.next_call_id;
                                state.next_call_id += 1;
                                let correlation = correlation_id(child_id, call_id);
                                pending_calls.push((correlation, call));
                                state.outstanding_calls += 1;
                                FutureState::Call(CallFuture::default())
                            };
                            let child = Task {
                                id: child_id,
                                parent_id: Some(task.id),
                                body: TaskBody::RemoteCall,
                                future: Some(future),
                            };
                            if child.future.as_ref().is_some_and(|f| f.ready()) {
                                ready.push_back(child);
                            } else {
                                state.suspended.insert(child_id, child);
                            }
                        }
                        Awaitable::Sub { function, input } => {
                            match self.registry.resolve(&function) {
                                Some(program) => sub_children.push(Task {
                                    id: child_id,
                                    parent_id: Some(task.id),
                                    body: TaskBody::Coroutine(DurableCoroutine::new(
                                        &program, input,
                                    )),
                                    future: None,
                                }),
                                None => immediate.push(CoroutineResult {
                                    coroutine_id: child_id,
                                    outcome: Err(ErrorValue::not_found(format!(
                                        "subroutine {:?} is not registered",
                                        function
                                    ))),
                                }),
                            }
                        }
                    }
                }

                let parent_id = task.id;
                task.future = Some(FutureState::for_policy(policy, &child_ids));
                let parent_ready = task.future.as_ref().is_some_and(|f| f.ready());
                if parent_ready {
                    ready.push_back(task);
                } else {
                    state.suspended.insert(parent_id, task);
                }

                // Prepend local children for a depth-first traversal.
                for child in sub_children.into_iter().rev() {
                    ready.push_front(child);
                }
                for result in immediate {
                    Self::deliver_to_parent(state, ready, parent_id, &result);
                }
            }
            Pending::Cancel => {
                debug!(coroutine = task.id, "coroutine cancelled its scope");
                state
                    .scope
                    .cancel(ErrorValue::cancelled("scope cancelled by the execution"));
                Self::inject_cancellation(state, ready);
                // The cancelling coroutine resumes right away with nil.
                task.future = Some(FutureState::Call(CallFuture::resolved(Value::Nil)));
                ready.push_front(task);
            }
        }
    }

    /// Notify a parent future that one of its children finished.
    fn deliver_to_parent(
        state: &mut State,
        ready: &mut VecDeque<Task>,
        parent_id: CoroutineId,
        result: &CoroutineResult,
    ) {
        let Some(parent) = state.suspended.get_mut(&parent_id) else {
            warn!(parent = parent_id, "discarding result for a finished parent");
            return;
        };
        let Some(future) = parent.future.as_mut() else {
            warn!(parent = parent_id, "discarding result for a parent without a future");
            return;
        };
        future.add_child_result(result);
        if future.ready() {
            let parent = state
                .suspended
                .remove(&parent_id)
                .expect("parent was just borrowed from the suspended set");
            ready.push_front(parent);
        }
    }

    /// Yield to the scheduler with every call issued this round.
    fn emit_poll(&self, state: &mut State, pending_calls: Vec<(u64, Call)>) -> SchedulerOutput {
        if state.outstanding_calls == 0 && !state.suspended.is_empty() {
            return SchedulerOutput::Exit(Err(ErrorValue::new(
                "InterpreterError",
                "execution deadlocked: suspended coroutines with no outstanding calls",
            )));
        }

        let max_results = state
            .outstanding_calls
            .min(self.options.poll_max_results)
            .max(1);
        let min_results = state
            .suspended
            .values()
            .filter(|task| matches!(task.body, TaskBody::Coroutine(_)))
            .filter_map(|task| task.future.as_ref())
            .map(FutureState::needed)
            .sum::<u32>()
            .clamp(1, max_results);

        let max_wait = match (self.options.poll_max_wait, state.scope.remaining_time()) {
            (Some(configured), Some(remaining)) => Some(configured.min(remaining)),
            (Some(configured), None) => Some(configured),
            (None, remaining) => remaining,
        };

        if self.options.trace {
            for task in state.suspended.values() {
                if let TaskBody::Coroutine(coroutine) = &task.body {
                    snapshot::trace_dump(coroutine);
                }
            }
        }

        debug!(
            calls = pending_calls.len(),
            outstanding = state.outstanding_calls,
            min_results,
            max_results,
            "yielding with poll"
        );

        match snapshot::encode_versioned(state) {
            Ok(bytes) => SchedulerOutput::Poll {
                state: bytes,
                calls: pending_calls,
                min_results,
                max_results,
                max_wait,
            },
            Err(e) => SchedulerOutput::Exit(Err(ErrorValue::permanent(format!(
                "coroutine state could not be serialized: {}",
                e
            )))),
        }
    }
}
