//! Scripted adapter harness
//!
//! [`ScriptedAdapter`] implements [`Adapter`](crate::Adapter) against a
//! scripted stack of outcomes and records every callback in the order the
//! runtime issued it. It is what this crate's own tests run against, and it
//! gives driver authors a deterministic stand-in while wiring a new adapter.
//!
//! The stack is consumed by `connect` and the `handle_*` callbacks, one
//! [`Step`] per call, front to back; an empty stack means "succeed with an
//! empty result". `checkout`, `checkin`, `disconnect`, and `handle_info` are
//! recorded but always succeed, so scripts stay aligned with the operations a
//! test issues. `ping` consumes its own dedicated stack, if one was given.
//!
//! # Example
//!
//! ```rust,ignore
//! let adapter = ScriptedAdapter::new([
//!     Step::Ok,                                  // connect
//!     Step::Ok,                                  // begin
//!     Step::Disconnect("server went away".into()), // query
//!     Step::Ok,                                  // reconnect
//! ]);
//! let pool = Pool::start(adapter.clone(), Config::new()).await?;
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::adapter::{
    Adapter, CallOutcome, DeclareOutcome, FetchOutcome, StateOutcome,
};
use crate::config::CallOptions;
use crate::error::BoxError;

/// Scripted outcome for one adapter callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Succeed with an empty result
    Ok,
    /// Succeed with the given result chunk (`Cont` for fetch)
    OkOutput(Vec<String>),
    /// Declare succeeds and substitutes the query
    OkReplace(String),
    /// Fetch yields the final chunk
    Halt(Vec<String>),
    /// Fail; the connection stays up
    Error(String),
    /// Fail and force a teardown
    Disconnect(String),
    /// Panic inside the callback
    Panic(String),
    /// Never return; exercises operation deadlines
    Hang,
}

/// Error value produced by [`Step::Error`] and [`Step::Disconnect`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ScriptError(pub String);

/// One adapter callback as the runtime issued it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    /// `connect`
    Connect,
    /// `disconnect`, with the rendered teardown reason
    Disconnect(String),
    /// `checkout`
    Checkout,
    /// `checkin`
    Checkin,
    /// `ping`
    Ping,
    /// `handle_begin`
    Begin,
    /// `handle_commit`
    Commit,
    /// `handle_rollback`
    Rollback,
    /// `handle_query`, with the query
    Query(String),
    /// `handle_declare`, with query and params
    Declare(String, Vec<String>),
    /// `handle_fetch`, with the cursor
    Fetch(u64),
    /// `handle_deallocate`, with the cursor
    Deallocate(u64),
    /// `handle_info`, with the message
    Info(String),
}

struct Inner {
    script: Mutex<VecDeque<Step>>,
    ping_script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<RecordedCall>>,
    generation: AtomicU32,
    next_cursor: AtomicU64,
}

/// Deterministic adapter driven by a scripted outcome stack
///
/// Cheap to clone; all clones share the script and the call log.
#[derive(Clone)]
pub struct ScriptedAdapter {
    inner: Arc<Inner>,
}

impl ScriptedAdapter {
    /// Create an adapter with the given outcome stack
    pub fn new(script: impl IntoIterator<Item = Step>) -> Self {
        Self {
            inner: Arc::new(Inner {
                script: Mutex::new(script.into_iter().collect()),
                ping_script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                generation: AtomicU32::new(0),
                next_cursor: AtomicU64::new(1),
            }),
        }
    }

    /// Append steps to the outcome stack
    pub fn push_steps(&self, steps: impl IntoIterator<Item = Step>) {
        self.inner.script.lock().extend(steps);
    }

    /// Script outcomes for `ping`, which otherwise always succeeds
    pub fn script_ping(&self, steps: impl IntoIterator<Item = Step>) {
        self.inner.ping_script.lock().extend(steps);
    }

    /// Snapshot of every recorded callback, in issue order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.inner.calls.lock().clone()
    }

    /// Number of `connect` callbacks seen so far
    pub fn connect_count(&self) -> usize {
        self.inner
            .calls
            .lock()
            .iter()
            .filter(|c| matches!(c, RecordedCall::Connect))
            .count()
    }

    /// Steps left on the outcome stack
    pub fn remaining_steps(&self) -> usize {
        self.inner.script.lock().len()
    }

    /// Poll the call log until `pred` holds or the timeout elapses
    pub async fn wait_for(
        &self,
        pred: impl Fn(&[RecordedCall]) -> bool,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if pred(&self.inner.calls.lock()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn record(&self, call: RecordedCall) {
        self.inner.calls.lock().push(call);
    }

    fn pop(&self) -> Option<Step> {
        self.inner.script.lock().pop_front()
    }

    fn new_cursor(&self) -> u64 {
        self.inner.next_cursor.fetch_add(1, Ordering::Relaxed)
    }

    /// Interpret the next step as a three-way call outcome.
    async fn call_outcome(&self, state: u32) -> CallOutcome<Vec<String>, u32> {
        match self.pop() {
            None | Some(Step::Ok) => CallOutcome::Ok(Vec::new(), state),
            Some(Step::OkOutput(rows)) => CallOutcome::Ok(rows, state),
            Some(Step::Error(m)) => CallOutcome::Error(Box::new(ScriptError(m)), state),
            Some(Step::Disconnect(m)) => CallOutcome::Disconnect(Box::new(ScriptError(m)), state),
            Some(Step::Panic(m)) => panic!("{m}"),
            Some(Step::Hang) => std::future::pending().await,
            Some(step) => panic!("bad return value: {step:?}"),
        }
    }
}

impl std::fmt::Debug for ScriptedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedAdapter")
            .field("remaining_steps", &self.remaining_steps())
            .field("calls", &self.inner.calls.lock().len())
            .finish()
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    type State = u32;
    type Query = String;
    type Params = Vec<String>;
    type Output = Vec<String>;
    type Cursor = u64;
    type Info = String;

    async fn connect(&self) -> Result<u32, BoxError> {
        self.record(RecordedCall::Connect);
        match self.pop() {
            None | Some(Step::Ok) | Some(Step::OkOutput(_)) => {
                Ok(self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1)
            }
            Some(Step::Error(m)) => Err(Box::new(ScriptError(m))),
            Some(Step::Panic(m)) => panic!("{m}"),
            Some(step) => panic!("bad return value: {step:?}"),
        }
    }

    async fn disconnect(&self, err: &crate::Error, _state: u32) {
        self.record(RecordedCall::Disconnect(err.to_string()));
    }

    async fn checkout(&self, state: u32) -> StateOutcome<u32> {
        self.record(RecordedCall::Checkout);
        StateOutcome::Ok(state)
    }

    async fn checkin(&self, state: u32) -> StateOutcome<u32> {
        self.record(RecordedCall::Checkin);
        StateOutcome::Ok(state)
    }

    async fn ping(&self, state: u32) -> StateOutcome<u32> {
        self.record(RecordedCall::Ping);
        let step = self.inner.ping_script.lock().pop_front();
        match step {
            None | Some(Step::Ok) => StateOutcome::Ok(state),
            Some(Step::Disconnect(m)) => {
                StateOutcome::Disconnect(Box::new(ScriptError(m)), state)
            }
            Some(Step::Panic(m)) => panic!("{m}"),
            Some(step) => panic!("bad return value: {step:?}"),
        }
    }

    async fn handle_begin(&self, _opts: &CallOptions, state: u32) -> CallOutcome<Vec<String>, u32> {
        self.record(RecordedCall::Begin);
        self.call_outcome(state).await
    }

    async fn handle_commit(
        &self,
        _opts: &CallOptions,
        state: u32,
    ) -> CallOutcome<Vec<String>, u32> {
        self.record(RecordedCall::Commit);
        self.call_outcome(state).await
    }

    async fn handle_rollback(
        &self,
        _opts: &CallOptions,
        state: u32,
    ) -> CallOutcome<Vec<String>, u32> {
        self.record(RecordedCall::Rollback);
        self.call_outcome(state).await
    }

    async fn handle_query(
        &self,
        query: String,
        _params: Vec<String>,
        _opts: &CallOptions,
        state: u32,
    ) -> CallOutcome<Vec<String>, u32> {
        self.record(RecordedCall::Query(query));
        self.call_outcome(state).await
    }

    async fn handle_declare(
        &self,
        query: String,
        params: Vec<String>,
        _opts: &CallOptions,
        state: u32,
    ) -> DeclareOutcome<String, u64, u32> {
        self.record(RecordedCall::Declare(query, params));
        match self.pop() {
            None | Some(Step::Ok) => DeclareOutcome::Ok(self.new_cursor(), state),
            Some(Step::OkReplace(query)) => {
                DeclareOutcome::Replace(query, self.new_cursor(), state)
            }
            Some(Step::Error(m)) => DeclareOutcome::Error(Box::new(ScriptError(m)), state),
            Some(Step::Disconnect(m)) => {
                DeclareOutcome::Disconnect(Box::new(ScriptError(m)), state)
            }
            Some(Step::Panic(m)) => panic!("{m}"),
            Some(Step::Hang) => std::future::pending().await,
            Some(step) => panic!("bad return value: {step:?}"),
        }
    }

    async fn handle_fetch(
        &self,
        _query: &String,
        cursor: &mut u64,
        _opts: &CallOptions,
        state: u32,
    ) -> FetchOutcome<Vec<String>, u32> {
        self.record(RecordedCall::Fetch(*cursor));
        match self.pop() {
            Some(Step::OkOutput(rows)) => FetchOutcome::Cont(rows, state),
            None | Some(Step::Ok) => FetchOutcome::Halt(Vec::new(), state),
            Some(Step::Halt(rows)) => FetchOutcome::Halt(rows, state),
            Some(Step::Error(m)) => FetchOutcome::Error(Box::new(ScriptError(m)), state),
            Some(Step::Disconnect(m)) => FetchOutcome::Disconnect(Box::new(ScriptError(m)), state),
            Some(Step::Panic(m)) => panic!("{m}"),
            Some(Step::Hang) => std::future::pending().await,
            Some(step) => panic!("bad return value: {step:?}"),
        }
    }

    async fn handle_deallocate(
        &self,
        _query: &String,
        cursor: u64,
        _opts: &CallOptions,
        state: u32,
    ) -> CallOutcome<(), u32> {
        self.record(RecordedCall::Deallocate(cursor));
        match self.pop() {
            None | Some(Step::Ok) | Some(Step::OkOutput(_)) => CallOutcome::Ok((), state),
            Some(Step::Error(m)) => CallOutcome::Error(Box::new(ScriptError(m)), state),
            Some(Step::Disconnect(m)) => CallOutcome::Disconnect(Box::new(ScriptError(m)), state),
            Some(Step::Panic(m)) => panic!("{m}"),
            Some(step) => panic!("bad return value: {step:?}"),
        }
    }

    async fn handle_info(&self, msg: String, state: u32) -> StateOutcome<u32> {
        self.record(RecordedCall::Info(msg));
        StateOutcome::Ok(state)
    }
}
