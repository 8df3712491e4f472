//! Connection holder actor
//!
//! One holder owns one adapter state. It alternates between two top-level
//! phases: **disconnected**, where it retries `connect` on a backoff
//! schedule, and **connected**, where it serializes adapter callbacks on
//! behalf of the client currently leasing the connection.
//!
//! Every callback runs under a deadline. A callback that exceeds it is
//! abandoned and the connection is torn down, since the adapter has no safe
//! cancellation primitive. A callback that panics is caught at the actor
//! boundary, the client is told, and the holder stops so the pool can
//! restart it from scratch.
//!
//! While a client holds the lease the holder watches the client's principal;
//! if it terminates with a transaction open the holder rolls back best
//! effort and checks the connection back in on the client's behalf.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::adapter::{Adapter, CallOutcome, DeclareOutcome, FetchOutcome, StateOutcome};
use crate::backoff::Backoff;
use crate::client::Fetch;
use crate::config::{CallOptions, Config};
use crate::error::{BoxError, Error, Result};
use crate::principal::PrincipalMonitor;

/// Identity of one check-out window on a holder.
pub(crate) type LeaseId = u64;
/// Identity of one open cursor on a holder.
pub(crate) type CursorId = u64;

/// Operation reply: the result plus the adapter-callback duration, when the
/// callback ran to completion.
pub(crate) type OpReply<T> = oneshot::Sender<(Result<T>, Option<Duration>)>;

/// Commands a client (or the pool) sends to a holder.
pub(crate) enum Command<A: Adapter> {
    Checkout {
        monitor: PrincipalMonitor,
        reply: oneshot::Sender<Result<LeaseId>>,
    },
    Checkin {
        lease: LeaseId,
    },
    Begin {
        lease: LeaseId,
        opts: CallOptions,
        reply: OpReply<A::Output>,
    },
    Commit {
        lease: LeaseId,
        opts: CallOptions,
        reply: OpReply<A::Output>,
    },
    Rollback {
        lease: LeaseId,
        opts: CallOptions,
        reply: OpReply<A::Output>,
    },
    Query {
        lease: LeaseId,
        query: A::Query,
        params: A::Params,
        opts: CallOptions,
        reply: OpReply<A::Output>,
    },
    Prepare {
        lease: LeaseId,
        query: A::Query,
        opts: CallOptions,
        reply: OpReply<A::Query>,
    },
    Execute {
        lease: LeaseId,
        query: A::Query,
        params: A::Params,
        opts: CallOptions,
        reply: OpReply<A::Output>,
    },
    Close {
        lease: LeaseId,
        query: A::Query,
        opts: CallOptions,
        reply: OpReply<()>,
    },
    Declare {
        lease: LeaseId,
        query: A::Query,
        params: A::Params,
        opts: CallOptions,
        reply: OpReply<(Option<A::Query>, CursorId)>,
    },
    Fetch {
        lease: LeaseId,
        cursor: CursorId,
        opts: CallOptions,
        reply: OpReply<Fetch<A::Output>>,
    },
    Deallocate {
        lease: LeaseId,
        cursor: CursorId,
        opts: CallOptions,
        /// `None` for the best-effort close issued when a stream is dropped
        reply: Option<OpReply<()>>,
    },
    Info {
        msg: A::Info,
    },
}

/// Lifecycle notifications a holder sends to its pool.
#[derive(Debug)]
pub(crate) enum HolderEvent {
    /// Connected and free for check-out
    Idle(usize),
    /// Lost its connection; reconnecting on backoff
    Disconnected(usize),
    /// Terminated; `restart` asks the pool to respawn it
    Stopped { id: usize, restart: bool },
}

/// Cheap handle for talking to a holder task.
pub(crate) struct HolderHandle<A: Adapter> {
    pub(crate) id: usize,
    pub(crate) tx: mpsc::Sender<Command<A>>,
}

impl<A: Adapter> Clone for HolderHandle<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

/// Spawn a holder task. With `initial` state it starts connected; otherwise
/// it attempts its first connect immediately, then falls back to backoff.
pub(crate) fn spawn<A: Adapter>(
    id: usize,
    adapter: Arc<A>,
    config: Arc<Config<A>>,
    events: mpsc::Sender<HolderEvent>,
    initial: Option<A::State>,
) -> HolderHandle<A> {
    let (tx, rx) = mpsc::channel(64);
    let holder = Holder {
        id,
        adapter,
        backoff: config.backoff(),
        config,
        rx,
        events,
        lease: None,
        next_lease: 1,
        tx_open: false,
        cursors: HashMap::new(),
        next_cursor: 1,
        ping_at: Instant::now(),
    };
    tokio::spawn(holder.run(initial));
    HolderHandle { id, tx }
}

/// Why a guarded callback did not produce an outcome.
pub(crate) enum GuardFailure {
    TimedOut(Duration),
    Panicked(String),
}

/// Run an adapter callback under a deadline, catching panics at the actor
/// boundary. On timeout the future is abandoned, taking the adapter state
/// with it.
pub(crate) async fn guard<T>(
    fut: impl std::future::Future<Output = T>,
    deadline: Duration,
) -> std::result::Result<T, GuardFailure> {
    match tokio::time::timeout(deadline, AssertUnwindSafe(fut).catch_unwind()).await {
        Err(_) => Err(GuardFailure::TimedOut(deadline)),
        Ok(Err(panic)) => Err(GuardFailure::Panicked(panic_message(&panic))),
        Ok(Ok(value)) => Ok(value),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Lease {
    id: LeaseId,
    monitor: PrincipalMonitor,
}

/// What a connected holder does next after processing one event.
enum Step<S> {
    Continue(S),
    Disconnected,
    Fatal,
}

/// How a connected phase ended.
enum ServeEnd {
    Disconnected,
    Fatal,
    Shutdown,
}

/// How a reconnect phase ended.
enum Reconnect<S> {
    Connected(S),
    Stop,
    Shutdown,
}

enum Woke<A: Adapter> {
    Cmd(Command<A>),
    ClientGone,
    Ping,
    Shutdown,
}

struct Holder<A: Adapter> {
    id: usize,
    adapter: Arc<A>,
    config: Arc<Config<A>>,
    rx: mpsc::Receiver<Command<A>>,
    events: mpsc::Sender<HolderEvent>,
    backoff: Backoff,
    lease: Option<Lease>,
    next_lease: LeaseId,
    tx_open: bool,
    cursors: HashMap<CursorId, (A::Query, A::Cursor)>,
    next_cursor: CursorId,
    ping_at: Instant,
}

impl<A: Adapter> Holder<A> {
    async fn run(mut self, initial: Option<A::State>) {
        let mut state = initial;
        let mut first_attempt = state.is_none();
        loop {
            let s = match state.take() {
                Some(s) => s,
                None => match self.reconnect(first_attempt).await {
                    Reconnect::Connected(s) => s,
                    Reconnect::Stop => {
                        let _ = self
                            .events
                            .send(HolderEvent::Stopped {
                                id: self.id,
                                restart: false,
                            })
                            .await;
                        return;
                    }
                    Reconnect::Shutdown => return,
                },
            };
            first_attempt = false;
            self.ping_at = Instant::now() + self.config.idle_interval;
            let _ = self.events.send(HolderEvent::Idle(self.id)).await;

            match self.serve(s).await {
                ServeEnd::Disconnected => {
                    let _ = self.events.send(HolderEvent::Disconnected(self.id)).await;
                }
                ServeEnd::Fatal => {
                    let _ = self
                        .events
                        .send(HolderEvent::Stopped {
                            id: self.id,
                            restart: true,
                        })
                        .await;
                    return;
                }
                ServeEnd::Shutdown => return,
            }
        }
    }

    // ==================== Disconnected phase ====================

    async fn reconnect(&mut self, mut immediate: bool) -> Reconnect<A::State> {
        loop {
            if !immediate {
                let Some(delay) = self.backoff.next() else {
                    warn!(holder = self.id, "backoff exhausted, stopping");
                    return Reconnect::Stop;
                };
                debug!(holder = self.id, ?delay, "reconnect scheduled");
                let wake = Instant::now() + delay;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep_until(wake) => break,
                        cmd = self.rx.recv() => match cmd {
                            Some(cmd) => self.reject(cmd),
                            None => return Reconnect::Shutdown,
                        },
                    }
                }
            }
            immediate = false;

            match guard(self.adapter.connect(), self.config.timeout).await {
                Ok(Ok(state)) => {
                    debug!(holder = self.id, "connected");
                    self.backoff.reset();
                    return Reconnect::Connected(state);
                }
                Ok(Err(err)) => {
                    warn!(holder = self.id, %err, "connect failed");
                }
                Err(GuardFailure::TimedOut(after)) => {
                    warn!(holder = self.id, ?after, "connect timed out");
                }
                Err(GuardFailure::Panicked(msg)) => {
                    warn!(holder = self.id, %msg, "connect panicked");
                }
            }
        }
    }

    /// Answer a command received while no connection is available.
    fn reject(&self, cmd: Command<A>) {
        let closed = || Error::closed();
        match cmd {
            Command::Checkout { reply, .. } => {
                let _ = reply.send(Err(closed()));
            }
            Command::Checkin { .. } | Command::Info { .. } => {}
            Command::Begin { reply, .. }
            | Command::Commit { reply, .. }
            | Command::Rollback { reply, .. }
            | Command::Query { reply, .. }
            | Command::Execute { reply, .. } => {
                let _ = reply.send((Err(closed()), None));
            }
            Command::Prepare { reply, .. } => {
                let _ = reply.send((Err(closed()), None));
            }
            Command::Close { reply, .. } => {
                let _ = reply.send((Err(closed()), None));
            }
            Command::Declare { reply, .. } => {
                let _ = reply.send((Err(closed()), None));
            }
            Command::Fetch { reply, .. } => {
                let _ = reply.send((Err(closed()), None));
            }
            Command::Deallocate { reply, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send((Err(closed()), None));
                }
            }
        }
    }

    // ==================== Connected phase ====================

    async fn serve(&mut self, mut state: A::State) -> ServeEnd {
        loop {
            let idle = self.lease.is_none();
            let woke = tokio::select! {
                biased;
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => Woke::Cmd(cmd),
                    None => Woke::Shutdown,
                },
                _ = Self::lease_gone(&mut self.lease) => Woke::ClientGone,
                _ = tokio::time::sleep_until(self.ping_at), if idle => Woke::Ping,
            };

            let step = match woke {
                Woke::Shutdown => {
                    self.adapter
                        .disconnect(&Error::connection("pool is shutting down"), state)
                        .await;
                    return ServeEnd::Shutdown;
                }
                Woke::Cmd(cmd) => self.handle(cmd, state).await,
                Woke::ClientGone => {
                    debug!(holder = self.id, "client went away, reclaiming connection");
                    self.release(state).await
                }
                Woke::Ping => self.do_ping(state).await,
            };

            match step {
                Step::Continue(s) => state = s,
                Step::Disconnected => return ServeEnd::Disconnected,
                Step::Fatal => return ServeEnd::Fatal,
            }
        }
    }

    async fn lease_gone(lease: &mut Option<Lease>) {
        match lease.as_mut() {
            Some(lease) => lease.monitor.terminated().await,
            None => std::future::pending().await,
        }
    }

    fn lease_valid(&self, lease: LeaseId) -> bool {
        self.lease.as_ref().is_some_and(|l| l.id == lease)
    }

    fn deadline(&self, opts: &CallOptions) -> Duration {
        opts.timeout.unwrap_or(self.config.timeout)
    }

    /// Tear the adapter state down after a disconnect outcome.
    async fn teardown(&mut self, cause: BoxError, state: A::State) -> Error {
        let err = Error::disconnected(cause);
        warn!(holder = self.id, %err, "connection torn down");
        let _ = guard(self.adapter.disconnect(&err, state), self.config.timeout).await;
        self.clear_session();
        err
    }

    /// Forget the lease, the open transaction, and every cursor.
    fn clear_session(&mut self) {
        self.lease = None;
        self.tx_open = false;
        self.cursors.clear();
    }

    fn fatal(&mut self, detail: &str) -> Error {
        let who = self
            .lease
            .as_ref()
            .map(|l| l.monitor.id().to_string())
            .unwrap_or_else(|| "<idle>".to_string());
        let err = Error::client_stopped(who, detail);
        error!(holder = self.id, %err, "adapter callback panicked, holder stopping");
        self.clear_session();
        err
    }

    async fn handle(&mut self, cmd: Command<A>, state: A::State) -> Step<A::State> {
        match cmd {
            Command::Checkout { monitor, reply } => self.do_checkout(monitor, reply, state).await,
            Command::Checkin { lease } => {
                if !self.lease_valid(lease) {
                    return Step::Continue(state);
                }
                self.release(state).await
            }
            Command::Begin { lease, opts, reply } => {
                if !self.lease_valid(lease) {
                    let _ = reply.send((Err(Error::closed()), None));
                    return Step::Continue(state);
                }
                let adapter = Arc::clone(&self.adapter);
                let deadline = self.deadline(&opts);
                let fut = async move { adapter.handle_begin(&opts, state).await };
                match self.call(fut, deadline, reply).await {
                    Ran::Ok {
                        value,
                        state,
                        elapsed,
                        reply,
                    } => {
                        self.tx_open = true;
                        let _ = reply.send((Ok(value), Some(elapsed)));
                        Step::Continue(state)
                    }
                    Ran::Continue(s) => Step::Continue(s),
                    Ran::Disconnected => Step::Disconnected,
                    Ran::Fatal => Step::Fatal,
                }
            }
            Command::Commit { lease, opts, reply } => {
                self.tx_closing_call(lease, opts, reply, state, TxEnd::Commit)
                    .await
            }
            Command::Rollback { lease, opts, reply } => {
                self.tx_closing_call(lease, opts, reply, state, TxEnd::Rollback)
                    .await
            }
            Command::Query {
                lease,
                query,
                params,
                opts,
                reply,
            } => {
                if !self.lease_valid(lease) {
                    let _ = reply.send((Err(Error::closed()), None));
                    return Step::Continue(state);
                }
                let adapter = Arc::clone(&self.adapter);
                let deadline = self.deadline(&opts);
                let fut = async move { adapter.handle_query(query, params, &opts, state).await };
                self.plain_call(fut, deadline, reply).await
            }
            Command::Prepare {
                lease,
                query,
                opts,
                reply,
            } => {
                if !self.lease_valid(lease) {
                    let _ = reply.send((Err(Error::closed()), None));
                    return Step::Continue(state);
                }
                let adapter = Arc::clone(&self.adapter);
                let deadline = self.deadline(&opts);
                let fut = async move { adapter.handle_prepare(query, &opts, state).await };
                self.plain_call(fut, deadline, reply).await
            }
            Command::Execute {
                lease,
                query,
                params,
                opts,
                reply,
            } => {
                if !self.lease_valid(lease) {
                    let _ = reply.send((Err(Error::closed()), None));
                    return Step::Continue(state);
                }
                let adapter = Arc::clone(&self.adapter);
                let deadline = self.deadline(&opts);
                let fut = async move { adapter.handle_execute(query, params, &opts, state).await };
                self.plain_call(fut, deadline, reply).await
            }
            Command::Close {
                lease,
                query,
                opts,
                reply,
            } => {
                if !self.lease_valid(lease) {
                    let _ = reply.send((Err(Error::closed()), None));
                    return Step::Continue(state);
                }
                let adapter = Arc::clone(&self.adapter);
                let deadline = self.deadline(&opts);
                let fut = async move { adapter.handle_close(query, &opts, state).await };
                self.plain_call(fut, deadline, reply).await
            }
            Command::Declare {
                lease,
                query,
                params,
                opts,
                reply,
            } => self.do_declare(lease, query, params, opts, reply, state).await,
            Command::Fetch {
                lease,
                cursor,
                opts,
                reply,
            } => self.do_fetch(lease, cursor, opts, reply, state).await,
            Command::Deallocate {
                lease,
                cursor,
                opts,
                reply,
            } => self.do_deallocate(lease, cursor, opts, reply, state).await,
            Command::Info { msg } => {
                let adapter = Arc::clone(&self.adapter);
                let deadline = self.config.timeout;
                let fut = async move { adapter.handle_info(msg, state).await };
                match guard(fut, deadline).await {
                    Ok(StateOutcome::Ok(s)) => Step::Continue(s),
                    Ok(StateOutcome::Disconnect(cause, s)) => {
                        self.teardown(cause, s).await;
                        Step::Disconnected
                    }
                    Err(GuardFailure::TimedOut(_)) => {
                        self.clear_session();
                        Step::Disconnected
                    }
                    Err(GuardFailure::Panicked(msg)) => {
                        self.fatal(&msg);
                        Step::Fatal
                    }
                }
            }
        }
    }

    async fn do_checkout(
        &mut self,
        monitor: PrincipalMonitor,
        reply: oneshot::Sender<Result<LeaseId>>,
        state: A::State,
    ) -> Step<A::State> {
        if self.lease.is_some() || monitor.is_terminated() {
            let _ = reply.send(Err(Error::closed()));
            return Step::Continue(state);
        }
        let adapter = Arc::clone(&self.adapter);
        let fut = async move { adapter.checkout(state).await };
        match guard(fut, self.config.timeout).await {
            Ok(StateOutcome::Ok(s)) => {
                let id = self.next_lease;
                self.next_lease += 1;
                self.lease = Some(Lease { id, monitor });
                let _ = reply.send(Ok(id));
                Step::Continue(s)
            }
            Ok(StateOutcome::Disconnect(cause, s)) => {
                let err = self.teardown(cause, s).await;
                let _ = reply.send(Err(err));
                Step::Disconnected
            }
            Err(GuardFailure::TimedOut(after)) => {
                self.clear_session();
                let _ = reply.send(Err(Error::operation_timeout(after)));
                Step::Disconnected
            }
            Err(GuardFailure::Panicked(msg)) => {
                let err = self.fatal(&msg);
                let _ = reply.send(Err(err));
                Step::Fatal
            }
        }
    }

    /// Commit and rollback share everything but the callback.
    async fn tx_closing_call(
        &mut self,
        lease: LeaseId,
        opts: CallOptions,
        reply: OpReply<A::Output>,
        state: A::State,
        end: TxEnd,
    ) -> Step<A::State> {
        if !self.lease_valid(lease) {
            let _ = reply.send((Err(Error::closed()), None));
            return Step::Continue(state);
        }
        let adapter = Arc::clone(&self.adapter);
        let deadline = self.deadline(&opts);
        let fut = async move {
            match end {
                TxEnd::Commit => adapter.handle_commit(&opts, state).await,
                TxEnd::Rollback => adapter.handle_rollback(&opts, state).await,
            }
        };
        match self.call(fut, deadline, reply).await {
            Ran::Ok {
                value,
                state,
                elapsed,
                reply,
            } => {
                self.tx_open = false;
                let _ = reply.send((Ok(value), Some(elapsed)));
                Step::Continue(state)
            }
            Ran::Continue(s) => {
                // The adapter refused, but the transaction attempt is over.
                self.tx_open = false;
                Step::Continue(s)
            }
            Ran::Disconnected => Step::Disconnected,
            Ran::Fatal => Step::Fatal,
        }
    }

    /// Run a callback with no holder-side bookkeeping on success.
    async fn plain_call<T: Send>(
        &mut self,
        fut: impl std::future::Future<Output = CallOutcome<T, A::State>>,
        deadline: Duration,
        reply: OpReply<T>,
    ) -> Step<A::State> {
        match self.call(fut, deadline, reply).await {
            Ran::Ok {
                value,
                state,
                elapsed,
                reply,
            } => {
                let _ = reply.send((Ok(value), Some(elapsed)));
                Step::Continue(state)
            }
            Ran::Continue(s) => Step::Continue(s),
            Ran::Disconnected => Step::Disconnected,
            Ran::Fatal => Step::Fatal,
        }
    }

    /// Drive one three-way callback to a replied outcome. The `Ok` case is
    /// handed back so the caller can apply bookkeeping before replying.
    async fn call<T: Send>(
        &mut self,
        fut: impl std::future::Future<Output = CallOutcome<T, A::State>>,
        deadline: Duration,
        reply: OpReply<T>,
    ) -> Ran<T, A::State> {
        let started = Instant::now();
        match guard(fut, deadline).await {
            Ok(CallOutcome::Ok(value, state)) => Ran::Ok {
                value,
                state,
                elapsed: started.elapsed(),
                reply,
            },
            Ok(CallOutcome::Error(cause, s)) => {
                let _ = reply.send((Err(Error::database(cause)), Some(started.elapsed())));
                Ran::Continue(s)
            }
            Ok(CallOutcome::Disconnect(cause, s)) => {
                let elapsed = started.elapsed();
                let err = self.teardown(cause, s).await;
                let _ = reply.send((Err(err), Some(elapsed)));
                Ran::Disconnected
            }
            Err(GuardFailure::TimedOut(after)) => {
                self.clear_session();
                let _ = reply.send((Err(Error::operation_timeout(after)), None));
                Ran::Disconnected
            }
            Err(GuardFailure::Panicked(msg)) => {
                let err = self.fatal(&msg);
                let _ = reply.send((Err(err), None));
                Ran::Fatal
            }
        }
    }

    async fn do_declare(
        &mut self,
        lease: LeaseId,
        query: A::Query,
        params: A::Params,
        opts: CallOptions,
        reply: OpReply<(Option<A::Query>, CursorId)>,
        state: A::State,
    ) -> Step<A::State> {
        if !self.lease_valid(lease) {
            let _ = reply.send((Err(Error::closed()), None));
            return Step::Continue(state);
        }
        let adapter = Arc::clone(&self.adapter);
        let deadline = self.deadline(&opts);
        let declared_query = query.clone();
        let fut = async move { adapter.handle_declare(query, params, &opts, state).await };
        let started = Instant::now();
        match guard(fut, deadline).await {
            Ok(DeclareOutcome::Ok(cursor, s)) => {
                let id = self.track_cursor(declared_query, cursor);
                let _ = reply.send((Ok((None, id)), Some(started.elapsed())));
                Step::Continue(s)
            }
            Ok(DeclareOutcome::Replace(replacement, cursor, s)) => {
                let id = self.track_cursor(replacement.clone(), cursor);
                let _ = reply.send((Ok((Some(replacement), id)), Some(started.elapsed())));
                Step::Continue(s)
            }
            Ok(DeclareOutcome::Error(cause, s)) => {
                let _ = reply.send((Err(Error::database(cause)), Some(started.elapsed())));
                Step::Continue(s)
            }
            Ok(DeclareOutcome::Disconnect(cause, s)) => {
                let elapsed = started.elapsed();
                let err = self.teardown(cause, s).await;
                let _ = reply.send((Err(err), Some(elapsed)));
                Step::Disconnected
            }
            Err(GuardFailure::TimedOut(after)) => {
                self.clear_session();
                let _ = reply.send((Err(Error::operation_timeout(after)), None));
                Step::Disconnected
            }
            Err(GuardFailure::Panicked(msg)) => {
                let err = self.fatal(&msg);
                let _ = reply.send((Err(err), None));
                Step::Fatal
            }
        }
    }

    fn track_cursor(&mut self, query: A::Query, cursor: A::Cursor) -> CursorId {
        let id = self.next_cursor;
        self.next_cursor += 1;
        self.cursors.insert(id, (query, cursor));
        id
    }

    async fn do_fetch(
        &mut self,
        lease: LeaseId,
        cursor_id: CursorId,
        opts: CallOptions,
        reply: OpReply<Fetch<A::Output>>,
        state: A::State,
    ) -> Step<A::State> {
        if !self.lease_valid(lease) {
            let _ = reply.send((Err(Error::closed()), None));
            return Step::Continue(state);
        }
        let Some((query, mut cursor)) = self.cursors.remove(&cursor_id) else {
            let _ = reply.send((Err(Error::cursor_not_found()), None));
            return Step::Continue(state);
        };
        let adapter = Arc::clone(&self.adapter);
        let deadline = self.deadline(&opts);
        let fut = async move {
            let outcome = adapter.handle_fetch(&query, &mut cursor, &opts, state).await;
            (outcome, query, cursor)
        };
        let started = Instant::now();
        match guard(fut, deadline).await {
            Ok((FetchOutcome::Cont(value, s), query, cursor)) => {
                self.cursors.insert(cursor_id, (query, cursor));
                let _ = reply.send((Ok(Fetch::Cont(value)), Some(started.elapsed())));
                Step::Continue(s)
            }
            Ok((FetchOutcome::Halt(value, s), query, cursor)) => {
                // Exhausted, but the cursor stays open until deallocate.
                self.cursors.insert(cursor_id, (query, cursor));
                let _ = reply.send((Ok(Fetch::Halt(value)), Some(started.elapsed())));
                Step::Continue(s)
            }
            Ok((FetchOutcome::Error(cause, s), query, cursor)) => {
                self.cursors.insert(cursor_id, (query, cursor));
                let _ = reply.send((Err(Error::database(cause)), Some(started.elapsed())));
                Step::Continue(s)
            }
            Ok((FetchOutcome::Disconnect(cause, s), _query, _cursor)) => {
                let elapsed = started.elapsed();
                let err = self.teardown(cause, s).await;
                let _ = reply.send((Err(err), Some(elapsed)));
                Step::Disconnected
            }
            Err(GuardFailure::TimedOut(after)) => {
                self.clear_session();
                let _ = reply.send((Err(Error::operation_timeout(after)), None));
                Step::Disconnected
            }
            Err(GuardFailure::Panicked(msg)) => {
                let err = self.fatal(&msg);
                let _ = reply.send((Err(err), None));
                Step::Fatal
            }
        }
    }

    async fn do_deallocate(
        &mut self,
        lease: LeaseId,
        cursor_id: CursorId,
        opts: CallOptions,
        reply: Option<OpReply<()>>,
        state: A::State,
    ) -> Step<A::State> {
        if !self.lease_valid(lease) {
            if let Some(reply) = reply {
                let _ = reply.send((Err(Error::closed()), None));
            }
            return Step::Continue(state);
        }
        let Some((query, cursor)) = self.cursors.remove(&cursor_id) else {
            if let Some(reply) = reply {
                let _ = reply.send((Err(Error::cursor_not_found()), None));
            }
            return Step::Continue(state);
        };
        let adapter = Arc::clone(&self.adapter);
        let deadline = self.deadline(&opts);
        let fut = async move { adapter.handle_deallocate(&query, cursor, &opts, state).await };
        let started = Instant::now();
        match guard(fut, deadline).await {
            Ok(CallOutcome::Ok((), s)) => {
                if let Some(reply) = reply {
                    let _ = reply.send((Ok(()), Some(started.elapsed())));
                }
                Step::Continue(s)
            }
            Ok(CallOutcome::Error(cause, s)) => {
                if let Some(reply) = reply {
                    let _ = reply.send((Err(Error::database(cause)), Some(started.elapsed())));
                }
                Step::Continue(s)
            }
            Ok(CallOutcome::Disconnect(cause, s)) => {
                let elapsed = started.elapsed();
                let err = self.teardown(cause, s).await;
                if let Some(reply) = reply {
                    let _ = reply.send((Err(err), Some(elapsed)));
                }
                Step::Disconnected
            }
            Err(GuardFailure::TimedOut(after)) => {
                self.clear_session();
                if let Some(reply) = reply {
                    let _ = reply.send((Err(Error::operation_timeout(after)), None));
                }
                Step::Disconnected
            }
            Err(GuardFailure::Panicked(msg)) => {
                let err = self.fatal(&msg);
                if let Some(reply) = reply {
                    let _ = reply.send((Err(err), None));
                }
                Step::Fatal
            }
        }
    }

    /// Give the connection back: close leftover cursors, roll back an open
    /// transaction best effort, run the adapter's checkin, and rejoin the
    /// idle queue. Used for explicit check-in and for client death alike.
    async fn release(&mut self, state: A::State) -> Step<A::State> {
        let mut state = state;

        // Leftover cursors are closed before the transaction ends.
        let orphaned: Vec<CursorId> = self.cursors.keys().copied().collect();
        for id in orphaned {
            let Some((query, cursor)) = self.cursors.remove(&id) else {
                continue;
            };
            let adapter = Arc::clone(&self.adapter);
            let opts = CallOptions::default();
            let fut =
                async move { adapter.handle_deallocate(&query, cursor, &opts, state).await };
            match guard(fut, self.config.timeout).await {
                Ok(CallOutcome::Ok((), s)) | Ok(CallOutcome::Error(_, s)) => state = s,
                Ok(CallOutcome::Disconnect(cause, s)) => {
                    self.teardown(cause, s).await;
                    return Step::Disconnected;
                }
                Err(GuardFailure::TimedOut(_)) => {
                    self.clear_session();
                    return Step::Disconnected;
                }
                Err(GuardFailure::Panicked(msg)) => {
                    self.fatal(&msg);
                    return Step::Fatal;
                }
            }
        }

        // Implicit rollback; failures downgrade to a disconnect.
        if self.tx_open {
            let adapter = Arc::clone(&self.adapter);
            let opts = CallOptions::default();
            let fut = async move { adapter.handle_rollback(&opts, state).await };
            match guard(fut, self.config.timeout).await {
                Ok(CallOutcome::Ok(_, s)) => {
                    self.tx_open = false;
                    state = s;
                }
                Ok(CallOutcome::Error(cause, s)) | Ok(CallOutcome::Disconnect(cause, s)) => {
                    self.teardown(cause, s).await;
                    return Step::Disconnected;
                }
                Err(GuardFailure::TimedOut(_)) => {
                    self.clear_session();
                    return Step::Disconnected;
                }
                Err(GuardFailure::Panicked(msg)) => {
                    self.fatal(&msg);
                    return Step::Fatal;
                }
            }
        }

        let adapter = Arc::clone(&self.adapter);
        let fut = async move { adapter.checkin(state).await };
        match guard(fut, self.config.timeout).await {
            Ok(StateOutcome::Ok(s)) => {
                self.lease = None;
                self.ping_at = Instant::now() + self.config.idle_interval;
                let _ = self.events.send(HolderEvent::Idle(self.id)).await;
                Step::Continue(s)
            }
            Ok(StateOutcome::Disconnect(cause, s)) => {
                self.teardown(cause, s).await;
                Step::Disconnected
            }
            Err(GuardFailure::TimedOut(_)) => {
                self.clear_session();
                Step::Disconnected
            }
            Err(GuardFailure::Panicked(msg)) => {
                self.fatal(&msg);
                Step::Fatal
            }
        }
    }

    async fn do_ping(&mut self, state: A::State) -> Step<A::State> {
        let adapter = Arc::clone(&self.adapter);
        let fut = async move { adapter.ping(state).await };
        match guard(fut, self.config.timeout).await {
            Ok(StateOutcome::Ok(s)) => {
                self.ping_at = Instant::now() + self.config.idle_interval;
                Step::Continue(s)
            }
            Ok(StateOutcome::Disconnect(cause, s)) => {
                self.teardown(cause, s).await;
                Step::Disconnected
            }
            Err(GuardFailure::TimedOut(_)) => {
                self.clear_session();
                Step::Disconnected
            }
            Err(GuardFailure::Panicked(msg)) => {
                self.fatal(&msg);
                Step::Fatal
            }
        }
    }
}

/// Which transaction-ending callback to run.
#[derive(Clone, Copy)]
enum TxEnd {
    Commit,
    Rollback,
}

/// Outcome of [`Holder::call`]. Error paths reply inline; the `Ok` case is
/// returned unreplied so the caller can apply bookkeeping first.
enum Ran<T, S> {
    Ok {
        value: T,
        state: S,
        elapsed: Duration,
        reply: OpReply<T>,
    },
    Continue(S),
    Disconnected,
    Fatal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::Principal;
    use crate::testing::{RecordedCall, ScriptedAdapter, Step as ScriptStep};

    fn test_config() -> Arc<Config<ScriptedAdapter>> {
        Arc::new(
            Config::new()
                .with_backoff_bounds(Duration::from_millis(10), Duration::from_millis(40))
                .with_idle_interval(Duration::from_secs(60))
                .with_timeout(Duration::from_millis(500)),
        )
    }

    struct Rig {
        adapter: ScriptedAdapter,
        handle: HolderHandle<ScriptedAdapter>,
        events: mpsc::Receiver<HolderEvent>,
        principal: Principal,
    }

    async fn rig(script: Vec<ScriptStep>) -> Rig {
        let adapter = ScriptedAdapter::new(script);
        let (events_tx, events) = mpsc::channel(16);
        let handle = spawn(0, Arc::new(adapter.clone()), test_config(), events_tx, None);
        Rig {
            adapter,
            handle,
            events,
            principal: Principal::new(),
        }
    }

    async fn expect_idle(events: &mut mpsc::Receiver<HolderEvent>) {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Some(HolderEvent::Idle(_))) => {}
            other => panic!("expected Idle event, got {other:?}"),
        }
    }

    async fn checkout(rig: &mut Rig) -> LeaseId {
        let (tx, rx) = oneshot::channel();
        rig.handle
            .tx
            .send(Command::Checkout {
                monitor: rig.principal.monitor(),
                reply: tx,
            })
            .await
            .unwrap();
        rx.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_checkout_query_checkin_roundtrip() {
        let mut rig = rig(vec![
            ScriptStep::Ok,                              // connect
            ScriptStep::OkOutput(vec!["row".into()]),    // query
        ])
        .await;
        expect_idle(&mut rig.events).await;

        let lease = checkout(&mut rig).await;

        let (tx, rx) = oneshot::channel();
        rig.handle
            .tx
            .send(Command::Query {
                lease,
                query: "SELECT 1".into(),
                params: vec![],
                opts: CallOptions::default(),
                reply: tx,
            })
            .await
            .unwrap();
        let (result, conn_time) = rx.await.unwrap();
        assert_eq!(result.unwrap(), vec!["row".to_string()]);
        assert!(conn_time.is_some());

        rig.handle
            .tx
            .send(Command::Checkin { lease })
            .await
            .unwrap();
        expect_idle(&mut rig.events).await;

        assert_eq!(
            rig.adapter.calls(),
            vec![
                RecordedCall::Connect,
                RecordedCall::Checkout,
                RecordedCall::Query("SELECT 1".into()),
                RecordedCall::Checkin,
            ]
        );
    }

    #[tokio::test]
    async fn test_stale_lease_is_rejected() {
        let mut rig = rig(vec![ScriptStep::Ok]).await;
        expect_idle(&mut rig.events).await;

        let lease = checkout(&mut rig).await;
        rig.handle
            .tx
            .send(Command::Checkin { lease })
            .await
            .unwrap();
        expect_idle(&mut rig.events).await;

        let (tx, rx) = oneshot::channel();
        rig.handle
            .tx
            .send(Command::Query {
                lease,
                query: "SELECT 1".into(),
                params: vec![],
                opts: CallOptions::default(),
                reply: tx,
            })
            .await
            .unwrap();
        let (result, conn_time) = rx.await.unwrap();
        assert_eq!(result.unwrap_err().to_string(), "connection is closed");
        assert_eq!(conn_time, None);
    }

    #[tokio::test]
    async fn test_disconnect_outcome_reconnects() {
        let mut rig = rig(vec![
            ScriptStep::Ok,                        // connect
            ScriptStep::Disconnect("gone".into()), // query
            ScriptStep::Ok,                        // reconnect
        ])
        .await;
        expect_idle(&mut rig.events).await;

        let lease = checkout(&mut rig).await;
        let (tx, rx) = oneshot::channel();
        rig.handle
            .tx
            .send(Command::Query {
                lease,
                query: "SELECT 1".into(),
                params: vec![],
                opts: CallOptions::default(),
                reply: tx,
            })
            .await
            .unwrap();
        let (result, _) = rx.await.unwrap();
        let err = result.unwrap_err();
        assert!(err.is_disconnect());
        assert_eq!(err.to_string(), "gone");

        // Disconnected, then Idle again once the reconnect lands.
        match tokio::time::timeout(Duration::from_secs(1), rig.events.recv()).await {
            Ok(Some(HolderEvent::Disconnected(_))) => {}
            other => panic!("expected Disconnected, got {other:?}"),
        }
        expect_idle(&mut rig.events).await;
        assert_eq!(rig.adapter.connect_count(), 2);
        assert!(rig
            .adapter
            .calls()
            .iter()
            .any(|c| matches!(c, RecordedCall::Disconnect(m) if m == "gone")));
    }

    #[tokio::test]
    async fn test_client_death_rolls_back_and_checks_in() {
        let mut rig = rig(vec![
            ScriptStep::Ok, // connect
            ScriptStep::Ok, // begin
            ScriptStep::Ok, // rollback (implicit)
        ])
        .await;
        expect_idle(&mut rig.events).await;

        let lease = checkout(&mut rig).await;
        let (tx, rx) = oneshot::channel();
        rig.handle
            .tx
            .send(Command::Begin {
                lease,
                opts: CallOptions::default(),
                reply: tx,
            })
            .await
            .unwrap();
        rx.await.unwrap().0.unwrap();

        rig.principal.terminate();
        expect_idle(&mut rig.events).await;

        let calls = rig.adapter.calls();
        assert!(calls.contains(&RecordedCall::Rollback));
        assert!(calls.contains(&RecordedCall::Checkin));
    }

    #[tokio::test]
    async fn test_callback_panic_stops_holder_for_restart() {
        let mut rig = rig(vec![
            ScriptStep::Ok,                   // connect
            ScriptStep::Panic("kaboom".into()), // query
        ])
        .await;
        expect_idle(&mut rig.events).await;

        let lease = checkout(&mut rig).await;
        let (tx, rx) = oneshot::channel();
        rig.handle
            .tx
            .send(Command::Query {
                lease,
                query: "SELECT 1".into(),
                params: vec![],
                opts: CallOptions::default(),
                reply: tx,
            })
            .await
            .unwrap();
        let (result, _) = rx.await.unwrap();
        let message = result.unwrap_err().to_string();
        assert!(message.contains("stopped"), "{message}");
        assert!(message.contains("kaboom"), "{message}");

        match tokio::time::timeout(Duration::from_secs(1), rig.events.recv()).await {
            Ok(Some(HolderEvent::Stopped { restart: true, .. })) => {}
            other => panic!("expected Stopped, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ping_fires_while_idle() {
        let adapter = ScriptedAdapter::new(vec![ScriptStep::Ok]);
        let config = Arc::new(
            Config::new()
                .with_idle_interval(Duration::from_millis(20))
                .with_timeout(Duration::from_millis(500)),
        );
        let (events_tx, mut events) = mpsc::channel(16);
        let _handle = spawn(0, Arc::new(adapter.clone()), config, events_tx, None);
        expect_idle(&mut events).await;

        assert!(
            adapter
                .wait_for(
                    |calls| calls.iter().filter(|c| matches!(c, RecordedCall::Ping)).count() >= 2,
                    Duration::from_secs(1),
                )
                .await
        );
    }

    #[tokio::test]
    async fn test_ping_disconnect_triggers_reconnect() {
        let adapter = ScriptedAdapter::new(vec![ScriptStep::Ok, ScriptStep::Ok]);
        adapter.script_ping(vec![ScriptStep::Disconnect("stale".into())]);
        let config = Arc::new(
            Config::new()
                .with_backoff_bounds(Duration::from_millis(10), Duration::from_millis(40))
                .with_idle_interval(Duration::from_millis(20))
                .with_timeout(Duration::from_millis(500)),
        );
        let (events_tx, mut events) = mpsc::channel(16);
        let _handle = spawn(0, Arc::new(adapter.clone()), config, events_tx, None);
        expect_idle(&mut events).await;

        assert!(adapter.wait_for(|_| adapter.connect_count() >= 2, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_backoff_stop_terminates_holder() {
        let adapter = ScriptedAdapter::new(vec![ScriptStep::Error("refused".into())]);
        let config = Arc::new(
            Config::new()
                .with_backoff_kind(crate::backoff::BackoffKind::Stop)
                .with_timeout(Duration::from_millis(500)),
        );
        let (events_tx, mut events) = mpsc::channel(16);
        let _handle = spawn(0, Arc::new(adapter.clone()), config, events_tx, None);

        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Some(HolderEvent::Stopped { restart: false, .. })) => {}
            other => panic!("expected Stopped without restart, got {other:?}"),
        }
        assert_eq!(adapter.connect_count(), 1);
    }
}
