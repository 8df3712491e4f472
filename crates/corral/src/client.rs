//! Checked-out connection handle and its legal-call state machine
//!
//! A [`Client`] is the handle a caller holds for one check-out window. It
//! enforces the call discipline the adapter relies on: transactions are
//! opened and closed in pairs, cursors are only touched inside the
//! transaction that declared them, and once an operation inside a
//! transaction fails every later operation short-circuits until the
//! enclosing [`Client::transaction`] closure returns and the rollback is
//! issued.
//!
//! Dropping a client returns its connection to the pool; an open
//! transaction is rolled back on the way out.

use std::collections::HashSet;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::adapter::Adapter;
use crate::config::{CallOptions, Config};
use crate::error::{Error, Result};
use crate::holder::{Command, CursorId, HolderHandle, LeaseId, OpReply};
use crate::log::{Call, LogEntry, LogHook};
use crate::principal::Principal;

/// Client-side transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// No transaction open
    Idle,
    /// Inside a transaction
    Transaction,
    /// A transaction operation failed; waiting for the rollback
    Failed,
}

/// What a [`Client::transaction`] closure resolved to
pub enum TxOutcome<T> {
    /// Commit and yield the value
    Commit(T),
    /// Roll back and surface this error
    Error(Error),
    /// Roll back; the transaction resolves to [`Error::Rollback`]
    Rollback,
}

/// One chunk pulled from a cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch<T> {
    /// More chunks remain
    Cont(T),
    /// The cursor is exhausted
    Halt(T),
}

impl<T> Fetch<T> {
    /// The chunk itself
    pub fn into_inner(self) -> T {
        match self {
            Self::Cont(value) | Self::Halt(value) => value,
        }
    }

    /// Whether this was the final chunk
    pub fn is_halt(&self) -> bool {
        matches!(self, Self::Halt(_))
    }
}

/// Handle to a cursor declared in the current check-out window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cursor {
    pub(crate) id: CursorId,
}

/// A checked-out connection
pub struct Client<A: Adapter> {
    holder: HolderHandle<A>,
    lease: LeaseId,
    status: TxStatus,
    cursors: HashSet<CursorId>,
    log: Option<LogHook<A::Query, A::Params>>,
    pending_pool_time: Option<Duration>,
    /// Keeps an implicitly created principal alive for the window
    _principal: Option<Principal>,
    open: bool,
}

impl<A: Adapter> Client<A> {
    pub(crate) fn new(
        holder: HolderHandle<A>,
        lease: LeaseId,
        config: &Config<A>,
        pool_time: Option<Duration>,
        principal: Option<Principal>,
    ) -> Self {
        Self {
            holder,
            lease,
            status: TxStatus::Idle,
            cursors: HashSet::new(),
            log: config.log.clone(),
            pending_pool_time: pool_time,
            _principal: principal,
            open: true,
        }
    }

    /// Current transaction status
    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// Return the connection to the pool
    pub async fn checkin(mut self) {
        self.open = false;
        let _ = self
            .holder
            .tx
            .send(Command::Checkin { lease: self.lease })
            .await;
    }

    // ==================== Queries ====================

    /// Run a query
    pub async fn query(&mut self, query: A::Query, params: A::Params) -> Result<A::Output> {
        self.query_opts(query, params, CallOptions::default()).await
    }

    /// Run a query with per-call options
    pub async fn query_opts(
        &mut self,
        query: A::Query,
        params: A::Params,
        opts: CallOptions,
    ) -> Result<A::Output> {
        self.guard_status()?;
        let (lq, lp) = self.log_items(&query, Some(&params));
        self.logged_op(Call::Query, lq, lp, |lease, reply| Command::Query {
            lease,
            query,
            params,
            opts,
            reply,
        })
        .await
    }

    /// Prepare a query for repeated execution
    pub async fn prepare(&mut self, query: A::Query) -> Result<A::Query> {
        self.prepare_opts(query, CallOptions::default()).await
    }

    /// Prepare a query with per-call options
    pub async fn prepare_opts(&mut self, query: A::Query, opts: CallOptions) -> Result<A::Query> {
        self.guard_status()?;
        let (lq, lp) = self.log_items(&query, None);
        self.logged_op(Call::Prepare, lq, lp, |lease, reply| Command::Prepare {
            lease,
            query,
            opts,
            reply,
        })
        .await
    }

    /// Run a previously prepared query
    pub async fn execute(&mut self, query: A::Query, params: A::Params) -> Result<A::Output> {
        self.execute_opts(query, params, CallOptions::default())
            .await
    }

    /// Run a previously prepared query with per-call options
    pub async fn execute_opts(
        &mut self,
        query: A::Query,
        params: A::Params,
        opts: CallOptions,
    ) -> Result<A::Output> {
        self.guard_status()?;
        let (lq, lp) = self.log_items(&query, Some(&params));
        self.logged_op(Call::Execute, lq, lp, |lease, reply| Command::Execute {
            lease,
            query,
            params,
            opts,
            reply,
        })
        .await
    }

    /// Release a prepared query
    pub async fn close(&mut self, query: A::Query) -> Result<()> {
        self.close_opts(query, CallOptions::default()).await
    }

    /// Release a prepared query with per-call options
    pub async fn close_opts(&mut self, query: A::Query, opts: CallOptions) -> Result<()> {
        self.guard_status()?;
        let (lq, lp) = self.log_items(&query, None);
        self.logged_op(Call::Close, lq, lp, |lease, reply| Command::Close {
            lease,
            query,
            opts,
            reply,
        })
        .await
    }

    // ==================== Cursors ====================

    /// Open a cursor; only legal inside a transaction
    pub async fn declare(&mut self, query: A::Query, params: A::Params) -> Result<Cursor> {
        self.declare_opts(query, params, CallOptions::default())
            .await
    }

    /// Open a cursor with per-call options
    pub async fn declare_opts(
        &mut self,
        query: A::Query,
        params: A::Params,
        opts: CallOptions,
    ) -> Result<Cursor> {
        self.ensure_in_transaction("cursors can only be declared inside a transaction")?;
        let (lq, lp) = self.log_items(&query, Some(&params));
        let (result, connection_time) = self.declare_raw(query, params, opts).await;
        let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
        self.emit_log(Call::Declare, lq, lp, outcome, connection_time, None);
        result.map(|(_, cursor)| cursor)
    }

    /// Pull the next chunk from a cursor
    pub async fn fetch(&mut self, cursor: Cursor) -> Result<Fetch<A::Output>> {
        self.fetch_opts(cursor, CallOptions::default()).await
    }

    /// Pull the next chunk with per-call options
    pub async fn fetch_opts(&mut self, cursor: Cursor, opts: CallOptions) -> Result<Fetch<A::Output>> {
        self.guard_status()?;
        let (result, connection_time) = self.fetch_raw(cursor, opts).await;
        let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
        self.emit_log(Call::Fetch, None, None, outcome, connection_time, None);
        result
    }

    /// Close a cursor
    pub async fn deallocate(&mut self, cursor: Cursor) -> Result<()> {
        self.deallocate_opts(cursor, CallOptions::default()).await
    }

    /// Close a cursor with per-call options
    pub async fn deallocate_opts(&mut self, cursor: Cursor, opts: CallOptions) -> Result<()> {
        self.guard_status()?;
        let (result, connection_time) = self.deallocate_raw(cursor, opts).await;
        let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
        self.emit_log(Call::Deallocate, None, None, outcome, connection_time, None);
        result
    }

    // ==================== Transactions ====================

    /// Run `f` inside a transaction.
    ///
    /// The closure resolves to a [`TxOutcome`]: `Commit` commits and yields
    /// the value, `Rollback` rolls back and resolves to
    /// [`Error::Rollback`], `Error` rolls back and surfaces the error. If
    /// any operation inside the closure fails, later operations
    /// short-circuit and the transaction resolves to [`Error::Rollback`]
    /// regardless of what the closure returns.
    ///
    /// A nested `transaction` call while one is already open runs the inner
    /// closure on the same transaction and only reflects its outcome
    /// outward.
    pub async fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut Client<A>) -> BoxFuture<'c, TxOutcome<T>> + Send,
    {
        match self.status {
            TxStatus::Failed => return Err(Error::rolling_back()),
            TxStatus::Transaction => {
                return match f(self).await {
                    TxOutcome::Commit(value) => Ok(value),
                    TxOutcome::Error(err) => {
                        self.status = TxStatus::Failed;
                        Err(err)
                    }
                    TxOutcome::Rollback => {
                        self.status = TxStatus::Failed;
                        Err(Error::Rollback)
                    }
                };
            }
            TxStatus::Idle => {}
        }

        self.begin_call(CallOptions::default()).await?;
        self.status = TxStatus::Transaction;

        let outcome = f(self).await;

        match outcome {
            TxOutcome::Commit(value) if self.status == TxStatus::Transaction => {
                let committed = self.commit_call(CallOptions::default()).await;
                self.status = TxStatus::Idle;
                committed.map(|_| value)
            }
            TxOutcome::Commit(_) => {
                // An operation failed along the way; the transaction is lost.
                let _ = self.rollback_call(CallOptions::default()).await;
                self.status = TxStatus::Idle;
                Err(Error::Rollback)
            }
            TxOutcome::Error(err) => {
                let _ = self.rollback_call(CallOptions::default()).await;
                self.status = TxStatus::Idle;
                Err(err)
            }
            TxOutcome::Rollback => {
                let _ = self.rollback_call(CallOptions::default()).await;
                self.status = TxStatus::Idle;
                Err(Error::Rollback)
            }
        }
    }

    pub(crate) async fn begin_call(&mut self, opts: CallOptions) -> Result<A::Output> {
        self.logged_op(Call::Begin, None, None, |lease, reply| Command::Begin {
            lease,
            opts,
            reply,
        })
        .await
    }

    pub(crate) async fn commit_call(&mut self, opts: CallOptions) -> Result<A::Output> {
        self.logged_op(Call::Commit, None, None, |lease, reply| Command::Commit {
            lease,
            opts,
            reply,
        })
        .await
    }

    pub(crate) async fn rollback_call(&mut self, opts: CallOptions) -> Result<A::Output> {
        self.logged_op(Call::Rollback, None, None, |lease, reply| {
            Command::Rollback { lease, opts, reply }
        })
        .await
    }

    // ==================== Raw plumbing ====================

    pub(crate) async fn declare_raw(
        &mut self,
        query: A::Query,
        params: A::Params,
        opts: CallOptions,
    ) -> (Result<(Option<A::Query>, Cursor)>, Option<Duration>) {
        let (result, connection_time) = self
            .raw_op(|lease, reply| Command::Declare {
                lease,
                query,
                params,
                opts,
                reply,
            })
            .await;
        let result = result.map(|(replaced, id)| {
            self.cursors.insert(id);
            (replaced, Cursor { id })
        });
        (result, connection_time)
    }

    pub(crate) async fn fetch_raw(
        &mut self,
        cursor: Cursor,
        opts: CallOptions,
    ) -> (Result<Fetch<A::Output>>, Option<Duration>) {
        if !self.cursors.contains(&cursor.id) {
            return (Err(Error::cursor_not_found()), None);
        }
        self.raw_op(|lease, reply| Command::Fetch {
            lease,
            cursor: cursor.id,
            opts,
            reply,
        })
        .await
    }

    pub(crate) async fn deallocate_raw(
        &mut self,
        cursor: Cursor,
        opts: CallOptions,
    ) -> (Result<()>, Option<Duration>) {
        if !self.cursors.remove(&cursor.id) {
            return (Err(Error::cursor_not_found()), None);
        }
        self.raw_op(|lease, reply| Command::Deallocate {
            lease,
            cursor: cursor.id,
            opts,
            reply: Some(reply),
        })
        .await
    }

    /// Best-effort cursor close for a dropped stream; never blocks.
    pub(crate) fn orphan_deallocate(&mut self, cursor: Cursor) {
        if self.cursors.remove(&cursor.id) && self.open {
            let _ = self.holder.tx.try_send(Command::Deallocate {
                lease: self.lease,
                cursor: cursor.id,
                opts: CallOptions::default(),
                reply: None,
            });
        }
    }

    /// Forget a cursor whose holder-side state is already gone.
    pub(crate) fn untrack_cursor(&mut self, cursor: Cursor) {
        self.cursors.remove(&cursor.id);
    }

    async fn raw_op<T>(
        &mut self,
        make: impl FnOnce(LeaseId, OpReply<T>) -> Command<A>,
    ) -> (Result<T>, Option<Duration>) {
        if !self.open {
            return (Err(Error::closed()), None);
        }
        let (tx, rx) = oneshot::channel();
        if self.holder.tx.send(make(self.lease, tx)).await.is_err() {
            self.poison();
            return (Err(Error::closed()), None);
        }
        let (result, connection_time) = match rx.await {
            Ok(reply) => reply,
            Err(_) => (Err(Error::closed()), None),
        };
        if result.is_err() {
            self.poison();
        }
        (result, connection_time)
    }

    async fn logged_op<T>(
        &mut self,
        call: Call,
        query: Option<A::Query>,
        params: Option<A::Params>,
        make: impl FnOnce(LeaseId, OpReply<T>) -> Command<A>,
    ) -> Result<T> {
        let (result, connection_time) = self.raw_op(make).await;
        let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
        self.emit_log(call, query, params, outcome, connection_time, None);
        result
    }

    pub(crate) fn emit_log(
        &mut self,
        call: Call,
        query: Option<A::Query>,
        params: Option<A::Params>,
        result: std::result::Result<(), String>,
        connection_time: Option<Duration>,
        decode_time: Option<Duration>,
    ) {
        let pool_time = self.pending_pool_time.take();
        if let Some(hook) = &self.log {
            crate::log::emit(
                hook,
                &LogEntry {
                    call,
                    query,
                    params,
                    result,
                    pool_time,
                    connection_time,
                    decode_time,
                },
            );
        }
    }

    pub(crate) fn wants_log(&self) -> bool {
        self.log.is_some()
    }

    fn log_items(
        &self,
        query: &A::Query,
        params: Option<&A::Params>,
    ) -> (Option<A::Query>, Option<A::Params>) {
        if self.log.is_some() {
            (Some(query.clone()), params.cloned())
        } else {
            (None, None)
        }
    }

    fn poison(&mut self) {
        if self.status == TxStatus::Transaction {
            self.status = TxStatus::Failed;
        }
    }

    fn guard_status(&self) -> Result<()> {
        match self.status {
            TxStatus::Failed => Err(Error::rolling_back()),
            _ => Ok(()),
        }
    }

    fn ensure_in_transaction(&self, what: &str) -> Result<()> {
        match self.status {
            TxStatus::Transaction => Ok(()),
            TxStatus::Failed => Err(Error::rolling_back()),
            TxStatus::Idle => Err(Error::connection(what)),
        }
    }
}

impl<A: Adapter> Drop for Client<A> {
    fn drop(&mut self) {
        if self.open {
            let _ = self
                .holder
                .tx
                .try_send(Command::Checkin { lease: self.lease });
        }
    }
}

impl<A: Adapter> std::fmt::Debug for Client<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("holder", &self.holder.id)
            .field("lease", &self.lease)
            .field("status", &self.status)
            .field("cursors", &self.cursors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::holder::{self, HolderEvent};
    use crate::testing::{RecordedCall, ScriptedAdapter, Step};
    use futures::FutureExt;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn client_rig(script: Vec<Step>) -> (ScriptedAdapter, Client<ScriptedAdapter>) {
        let adapter = ScriptedAdapter::new(script);
        let config: Config<ScriptedAdapter> = Config::new()
            .with_idle_interval(Duration::from_secs(60))
            .with_timeout(Duration::from_millis(500));
        let config = Arc::new(config);
        let (events_tx, mut events) = mpsc::channel(16);
        let handle = holder::spawn(0, Arc::new(adapter.clone()), config.clone(), events_tx, None);

        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Some(HolderEvent::Idle(_))) => {}
            other => panic!("expected Idle, got {other:?}"),
        }
        // Keep events alive so the holder never blocks on a full channel.
        tokio::spawn(async move { while events.recv().await.is_some() {} });

        let principal = Principal::new();
        let (tx, rx) = oneshot::channel();
        handle
            .tx
            .send(Command::Checkout {
                monitor: principal.monitor(),
                reply: tx,
            })
            .await
            .unwrap();
        let lease = rx.await.unwrap().unwrap();
        let client = Client::new(handle, lease, &config, None, Some(principal));
        (adapter, client)
    }

    #[tokio::test]
    async fn test_transaction_commits() {
        let (adapter, mut client) = client_rig(vec![
            Step::Ok, // connect
            Step::Ok, // begin
            Step::OkOutput(vec!["row".into()]), // query
            Step::Ok, // commit
        ])
        .await;

        let rows = client
            .transaction(|c| {
                async move {
                    match c.query("SELECT 1".into(), vec![]).await {
                        Ok(rows) => TxOutcome::Commit(rows),
                        Err(err) => TxOutcome::Error(err),
                    }
                }
                .boxed()
            })
            .await
            .unwrap();

        assert_eq!(rows, vec!["row".to_string()]);
        assert_eq!(client.status(), TxStatus::Idle);

        let calls = adapter.calls();
        assert!(calls.contains(&RecordedCall::Begin));
        assert!(calls.contains(&RecordedCall::Commit));
        assert!(!calls.contains(&RecordedCall::Rollback));
    }

    #[tokio::test]
    async fn test_failed_status_short_circuits_and_rolls_back() {
        let (adapter, mut client) = client_rig(vec![
            Step::Ok,                    // connect
            Step::Ok,                    // begin
            Step::Error("syntax".into()), // query
            Step::Ok,                    // rollback
        ])
        .await;

        let result: Result<()> = client
            .transaction(|c| {
                async move {
                    let first = c.query("BAD".into(), vec![]).await;
                    assert_eq!(first.unwrap_err().to_string(), "syntax");
                    // Later operations short-circuit without reaching the adapter.
                    let second = c.query("GOOD".into(), vec![]).await;
                    assert_eq!(
                        second.unwrap_err().to_string(),
                        "transaction rolling back"
                    );
                    TxOutcome::Commit(())
                }
                .boxed()
            })
            .await;

        assert!(result.unwrap_err().is_rollback());
        assert_eq!(client.status(), TxStatus::Idle);

        let queries: Vec<_> = adapter
            .calls()
            .into_iter()
            .filter(|c| matches!(c, RecordedCall::Query(_)))
            .collect();
        assert_eq!(queries, vec![RecordedCall::Query("BAD".into())]);
        assert!(adapter.calls().contains(&RecordedCall::Rollback));
    }

    #[tokio::test]
    async fn test_explicit_rollback_outcome() {
        let (adapter, mut client) = client_rig(vec![
            Step::Ok, // connect
            Step::Ok, // begin
            Step::Ok, // rollback
        ])
        .await;

        let result: Result<()> = client
            .transaction(|_| async move { TxOutcome::Rollback }.boxed())
            .await;

        assert!(result.unwrap_err().is_rollback());
        assert!(adapter.calls().contains(&RecordedCall::Rollback));
        assert!(!adapter.calls().contains(&RecordedCall::Commit));
    }

    #[tokio::test]
    async fn test_nested_transaction_is_a_no_op() {
        let (adapter, mut client) = client_rig(vec![
            Step::Ok, // connect
            Step::Ok, // begin
            Step::Ok, // commit
        ])
        .await;

        client
            .transaction(|c| {
                async move {
                    let inner: Result<u8> = c
                        .transaction(|_| async move { TxOutcome::Commit(7) }.boxed())
                        .await;
                    assert_eq!(inner.unwrap(), 7);
                    TxOutcome::Commit(())
                }
                .boxed()
            })
            .await
            .unwrap();

        let begins = adapter
            .calls()
            .iter()
            .filter(|c| matches!(c, RecordedCall::Begin))
            .count();
        assert_eq!(begins, 1);
    }

    #[tokio::test]
    async fn test_inner_rollback_poisons_outer() {
        let (adapter, mut client) = client_rig(vec![
            Step::Ok, // connect
            Step::Ok, // begin
            Step::Ok, // rollback
        ])
        .await;

        let result: Result<()> = client
            .transaction(|c| {
                async move {
                    let inner: Result<()> = c
                        .transaction(|_| async move { TxOutcome::Rollback }.boxed())
                        .await;
                    assert!(inner.unwrap_err().is_rollback());
                    TxOutcome::Commit(())
                }
                .boxed()
            })
            .await;

        assert!(result.unwrap_err().is_rollback());
        assert!(adapter.calls().contains(&RecordedCall::Rollback));
    }

    #[tokio::test]
    async fn test_begin_error_leaves_idle() {
        let (adapter, mut client) = client_rig(vec![
            Step::Ok,                        // connect
            Step::Error("no begin".into()), // begin
        ])
        .await;

        let result: Result<()> = client
            .transaction(|_| async move { TxOutcome::Commit(()) }.boxed())
            .await;

        assert_eq!(result.unwrap_err().to_string(), "no begin");
        assert_eq!(client.status(), TxStatus::Idle);
        assert!(!adapter.calls().contains(&RecordedCall::Commit));
        assert!(!adapter.calls().contains(&RecordedCall::Rollback));
    }

    #[tokio::test]
    async fn test_declare_requires_transaction() {
        let (_adapter, mut client) = client_rig(vec![Step::Ok]).await;
        let err = client.declare("Q".into(), vec![]).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "cursors can only be declared inside a transaction"
        );
    }

    #[tokio::test]
    async fn test_fetch_unknown_cursor() {
        let (_adapter, mut client) = client_rig(vec![Step::Ok, Step::Ok]).await;
        let result = client
            .transaction(|c| {
                async move {
                    let err = c.fetch(Cursor { id: 99 }).await.unwrap_err();
                    assert_eq!(err.to_string(), "cursor not found");
                    TxOutcome::<()>::Rollback
                }
                .boxed()
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_checkin_reaches_adapter() {
        let (adapter, client) = client_rig(vec![Step::Ok]).await;
        client.checkin().await;
        assert!(
            adapter
                .wait_for(
                    |calls| calls.contains(&RecordedCall::Checkin),
                    Duration::from_secs(1)
                )
                .await
        );
    }
}
