//! The driver adapter contract
//!
//! An [`Adapter`] is the capability set a database driver implements to plug
//! into the runtime. The runtime owns the adapter state: it is produced by
//! `connect`, moved into every callback, and handed back inside the
//! callback's outcome. A callback that returns a `Disconnect` outcome retires
//! the returned state — it is passed to `disconnect` and never seen again.
//!
//! Callbacks are only ever invoked from the connection holder that owns the
//! state, one at a time, in the order the client issued them.
//!
//! # Example
//!
//! ```rust,ignore
//! use corral::adapter::{Adapter, CallOutcome, StateOutcome};
//!
//! struct PgAdapter { opts: PgOptions }
//!
//! #[async_trait]
//! impl Adapter for PgAdapter {
//!     type State = PgSession;
//!     type Query = String;
//!     // ...
//!
//!     async fn connect(&self) -> Result<PgSession, BoxError> {
//!         PgSession::open(&self.opts).await.map_err(Into::into)
//!     }
//!     // ...
//! }
//! ```

use async_trait::async_trait;

use crate::config::CallOptions;
use crate::error::BoxError;

/// Outcome of a callback that carries no payload (`checkout`, `checkin`,
/// `ping`, `handle_info`)
pub enum StateOutcome<S> {
    /// The connection stays up
    Ok(S),
    /// Tear the connection down and reconnect
    Disconnect(BoxError, S),
}

/// Three-way outcome of a payload-carrying callback
pub enum CallOutcome<T, S> {
    /// Success; the connection stays up
    Ok(T, S),
    /// The operation failed but the connection stays up
    Error(BoxError, S),
    /// Tear the connection down and reconnect
    Disconnect(BoxError, S),
}

/// Outcome of `handle_declare`
pub enum DeclareOutcome<Q, C, S> {
    /// A cursor was opened
    Ok(C, S),
    /// A cursor was opened and the query was substituted; the replacement is
    /// used for subsequent fetch/deallocate and handed to decode hooks
    Replace(Q, C, S),
    /// The operation failed but the connection stays up
    Error(BoxError, S),
    /// Tear the connection down and reconnect
    Disconnect(BoxError, S),
}

/// Outcome of `handle_fetch`
pub enum FetchOutcome<T, S> {
    /// A chunk of results; more remain
    Cont(T, S),
    /// The final chunk; the cursor is exhausted
    Halt(T, S),
    /// The operation failed but the connection stays up
    Error(BoxError, S),
    /// Tear the connection down and reconnect
    Disconnect(BoxError, S),
}

/// Capability set a database driver implements
///
/// `connect`, `disconnect`, check-out/check-in, the transaction callbacks,
/// `handle_query`, and the cursor callbacks are required. The rest default
/// the way a minimal driver would behave: `ping` succeeds, `handle_prepare`
/// returns the query unchanged, `handle_execute` forwards to `handle_query`,
/// `handle_close` and `handle_info` succeed.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Connection state threaded through every callback
    type State: Send + 'static;
    /// Query value carried by prepare/execute/declare/fetch
    type Query: Clone + Send + Sync + 'static;
    /// Parameter value carried by query/execute/declare
    type Params: Clone + Send + Sync + 'static;
    /// Result payload of query/execute/fetch and the transaction callbacks
    type Output: Send + 'static;
    /// Server-side cursor handle returned by declare
    type Cursor: Send + 'static;
    /// Asynchronous message from the environment
    type Info: Clone + Send + 'static;

    /// Establish a connection; may block on I/O. Called from the holder only.
    async fn connect(&self) -> Result<Self::State, BoxError>;

    /// Tear a connection down. Idempotent; always paired with a prior
    /// successful `connect`. `err` is what forced the teardown.
    async fn disconnect(&self, err: &crate::Error, state: Self::State);

    /// A client is seizing the connection
    async fn checkout(&self, state: Self::State) -> StateOutcome<Self::State>;

    /// The client released the connection
    async fn checkin(&self, state: Self::State) -> StateOutcome<Self::State>;

    /// Periodic liveness probe while the connection is idle
    async fn ping(&self, state: Self::State) -> StateOutcome<Self::State> {
        StateOutcome::Ok(state)
    }

    /// Open a transaction
    async fn handle_begin(
        &self,
        opts: &CallOptions,
        state: Self::State,
    ) -> CallOutcome<Self::Output, Self::State>;

    /// Commit the open transaction
    async fn handle_commit(
        &self,
        opts: &CallOptions,
        state: Self::State,
    ) -> CallOutcome<Self::Output, Self::State>;

    /// Roll the open transaction back
    async fn handle_rollback(
        &self,
        opts: &CallOptions,
        state: Self::State,
    ) -> CallOutcome<Self::Output, Self::State>;

    /// Prepare a query for later execution
    async fn handle_prepare(
        &self,
        query: Self::Query,
        opts: &CallOptions,
        state: Self::State,
    ) -> CallOutcome<Self::Query, Self::State> {
        let _ = opts;
        CallOutcome::Ok(query, state)
    }

    /// Run a query and return its full result
    async fn handle_query(
        &self,
        query: Self::Query,
        params: Self::Params,
        opts: &CallOptions,
        state: Self::State,
    ) -> CallOutcome<Self::Output, Self::State>;

    /// Run a previously prepared query
    async fn handle_execute(
        &self,
        query: Self::Query,
        params: Self::Params,
        opts: &CallOptions,
        state: Self::State,
    ) -> CallOutcome<Self::Output, Self::State> {
        self.handle_query(query, params, opts, state).await
    }

    /// Release a prepared query
    async fn handle_close(
        &self,
        query: Self::Query,
        opts: &CallOptions,
        state: Self::State,
    ) -> CallOutcome<(), Self::State> {
        let _ = (query, opts);
        CallOutcome::Ok((), state)
    }

    /// Open a server-side cursor
    async fn handle_declare(
        &self,
        query: Self::Query,
        params: Self::Params,
        opts: &CallOptions,
        state: Self::State,
    ) -> DeclareOutcome<Self::Query, Self::Cursor, Self::State>;

    /// Pull the next chunk from a cursor
    async fn handle_fetch(
        &self,
        query: &Self::Query,
        cursor: &mut Self::Cursor,
        opts: &CallOptions,
        state: Self::State,
    ) -> FetchOutcome<Self::Output, Self::State>;

    /// Release a cursor
    async fn handle_deallocate(
        &self,
        query: &Self::Query,
        cursor: Self::Cursor,
        opts: &CallOptions,
        state: Self::State,
    ) -> CallOutcome<(), Self::State>;

    /// Asynchronous message from the environment
    async fn handle_info(&self, msg: Self::Info, state: Self::State) -> StateOutcome<Self::State> {
        let _ = msg;
        StateOutcome::Ok(state)
    }
}
