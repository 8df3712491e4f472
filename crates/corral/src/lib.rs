//! # corral
//!
//! A database-client runtime: the layer between an application and a
//! driver-specific adapter.
//!
//! ## Features
//!
//! - **Connection supervision**: each pooled connection is owned by a
//!   single-threaded holder that reconnects on a backoff schedule, pings
//!   while idle, and survives misbehaving callbacks
//! - **Pooling**: check-out/check-in with FIFO waiters, deadlines, and
//!   admission control when the queue stops keeping up
//! - **Client state machine**: transactions, prepared queries, and cursors
//!   with misuse detected client-side before it can corrupt adapter state
//! - **Streaming**: lazy `declare`/`fetch`/`deallocate` sequences whose
//!   cursors are always released, with encode/decode hooks
//! - **Ownership**: reservations bound to principals for test isolation,
//!   shareable with other principals and revoked on termination
//! - **Timing hooks**: a structured [`LogEntry`] per adapter call
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use corral::prelude::*;
//!
//! let pool = Pool::start(MyAdapter::new(opts), Config::new().with_pool_size(4)).await?;
//!
//! let rows = pool
//!     .transaction(|client| async move {
//!         match client.query("SELECT * FROM users".into(), vec![]).await {
//!             Ok(rows) => TxOutcome::Commit(rows),
//!             Err(err) => TxOutcome::Error(err),
//!         }
//!     }.boxed())
//!     .await?;
//! ```
//!
//! Drivers implement the [`Adapter`] trait; everything else is provided by
//! the runtime. The [`testing`] module ships a scripted adapter for
//! deterministic tests.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapter;
pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
mod holder;
pub mod log;
pub mod ownership;
pub mod pool;
pub mod principal;
mod registry;
pub mod stream;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::adapter::{
        Adapter, CallOutcome, DeclareOutcome, FetchOutcome, StateOutcome,
    };
    pub use crate::backoff::{Backoff, BackoffKind};
    pub use crate::client::{Client, Cursor, Fetch, TxOutcome, TxStatus};
    pub use crate::config::{CallOptions, Config};
    pub use crate::error::{BoxError, Error, Result};
    pub use crate::log::{Call, LogEntry, LogHook};
    pub use crate::ownership::{
        AllowOutcome, CheckinOutcome, CheckoutOutcome, Ownership, OwnershipMode,
        OwnershipOptions, SharedClient,
    };
    pub use crate::pool::{Pool, PoolStatus};
    pub use crate::principal::{Principal, PrincipalId, PrincipalMonitor};
    pub use crate::stream::{DecodeHook, EncodeHook, QueryStream, StreamOptions};
}

// Re-export commonly used items at crate root
pub use adapter::Adapter;
pub use client::{Client, TxOutcome};
pub use config::Config;
pub use error::{Error, Result};
pub use log::LogEntry;
pub use ownership::Ownership;
pub use pool::Pool;
pub use principal::Principal;
