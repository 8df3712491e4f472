//! Runtime configuration
//!
//! [`Config`] covers pool sizing, reconnect backoff, ping cadence, queue
//! deadlines, and the optional log hook. Per-call knobs travel separately in
//! [`CallOptions`], which is also what adapter callbacks receive.

use std::fmt;
use std::time::Duration;

use crate::adapter::Adapter;
use crate::backoff::{Backoff, BackoffKind};
use crate::log::LogHook;

/// Per-operation options, passed through to every adapter callback
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Deadline for the adapter callback; falls back to [`Config::timeout`]
    pub timeout: Option<Duration>,
    /// Fetch-batch size hint for `handle_declare`/`handle_fetch`
    pub max_rows: Option<usize>,
}

impl CallOptions {
    /// Options with a per-call deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Options with a fetch-batch size hint
    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }
}

/// Pool and connection-holder configuration
pub struct Config<A: Adapter> {
    /// Number of connection holders (default 1)
    pub pool_size: usize,
    /// Block startup until the first connect completes (default false)
    pub sync_connect: bool,
    /// Reconnect delay strategy (default exponential)
    pub backoff_kind: BackoffKind,
    /// Smallest reconnect delay (default 1s)
    pub backoff_min: Duration,
    /// Largest reconnect delay (default 30s)
    pub backoff_max: Duration,
    /// Idle time between pings while no client holds the connection (default 1s)
    pub idle_interval: Duration,
    /// How long a check-out may wait in the pool queue (default 5s)
    pub queue_timeout: Duration,
    /// Queue wait considered healthy for admission control (default 50ms)
    pub queue_target: Duration,
    /// Window over which queue health is judged (default 1s)
    pub queue_interval: Duration,
    /// Default deadline for each adapter callback (default 15s)
    pub timeout: Duration,
    /// Register the pool under this name for process-wide lookup
    pub name: Option<String>,
    /// User hook invoked with a [`crate::LogEntry`] per adapter call
    pub log: Option<LogHook<A::Query, A::Params>>,
}

impl<A: Adapter> Default for Config<A> {
    fn default() -> Self {
        Self {
            pool_size: 1,
            sync_connect: false,
            backoff_kind: BackoffKind::Exp,
            backoff_min: Backoff::DEFAULT_MIN,
            backoff_max: Backoff::DEFAULT_MAX,
            idle_interval: Duration::from_millis(1_000),
            queue_timeout: Duration::from_millis(5_000),
            queue_target: Duration::from_millis(50),
            queue_interval: Duration::from_millis(1_000),
            timeout: Duration::from_millis(15_000),
            name: None,
            log: None,
        }
    }
}

impl<A: Adapter> Clone for Config<A> {
    fn clone(&self) -> Self {
        Self {
            pool_size: self.pool_size,
            sync_connect: self.sync_connect,
            backoff_kind: self.backoff_kind,
            backoff_min: self.backoff_min,
            backoff_max: self.backoff_max,
            idle_interval: self.idle_interval,
            queue_timeout: self.queue_timeout,
            queue_target: self.queue_target,
            queue_interval: self.queue_interval,
            timeout: self.timeout,
            name: self.name.clone(),
            log: self.log.clone(),
        }
    }
}

impl<A: Adapter> fmt::Debug for Config<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("pool_size", &self.pool_size)
            .field("sync_connect", &self.sync_connect)
            .field("backoff_kind", &self.backoff_kind)
            .field("backoff_min", &self.backoff_min)
            .field("backoff_max", &self.backoff_max)
            .field("idle_interval", &self.idle_interval)
            .field("queue_timeout", &self.queue_timeout)
            .field("queue_target", &self.queue_target)
            .field("queue_interval", &self.queue_interval)
            .field("timeout", &self.timeout)
            .field("name", &self.name)
            .field("log", &self.log.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

impl<A: Adapter> Config<A> {
    /// Configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of connection holders
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    /// Block startup until the first connect completes
    pub fn with_sync_connect(mut self, sync: bool) -> Self {
        self.sync_connect = sync;
        self
    }

    /// Set the reconnect delay strategy
    pub fn with_backoff_kind(mut self, kind: BackoffKind) -> Self {
        self.backoff_kind = kind;
        self
    }

    /// Set the reconnect delay bounds
    pub fn with_backoff_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max;
        self
    }

    /// Set the idle ping interval
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Set the pool-queue deadline
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Set the admission-control knobs
    pub fn with_queue_health(mut self, target: Duration, interval: Duration) -> Self {
        self.queue_target = target;
        self.queue_interval = interval;
        self
    }

    /// Set the default per-operation adapter deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register the pool under a process-wide name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Install a log hook
    pub fn with_log(mut self, hook: LogHook<A::Query, A::Params>) -> Self {
        self.log = Some(hook);
        self
    }

    /// Backoff generator for one holder
    pub(crate) fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_kind, self.backoff_min, self.backoff_max)
    }
}
