//! Connection pool
//!
//! The pool multiplexes callers onto a fixed set of connection holders. A
//! check-out either takes an idle holder immediately or parks the caller in
//! a FIFO of waiters with a deadline; check-ins hand connections straight to
//! the longest-waiting caller. The pool itself is a serial bookkeeping
//! actor: no I/O ever happens on its task.
//!
//! Queue health is watched over a sliding window: when most grants in the
//! previous window waited longer than `queue_target`, new waiters are
//! refused immediately until the queue drains (admission control).
//!
//! Holders that stop after a protocol violation are respawned from scratch;
//! holders whose backoff is `Stop` stay down.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::adapter::Adapter;
use crate::backoff::BackoffKind;
use crate::client::{Client, TxOutcome};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::holder::{self, Command, HolderEvent, HolderHandle};
use crate::principal::{Principal, PrincipalMonitor};
use crate::registry;

/// Point-in-time pool introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Configured number of holders
    pub size: usize,
    /// Holders currently connected
    pub connected: usize,
    /// Connected holders free for check-out
    pub idle: usize,
    /// Callers parked waiting for a connection
    pub waiting: usize,
}

enum PoolMsg<A: Adapter> {
    Checkout {
        reply: oneshot::Sender<Result<HolderHandle<A>>>,
    },
    Status {
        reply: oneshot::Sender<PoolStatus>,
    },
    Broadcast {
        msg: A::Info,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A pool of database connections
///
/// Cheap to clone; all clones drive the same pool. The pool shuts down when
/// [`shutdown`](Self::shutdown) is called, or when every clone is dropped
/// and no name registration keeps it alive.
pub struct Pool<A: Adapter> {
    tx: mpsc::Sender<PoolMsg<A>>,
    config: Arc<Config<A>>,
}

impl<A: Adapter> Clone for Pool<A> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<A: Adapter> std::fmt::Debug for Pool<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("config", &self.config).finish()
    }
}

impl<A: Adapter> Pool<A> {
    /// Start a pool.
    ///
    /// With `sync_connect` the first connect of every holder happens before
    /// this returns; a failure aborts startup when the backoff is
    /// [`BackoffKind::Stop`] and otherwise falls back to reconnecting in
    /// the background.
    pub async fn start(adapter: A, config: Config<A>) -> Result<Pool<A>> {
        let adapter = Arc::new(adapter);
        let config = Arc::new(config);

        let mut initial = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            if config.sync_connect {
                match holder::guard(adapter.connect(), config.timeout).await {
                    Ok(Ok(state)) => initial.push(Some(state)),
                    Ok(Err(cause)) => {
                        if config.backoff_kind == BackoffKind::Stop {
                            return Err(Error::database(cause));
                        }
                        initial.push(None);
                    }
                    Err(holder::GuardFailure::TimedOut(after)) => {
                        if config.backoff_kind == BackoffKind::Stop {
                            return Err(Error::operation_timeout(after));
                        }
                        initial.push(None);
                    }
                    Err(holder::GuardFailure::Panicked(msg)) => {
                        if config.backoff_kind == BackoffKind::Stop {
                            return Err(Error::connection(format!("connect raised: ** (panic) {msg}")));
                        }
                        initial.push(None);
                    }
                }
            } else {
                initial.push(None);
            }
        }

        let (events_tx, events_rx) = mpsc::channel(64);
        let mut holders = Vec::with_capacity(config.pool_size);
        for (id, state) in initial.into_iter().enumerate() {
            holders.push(holder::spawn(
                id,
                Arc::clone(&adapter),
                Arc::clone(&config),
                events_tx.clone(),
                state,
            ));
        }

        let (tx, rx) = mpsc::channel(64);
        let pool = Pool {
            tx,
            config: Arc::clone(&config),
        };

        if let Some(name) = &config.name {
            if !registry::register(name, pool.clone()) {
                return Err(Error::connection(format!(
                    "name {name:?} is already registered"
                )));
            }
        }

        let actor = PoolActor {
            adapter,
            config,
            rx,
            events_tx,
            events_rx,
            holders,
            idle: VecDeque::new(),
            connected: HashSet::new(),
            stopped: HashSet::new(),
            waiters: VecDeque::new(),
            window: AdmissionWindow::new(),
        };
        tokio::spawn(actor.run());

        Ok(pool)
    }

    /// Resolve a pool registered under `name`
    pub fn lookup(name: &str) -> Option<Pool<A>> {
        registry::lookup::<Pool<A>>(name)
    }

    /// Check a connection out for an implicitly created principal that
    /// lives as long as the returned client.
    pub async fn checkout(&self) -> Result<Client<A>> {
        let principal = Principal::new();
        let monitor = principal.monitor();
        self.do_checkout(monitor, Some(principal)).await
    }

    /// Check a connection out on behalf of `principal`; the connection is
    /// reclaimed if the principal terminates while holding it.
    pub async fn checkout_as(&self, principal: &Principal) -> Result<Client<A>> {
        self.do_checkout(principal.monitor(), None).await
    }

    async fn do_checkout(
        &self,
        monitor: PrincipalMonitor,
        principal: Option<Principal>,
    ) -> Result<Client<A>> {
        let started = Instant::now();
        let attempt = async {
            loop {
                let (tx, rx) = oneshot::channel();
                if self.tx.send(PoolMsg::Checkout { reply: tx }).await.is_err() {
                    return Err(Error::closed());
                }
                let handle = match rx.await {
                    Ok(granted) => granted?,
                    Err(_) => return Err(Error::closed()),
                };

                let (tx, rx) = oneshot::channel();
                if handle
                    .tx
                    .send(Command::Checkout {
                        monitor: monitor.clone(),
                        reply: tx,
                    })
                    .await
                    .is_err()
                {
                    continue;
                }
                match rx.await {
                    Ok(Ok(lease)) => return Ok((handle, lease)),
                    // The holder lost its connection between the grant and
                    // the seize; ask the pool again.
                    Ok(Err(_)) | Err(_) => continue,
                }
            }
        };

        let (handle, lease) = tokio::time::timeout(self.config.queue_timeout, attempt)
            .await
            .map_err(|_| Error::queue_timeout())??;

        Ok(Client::new(
            handle,
            lease,
            &self.config,
            Some(started.elapsed()),
            principal,
        ))
    }

    /// Check out, run `f`, check back in.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut Client<A>) -> futures::future::BoxFuture<'c, Result<T>> + Send,
    {
        let mut client = self.checkout().await?;
        let result = f(&mut client).await;
        client.checkin().await;
        result
    }

    /// Check out, run `f` inside a transaction, check back in.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut Client<A>) -> futures::future::BoxFuture<'c, TxOutcome<T>> + Send,
    {
        let mut client = self.checkout().await?;
        let result = client.transaction(f).await;
        client.checkin().await;
        result
    }

    /// Deliver an environment message to every holder's adapter state
    pub async fn broadcast_info(&self, msg: A::Info) {
        let _ = self.tx.send(PoolMsg::Broadcast { msg }).await;
    }

    /// Snapshot the pool's bookkeeping
    pub async fn status(&self) -> Result<PoolStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(PoolMsg::Status { reply: tx })
            .await
            .map_err(|_| Error::closed())?;
        rx.await.map_err(|_| Error::closed())
    }

    /// Stop the pool: fail parked waiters, disconnect every holder, and
    /// drop the name registration.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(PoolMsg::Shutdown { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct Waiter<A: Adapter> {
    deadline: Instant,
    enqueued: Instant,
    reply: oneshot::Sender<Result<HolderHandle<A>>>,
}

/// Sliding-window queue health. When a strict majority of grants in the
/// previous window waited longer than `queue_target`, new waiters are
/// refused immediately.
struct AdmissionWindow {
    started: Option<Instant>,
    slow: u32,
    total: u32,
    prev_slow: u32,
    prev_total: u32,
}

impl AdmissionWindow {
    fn new() -> Self {
        Self {
            started: None,
            slow: 0,
            total: 0,
            prev_slow: 0,
            prev_total: 0,
        }
    }

    fn roll(&mut self, now: Instant, interval: Duration) {
        let started = *self.started.get_or_insert(now);
        if now.duration_since(started) >= interval {
            self.prev_slow = self.slow;
            self.prev_total = self.total;
            self.slow = 0;
            self.total = 0;
            self.started = Some(now);
        }
    }

    fn record(&mut self, wait: Duration, target: Duration, interval: Duration) {
        let now = Instant::now();
        self.roll(now, interval);
        self.total += 1;
        if wait > target {
            self.slow += 1;
        }
    }

    fn overloaded(&mut self, interval: Duration) -> bool {
        self.roll(Instant::now(), interval);
        self.prev_total > 0 && self.prev_slow * 2 > self.prev_total
    }
}

struct PoolActor<A: Adapter> {
    adapter: Arc<A>,
    config: Arc<Config<A>>,
    rx: mpsc::Receiver<PoolMsg<A>>,
    events_tx: mpsc::Sender<HolderEvent>,
    events_rx: mpsc::Receiver<HolderEvent>,
    holders: Vec<HolderHandle<A>>,
    idle: VecDeque<usize>,
    connected: HashSet<usize>,
    stopped: HashSet<usize>,
    waiters: VecDeque<Waiter<A>>,
    window: AdmissionWindow,
}

impl<A: Adapter> PoolActor<A> {
    async fn run(mut self) {
        loop {
            let expiry = self
                .waiters
                .front()
                .map(|w| w.deadline)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            let has_waiters = !self.waiters.is_empty();

            tokio::select! {
                biased;
                msg = self.rx.recv() => match msg {
                    None => {
                        self.stop().await;
                        return;
                    }
                    Some(PoolMsg::Shutdown { reply }) => {
                        self.stop().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(PoolMsg::Checkout { reply }) => self.checkout(reply),
                    Some(PoolMsg::Status { reply }) => {
                        let _ = reply.send(PoolStatus {
                            size: self.holders.len(),
                            connected: self.connected.len(),
                            idle: self.idle.len(),
                            waiting: self.waiters.len(),
                        });
                    }
                    Some(PoolMsg::Broadcast { msg }) => {
                        for handle in &self.holders {
                            let _ = handle.tx.try_send(Command::Info { msg: msg.clone() });
                        }
                    }
                },
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.holder_event(event);
                    }
                }
                _ = tokio::time::sleep_until(expiry), if has_waiters => self.expire_waiters(),
            }
        }
    }

    fn checkout(&mut self, reply: oneshot::Sender<Result<HolderHandle<A>>>) {
        if self.window.overloaded(self.config.queue_interval) {
            debug!("queue unhealthy, refusing waiter");
            let _ = reply.send(Err(Error::queue_timeout()));
            return;
        }
        if let Some(id) = self.idle.pop_front() {
            self.window.record(
                Duration::ZERO,
                self.config.queue_target,
                self.config.queue_interval,
            );
            if reply.send(Ok(self.holders[id].clone())).is_err() {
                // The caller gave up; keep the holder available.
                self.idle.push_front(id);
            }
            return;
        }
        let now = Instant::now();
        self.waiters.push_back(Waiter {
            deadline: now + self.config.queue_timeout,
            enqueued: now,
            reply,
        });
    }

    fn holder_event(&mut self, event: HolderEvent) {
        match event {
            HolderEvent::Idle(id) => {
                self.connected.insert(id);
                self.grant_or_park(id);
            }
            HolderEvent::Disconnected(id) => {
                self.connected.remove(&id);
                self.idle.retain(|&h| h != id);
            }
            HolderEvent::Stopped { id, restart } => {
                self.connected.remove(&id);
                self.idle.retain(|&h| h != id);
                if restart {
                    warn!(holder = id, "holder stopped, respawning");
                    self.holders[id] = holder::spawn(
                        id,
                        Arc::clone(&self.adapter),
                        Arc::clone(&self.config),
                        self.events_tx.clone(),
                        None,
                    );
                } else {
                    warn!(holder = id, "holder stopped permanently");
                    self.stopped.insert(id);
                }
            }
        }
    }

    /// Hand a freshly idle holder to the longest-waiting live caller, or
    /// park it in the idle queue.
    fn grant_or_park(&mut self, id: usize) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.reply.is_closed() {
                continue;
            }
            if Instant::now() >= waiter.deadline {
                let _ = waiter.reply.send(Err(Error::queue_timeout()));
                continue;
            }
            self.window.record(
                waiter.enqueued.elapsed(),
                self.config.queue_target,
                self.config.queue_interval,
            );
            if waiter.reply.send(Ok(self.holders[id].clone())).is_ok() {
                return;
            }
        }
        if !self.idle.contains(&id) {
            self.idle.push_back(id);
        }
    }

    fn expire_waiters(&mut self) {
        let now = Instant::now();
        while let Some(waiter) = self.waiters.front() {
            if waiter.deadline > now && !waiter.reply.is_closed() {
                break;
            }
            if let Some(waiter) = self.waiters.pop_front() {
                let _ = waiter.reply.send(Err(Error::queue_timeout()));
            }
        }
    }

    async fn stop(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.reply.send(Err(Error::connection("pool is shutting down")));
        }
        if let Some(name) = &self.config.name {
            registry::deregister(name);
        }
        // Dropping the handles closes every holder's mailbox; connected
        // holders disconnect their adapter state on the way out.
        self.holders.clear();
        self.idle.clear();
        self.connected.clear();
    }
}
