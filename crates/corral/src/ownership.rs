//! Ownership layer for test isolation
//!
//! An [`Ownership`] proxy wraps a [`Pool`] and reserves connections to
//! *principals*: a principal checks a connection out and holds it across
//! any number of operations, may let other principals share the
//! reservation, and everything is revoked when the owner checks back in or
//! terminates.
//!
//! In [`OwnershipMode::Manual`] a principal must check out explicitly
//! before operating; in [`OwnershipMode::Auto`] the first touch checks out
//! transparently.
//!
//! The proxy is a serial bookkeeping actor. It monitors every owner and
//! every allowed principal: an owner that terminates is implicitly checked
//! in (open transactions roll back best effort on the holder); a terminated
//! allowee is simply removed from the reservation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard};
use tracing::debug;

use crate::adapter::Adapter;
use crate::client::{Client, TxOutcome};
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::principal::{Principal, PrincipalId};
use crate::registry;

/// How principals acquire reservations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OwnershipMode {
    /// Explicit [`Ownership::checkout`] required before any operation
    #[default]
    Manual,
    /// First operation by an unknown principal checks out transparently
    Auto,
}

/// Options for an ownership proxy
#[derive(Debug, Clone, Default)]
pub struct OwnershipOptions {
    /// Acquisition mode (default manual)
    pub mode: OwnershipMode,
    /// Register the proxy under this name for process-wide lookup
    pub name: Option<String>,
}

impl OwnershipOptions {
    /// Options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the acquisition mode
    pub fn with_mode(mut self, mode: OwnershipMode) -> Self {
        self.mode = mode;
        self
    }

    /// Register the proxy under a process-wide name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Outcome of [`Ownership::checkout`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutOutcome {
    /// A connection was reserved
    Ok,
    /// The principal already owns a reservation
    AlreadyOwner,
    /// The principal is already allowed on another reservation
    AlreadyAllowed,
}

/// Outcome of [`Ownership::checkin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckinOutcome {
    /// The reservation was released
    Ok,
    /// The principal is allowed on the reservation but does not own it
    NotOwner,
    /// No reservation involves this principal
    NotFound,
}

/// Outcome of [`Ownership::allow`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowOutcome {
    /// The allowee now shares the reservation
    Ok,
    /// The allowee already shares a reservation
    AlreadyAllowed,
    /// The caller does not own a reservation
    NotOwner,
    /// No reservation exists for the caller
    NotFound,
}

/// A reserved connection shared between an owner and its allowed principals
///
/// Operations are serialized through [`lock`](Self::lock); the reservation
/// itself lives until the owner checks in or terminates.
#[derive(Debug)]
pub struct SharedClient<A: Adapter> {
    inner: Arc<Mutex<Client<A>>>,
}

impl<A: Adapter> Clone for SharedClient<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Adapter> SharedClient<A> {
    /// Exclusive access to the reserved connection
    pub async fn lock(&self) -> MutexGuard<'_, Client<A>> {
        self.inner.lock().await
    }
}

enum Msg<A: Adapter> {
    Checkout {
        principal: Principal,
        reply: oneshot::Sender<Result<CheckoutOutcome>>,
    },
    Checkin {
        principal: PrincipalId,
        reply: oneshot::Sender<CheckinOutcome>,
    },
    Allow {
        owner: PrincipalId,
        allowee: Principal,
        reply: oneshot::Sender<AllowOutcome>,
    },
    Resolve {
        principal: Principal,
        reply: oneshot::Sender<Result<SharedClient<A>>>,
    },
    SetMode {
        mode: OwnershipMode,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Ownership proxy over a pool
///
/// Cheap to clone; all clones drive the same reservation table.
pub struct Ownership<A: Adapter> {
    tx: mpsc::Sender<Msg<A>>,
}

impl<A: Adapter> Clone for Ownership<A> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<A: Adapter> std::fmt::Debug for Ownership<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ownership").finish()
    }
}

impl<A: Adapter> Ownership<A> {
    /// Start an ownership proxy over `pool`
    pub fn start(pool: Pool<A>, options: OwnershipOptions) -> Result<Ownership<A>> {
        let (tx, rx) = mpsc::channel(64);
        let proxy = Ownership { tx };

        if let Some(name) = &options.name {
            if !registry::register(name, proxy.clone()) {
                return Err(Error::connection(format!(
                    "name {name:?} is already registered"
                )));
            }
        }

        let actor = OwnershipActor {
            pool,
            mode: options.mode,
            name: options.name,
            rx,
            entries: HashMap::new(),
            index: HashMap::new(),
            revoked: HashSet::new(),
            monitors: FuturesUnordered::new(),
        };
        tokio::spawn(actor.run());
        Ok(proxy)
    }

    /// Resolve a proxy registered under `name`
    pub fn lookup(name: &str) -> Option<Ownership<A>> {
        registry::lookup::<Ownership<A>>(name)
    }

    /// Reserve a connection for `principal`
    pub async fn checkout(&self, principal: &Principal) -> Result<CheckoutOutcome> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Msg::Checkout {
                principal: principal.clone(),
                reply: tx,
            })
            .await
            .map_err(|_| Error::closed())?;
        rx.await.map_err(|_| Error::closed())?
    }

    /// Release `principal`'s reservation, revoking every allowed principal
    pub async fn checkin(&self, principal: &Principal) -> Result<CheckinOutcome> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Msg::Checkin {
                principal: principal.id(),
                reply: tx,
            })
            .await
            .map_err(|_| Error::closed())?;
        rx.await.map_err(|_| Error::closed())
    }

    /// Let `allowee` share `owner`'s reservation
    pub async fn allow(&self, owner: &Principal, allowee: &Principal) -> Result<AllowOutcome> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Msg::Allow {
                owner: owner.id(),
                allowee: allowee.clone(),
                reply: tx,
            })
            .await
            .map_err(|_| Error::closed())?;
        rx.await.map_err(|_| Error::closed())
    }

    /// Switch the acquisition mode
    pub async fn set_mode(&self, mode: OwnershipMode) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Msg::SetMode { mode, reply: tx })
            .await
            .map_err(|_| Error::closed())?;
        rx.await.map_err(|_| Error::closed())
    }

    /// The connection reserved for `principal` (owner or allowed). In auto
    /// mode an unknown principal is checked out transparently.
    pub async fn with_client(&self, principal: &Principal) -> Result<SharedClient<A>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Msg::Resolve {
                principal: principal.clone(),
                reply: tx,
            })
            .await
            .map_err(|_| Error::closed())?;
        rx.await.map_err(|_| Error::closed())?
    }

    /// Run `f` on the connection reserved for `principal`
    pub async fn run<T, F>(&self, principal: &Principal, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut Client<A>) -> BoxFuture<'c, Result<T>> + Send,
    {
        let shared = self.with_client(principal).await?;
        let mut client = shared.lock().await;
        f(&mut client).await
    }

    /// Run `f` inside a transaction on the reserved connection
    pub async fn transaction<T, F>(&self, principal: &Principal, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut Client<A>) -> BoxFuture<'c, TxOutcome<T>> + Send,
    {
        let shared = self.with_client(principal).await?;
        let mut client = shared.lock().await;
        client.transaction(f).await
    }

    /// Release every reservation and drop the name registration
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Msg::Shutdown { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct Entry<A: Adapter> {
    client: SharedClient<A>,
    allowed: HashSet<PrincipalId>,
}

struct OwnershipActor<A: Adapter> {
    pool: Pool<A>,
    mode: OwnershipMode,
    name: Option<String>,
    rx: mpsc::Receiver<Msg<A>>,
    /// Reservations by owner
    entries: HashMap<PrincipalId, Entry<A>>,
    /// Every involved principal (owner or allowed) to its owner
    index: HashMap<PrincipalId, PrincipalId>,
    /// Allowees whose reservation was released; they observe `NotOwner`
    /// until they terminate or acquire a reservation of their own
    revoked: HashSet<PrincipalId>,
    monitors: FuturesUnordered<BoxFuture<'static, PrincipalId>>,
}

impl<A: Adapter> OwnershipActor<A> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                msg = self.rx.recv() => match msg {
                    None => {
                        self.stop();
                        return;
                    }
                    Some(Msg::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                        return;
                    }
                    Some(msg) => self.handle(msg).await,
                },
                Some(id) = self.monitors.next() => {
                    self.principal_died(id);
                }
            }
        }
    }

    async fn handle(&mut self, msg: Msg<A>) {
        match msg {
            Msg::Checkout { principal, reply } => {
                let id = principal.id();
                let outcome = match self.index.get(&id) {
                    Some(owner) if *owner == id => Ok(CheckoutOutcome::AlreadyOwner),
                    Some(_) => Ok(CheckoutOutcome::AlreadyAllowed),
                    None => self
                        .reserve(principal)
                        .await
                        .map(|_| CheckoutOutcome::Ok),
                };
                let _ = reply.send(outcome);
            }
            Msg::Checkin { principal, reply } => {
                let outcome = match self.index.get(&principal) {
                    None if self.revoked.contains(&principal) => CheckinOutcome::NotOwner,
                    None => CheckinOutcome::NotFound,
                    Some(owner) if *owner != principal => CheckinOutcome::NotOwner,
                    Some(_) => {
                        self.drop_entry(principal);
                        CheckinOutcome::Ok
                    }
                };
                let _ = reply.send(outcome);
            }
            Msg::Allow {
                owner,
                allowee,
                reply,
            } => {
                let _ = reply.send(self.allow(owner, allowee));
            }
            Msg::Resolve { principal, reply } => {
                let existing = self
                    .index
                    .get(&principal.id())
                    .and_then(|owner| self.entries.get(owner))
                    .map(|entry| entry.client.clone());
                let outcome = match existing {
                    Some(client) => Ok(client),
                    None => match self.mode {
                        OwnershipMode::Manual => Err(Error::no_ownership()),
                        OwnershipMode::Auto => self.reserve(principal).await,
                    },
                };
                let _ = reply.send(outcome);
            }
            Msg::SetMode { mode, reply } => {
                self.mode = mode;
                let _ = reply.send(());
            }
            Msg::Shutdown { .. } => {}
        }
    }

    /// Check a connection out of the pool and reserve it for `principal`.
    async fn reserve(&mut self, principal: Principal) -> Result<SharedClient<A>> {
        let id = principal.id();
        self.revoked.remove(&id);
        let client = self.pool.checkout_as(&principal).await?;
        let shared = SharedClient {
            inner: Arc::new(Mutex::new(client)),
        };
        self.entries.insert(
            id,
            Entry {
                client: shared.clone(),
                allowed: HashSet::new(),
            },
        );
        self.index.insert(id, id);
        self.watch(&principal);
        debug!(principal = %id, "ownership reserved");
        Ok(shared)
    }

    fn allow(&mut self, owner: PrincipalId, allowee: Principal) -> AllowOutcome {
        match self.index.get(&owner) {
            None => AllowOutcome::NotFound,
            Some(real_owner) if *real_owner != owner => AllowOutcome::NotOwner,
            Some(_) => {
                let allowee_id = allowee.id();
                if self.index.contains_key(&allowee_id) {
                    return AllowOutcome::AlreadyAllowed;
                }
                if let Some(entry) = self.entries.get_mut(&owner) {
                    self.revoked.remove(&allowee_id);
                    entry.allowed.insert(allowee_id);
                    self.index.insert(allowee_id, owner);
                    self.watch(&allowee);
                    AllowOutcome::Ok
                } else {
                    AllowOutcome::NotFound
                }
            }
        }
    }

    fn watch(&mut self, principal: &Principal) {
        let mut monitor = principal.monitor();
        self.monitors.push(Box::pin(async move {
            monitor.terminated().await;
            monitor.id()
        }));
    }

    fn principal_died(&mut self, id: PrincipalId) {
        self.revoked.remove(&id);
        if self.entries.contains_key(&id) {
            debug!(principal = %id, "owner terminated, implicit checkin");
            self.drop_entry(id);
        } else if let Some(owner) = self.index.get(&id).copied() {
            debug!(principal = %id, "allowee terminated, revoking");
            if let Some(entry) = self.entries.get_mut(&owner) {
                entry.allowed.remove(&id);
            }
            self.index.remove(&id);
        }
    }

    /// Release a reservation: revoke every allowed principal and return the
    /// connection to the pool (the client checks in when the last holder of
    /// the shared handle lets go).
    fn drop_entry(&mut self, owner: PrincipalId) {
        if let Some(entry) = self.entries.remove(&owner) {
            for allowee in &entry.allowed {
                self.index.remove(allowee);
                self.revoked.insert(*allowee);
            }
            self.index.remove(&owner);
        }
    }

    fn stop(&mut self) {
        let owners: Vec<PrincipalId> = self.entries.keys().copied().collect();
        for owner in owners {
            self.drop_entry(owner);
        }
        if let Some(name) = &self.name {
            registry::deregister(name);
        }
    }
}
