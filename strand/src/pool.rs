//! Connection pool with fixed core and elastic bench connections
//!
//! Connections are grouped per connection name into
//! `{Master, Slave} x {Core, Bench}`. Core connections are created for
//! `num_connection`, bench connections for the remainder up to
//! `max_num_connection`. All of them start closed and are opened on demand.
//!
//! A caller that finds nothing available is queued as a waiter. Waiters are
//! served FIFO per key when a connection of their group becomes idle: the
//! pool listens to `connection.state_changed.idle` and
//! `connection.state_changed.transaction_idle` for that. A connection that
//! gets closed under its waiters (timeout, cancellation, a lost transaction)
//! is handed to the head waiter to reopen, and the waiters of the transaction
//! it was bound to are rejected.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DatabaseConfig, ReaperConfig, Role};
use crate::connection::{
    Claim, Connection, ConnectionEvent, ConnectionEvents, ConnectionState,
};
use crate::driver::Connector;
use crate::error::{Error, Result};
use crate::event::{ListenerId, Propagation};
use crate::promise::{self, Deferred, Promise};
use crate::query::Statement;
use crate::row::{FetchMode, QueryResult};
use crate::transaction::TxBinding;

/// Backpressure gate: resolves once the wait-list is below its threshold.
pub type Gate = Shared<Promise<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Core,
    Bench,
}

#[derive(Default)]
struct Group {
    core: Vec<Arc<Connection>>,
    bench: Vec<Arc<Connection>>,
}

impl Group {
    fn tier(&self, tier: Tier) -> &[Arc<Connection>] {
        match tier {
            Tier::Core => &self.core,
            Tier::Bench => &self.bench,
        }
    }

    fn tier_mut(&mut self, tier: Tier) -> &mut Vec<Arc<Connection>> {
        match tier {
            Tier::Core => &mut self.core,
            Tier::Bench => &mut self.bench,
        }
    }

    fn is_empty(&self) -> bool {
        self.core.is_empty() && self.bench.is_empty()
    }

    fn all(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.core.iter().chain(self.bench.iter())
    }
}

#[derive(Default)]
struct RoleGroups {
    master: Group,
    slave: Group,
}

impl RoleGroups {
    fn get(&self, role: Role) -> &Group {
        match role {
            Role::Master => &self.master,
            Role::Slave => &self.slave,
        }
    }

    fn get_mut(&mut self, role: Role) -> &mut Group {
        match role {
            Role::Master => &mut self.master,
            Role::Slave => &mut self.slave,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum WaitKey {
    Pool { name: String, role: Role },
    Transaction(Uuid),
}

struct Waiter {
    id: u64,
    deferred: Deferred<Lease>,
}

#[derive(Default)]
struct Waiters {
    queues: HashMap<WaitKey, VecDeque<Waiter>>,
    pending: usize,
    next_id: u64,
    gate: Option<(Deferred<()>, Gate)>,
}

impl Waiters {
    fn has_waiters(&self, key: &WaitKey) -> bool {
        self.queues.get(key).is_some_and(|q| !q.is_empty())
    }

    fn push(&mut self, key: WaitKey, deferred: Deferred<Lease>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.queues
            .entry(key)
            .or_default()
            .push_back(Waiter { id, deferred });
        self.pending += 1;
        id
    }

    fn pop(&mut self, key: &WaitKey) -> Option<Waiter> {
        let queue = self.queues.get_mut(key)?;
        let waiter = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(key);
        }
        if waiter.is_some() {
            self.pending -= 1;
        }
        waiter
    }

    fn remove(&mut self, key: &WaitKey, id: u64) -> bool {
        let Some(queue) = self.queues.get_mut(key) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|w| w.id != id);
        let removed = queue.len() != before;
        if queue.is_empty() {
            self.queues.remove(key);
        }
        if removed {
            self.pending -= 1;
        }
        removed
    }

    fn drain(&mut self, key: &WaitKey) -> VecDeque<Waiter> {
        let drained = self.queues.remove(key).unwrap_or_default();
        self.pending -= drained.len();
        drained
    }

    fn release_gate(&mut self, threshold: usize) {
        if self.pending < threshold {
            if let Some((deferred, _)) = self.gate.take() {
                let _ = deferred.resolve(());
            }
        }
    }
}

struct PoolInner {
    groups: HashMap<String, RoleGroups>,
    waiters: Mutex<Waiters>,
    waiting_list_size: usize,
    waiting_time: Duration,
    reaper: ReaperConfig,
    events: Arc<ConnectionEvents>,
    listeners: Vec<ListenerId>,
}

impl PoolInner {
    fn role_group(&self, name: &str, role: Role) -> Option<&Group> {
        self.groups.get(name).map(|roles| roles.get(role))
    }

    /// Resolve the group for a request, falling back to master.
    fn resolve_group(&self, name: &str, role: Role) -> Result<(Role, &Group)> {
        let roles = self
            .groups
            .get(name)
            .ok_or_else(|| Error::Configuration(format!("unknown connection name '{}'", name)))?;
        let group = roles.get(role);
        if !group.is_empty() {
            return Ok((role, group));
        }
        let master = roles.get(Role::Master);
        if master.is_empty() {
            return Err(Error::Configuration(format!(
                "connection '{}' has no master connections",
                name
            )));
        }
        Ok((Role::Master, master))
    }

    /// Claim an idle connection, else a closed one to open; core before bench.
    fn claim_from(
        &self,
        group: &Group,
        tried: &HashSet<u64>,
    ) -> Option<(Arc<Connection>, Claim)> {
        let mut rng = rand::thread_rng();
        for tier in [Tier::Core, Tier::Bench] {
            let mut candidates: Vec<&Arc<Connection>> = group.tier(tier).iter().collect();
            candidates.shuffle(&mut rng);

            for conn in &candidates {
                if conn.state() != ConnectionState::Idle {
                    continue;
                }
                match conn.try_claim(None) {
                    Claim::Busy => continue,
                    claim => return Some((Arc::clone(conn), claim)),
                }
            }
            for conn in &candidates {
                if tried.contains(&conn.id()) || conn.state() != ConnectionState::Closed {
                    continue;
                }
                match conn.try_claim(None) {
                    Claim::Busy => continue,
                    claim => return Some((Arc::clone(conn), claim)),
                }
            }
        }
        None
    }

    fn enqueue(self: &Arc<Self>, waiters: &mut Waiters, key: WaitKey) -> AcquireState {
        let (deferred, promise) = promise::channel();
        let id = waiters.push(key.clone(), deferred);
        debug!(waiter = id, key = ?key, pending = waiters.pending, "queued for a connection");
        AcquireState::Waiting {
            promise,
            guard: WaiterGuard {
                pool: Arc::downgrade(self),
                key,
                id,
            },
            deadline: None,
        }
    }

    /// Hand an available connection to the oldest live waiter of its key.
    ///
    /// A closed connection is handed over claimed for opening; the waiter
    /// opens it.
    /// A connection was closed: fail the waiters of the transaction it lost,
    /// then offer it for reopening.
    fn on_closed(self: &Arc<Self>, event: &ConnectionEvent) {
        if let Some(id) = event.transaction {
            self.reject_transaction_waiters(id, "lost its connection");
        }
        self.serve(&event.connection);
    }

    fn reject_transaction_waiters(&self, id: Uuid, reason: &str) {
        let drained = {
            let mut waiters = self.waiters.lock();
            let drained = waiters.drain(&WaitKey::Transaction(id));
            waiters.release_gate(self.waiting_list_size);
            drained
        };
        for waiter in drained {
            waiter
                .deferred
                .reject(Error::TransactionClosed(format!("transaction {} {}", id, reason)));
        }
    }

    fn serve(self: &Arc<Self>, conn: &Arc<Connection>) {
        let transaction = conn.transaction();
        let key = match transaction {
            Some(id) => WaitKey::Transaction(id),
            None => WaitKey::Pool {
                name: conn.name().to_string(),
                role: conn.role(),
            },
        };

        let leftover = {
            let mut waiters = self.waiters.lock();
            if !waiters.has_waiters(&key) || conn.try_claim(transaction) == Claim::Busy {
                return;
            }
            let mut lease = Lease::new(Arc::clone(conn), self);
            let leftover = loop {
                let Some(waiter) = waiters.pop(&key) else {
                    break Some(lease);
                };
                match waiter.deferred.resolve(lease) {
                    Ok(()) => {
                        debug!(waiter = waiter.id, connection = conn.id(), "waiter served");
                        break None;
                    }
                    // The waiter went away; offer the connection to the next one
                    Err(returned) => lease = returned,
                }
            };
            waiters.release_gate(self.waiting_list_size);
            leftover
        };
        drop(leftover);
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for id in &self.listeners {
            self.events.forget(*id);
        }
    }
}

/// Handle on the pool; cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("names", &self.inner.groups.keys().collect::<Vec<_>>())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Snapshot of one (name, role) group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub core: usize,
    pub bench: usize,
    pub open: usize,
    pub idle: usize,
    pub working: usize,
    pub pending: usize,
}

/// Outcome of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
    pub pinged: usize,
    pub closed: usize,
}

impl ConnectionPool {
    /// Build every connection described by the configuration, all closed.
    pub fn new(
        config: &DatabaseConfig,
        connector: Arc<dyn Connector>,
        events: Arc<ConnectionEvents>,
    ) -> Result<Self> {
        config.validate()?;

        let mut groups: HashMap<String, RoleGroups> = HashMap::new();
        for (name, servers) in &config.connections {
            let roles = groups.entry(name.clone()).or_default();
            for server in servers {
                let group = roles.get_mut(server.role);
                for (tier, count) in [
                    (Tier::Core, server.num_connection),
                    (Tier::Bench, server.bench_size()),
                ] {
                    for _ in 0..count {
                        group.tier_mut(tier).push(Connection::new(
                            name.clone(),
                            server.clone(),
                            Arc::clone(&connector),
                            Arc::clone(&events),
                        ));
                    }
                }
            }
        }

        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner>| {
            let mut listeners: Vec<ListenerId> =
                [ConnectionState::Idle, ConnectionState::TransactionIdle]
                    .iter()
                    .map(|state| {
                        let pool = weak.clone();
                        events.listen(state.event_name(), move |_, event: &ConnectionEvent| {
                            if let Some(pool) = pool.upgrade() {
                                pool.serve(&event.connection);
                            }
                            Propagation::Continue
                        })
                    })
                    .collect();
            let pool = weak.clone();
            listeners.push(events.listen(
                ConnectionState::Closed.event_name(),
                move |_, event: &ConnectionEvent| {
                    if let Some(pool) = pool.upgrade() {
                        pool.on_closed(event);
                    }
                    Propagation::Continue
                },
            ));

            PoolInner {
                groups,
                waiters: Mutex::new(Waiters::default()),
                waiting_list_size: config.connection_waiting_list_size,
                waiting_time: config.connection_waiting_time(),
                reaper: config.reaper.clone(),
                events: Arc::clone(&events),
                listeners,
            }
        });

        Ok(Self { inner })
    }

    /// Get a connection of `name` with `role` (master when none of `role` exists).
    ///
    /// Fails synchronously with [`Error::Configuration`] for an unknown name.
    /// Otherwise an idle connection is claimed right away, a closed one is
    /// opened, or the caller is queued. Dropping the returned future before
    /// it completes removes the caller from the wait-list.
    pub fn get_connection(&self, name: &str, role: Role) -> Result<Acquire> {
        let (role, group) = self.inner.resolve_group(name, role)?;
        let key = WaitKey::Pool {
            name: name.to_string(),
            role,
        };

        let mut waiters = self.inner.waiters.lock();
        let state = match self.inner.claim_from(group, &HashSet::new()) {
            Some((conn, Claim::Ready)) => AcquireState::Ready(Some(Lease::new(conn, &self.inner))),
            Some((conn, _)) => AcquireState::opening(Lease::new(conn, &self.inner)),
            None => self.inner.enqueue(&mut waiters, key.clone()),
        };
        drop(waiters);

        Ok(self.acquire(key, state))
    }

    /// Get the connection bound to a transaction, queueing behind its
    /// in-flight statement if needed.
    pub(crate) fn acquire_for_transaction(&self, binding: &Arc<TxBinding>) -> Result<Acquire> {
        if binding.is_closed() {
            return Err(Error::TransactionClosed(format!(
                "transaction {} is closed",
                binding.id()
            )));
        }
        let conn = binding.connection().ok_or_else(|| {
            Error::NotReady(format!("transaction {} has not started", binding.id()))
        })?;
        let key = WaitKey::Transaction(binding.id());

        let mut waiters = self.inner.waiters.lock();
        let state = match conn.try_claim(Some(binding.id())) {
            Claim::Ready => AcquireState::Ready(Some(Lease::new(conn, &self.inner))),
            _ if conn.transaction() != Some(binding.id()) => {
                return Err(Error::TransactionClosed(format!(
                    "transaction {} lost its connection",
                    binding.id()
                )));
            }
            _ => self.inner.enqueue(&mut waiters, key.clone()),
        };
        drop(waiters);

        Ok(self.acquire(key, state))
    }

    fn acquire(&self, key: WaitKey, state: AcquireState) -> Acquire {
        Acquire {
            pool: Arc::clone(&self.inner),
            key,
            state,
            tried: HashSet::new(),
            waiting_time: self.inner.waiting_time,
        }
    }

    /// Reject every waiter queued on a transaction.
    pub(crate) fn drain_transaction(&self, id: Uuid) {
        self.inner.reject_transaction_waiters(id, "closed while waiting");
    }

    /// Backpressure gate.
    ///
    /// Resolved immediately while fewer than `connection_waiting_list_size`
    /// callers wait; otherwise the single shared gate, released once the
    /// wait-list drops below the threshold.
    pub fn pending_threshold_lock(&self) -> Gate {
        let mut waiters = self.inner.waiters.lock();
        if waiters.pending < self.inner.waiting_list_size {
            return Promise::resolved(()).shared();
        }
        if let Some((_, gate)) = &waiters.gate {
            return gate.clone();
        }
        let (deferred, promise) = promise::channel();
        let gate = promise.shared();
        waiters.gate = Some((deferred, gate.clone()));
        gate
    }

    /// Callers currently waiting for a connection.
    pub fn pending_count(&self) -> usize {
        self.inner.waiters.lock().pending
    }

    /// Connection names known to the pool.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.groups.keys().map(String::as_str)
    }

    /// Connections of a group, core first.
    pub fn connections(&self, name: &str, role: Role) -> Vec<Arc<Connection>> {
        self.inner
            .role_group(name, role)
            .map(|group| group.all().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self, name: &str, role: Role) -> Option<PoolStats> {
        let group = self.inner.role_group(name, role)?;
        let mut stats = PoolStats {
            core: group.core.len(),
            bench: group.bench.len(),
            ..PoolStats::default()
        };
        for conn in group.all() {
            match conn.state() {
                ConnectionState::Closed => {}
                ConnectionState::Idle => {
                    stats.open += 1;
                    stats.idle += 1;
                }
                _ => {
                    stats.open += 1;
                    stats.working += 1;
                }
            }
        }
        let key = WaitKey::Pool {
            name: name.to_string(),
            role,
        };
        stats.pending = self
            .inner
            .waiters
            .lock()
            .queues
            .get(&key)
            .map_or(0, VecDeque::len);
        Some(stats)
    }

    /// One maintenance pass over every idle connection.
    ///
    /// Core connections older than `core_max_age` are closed, those idle for
    /// `core_ping_after` are pinged (and closed when the ping fails). Bench
    /// connections idle for `bench_max_idle` or older than `core_max_age`
    /// are closed. Busy or claimed connections are never touched.
    pub async fn reap(&self) -> ReapStats {
        let max_age = Duration::from_secs(self.inner.reaper.core_max_age);
        let ping_after = Duration::from_secs(self.inner.reaper.core_ping_after);
        let bench_idle = Duration::from_secs(self.inner.reaper.bench_max_idle);
        let mut stats = ReapStats::default();

        for roles in self.inner.groups.values() {
            for role in [Role::Master, Role::Slave] {
                let group = roles.get(role);
                for conn in &group.core {
                    let too_old = conn.connected_duration().is_some_and(|age| age >= max_age);
                    if too_old {
                        if conn.close_if_idle() {
                            stats.closed += 1;
                        }
                    } else if conn.stayed_over(ConnectionState::Idle, ping_after)
                        && !conn.is_claimed()
                    {
                        stats.pinged += 1;
                        if conn.ping().await {
                            self.inner.serve(conn);
                        } else {
                            stats.closed += 1;
                        }
                    }
                }
                for conn in &group.bench {
                    let expired = conn.stayed_over(ConnectionState::Idle, bench_idle)
                        || conn.connected_duration().is_some_and(|age| age >= max_age);
                    if expired && conn.close_if_idle() {
                        stats.closed += 1;
                    }
                }
            }
        }

        if stats.pinged > 0 || stats.closed > 0 {
            info!(
                pinged = stats.pinged,
                closed = stats.closed,
                "reaper pass finished"
            );
        }
        stats
    }

    /// Run [`ConnectionPool::reap`] every `reaper.interval` seconds until the
    /// pool is dropped.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let pool = Arc::downgrade(&self.inner);
        let period = Duration::from_secs(self.inner.reaper.interval.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                ConnectionPool { inner }.reap().await;
            }
        })
    }

    /// Close every connection and cancel every waiter.
    pub fn shutdown(&self) {
        let drained: Vec<Waiter> = {
            let mut waiters = self.inner.waiters.lock();
            let keys: Vec<WaitKey> = waiters.queues.keys().cloned().collect();
            let drained = keys
                .iter()
                .flat_map(|key| waiters.drain(key))
                .collect();
            waiters.release_gate(self.inner.waiting_list_size);
            drained
        };
        for waiter in drained {
            waiter
                .deferred
                .reject(Error::Cancelled("connection pool shut down".into()));
        }
        for roles in self.inner.groups.values() {
            for conn in roles.master.all().chain(roles.slave.all()) {
                conn.close();
            }
        }
        warn!("connection pool shut down");
    }
}

/// A connection reserved for one caller until a statement is dispatched on it.
///
/// Dropping an unused lease makes the connection available again, and offers
/// it to the next waiter (reopened first if it was closed meanwhile).
pub struct Lease {
    connection: Arc<Connection>,
    pool: Weak<PoolInner>,
    armed: bool,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("connection", &self.connection.id())
            .finish()
    }
}

impl Lease {
    fn new(connection: Arc<Connection>, pool: &Arc<PoolInner>) -> Self {
        Self {
            connection,
            pool: Arc::downgrade(pool),
            armed: true,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Dispatch a statement on the leased connection, consuming the lease.
    pub fn query(mut self, statement: Statement, fetch: FetchMode) -> Result<Promise<QueryResult>> {
        let promise = self.connection.query(statement, fetch)?;
        self.armed = false;
        Ok(promise)
    }

    /// Give up the claim without offering the connection to waiters.
    fn discard(mut self) {
        self.armed = false;
        self.connection.release_claim();
    }

    /// Bind the leased connection to a transaction.
    pub(crate) fn bind_transaction(&self, id: Uuid) -> Result<()> {
        self.connection.begin_transaction(id)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.armed && self.connection.release_claim() {
            if let Some(pool) = self.pool.upgrade() {
                pool.serve(&self.connection);
            }
        }
    }
}

/// Removes its waiter from the wait-list when dropped.
struct WaiterGuard {
    pool: Weak<PoolInner>,
    key: WaitKey,
    id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let mut waiters = pool.waiters.lock();
            if waiters.remove(&self.key, self.id) {
                waiters.release_gate(pool.waiting_list_size);
            }
        }
    }
}

enum AcquireState {
    Ready(Option<Lease>),
    Opening {
        lease: Option<Lease>,
        open: BoxFuture<'static, bool>,
    },
    Waiting {
        // Declared before the guard: a lease delivered into the channel is
        // released before the guard takes the wait-list lock.
        promise: Promise<Lease>,
        guard: WaiterGuard,
        deadline: Option<Pin<Box<Sleep>>>,
    },
    Done,
}

impl AcquireState {
    fn opening(lease: Lease) -> Self {
        let conn = Arc::clone(lease.connection());
        AcquireState::Opening {
            lease: Some(lease),
            open: async move { conn.open().await }.boxed(),
        }
    }
}

/// Future of a [`Lease`], returned by [`ConnectionPool::get_connection`].
pub struct Acquire {
    pool: Arc<PoolInner>,
    key: WaitKey,
    state: AcquireState,
    tried: HashSet<u64>,
    waiting_time: Duration,
}

impl Acquire {
    /// Whether the caller sits on the wait-list.
    pub fn is_waiting(&self) -> bool {
        matches!(self.state, AcquireState::Waiting { .. })
    }

    /// Next step after an open attempt failed: another idle or untried
    /// closed connection, the wait-list if anything else is open, or an error.
    fn retry(&mut self) -> Result<AcquireState> {
        let WaitKey::Pool { name, role } = &self.key else {
            return Err(Error::TransactionClosed("transaction lost its connection".into()));
        };
        let group = self.pool.role_group(name, *role).ok_or_else(|| {
            Error::Configuration(format!("unknown connection name '{}'", name))
        })?;

        let mut waiters = self.pool.waiters.lock();
        match self.pool.claim_from(group, &self.tried) {
            Some((conn, Claim::Ready)) => Ok(AcquireState::Ready(Some(Lease::new(conn, &self.pool)))),
            Some((conn, _)) => Ok(AcquireState::opening(Lease::new(conn, &self.pool))),
            None if group.all().any(|c| c.state().is_open() || c.is_opening()) => {
                Ok(self.pool.enqueue(&mut waiters, self.key.clone()))
            }
            None => Err(Error::Connection(format!(
                "unable to open any connection for '{}' ({})",
                name, role
            ))),
        }
    }
}

impl Future for Acquire {
    type Output = Result<Lease>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                AcquireState::Ready(lease) => {
                    let lease = lease.take();
                    this.state = AcquireState::Done;
                    return Poll::Ready(lease.ok_or_else(completed));
                }
                AcquireState::Opening { lease, open } => match open.poll_unpin(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(true) => {
                        let lease = lease.take();
                        this.state = AcquireState::Done;
                        return Poll::Ready(lease.ok_or_else(completed));
                    }
                    Poll::Ready(false) => {
                        // Not offered to waiters: it just failed to open
                        if let Some(failed) = lease.take() {
                            this.tried.insert(failed.connection().id());
                            failed.discard();
                        }
                        this.state = AcquireState::Done;
                        match this.retry() {
                            Ok(next) => this.state = next,
                            Err(e) => return Poll::Ready(Err(e)),
                        }
                    }
                },
                AcquireState::Waiting {
                    promise, deadline, ..
                } => {
                    match promise.poll_unpin(cx) {
                        // A closed connection handed over for reopening
                        Poll::Ready(Ok(lease))
                            if lease.connection().state() == ConnectionState::Closed =>
                        {
                            this.state = AcquireState::opening(lease);
                            continue;
                        }
                        Poll::Ready(result) => {
                            this.state = AcquireState::Done;
                            return Poll::Ready(result);
                        }
                        Poll::Pending => {}
                    }
                    let waiting_time = this.waiting_time;
                    let deadline = deadline
                        .get_or_insert_with(|| Box::pin(tokio::time::sleep(waiting_time)));
                    if deadline.as_mut().poll(cx).is_ready() {
                        this.state = AcquireState::Done;
                        warn!(key = ?this.key, "timed out waiting for a connection");
                        return Poll::Ready(Err(Error::Timeout(format!(
                            "no connection became available within {:?}",
                            waiting_time
                        ))));
                    }
                    return Poll::Pending;
                }
                AcquireState::Done => return Poll::Ready(Err(completed())),
            }
        }
    }
}

fn completed() -> Error {
    Error::Cancelled("connection request already completed".into())
}
