//! A physical connection and its state machine
//!
//! ```text
//!            open()            query()
//!  Closed ----------> Idle ------------> Working
//!    ^                 |  ^                 |
//!    |    close()      |  +-- resolve() ----+
//!    +-----------------+      reject()
//!                      | begin_transaction()
//!                      v
//!              TransactionIdle <--> TransactionWorking
//! ```
//!
//! Every transition is published as `connection.state_changed.<state>`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{Role, ServerConfig};
use crate::driver::{Connector, Link};
use crate::error::{Error, Result};
use crate::event::EventManager;
use crate::promise::{self, Deferred, Promise};
use crate::query::Statement;
use crate::row::{FetchMode, QueryResult};

/// Event name prefix for connection state changes
pub const STATE_CHANGED: &str = "connection.state_changed";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    Idle,
    Working,
    TransactionIdle,
    TransactionWorking,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Idle => "idle",
            ConnectionState::Working => "working",
            ConnectionState::TransactionIdle => "transaction_idle",
            ConnectionState::TransactionWorking => "transaction_working",
        }
    }

    /// Full event name published when a connection enters this state.
    pub fn event_name(&self) -> String {
        format!("{}.{}", STATE_CHANGED, self.as_str())
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `connection.state_changed.*` events.
#[derive(Clone)]
pub struct ConnectionEvent {
    pub connection: Arc<Connection>,
    pub state: ConnectionState,
    /// Bound transaction; on `closed`, the one the connection was bound to.
    pub transaction: Option<Uuid>,
}

pub type ConnectionEvents = EventManager<ConnectionEvent>;

/// Result of trying to reserve a connection for one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    /// Idle and now reserved
    Ready,
    /// Closed and now reserved for opening
    Open,
    /// Not available
    Busy,
}

struct PendingQuery {
    deferred: Deferred<QueryResult>,
    fetch: FetchMode,
}

struct Inner {
    state: ConnectionState,
    state_entered_at: Instant,
    opened_at: Option<Instant>,
    link: Option<Box<dyn Link>>,
    pending: Option<PendingQuery>,
    transaction: Option<Uuid>,
    claimed: bool,
    opening: bool,
}

impl Inner {
    fn transition(&mut self, state: ConnectionState) {
        self.state = state;
        self.state_entered_at = Instant::now();
    }
}

/// One socket to one server, shared as `Arc<Connection>`.
///
/// At most one query is pending at a time: a pending future exists exactly
/// while the state is `Working` or `TransactionWorking`.
pub struct Connection {
    id: u64,
    name: String,
    role: Role,
    server: ServerConfig,
    connector: Arc<dyn Connector>,
    events: Arc<ConnectionEvents>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Create a closed connection. Nothing is opened until [`Connection::open`].
    pub fn new(
        name: impl Into<String>,
        server: ServerConfig,
        connector: Arc<dyn Connector>,
        events: Arc<ConnectionEvents>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            role: server.role,
            server,
            connector,
            events,
            inner: Mutex::new(Inner {
                state: ConnectionState::Closed,
                state_entered_at: Instant::now(),
                opened_at: None,
                link: None,
                pending: None,
                transaction: None,
                claimed: false,
                opening: false,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Transaction currently bound to this connection.
    pub fn transaction(&self) -> Option<Uuid> {
        self.inner.lock().transaction
    }

    /// Whether a caller holds this connection without having dispatched yet.
    pub fn is_claimed(&self) -> bool {
        self.inner.lock().claimed
    }

    pub fn is_opening(&self) -> bool {
        self.inner.lock().opening
    }

    /// Whether the connection is in `state` and has been for at least `duration`.
    pub fn stayed_over(&self, state: ConnectionState, duration: Duration) -> bool {
        let inner = self.inner.lock();
        inner.state == state && inner.state_entered_at.elapsed() >= duration
    }

    /// Time since the current state was entered.
    pub fn state_duration(&self) -> Duration {
        self.inner.lock().state_entered_at.elapsed()
    }

    /// Time since the link was opened; `None` while closed.
    pub fn connected_duration(&self) -> Option<Duration> {
        self.inner.lock().opened_at.map(|at| at.elapsed())
    }

    /// Open the physical link. Returns false (and stays closed) on failure.
    pub async fn open(self: &Arc<Self>) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_open() {
                return true;
            }
            inner.opening = true;
        }

        let connecting = self.connector.connect(&self.server);
        match connecting.await {
            Ok(mut link) => {
                let mut inner = self.inner.lock();
                if !inner.opening {
                    // Closed while the connect was in progress
                    drop(inner);
                    link.close();
                    return false;
                }
                inner.opening = false;
                inner.link = Some(link);
                inner.opened_at = Some(Instant::now());
                inner.transition(ConnectionState::Idle);
                drop(inner);

                debug!(
                    connection = self.id,
                    name = %self.name,
                    role = %self.role,
                    "connection opened"
                );
                self.emit(ConnectionState::Idle);
                true
            }
            Err(e) => {
                self.inner.lock().opening = false;
                warn!(
                    connection = self.id,
                    name = %self.name,
                    role = %self.role,
                    host = %self.server.host,
                    error = %e,
                    "failed to open connection"
                );
                false
            }
        }
    }

    /// Dispatch a statement without blocking.
    ///
    /// Only `Idle` and `TransactionIdle` connections accept a query; any other
    /// state fails with [`Error::NotReady`] and leaves the connection untouched.
    /// The returned promise is settled by the query manager's polling loop.
    pub fn query(
        self: &Arc<Self>,
        statement: Statement,
        fetch: FetchMode,
    ) -> Result<Promise<QueryResult>> {
        let mut inner = self.inner.lock();
        let next = match inner.state {
            ConnectionState::Idle => ConnectionState::Working,
            ConnectionState::TransactionIdle => ConnectionState::TransactionWorking,
            state => {
                return Err(Error::NotReady(format!(
                    "connection #{} is {}",
                    self.id, state
                )))
            }
        };
        let link = inner
            .link
            .as_mut()
            .ok_or_else(|| Error::NotReady(format!("connection #{} has no link", self.id)))?;
        link.dispatch(statement)?;

        let (deferred, promise) = promise::channel();
        inner.pending = Some(PendingQuery { deferred, fetch });
        inner.claimed = false;
        inner.transition(next);
        drop(inner);

        self.emit(next);
        Ok(promise)
    }

    /// Readiness check of the in-flight statement.
    pub(crate) fn poll_link(&self, cx: &mut Context<'_>) -> Poll<Result<QueryResult>> {
        let mut inner = self.inner.lock();
        if inner.pending.is_none() {
            return Poll::Ready(Err(Error::NotReady(format!(
                "connection #{} has no query in flight",
                self.id
            ))));
        }
        match inner.link.as_mut() {
            Some(link) => link.poll_complete(cx),
            None => Poll::Ready(Err(Error::Connection("link is closed".into()))),
        }
    }

    /// Settle the pending query with a result. Returns false if none was pending.
    pub(crate) fn resolve(self: &Arc<Self>, result: QueryResult) -> bool {
        self.settle(Ok(result))
    }

    /// Settle the pending query with an error. Returns false if none was pending.
    pub(crate) fn reject(self: &Arc<Self>, error: Error) -> bool {
        self.settle(Err(error))
    }

    fn settle(self: &Arc<Self>, result: Result<QueryResult>) -> bool {
        let mut inner = self.inner.lock();
        let Some(pending) = inner.pending.take() else {
            return false;
        };
        let next = match inner.state {
            ConnectionState::TransactionWorking => ConnectionState::TransactionIdle,
            _ => ConnectionState::Idle,
        };
        inner.transition(next);
        drop(inner);

        pending
            .deferred
            .settle(result.map(|r| r.apply(pending.fetch)));
        self.emit(next);
        true
    }

    /// Terminate the link. A pending query is rejected. Idempotent.
    pub fn close(self: &Arc<Self>) {
        let inner = self.inner.lock();
        if inner.state == ConnectionState::Closed && inner.link.is_none() && !inner.opening {
            return;
        }
        self.close_locked(inner);
    }

    /// Close only if nobody is using or holding the connection.
    pub(crate) fn close_if_idle(self: &Arc<Self>) -> bool {
        let inner = self.inner.lock();
        if inner.state != ConnectionState::Idle || inner.claimed {
            return false;
        }
        self.close_locked(inner);
        true
    }

    fn close_locked(self: &Arc<Self>, mut inner: MutexGuard<'_, Inner>) {
        let link = inner.link.take();
        let pending = inner.pending.take();
        let previous = inner.state;
        let transaction = inner.transaction.take();
        inner.opening = false;
        inner.opened_at = None;
        inner.transition(ConnectionState::Closed);
        drop(inner);

        if let Some(mut link) = link {
            link.close();
        }
        if let Some(pending) = pending {
            pending
                .deferred
                .reject(Error::Connection("connection closed".into()));
        }
        debug!(
            connection = self.id,
            name = %self.name,
            role = %self.role,
            from = %previous,
            "connection closed"
        );
        self.publish(ConnectionState::Closed, transaction);
    }

    /// Health check. An idle connection that fails the ping is closed.
    ///
    /// Connections that are busy or claimed are not pinged and count as healthy.
    pub async fn ping(self: &Arc<Self>) -> bool {
        let mut link = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Idle || inner.claimed {
                return inner.state.is_open();
            }
            let Some(link) = inner.link.take() else {
                return false;
            };
            inner.claimed = true;
            link
        };

        let alive = link.ping().await;

        let restored = {
            let mut inner = self.inner.lock();
            inner.claimed = false;
            if inner.state == ConnectionState::Idle && inner.link.is_none() {
                inner.link = Some(link);
                true
            } else {
                link.close();
                false
            }
        };

        if !alive {
            warn!(connection = self.id, name = %self.name, "ping failed, closing connection");
            self.close();
            return false;
        }
        restored
    }

    /// Bind a claimed idle connection to a transaction.
    pub(crate) fn begin_transaction(self: &Arc<Self>, transaction: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Idle {
            return Err(Error::NotReady(format!(
                "connection #{} is {} and cannot start a transaction",
                self.id, inner.state
            )));
        }
        inner.transaction = Some(transaction);
        inner.transition(ConnectionState::TransactionIdle);
        drop(inner);
        self.emit(ConnectionState::TransactionIdle);
        Ok(())
    }

    /// Release the transaction binding and return to `Idle`.
    pub(crate) fn end_transaction(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::TransactionIdle {
            return false;
        }
        inner.transaction = None;
        inner.transition(ConnectionState::Idle);
        drop(inner);
        self.emit(ConnectionState::Idle);
        true
    }

    /// Reserve the connection for one caller.
    ///
    /// Without a transaction, only unbound `Idle` connections (or `Closed` ones,
    /// to be opened) can be claimed. With one, only the connection bound to it.
    pub(crate) fn try_claim(&self, transaction: Option<Uuid>) -> Claim {
        let mut inner = self.inner.lock();
        if inner.claimed || inner.opening {
            return Claim::Busy;
        }
        let claim = match (inner.state, transaction) {
            (ConnectionState::Idle, None) => Claim::Ready,
            (ConnectionState::TransactionIdle, Some(id)) if inner.transaction == Some(id) => {
                Claim::Ready
            }
            (ConnectionState::Closed, None) => {
                inner.opening = true;
                Claim::Open
            }
            _ => Claim::Busy,
        };
        if claim != Claim::Busy {
            inner.claimed = true;
        }
        claim
    }

    /// Drop a claim. Returns true if the connection can be claimed again,
    /// either idle or closed and reopenable.
    pub(crate) fn release_claim(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.claimed {
            return false;
        }
        inner.claimed = false;
        if inner.state == ConnectionState::Closed {
            inner.opening = false;
        }
        matches!(
            inner.state,
            ConnectionState::Idle | ConnectionState::TransactionIdle | ConnectionState::Closed
        )
    }

    fn emit(self: &Arc<Self>, state: ConnectionState) {
        let transaction = self.transaction();
        self.publish(state, transaction);
    }

    fn publish(self: &Arc<Self>, state: ConnectionState, transaction: Option<Uuid>) {
        let event = ConnectionEvent {
            connection: Arc::clone(self),
            state,
            transaction,
        };
        self.events.emit(&state.event_name(), &event);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(mut link) = self.inner.get_mut().link.take() {
            link.close();
        }
    }
}
