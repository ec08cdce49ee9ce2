//! Transactions bound to a single connection
//!
//! A started transaction owns one master connection exclusively until it is
//! committed, rolled back or dropped. Its statements are queued on a private
//! wait-list and run one at a time in submission order.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Role;
use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::manager::{QueryFuture, QueryManager};
use crate::promise::Promise;
use crate::query::Query;

/// Shared between a [`Transaction`] and its in-flight statements.
pub(crate) struct TxBinding {
    id: Uuid,
    name: String,
    connection: Mutex<Option<Arc<Connection>>>,
    closed: AtomicBool,
    finishing: AtomicBool,
}

impl TxBinding {
    fn new(name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            connection: Mutex::new(None),
            closed: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn started(name: &str, connection: Arc<Connection>) -> Self {
        let binding = Self::new(name.to_string());
        *binding.connection.lock() = Some(connection);
        binding
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the binding. Returns the connection if it is still bound here;
    /// a connection that was closed underneath may already serve someone else.
    fn close(&self) -> Option<Arc<Connection>> {
        self.closed.store(true, Ordering::Release);
        self.connection
            .lock()
            .take()
            .filter(|connection| connection.transaction() == Some(self.id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Working,
    Closed,
}

/// A unit of work on one exclusively bound connection.
///
/// # Example
///
/// ```ignore
/// let tx = manager.transaction("main");
/// tx.start().await?;
/// tx.execute(Query::new("main", "UPDATE accounts SET balance = balance - ? WHERE id = ?")
///     .bind(10)
///     .bind(1))
///     .await?;
/// tx.commit().await?;
/// ```
///
/// Dropping a started transaction without committing or rolling back closes
/// its connection.
pub struct Transaction {
    binding: Arc<TxBinding>,
    manager: QueryManager,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.binding.id)
            .field("name", &self.binding.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(name: impl Into<String>, manager: QueryManager) -> Self {
        Self {
            binding: Arc::new(TxBinding::new(name.into())),
            manager,
        }
    }

    pub fn id(&self) -> Uuid {
        self.binding.id
    }

    pub fn name(&self) -> &str {
        &self.binding.name
    }

    pub fn state(&self) -> TransactionState {
        if self.binding.is_closed() {
            return TransactionState::Closed;
        }
        match self.binding.connection().map(|c| c.state()) {
            Some(ConnectionState::TransactionWorking) => TransactionState::Working,
            _ => TransactionState::Idle,
        }
    }

    pub fn is_started(&self) -> bool {
        self.binding.connection().is_some()
    }

    /// Bind a master connection and issue `START TRANSACTION`.
    ///
    /// On failure the connection is closed and the transaction is closed.
    pub async fn start(&self) -> Result<()> {
        if self.binding.is_closed() {
            return Err(self.closed_error());
        }
        if self.is_started() {
            return Err(Error::NotReady(format!(
                "transaction {} already started",
                self.binding.id
            )));
        }

        let lease = self
            .manager
            .pool()
            .get_connection(&self.binding.name, Role::Master)?
            .await?;
        let connection = Arc::clone(lease.connection());
        if let Err(e) = lease.bind_transaction(self.binding.id) {
            connection.close();
            self.abort();
            return Err(e);
        }
        *self.binding.connection.lock() = Some(connection);
        drop(lease);

        match self.submit("START TRANSACTION").await {
            Ok(_) => {
                debug!(transaction = %self.binding.id, name = %self.binding.name, "transaction started");
                Ok(())
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Queue a statement behind the transaction's earlier ones.
    ///
    /// The query's connection name and role are ignored: it always runs on
    /// the bound connection.
    pub fn execute(&self, query: Query) -> QueryFuture {
        if self.binding.finishing.load(Ordering::Acquire) || self.binding.is_closed() {
            return Promise::rejected(self.closed_error());
        }
        self.manager
            .submit(query, Some(Arc::clone(&self.binding)), false)
    }

    pub async fn commit(self) -> Result<()> {
        self.finish("COMMIT").await
    }

    pub async fn rollback(self) -> Result<()> {
        self.finish("ROLLBACK").await
    }

    async fn finish(&self, sql: &str) -> Result<()> {
        if self.binding.is_closed() {
            return Err(self.closed_error());
        }
        if !self.is_started() {
            return Err(Error::NotReady(format!(
                "transaction {} has not started",
                self.binding.id
            )));
        }
        if self.binding.finishing.swap(true, Ordering::AcqRel) {
            return Err(self.closed_error());
        }

        let result = self.submit(sql).await;
        let connection = self.binding.close();
        match (&result, connection) {
            (Ok(_), Some(connection)) => {
                if !connection.end_transaction() {
                    connection.close();
                }
            }
            (Err(e), Some(connection)) => {
                warn!(transaction = %self.binding.id, error = %e, "{} failed, closing connection", sql);
                connection.close();
            }
            _ => {}
        }
        self.manager.pool().drain_transaction(self.binding.id);
        debug!(transaction = %self.binding.id, "transaction finished with {}", sql);
        result.map(|_| ())
    }

    fn submit(&self, sql: &str) -> QueryFuture {
        let query = Query::new(self.binding.name.clone(), sql).role(Role::Master);
        self.manager
            .submit(query, Some(Arc::clone(&self.binding)), false)
    }

    fn abort(&self) {
        if let Some(connection) = self.binding.close() {
            connection.close();
        }
        self.manager.pool().drain_transaction(self.binding.id);
    }

    fn closed_error(&self) -> Error {
        Error::TransactionClosed(format!("transaction {} is closed", self.binding.id))
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.binding.is_closed() || !self.is_started() {
            return;
        }
        warn!(
            transaction = %self.binding.id,
            name = %self.binding.name,
            "transaction dropped without commit or rollback, closing its connection"
        );
        self.abort();
    }
}
