//! strand - non-blocking MySQL access for event-loop applications
//!
//! A connection pool, a query multiplexer and a coroutine scheduler that
//! share one event loop. Queries are dispatched without blocking and their
//! completion is detected by readiness polling, so a handful of connections
//! can serve many concurrent callers.
//!
//! # Features
//!
//! - **Connection Pool**: core and elastic bench connections per name and role,
//!   FIFO waiters, backpressure gate and idle reaping
//! - **Query Manager**: per-query timeouts, cancellation on drop and in-flight
//!   de-duplication of identical reads
//! - **Transactions**: one exclusively bound connection, statements run in order
//! - **Coroutines**: resumable sequences with nesting, system calls and pooling
//! - **Events**: hierarchical `connection.state_changed.*` notifications
//!
//! # Example
//!
//! ```ignore
//! use strand::{DatabaseConfig, Query, Runtime};
//!
//! #[tokio::main]
//! async fn main() -> strand::Result<()> {
//!     let config = DatabaseConfig::load(None)?;
//!     let runtime = Runtime::mysql(config)?;
//!     let _reaper = runtime.spawn_maintenance();
//!
//!     let result = runtime
//!         .execute(Query::new("main", "SELECT username FROM users WHERE id = ?").bind(42))
//!         .await?;
//!     let name: String = result.scalar()?;
//!
//!     let tx = runtime.manager().transaction("main");
//!     tx.start().await?;
//!     tx.execute(Query::new("main", "UPDATE users SET visits = visits + 1 WHERE id = ?").bind(42))
//!         .await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod coroutine;
pub mod defaults;
pub mod driver;
pub mod error;
pub mod event;
pub mod manager;
pub mod pool;
pub mod promise;
pub mod query;
pub mod row;
pub mod runtime;
pub mod transaction;
pub mod value;

// Re-export main types
pub use config::{CoroutineConfig, DatabaseConfig, ReaperConfig, Role, ServerConfig};
pub use connection::{Connection, ConnectionEvent, ConnectionEvents, ConnectionState};
pub use coroutine::{
    CoroutineHandle, CoroutineScheduler, CoroutineState, Outcome, Sequence, Step, SystemCall,
    Yield,
};
pub use driver::{Connector, Link, MySqlConnector};
pub use error::{Error, Result};
pub use event::{EventManager, ListenerId, Propagation};
pub use manager::{QueryFuture, QueryManager};
pub use pool::{Acquire, ConnectionPool, Gate, Lease, PoolStats, ReapStats};
pub use promise::{Deferred, Promise};
pub use query::{Expression, Query, Statement, StatementParams};
pub use row::{ExecuteResult, FetchMode, FromRow, QueryResult, Row};
pub use runtime::Runtime;
pub use transaction::{Transaction, TransactionState};
pub use value::{FromValue, Value};
