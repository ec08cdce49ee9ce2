//! Physical database links
//!
//! A [`Connector`] opens links; a [`Link`] runs one statement at a time
//! without blocking: [`Link::dispatch`] starts it and the query manager's
//! polling loop learns about completion through [`Link::poll_complete`].

use std::task::{Context, Poll};

use futures::future::BoxFuture;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::query::Statement;
use crate::row::QueryResult;

pub mod mysql;
mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use self::mysql::MySqlConnector;

/// Opens physical links to a server.
pub trait Connector: Send + Sync {
    /// Connect and prepare the session. No retries.
    fn connect(&self, server: &ServerConfig) -> BoxFuture<'static, Result<Box<dyn Link>>>;
}

/// One open socket to a server.
pub trait Link: Send {
    /// Start executing a statement. Must not block.
    fn dispatch(&mut self, statement: Statement) -> Result<()>;

    /// Readiness check of the dispatched statement.
    fn poll_complete(&mut self, cx: &mut Context<'_>) -> Poll<Result<QueryResult>>;

    /// Round-trip health check.
    fn ping(&mut self) -> BoxFuture<'_, bool>;

    /// Tear the link down. Abandons any statement in flight.
    fn close(&mut self);
}
