//! Scripted in-memory driver for unit tests
//!
//! Statements stay in flight until the test completes them, which makes
//! socket readiness fully controllable.

use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;

use super::{Connector, Link};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::query::Statement;
use crate::row::{ExecuteResult, QueryResult};

type Responder = Box<dyn Fn(&Statement) -> Option<Result<QueryResult>> + Send>;

struct InFlight {
    link: u64,
    statement: Statement,
    result: Option<Result<QueryResult>>,
    waker: Option<Waker>,
}

#[derive(Default)]
struct State {
    next_link: u64,
    connects: usize,
    failing_connects: usize,
    closed: usize,
    ping_fails: bool,
    log: Vec<Statement>,
    in_flight: Vec<InFlight>,
    responder: Option<Responder>,
}

/// The fake server shared by every link of a [`MockConnector`].
#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<State>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            server: self.clone(),
        })
    }

    /// Answer every statement immediately with the responder's result.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&Statement) -> Option<Result<QueryResult>> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_connects(&self, n: usize) {
        self.state.lock().failing_connects = n;
    }

    pub fn fail_pings(&self, fail: bool) {
        self.state.lock().ping_fails = fail;
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn closed_links(&self) -> usize {
        self.state.lock().closed
    }

    /// SQL of every statement dispatched so far.
    pub fn dispatched(&self) -> Vec<String> {
        self.state.lock().log.iter().map(|s| s.sql.clone()).collect()
    }

    pub fn last_statement(&self) -> Option<Statement> {
        self.state.lock().log.last().cloned()
    }

    /// SQL of statements still waiting for a result.
    pub fn in_flight(&self) -> Vec<String> {
        self.state
            .lock()
            .in_flight
            .iter()
            .filter(|f| f.result.is_none())
            .map(|f| f.statement.sql.clone())
            .collect()
    }

    /// Complete the oldest in-flight statement with the given SQL.
    pub fn complete(&self, sql: &str, result: Result<QueryResult>) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state
            .in_flight
            .iter_mut()
            .find(|f| f.result.is_none() && f.statement.sql == sql)
        else {
            return false;
        };
        entry.result = Some(result);
        if let Some(waker) = entry.waker.take() {
            waker.wake();
        }
        true
    }

    /// Complete the oldest in-flight statement with the given SQL as a write.
    pub fn complete_ok(&self, sql: &str, rows_affected: u64) -> bool {
        self.complete(
            sql,
            Ok(QueryResult::Execution(ExecuteResult {
                rows_affected,
                last_insert_id: None,
            })),
        )
    }
}

struct MockConnector {
    server: MockServer,
}

impl Connector for MockConnector {
    fn connect(&self, _server: &ServerConfig) -> BoxFuture<'static, Result<Box<dyn Link>>> {
        let mut state = self.server.state.lock();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return future::ready(Err(Error::Connection("connection refused".into()))).boxed();
        }
        state.next_link += 1;
        let link = MockLink {
            id: state.next_link,
            server: self.server.clone(),
        };
        future::ready(Ok(Box::new(link) as Box<dyn Link>)).boxed()
    }
}

struct MockLink {
    id: u64,
    server: MockServer,
}

impl Link for MockLink {
    fn dispatch(&mut self, statement: Statement) -> Result<()> {
        let mut state = self.server.state.lock();
        let result = state.responder.as_ref().and_then(|r| r(&statement));
        state.log.push(statement.clone());
        state.in_flight.push(InFlight {
            link: self.id,
            statement,
            result,
            waker: None,
        });
        Ok(())
    }

    fn poll_complete(&mut self, cx: &mut Context<'_>) -> Poll<Result<QueryResult>> {
        let mut state = self.server.state.lock();
        let Some(index) = state.in_flight.iter().position(|f| f.link == self.id) else {
            return Poll::Ready(Err(Error::NotReady("no statement in flight".into())));
        };
        if state.in_flight[index].result.is_some() {
            let entry = state.in_flight.remove(index);
            return Poll::Ready(entry.result.unwrap_or_else(|| Ok(QueryResult::Rows(vec![]))));
        }
        state.in_flight[index].waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn ping(&mut self) -> BoxFuture<'_, bool> {
        let ok = !self.server.state.lock().ping_fails;
        future::ready(ok).boxed()
    }

    fn close(&mut self) {
        let mut state = self.server.state.lock();
        state.in_flight.retain(|f| f.link != self.id);
        state.closed += 1;
    }
}
