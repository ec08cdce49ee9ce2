//! Services a coroutine can request from its scheduler

use std::time::Duration;

use futures::FutureExt;

use super::{CoroutineScheduler, Outcome, Yield};
use crate::error::Error;

/// A request yielded through [`Yield::Call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCall {
    /// Cancel the calling coroutine (and its children).
    CancelSelf,
    /// Resume with `Outcome::Id` of the calling coroutine.
    GetId,
    /// Restart the wall-clock timeout with a new duration.
    SetTimeout(Duration),
    /// Bound every later await of the calling coroutine.
    SetAwaitTimeout(Duration),
    /// Wait until the pool's wait-list is under its threshold.
    AcquireQueryGate,
}

impl SystemCall {
    /// Run the call for coroutine `id`.
    ///
    /// Returns what the coroutine yields next, or `None` when it no longer runs.
    pub(super) fn execute(self, scheduler: &mut CoroutineScheduler, id: u64) -> Option<Yield> {
        match self {
            SystemCall::CancelSelf => {
                scheduler.cancel_with(
                    id,
                    Error::Cancelled(format!("coroutine {} cancelled itself", id)),
                );
                None
            }
            SystemCall::GetId => Some(Yield::Value(Outcome::Id(id))),
            SystemCall::SetTimeout(timeout) => {
                scheduler.set_timeout(id, timeout);
                Some(Yield::Value(Outcome::Unit))
            }
            SystemCall::SetAwaitTimeout(timeout) => {
                scheduler.set_await_timeout(id, timeout);
                Some(Yield::Value(Outcome::Unit))
            }
            SystemCall::AcquireQueryGate => match scheduler.query_gate() {
                Some(gate) => Some(Yield::Future(
                    gate.map(|opened| opened.map(|()| Outcome::Unit)).boxed(),
                )),
                None => Some(Yield::Value(Outcome::Unit)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoroutineConfig, DatabaseConfig, Role, ServerConfig};
    use crate::connection::ConnectionEvents;
    use crate::coroutine::{Sequence, Step};
    use crate::driver::mock::MockServer;
    use crate::error::Result;
    use crate::pool::ConnectionPool;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn gated_by(pending_limit: usize) -> (MockServer, ConnectionPool) {
        let mock = MockServer::new();
        let mut config = DatabaseConfig::default().with_server(
            "db",
            ServerConfig {
                role: Role::Master,
                host: "localhost".into(),
                port: 3306,
                username: "root".into(),
                password: String::new(),
                dbname: "test".into(),
                num_connection: 1,
                max_num_connection: 0,
            },
        );
        config.connection_waiting_list_size = pending_limit;
        let pool =
            ConnectionPool::new(&config, mock.connector(), Arc::new(ConnectionEvents::new()))
                .unwrap();
        (mock, pool)
    }

    fn gate_then_done(log: Arc<Mutex<Vec<&'static str>>>) -> Box<dyn Sequence> {
        let mut gated = false;
        Box::new(move |input: Result<Outcome>| -> Result<Step> {
            if !gated {
                gated = true;
                return Ok(Step::Yield(Yield::Call(SystemCall::AcquireQueryGate)));
            }
            log.lock().push("passed gate");
            input.map(Step::Complete)
        })
    }

    #[tokio::test]
    async fn test_query_gate_holds_coroutine_until_wait_list_drains() {
        let (_mock, pool) = gated_by(1);
        let held = pool.get_connection("db", Role::Master).unwrap().await.unwrap();
        let waiting = pool.get_connection("db", Role::Master).unwrap();
        assert_eq!(pool.pending_count(), 1);

        let mut scheduler = CoroutineScheduler::new(CoroutineConfig::default()).with_pool(pool.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = scheduler.spawn(gate_then_done(Arc::clone(&log)));

        for _ in 0..5 {
            scheduler.tick();
        }
        assert!(log.lock().is_empty());

        drop(waiting);
        assert_eq!(pool.pending_count(), 0);
        scheduler.run_until_idle().await;
        assert_eq!(*log.lock(), vec!["passed gate"]);
        assert_eq!(handle.await.unwrap(), Outcome::Unit);
        drop(held);
    }

    #[tokio::test]
    async fn test_open_gate_passes_immediately() {
        let (_mock, pool) = gated_by(10);
        let mut scheduler = CoroutineScheduler::new(CoroutineConfig::default()).with_pool(pool);
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = scheduler.spawn(gate_then_done(Arc::clone(&log)));
        scheduler.run_until_idle().await;
        assert_eq!(*log.lock(), vec!["passed gate"]);
        assert!(handle.await.is_ok());
    }
}
