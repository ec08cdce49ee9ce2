//! Query multiplexer
//!
//! [`QueryManager`] turns a logical [`Query`] into a dispatched statement:
//! it acquires a connection (from the pool or a transaction), dispatches,
//! and settles the caller's future from a single polling loop that checks
//! every working connection for readiness in one pass.
//!
//! The loop runs as a Tokio task while jobs exist and stops when the last
//! one settles. Without a runtime, drive it with [`QueryManager::tick`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::poll_fn;
use futures::task::AtomicWaker;
use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::time::{Instant, Sleep};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::pool::{Acquire, ConnectionPool};
use crate::promise::{self, Deferred, Promise};
use crate::query::{Query, Statement};
use crate::row::{FetchMode, QueryResult};
use crate::transaction::{Transaction, TxBinding};

/// Future returned for every submitted query.
pub type QueryFuture = Promise<QueryResult>;

enum JobState {
    PendingConnection(Acquire),
    Dispatched {
        connection: Arc<Connection>,
        promise: Promise<QueryResult>,
    },
}

struct Job {
    deferred: Deferred<QueryResult>,
    state: JobState,
    statement: Option<Statement>,
    fetch: FetchMode,
    deadline: Instant,
    share_key: Option<u64>,
    sql: String,
}

struct Shared {
    leader: u64,
    followers: Vec<Deferred<QueryResult>>,
}

/// Reads in flight, keyed by query fingerprint.
#[derive(Default)]
struct InFlightQueries {
    entries: HashMap<u64, Shared>,
}

impl InFlightQueries {
    /// Subscribe to an in-flight read. Gives the deferred back when there is none.
    fn follow(
        &mut self,
        key: u64,
        deferred: Deferred<QueryResult>,
    ) -> std::result::Result<(), Deferred<QueryResult>> {
        match self.entries.get_mut(&key) {
            Some(shared) => {
                shared.followers.push(deferred);
                Ok(())
            }
            None => Err(deferred),
        }
    }

    fn register(&mut self, key: u64, leader: u64) {
        self.entries.entry(key).or_insert_with(|| Shared {
            leader,
            followers: Vec::new(),
        });
    }

    fn has_live_followers(&mut self, key: u64, leader: u64) -> bool {
        match self.entries.get_mut(&key) {
            Some(shared) if shared.leader == leader => {
                shared.followers.retain(|f| !f.is_closed());
                !shared.followers.is_empty()
            }
            _ => false,
        }
    }

    fn remove(&mut self, key: u64, leader: u64) -> Vec<Deferred<QueryResult>> {
        match self.entries.get(&key) {
            Some(shared) if shared.leader == leader => self
                .entries
                .remove(&key)
                .map(|shared| shared.followers)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

#[derive(Default)]
struct Jobs {
    next_id: u64,
    entries: IndexMap<u64, Job>,
    cache: InFlightQueries,
}

struct ManagerInner {
    pool: ConnectionPool,
    default_timeout: Duration,
    jobs: Mutex<Jobs>,
    ticking: Mutex<()>,
    polling: AtomicBool,
    waker: AtomicWaker,
}

/// Submits queries and drives them to completion. Cheap to clone.
#[derive(Clone)]
pub struct QueryManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for QueryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryManager")
            .field("jobs", &self.live_jobs())
            .field("default_timeout", &self.inner.default_timeout)
            .finish()
    }
}

impl QueryManager {
    pub fn new(pool: ConnectionPool, default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                pool,
                default_timeout,
                jobs: Mutex::new(Jobs::default()),
                ticking: Mutex::new(()),
                polling: AtomicBool::new(false),
                waker: AtomicWaker::new(),
            }),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Submit a query. Fails through the returned future, never synchronously.
    pub fn execute(&self, query: Query) -> QueryFuture {
        self.submit(query, None, false)
    }

    /// Like [`QueryManager::execute`], but joins an identical read already in
    /// flight instead of dispatching it again.
    pub fn execute_shared(&self, query: Query) -> QueryFuture {
        self.submit(query, None, true)
    }

    /// Create an unstarted transaction on the named connection.
    pub fn transaction(&self, name: impl Into<String>) -> Transaction {
        Transaction::new(name, self.clone())
    }

    /// Jobs not settled yet.
    pub fn live_jobs(&self) -> usize {
        self.inner.jobs.lock().entries.len()
    }

    /// One polling pass. Returns the number of jobs still live.
    pub fn tick(&self, cx: &mut Context<'_>) -> usize {
        self.inner.tick(cx)
    }

    pub(crate) fn submit(
        &self,
        query: Query,
        binding: Option<Arc<TxBinding>>,
        share: bool,
    ) -> QueryFuture {
        let statement = match query.statement() {
            Ok(statement) => statement,
            Err(e) => return Promise::rejected(e),
        };
        let share_key = (share && binding.is_none()).then(|| query.fingerprint());

        let (deferred, promise) = promise::channel();
        let deferred = match share_key {
            Some(key) => match self.inner.jobs.lock().cache.follow(key, deferred) {
                Ok(()) => {
                    debug!(sql = %query.sql(), "joined an identical query in flight");
                    return promise;
                }
                Err(deferred) => deferred,
            },
            None => deferred,
        };

        let acquire = match &binding {
            Some(binding) => self.inner.pool.acquire_for_transaction(binding),
            None => self
                .inner
                .pool
                .get_connection(query.connection(), query.target_role()),
        };
        let acquire = match acquire {
            Ok(acquire) => acquire,
            Err(e) => return Promise::rejected(e),
        };

        let timeout = query
            .max_execution_time()
            .unwrap_or(self.inner.default_timeout);
        let job = Job {
            deferred,
            state: JobState::PendingConnection(acquire),
            statement: Some(statement),
            fetch: query.fetch_mode(),
            deadline: Instant::now() + timeout,
            share_key,
            sql: query.sql().to_string(),
        };
        {
            let mut jobs = self.inner.jobs.lock();
            jobs.next_id += 1;
            let id = jobs.next_id;
            jobs.entries.insert(id, job);
        }

        self.ensure_polling();
        promise
    }

    fn ensure_polling(&self) {
        if self.inner.polling.swap(true, Ordering::AcqRel) {
            self.inner.waker.wake();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(poll_loop(Arc::clone(&self.inner)));
            }
            // Driven by hand through tick()
            Err(_) => self.inner.polling.store(false, Ordering::Release),
        }
    }
}

async fn poll_loop(inner: Arc<ManagerInner>) {
    let mut timer: Option<Pin<Box<Sleep>>> = None;
    poll_fn(|cx| loop {
        inner.waker.register(cx.waker());
        if inner.tick(cx) == 0 {
            inner.polling.store(false, Ordering::Release);
            // A submission may have slipped in before the flag was cleared
            let resumed = !inner.jobs.lock().entries.is_empty()
                && inner
                    .polling
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
            if resumed {
                continue;
            }
            return Poll::Ready(());
        }

        if let Some(deadline) = inner.next_deadline() {
            let sleep = timer.get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
            sleep.as_mut().reset(deadline);
            if sleep.as_mut().poll(cx).is_ready() {
                continue;
            }
        }
        return Poll::Pending;
    })
    .await
}

impl ManagerInner {
    fn tick(&self, cx: &mut Context<'_>) -> usize {
        let Some(_ticking) = self.ticking.try_lock() else {
            return self.jobs.lock().entries.len();
        };

        // Jobs are advanced without the lock: dispatching and settling emit
        // events whose listeners may submit new queries.
        let entries = std::mem::take(&mut self.jobs.lock().entries);
        let mut live = IndexMap::with_capacity(entries.len());
        for (id, mut job) in entries {
            match self.advance(id, &mut job, cx) {
                Some(result) => self.settle(id, job, result),
                None => {
                    live.insert(id, job);
                }
            }
        }

        let mut jobs = self.jobs.lock();
        let submitted = std::mem::replace(&mut jobs.entries, live);
        jobs.entries.extend(submitted);
        jobs.entries.len()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.jobs.lock().entries.values().map(|job| job.deadline).min()
    }

    /// Move a job forward. Returns its outcome once it is settled.
    fn advance(&self, id: u64, job: &mut Job, cx: &mut Context<'_>) -> Option<Result<QueryResult>> {
        if job.deferred.poll_closed(cx).is_ready() && !self.has_followers(id, job) {
            if let JobState::Dispatched { connection, .. } = &job.state {
                debug!(connection = connection.id(), sql = %job.sql, "query cancelled, closing connection");
                connection.close();
            }
            return Some(Err(Error::Cancelled("query future dropped".into())));
        }

        if Instant::now() >= job.deadline {
            if let JobState::Dispatched { connection, .. } = &job.state {
                connection.close();
            }
            warn!(sql = %job.sql, "query exceeded its maximum execution time");
            return Some(Err(Error::Timeout(format!(
                "query exceeded its maximum execution time: {}",
                job.sql
            ))));
        }

        loop {
            match &mut job.state {
                JobState::PendingConnection(acquire) => {
                    let lease = match acquire.poll_unpin(cx) {
                        Poll::Pending => return None,
                        Poll::Ready(Err(e)) => return Some(Err(e)),
                        Poll::Ready(Ok(lease)) => lease,
                    };
                    let Some(statement) = job.statement.take() else {
                        return Some(Err(Error::NotReady("statement already dispatched".into())));
                    };
                    let connection = Arc::clone(lease.connection());
                    match lease.query(statement, job.fetch) {
                        Ok(promise) => {
                            debug!(connection = connection.id(), sql = %job.sql, "query dispatched");
                            if let Some(key) = job.share_key {
                                self.jobs.lock().cache.register(key, id);
                            }
                            job.state = JobState::Dispatched { connection, promise };
                        }
                        Err(e) => return Some(Err(e)),
                    }
                }
                JobState::Dispatched { connection, promise } => {
                    // Settled elsewhere, e.g. the connection was closed
                    if let Some(result) = promise.try_take() {
                        return Some(result);
                    }
                    match connection.poll_link(cx) {
                        Poll::Pending => return None,
                        Poll::Ready(Ok(result)) => {
                            connection.resolve(result);
                        }
                        Poll::Ready(Err(e)) if e.is_fatal_for_connection() => {
                            connection.close();
                            return Some(Err(e));
                        }
                        Poll::Ready(Err(e)) => {
                            connection.reject(e);
                        }
                    }
                    return Some(promise.try_take().unwrap_or_else(|| {
                        Err(Error::Connection("query result lost".into()))
                    }));
                }
            }
        }
    }

    fn has_followers(&self, id: u64, job: &Job) -> bool {
        match job.share_key {
            Some(key) => self.jobs.lock().cache.has_live_followers(key, id),
            None => false,
        }
    }

    fn settle(&self, id: u64, job: Job, result: Result<QueryResult>) {
        let followers = match job.share_key {
            Some(key) => self.jobs.lock().cache.remove(key, id),
            None => Vec::new(),
        };
        for follower in followers {
            follower.settle(result.clone());
        }
        job.deferred.settle(result);
    }
}
