//! Resumable sequences driven by a scheduler
//!
//! A [`Sequence`] is an explicit state machine: each call to
//! [`Sequence::resume`] receives the result of the previous step and returns
//! the next [`Step`]. A step either yields something for the scheduler to
//! wait on, or completes with a final [`Outcome`].
//!
//! # Example
//!
//! ```ignore
//! use strand::coroutine::{Outcome, Step, Yield};
//!
//! let manager = runtime.manager().clone();
//! let mut stage = 0;
//! let handle = runtime.scheduler_mut().spawn(Box::new(move |input| {
//!     stage += 1;
//!     match stage {
//!         1 => Ok(Step::Yield(Yield::query(
//!             manager.execute(Query::new("main", "SELECT COUNT(*) FROM users")),
//!         ))),
//!         _ => Ok(Step::Complete(input?)),
//!     }
//! }));
//! runtime.run_until_idle().await;
//! let count = handle.await?.into_query()?.scalar::<i64>()?;
//! ```

mod scheduler;
mod syscall;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{Error, Result};
use crate::promise::Promise;
use crate::row::QueryResult;
use crate::value::Value;

pub use self::scheduler::CoroutineScheduler;
pub use self::syscall::SystemCall;

/// Values passed between sequences and the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Unit,
    Bool(bool),
    Id(u64),
    Value(Value),
    Query(QueryResult),
}

impl Outcome {
    pub fn into_query(self) -> Result<QueryResult> {
        match self {
            Outcome::Query(result) => Ok(result),
            other => Err(Error::Coroutine(format!(
                "expected a query result, got {:?}",
                other
            ))),
        }
    }

    pub fn into_value(self) -> Result<Value> {
        match self {
            Outcome::Value(value) => Ok(value),
            Outcome::Bool(b) => Ok(Value::Bool(b)),
            Outcome::Id(id) => Ok(Value::U64(id)),
            Outcome::Unit => Ok(Value::Null),
            Outcome::Query(_) => Err(Error::Coroutine(
                "expected a value, got a query result".into(),
            )),
        }
    }
}

impl From<()> for Outcome {
    fn from(_: ()) -> Self {
        Outcome::Unit
    }
}

impl From<bool> for Outcome {
    fn from(b: bool) -> Self {
        Outcome::Bool(b)
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Value(value)
    }
}

impl From<QueryResult> for Outcome {
    fn from(result: QueryResult) -> Self {
        Outcome::Query(result)
    }
}

pub type OutcomeFuture = BoxFuture<'static, Result<Outcome>>;

/// What a sequence hands to the scheduler when it suspends.
pub enum Yield {
    /// Suspend until the future settles; resume with its result.
    Future(OutcomeFuture),
    /// Run a child sequence; resume with its final outcome.
    Nested(Box<dyn Sequence>),
    /// Ask the scheduler for a service.
    Call(SystemCall),
    /// Resume right away with this value.
    Value(Outcome),
}

impl Yield {
    pub fn future<F, T>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Into<Outcome>,
    {
        Yield::Future(boxed(future))
    }

    /// Suspend on a submitted query.
    pub fn query(future: Promise<QueryResult>) -> Self {
        Self::future(future)
    }

    pub fn nested(sequence: impl Sequence + 'static) -> Self {
        Yield::Nested(Box::new(sequence))
    }
}

pub enum Step {
    Yield(Yield),
    Complete(Outcome),
}

/// A resumable computation.
///
/// The first resume receives `Ok(Outcome::Unit)`. Returning an error ends
/// the sequence; the error is delivered like a completion.
pub trait Sequence: Send {
    fn resume(&mut self, input: Result<Outcome>) -> Result<Step>;
}

impl<F> Sequence for F
where
    F: FnMut(Result<Outcome>) -> Result<Step> + Send,
{
    fn resume(&mut self, input: Result<Outcome>) -> Result<Step> {
        self(input)
    }
}

/// Wraps a single future as a sequence.
struct Await {
    future: Option<OutcomeFuture>,
}

impl Sequence for Await {
    fn resume(&mut self, input: Result<Outcome>) -> Result<Step> {
        match self.future.take() {
            Some(future) => Ok(Step::Yield(Yield::Future(future))),
            None => input.map(Step::Complete),
        }
    }
}

/// A sequence that awaits `future` and completes with its output.
pub fn from_future<F, T>(future: F) -> Box<dyn Sequence>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Into<Outcome>,
{
    Box::new(Await {
        future: Some(boxed(future)),
    })
}

fn boxed<F, T>(future: F) -> OutcomeFuture
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Into<Outcome>,
{
    future.map(|result| result.map(Into::into)).boxed()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    /// Pooled or finished, waiting to be recycled
    Idle,
    /// Ready to be resumed on the next tick
    Working,
    /// Suspended on a future or a child
    Progress,
}

/// Caller side of a spawned coroutine: its id and its final outcome.
#[derive(Debug)]
pub struct CoroutineHandle {
    id: u64,
    promise: Promise<Outcome>,
}

impl CoroutineHandle {
    pub(crate) fn new(id: u64, promise: Promise<Outcome>) -> Self {
        Self { id, promise }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for CoroutineHandle {
    type Output = Result<Outcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.promise).poll(cx)
    }
}
