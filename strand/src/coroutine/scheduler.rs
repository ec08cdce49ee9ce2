use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::poll_fn;
use futures::task::noop_waker_ref;
use indexmap::IndexMap;
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use tracing::{debug, error};

use super::{
    CoroutineHandle, CoroutineState, Outcome, OutcomeFuture, Sequence, Step, SystemCall, Yield,
};
use crate::config::CoroutineConfig;
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, Gate};
use crate::promise::{self, Deferred};

enum Awaiting {
    Nothing,
    Future(OutcomeFuture),
    Child(u64),
}

struct Coroutine {
    id: u64,
    state: CoroutineState,
    sequence: Option<Box<dyn Sequence>>,
    parent: Option<u64>,
    awaiting: Awaiting,
    polled: bool,
    input: Option<Result<Outcome>>,
    deadline: Instant,
    await_timeout: Option<Duration>,
    await_deadline: Option<Instant>,
    handle: Option<Deferred<Outcome>>,
    idle_since: Instant,
}

impl Coroutine {
    fn blank() -> Self {
        let now = Instant::now();
        Self {
            id: 0,
            state: CoroutineState::Idle,
            sequence: None,
            parent: None,
            awaiting: Awaiting::Nothing,
            polled: false,
            input: None,
            deadline: now,
            await_timeout: None,
            await_deadline: None,
            handle: None,
            idle_since: now,
        }
    }

    fn reset(&mut self) {
        self.state = CoroutineState::Idle;
        self.sequence = None;
        self.parent = None;
        self.awaiting = Awaiting::Nothing;
        self.polled = false;
        self.input = None;
        self.await_timeout = None;
        self.await_deadline = None;
        self.handle = None;
        self.idle_since = Instant::now();
    }
}

/// Drives coroutines one step per tick.
///
/// Finished coroutines are reset and kept on a LIFO free stack so the next
/// spawn reuses them; [`CoroutineScheduler::trim_pool`] drops the ones that
/// sat unused for too long.
pub struct CoroutineScheduler {
    live: IndexMap<u64, Coroutine>,
    free: VecDeque<Coroutine>,
    next_id: u64,
    config: CoroutineConfig,
    pool: Option<ConnectionPool>,
}

impl fmt::Debug for CoroutineScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineScheduler")
            .field("live", &self.live.len())
            .field("pooled", &self.free.len())
            .finish()
    }
}

impl CoroutineScheduler {
    pub fn new(config: CoroutineConfig) -> Self {
        Self {
            live: IndexMap::new(),
            free: VecDeque::new(),
            next_id: 0,
            config,
            pool: None,
        }
    }

    /// Wire the pool whose backpressure gate `SystemCall::AcquireQueryGate` waits on.
    pub fn with_pool(mut self, pool: ConnectionPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Run `callable`; when it produces a sequence, schedule it as a coroutine.
    pub fn execute<F>(&mut self, callable: F) -> Option<CoroutineHandle>
    where
        F: FnOnce() -> Option<Box<dyn Sequence>>,
    {
        callable().map(|sequence| self.spawn(sequence))
    }

    pub fn spawn(&mut self, sequence: Box<dyn Sequence>) -> CoroutineHandle {
        let (deferred, promise) = promise::channel();
        let id = self.start(sequence, None, Some(deferred));
        CoroutineHandle::new(id, promise)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Recycled coroutines waiting for reuse.
    pub fn pooled_count(&self) -> usize {
        self.free.len()
    }

    pub fn state(&self, id: u64) -> Option<CoroutineState> {
        self.live.get(&id).map(|co| co.state)
    }

    /// Cancel a coroutine and, first, everything it is waiting on.
    pub fn cancel(&mut self, id: u64) -> bool {
        if !self.live.contains_key(&id) {
            return false;
        }
        self.cancel_with(id, Error::Cancelled(format!("coroutine {} cancelled", id)));
        true
    }

    /// One pass without a waker. Returns the number of live coroutines.
    pub fn tick(&mut self) -> usize {
        let mut cx = Context::from_waker(noop_waker_ref());
        self.tick_with(&mut cx)
    }

    /// One pass over every coroutine live at its start.
    pub fn tick_with(&mut self, cx: &mut Context<'_>) -> usize {
        let ids: Vec<u64> = self.live.keys().copied().collect();
        for id in ids {
            let Some((state, deadline)) = self.live.get(&id).map(|co| (co.state, co.deadline))
            else {
                continue;
            };
            if state != CoroutineState::Idle && Instant::now() >= deadline {
                debug!(coroutine = id, "coroutine timed out");
                self.cancel_with(id, Error::Timeout(format!("coroutine {} timed out", id)));
                continue;
            }
            match state {
                CoroutineState::Idle => self.recycle(id),
                CoroutineState::Progress => self.poll_awaited(id, cx),
                CoroutineState::Working => self.resume(id),
            }
        }
        self.live.len()
    }

    /// Drop pooled coroutines from the bottom of the stack while it is over
    /// `max_pool_size` and the bottom one has been idle for `max_time_idle`.
    pub fn trim_pool(&mut self) -> usize {
        let max_idle = self.config.max_time_idle();
        let mut trimmed = 0;
        while self.free.len() > self.config.max_pool_size
            && self
                .free
                .front()
                .is_some_and(|co| co.idle_since.elapsed() > max_idle)
        {
            self.free.pop_front();
            trimmed += 1;
        }
        if trimmed > 0 {
            debug!(trimmed, pooled = self.free.len(), "trimmed coroutine pool");
        }
        trimmed
    }

    /// Tick until no coroutine is live, sleeping on awaited futures and deadlines.
    ///
    /// The coroutine pool is trimmed every `max_time_idle` while this runs.
    pub async fn run_until_idle(&mut self) {
        let mut timer: Option<Pin<Box<Sleep>>> = None;
        let period = self.config.max_time_idle().max(Duration::from_secs(1));
        let mut trimmer = tokio::time::interval_at(Instant::now() + period, period);
        trimmer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        poll_fn(|cx| loop {
            while trimmer.poll_tick(cx).is_ready() {
                self.trim_pool();
            }
            if self.tick_with(cx) == 0 {
                return Poll::Ready(());
            }
            if self.runnable() {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            if let Some(deadline) = self.next_deadline() {
                let sleep =
                    timer.get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
                sleep.as_mut().reset(deadline);
                if sleep.as_mut().poll(cx).is_ready() {
                    continue;
                }
            }
            return Poll::Pending;
        })
        .await
    }

    /// Whether the next tick can make progress without waiting.
    fn runnable(&self) -> bool {
        self.live.values().any(|co| {
            co.state != CoroutineState::Progress
                || (matches!(co.awaiting, Awaiting::Future(_)) && !co.polled)
        })
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.live
            .values()
            .flat_map(|co| std::iter::once(co.deadline).chain(co.await_deadline))
            .min()
    }

    fn start(
        &mut self,
        sequence: Box<dyn Sequence>,
        parent: Option<u64>,
        handle: Option<Deferred<Outcome>>,
    ) -> u64 {
        let mut co = self.free.pop_back().unwrap_or_else(Coroutine::blank);
        self.next_id += 1;
        co.id = self.next_id;
        co.state = CoroutineState::Working;
        co.sequence = Some(sequence);
        co.parent = parent;
        co.input = Some(Ok(Outcome::Unit));
        co.deadline = Instant::now() + self.config.timeout();
        co.handle = handle;

        let id = co.id;
        debug!(coroutine = id, parent = ?parent, "coroutine started");
        self.live.insert(id, co);
        id
    }

    fn recycle(&mut self, id: u64) {
        if let Some(mut co) = self.live.shift_remove(&id) {
            co.reset();
            self.free.push_back(co);
        }
    }

    fn poll_awaited(&mut self, id: u64, cx: &mut Context<'_>) {
        let Some(co) = self.live.get_mut(&id) else {
            return;
        };
        let result = match &mut co.awaiting {
            Awaiting::Child(_) => return,
            Awaiting::Nothing => Ok(Outcome::Unit),
            Awaiting::Future(future) => match future.as_mut().poll(cx) {
                Poll::Ready(result) => result,
                Poll::Pending => {
                    co.polled = true;
                    match co.await_deadline {
                        Some(deadline) if Instant::now() >= deadline => Err(Error::Timeout(
                            format!("coroutine {} timed out waiting on a future", id),
                        )),
                        _ => return,
                    }
                }
            },
        };
        co.awaiting = Awaiting::Nothing;
        co.await_deadline = None;
        co.input = Some(result);
        co.state = CoroutineState::Working;
    }

    fn resume(&mut self, id: u64) {
        let Some(co) = self.live.get_mut(&id) else {
            return;
        };
        let input = co.input.take().unwrap_or(Ok(Outcome::Unit));
        let step = match co.sequence.as_mut() {
            Some(sequence) => sequence.resume(input),
            None => Err(Error::Coroutine(format!("coroutine {} has no sequence", id))),
        };
        self.dispatch(id, step);
    }

    fn dispatch(&mut self, id: u64, mut step: Result<Step>) {
        loop {
            let yielded = match step {
                Ok(Step::Yield(yielded)) => yielded,
                Ok(Step::Complete(outcome)) => return self.finish(id, Ok(outcome)),
                Err(e) => return self.finish(id, Err(e)),
            };
            match yielded {
                Yield::Call(call) => match call.execute(self, id) {
                    Some(next) => step = Ok(Step::Yield(next)),
                    None => return,
                },
                Yield::Value(outcome) => {
                    if let Some(co) = self.live.get_mut(&id) {
                        co.input = Some(Ok(outcome));
                        co.state = CoroutineState::Working;
                    }
                    return;
                }
                Yield::Future(future) => {
                    if let Some(co) = self.live.get_mut(&id) {
                        co.await_deadline = co.await_timeout.map(|t| Instant::now() + t);
                        co.awaiting = Awaiting::Future(future);
                        co.polled = false;
                        co.state = CoroutineState::Progress;
                    }
                    return;
                }
                Yield::Nested(sequence) => {
                    let child = self.start(sequence, Some(id), None);
                    if let Some(co) = self.live.get_mut(&id) {
                        co.awaiting = Awaiting::Child(child);
                        co.state = CoroutineState::Progress;
                    }
                    return;
                }
            }
        }
    }

    /// Deliver a final result to the parent, or settle the handle.
    fn finish(&mut self, id: u64, result: Result<Outcome>) {
        let Some(co) = self.live.get_mut(&id) else {
            return;
        };
        co.state = CoroutineState::Idle;
        co.sequence = None;
        let parent = co.parent;
        let handle = co.handle.take();
        debug!(coroutine = id, ok = result.is_ok(), "coroutine finished");

        if let Some(parent) = parent.and_then(|p| self.live.get_mut(&p)) {
            if parent.state == CoroutineState::Progress {
                parent.awaiting = Awaiting::Nothing;
                parent.input = Some(result);
                parent.state = CoroutineState::Working;
            }
            return;
        }

        let unobserved = match handle {
            Some(handle) => match result {
                Ok(outcome) => {
                    handle.settle(Ok(outcome));
                    None
                }
                Err(e) => (!handle.settle(Err(e.clone()))).then_some(e),
            },
            None => result.err(),
        };
        if let Some(e) = unobserved {
            error!(coroutine = id, error = %e, "coroutine failed and nobody observed it");
        }
    }

    /// Cancel `id`: its child first, then its awaited future, then its handle.
    /// A parent still waiting on it resumes with `Cancelled`.
    pub(super) fn cancel_with(&mut self, id: u64, reason: Error) {
        let Some(co) = self.live.get_mut(&id) else {
            return;
        };
        if co.state == CoroutineState::Idle {
            return;
        }
        co.state = CoroutineState::Idle;
        let awaiting = std::mem::replace(&mut co.awaiting, Awaiting::Nothing);

        if let Awaiting::Child(child) = awaiting {
            self.cancel_with(
                child,
                Error::Cancelled(format!("parent coroutine {} was cancelled", id)),
            );
        }
        drop(awaiting);

        let Some(co) = self.live.get_mut(&id) else {
            return;
        };
        co.sequence = None;
        co.input = None;
        co.await_deadline = None;
        let parent = co.parent;
        let handle = co.handle.take();
        debug!(coroutine = id, reason = %reason, "coroutine cancelled");

        if let Some(handle) = handle {
            handle.reject(reason.clone());
        }
        if let Some(parent) = parent.and_then(|p| self.live.get_mut(&p)) {
            if parent.state == CoroutineState::Progress {
                parent.awaiting = Awaiting::Nothing;
                parent.input = Some(Err(Error::Cancelled(format!(
                    "coroutine {} has been cancelled due to {}",
                    id, reason
                ))));
                parent.state = CoroutineState::Working;
            }
        }
    }

    pub(super) fn set_timeout(&mut self, id: u64, timeout: Duration) {
        if let Some(co) = self.live.get_mut(&id) {
            co.deadline = Instant::now() + timeout;
        }
    }

    pub(super) fn set_await_timeout(&mut self, id: u64, timeout: Duration) {
        if let Some(co) = self.live.get_mut(&id) {
            co.await_timeout = Some(timeout);
        }
    }

    pub(super) fn query_gate(&self) -> Option<Gate> {
        self.pool.as_ref().map(ConnectionPool::pending_threshold_lock)
    }
}
