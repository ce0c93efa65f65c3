//! # I/O Scheduler
//!
//! Admission control in front of the blocking workers.
//!
//! ```text
//!   priority ─┐
//!   read ─────┼──► dispatch ──► in flight (≤ max_concurrent_ops)
//!   write ────┘   (priority first, then read:write weighted round-robin)
//! ```
//!
//! `admit` returns a [`Permit`] that holds one concurrency slot until it is
//! dropped. Each queue has a bounded depth; when no slot is free and the
//! queue is full the call fails at once with `Overloaded`. Dropping the
//! admission future, or hitting its deadline, while still queued removes the
//! waiter. Once dispatched an operation is never cancelled here.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use kura_core::{
    config::Config,
    error::{Error, Result},
    types::{OperationDescriptor, OperationKind, Priority},
};

/// Logical queue an operation waits in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Priority,
    Read,
    Write,
}

impl Lane {
    pub fn for_op(kind: OperationKind, priority: Priority) -> Self {
        match (priority, kind) {
            (Priority::High, _) => Lane::Priority,
            (Priority::Normal, OperationKind::Read) => Lane::Read,
            (Priority::Normal, OperationKind::Write) => Lane::Write,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Lane::Priority => "priority",
            Lane::Read => "read",
            Lane::Write => "write",
        }
    }

    fn index(self) -> usize {
        match self {
            Lane::Priority => 0,
            Lane::Read => 1,
            Lane::Write => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent_ops: usize,
    pub read_queue_depth: usize,
    pub write_queue_depth: usize,
    pub priority_queue_depth: usize,
    pub read_weight: u32,
    pub write_weight: u32,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_ops: config.storage.max_concurrent_ops,
            read_queue_depth: config.scheduler.read_queue_depth,
            write_queue_depth: config.scheduler.write_queue_depth,
            priority_queue_depth: config.scheduler.priority_queue_depth,
            read_weight: config.scheduler.read_weight,
            write_weight: config.scheduler.write_weight,
        }
    }

    fn depth(&self, lane: Lane) -> usize {
        match lane {
            Lane::Priority => self.priority_queue_depth,
            Lane::Read => self.read_queue_depth,
            Lane::Write => self.write_queue_depth,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub priority_depth: usize,
    pub read_depth: usize,
    pub write_depth: usize,
    pub dispatched: u64,
    pub completed: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub cancelled: u64,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct SchedState {
    in_flight: usize,
    queues: [VecDeque<Waiter>; 3],
    read_credit: u32,
    write_credit: u32,
    next_id: u64,
    dispatched: u64,
    completed: u64,
    rejected: u64,
    timed_out: u64,
    cancelled: u64,
}

impl SchedState {
    fn queue(&mut self, lane: Lane) -> &mut VecDeque<Waiter> {
        &mut self.queues[lane.index()]
    }

    fn all_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    fn remove(&mut self, lane: Lane, id: u64) -> bool {
        let queue = self.queue(lane);
        match queue.iter().position(|w| w.id == id) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Lane to serve next: priority always first, then reads and writes in
    /// proportion to their weights while both have waiters.
    fn next_lane(&mut self, settings: &SchedulerSettings) -> Option<Lane> {
        if !self.queues[Lane::Priority.index()].is_empty() {
            return Some(Lane::Priority);
        }
        let reads = !self.queues[Lane::Read.index()].is_empty();
        let writes = !self.queues[Lane::Write.index()].is_empty();
        match (reads, writes) {
            (false, false) => None,
            (true, false) => Some(Lane::Read),
            (false, true) => Some(Lane::Write),
            (true, true) => {
                if self.read_credit == 0 && self.write_credit == 0 {
                    self.read_credit = settings.read_weight;
                    self.write_credit = settings.write_weight;
                }
                if self.read_credit > 0 {
                    self.read_credit -= 1;
                    Some(Lane::Read)
                } else {
                    self.write_credit -= 1;
                    Some(Lane::Write)
                }
            }
        }
    }

    /// Hand free slots to queued waiters.
    fn dispatch(&mut self, settings: &SchedulerSettings) {
        while self.in_flight < settings.max_concurrent_ops {
            let Some(lane) = self.next_lane(settings) else {
                break;
            };
            let Some(waiter) = self.queue(lane).pop_front() else {
                break;
            };
            match waiter.tx.send(()) {
                Ok(()) => {
                    self.in_flight += 1;
                    self.dispatched += 1;
                    trace!(lane = lane.name(), id = waiter.id, "Dispatched queued operation");
                }
                Err(()) => {
                    self.cancelled += 1;
                }
            }
        }
    }
}

struct Inner {
    state: Mutex<SchedState>,
    settings: SchedulerSettings,
}

impl Inner {
    fn complete(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.completed += 1;
        state.dispatch(&self.settings);
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(mut settings: SchedulerSettings) -> Self {
        // zero would stall dispatch or exhaust the round-robin credits
        settings.max_concurrent_ops = settings.max_concurrent_ops.max(1);
        settings.read_weight = settings.read_weight.max(1);
        settings.write_weight = settings.write_weight.max(1);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedState {
                    in_flight: 0,
                    queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                    read_credit: 0,
                    write_credit: 0,
                    next_id: 0,
                    dispatched: 0,
                    completed: 0,
                    rejected: 0,
                    timed_out: 0,
                    cancelled: 0,
                }),
                settings,
            }),
        }
    }

    /// Wait for a concurrency slot for `op`.
    ///
    /// Fails with `Overloaded` when the op would have to queue and its queue
    /// is full, or with `Timeout` when `deadline` passes while still queued.
    pub async fn admit(&self, op: &OperationDescriptor, deadline: Option<Duration>) -> Result<Permit> {
        let lane = Lane::for_op(op.kind(), op.priority());
        let (id, rx) = {
            let mut state = self.inner.state.lock();
            if state.in_flight < self.inner.settings.max_concurrent_ops && state.all_empty() {
                state.in_flight += 1;
                state.dispatched += 1;
                return Ok(self.permit());
            }

            let depth = state.queue(lane).len();
            if depth >= self.inner.settings.depth(lane) {
                state.rejected += 1;
                let in_flight = state.in_flight;
                drop(state);
                debug!(
                    path = %op.path().display(),
                    queue = lane.name(),
                    depth,
                    in_flight,
                    "Rejecting operation, queue full"
                );
                return Err(Error::Overloaded {
                    queue: lane.name(),
                    depth,
                    in_flight,
                });
            }

            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.queue(lane).push_back(Waiter { id, tx });
            state.dispatch(&self.inner.settings);
            (id, rx)
        };

        let mut queued = Queued {
            inner: Arc::clone(&self.inner),
            lane,
            id,
            rx,
            settled: false,
        };

        let outcome = match deadline {
            Some(limit) => tokio::time::timeout(limit, &mut queued.rx).await.ok(),
            None => Some((&mut queued.rx).await),
        };

        match outcome {
            Some(Ok(())) => {
                queued.settled = true;
                Ok(self.permit())
            }
            Some(Err(_)) => Err(Error::internal("scheduler dropped a queued operation")),
            None => {
                let removed = {
                    let mut state = self.inner.state.lock();
                    let removed = state.remove(lane, id);
                    if removed {
                        state.timed_out += 1;
                    }
                    removed
                };
                queued.settled = true;
                if removed {
                    let waited_ms = op.age().as_millis() as u64;
                    debug!(path = %op.path().display(), waited_ms, "Queued operation timed out");
                    Err(Error::Timeout { waited_ms })
                } else {
                    // dispatched right as the deadline passed; the slot is ours
                    Ok(self.permit())
                }
            }
        }
    }

    fn permit(&self) -> Permit {
        Permit {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        SchedulerStats {
            in_flight: state.in_flight,
            max_concurrent: self.inner.settings.max_concurrent_ops,
            priority_depth: state.queues[Lane::Priority.index()].len(),
            read_depth: state.queues[Lane::Read.index()].len(),
            write_depth: state.queues[Lane::Write.index()].len(),
            dispatched: state.dispatched,
            completed: state.completed,
            rejected: state.rejected,
            timed_out: state.timed_out,
            cancelled: state.cancelled,
        }
    }
}

/// One occupied concurrency slot; freed on drop.
pub struct Permit {
    inner: Arc<Inner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.inner.complete();
    }
}

/// Deadline left after `spent` has elapsed
pub(crate) fn remaining(deadline: Option<Duration>, spent: Duration) -> Option<Duration> {
    deadline.map(|limit| limit.saturating_sub(spent))
}

/// Await a dispatched operation. If `limit` passes first the caller gets
/// `Timeout` and the task keeps running to completion on its own.
pub(crate) async fn join_within<T>(task: JoinHandle<Result<T>>, limit: Option<Duration>) -> Result<T> {
    let joined = match limit {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            Err(_) => {
                return Err(Error::Timeout {
                    waited_ms: limit.as_millis() as u64,
                })
            }
        },
        None => task.await,
    };
    joined.map_err(|e| Error::internal(format!("I/O task failed: {}", e)))?
}

/// A waiter that has not been granted a slot yet.
struct Queued {
    inner: Arc<Inner>,
    lane: Lane,
    id: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for Queued {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.remove(self.lane, self.id) {
            state.cancelled += 1;
            trace!(lane = self.lane.name(), id = self.id, "Queued operation cancelled");
        } else if self.rx.try_recv().is_ok() {
            // granted a slot nobody will use
            state.in_flight = state.in_flight.saturating_sub(1);
            state.dispatch(&self.inner.settings);
        }
    }
}
