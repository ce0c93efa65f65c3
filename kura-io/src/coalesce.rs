//! # Write Coalescer
//!
//! Merges bursts of small writes to the same path into one physical write.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  write("a") ──┐                                                 │
//! │  write("b") ──┼──► CoalesceBuffer(path) ──debounce──► "abc"     │
//! │  write("c") ──┘        (oneshot per caller)     AtomicWriter    │
//! │                                                                 │
//! │  large write ────────────────────────────────► AtomicWriter     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Opening a buffer takes a Write slot from the [`Scheduler`], held until the
//! buffer's commit finishes; writes that join an open buffer ride on that slot.
//! Each path has at most one open buffer. Taking a buffer for flush removes it
//! from the map, so later writes open a fresh one instead of racing the
//! in-flight commit. Every taken payload gets a generation number; commits for
//! a path pass through that path's gate, which skips any payload older than
//! what is already on disk. Content is whole-file replacement, so a skipped
//! payload was superseded, not lost.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use kura_core::{
    config::Config,
    error::{Error, Result},
    metrics::Metrics,
    types::{OperationDescriptor, OperationKind, WriteOptions},
};

use crate::atomic::AtomicWriter;
use crate::cache::ReadCache;
use crate::scheduler::{join_within, remaining, Permit, Scheduler};

/// Coalescing knobs, resolved from [`Config`]
#[derive(Debug, Clone)]
pub struct CoalesceSettings {
    pub enabled: bool,
    /// Writes strictly below this size are buffered
    pub threshold_bytes: usize,
    /// Debounce window, re-armed by every write to the buffer
    pub window: Duration,
    /// Hard cap on how long a buffer stays open
    pub max_delay: Duration,
    /// A buffer reaching this size is flushed immediately
    pub max_buffer_bytes: usize,
}

impl CoalesceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.coalesce.enabled,
            threshold_bytes: config.coalesce.threshold_bytes,
            window: config.storage.coalesce_window(),
            max_delay: config.coalesce.max_delay(),
            max_buffer_bytes: config.storage.write_buffer_bytes,
        }
    }
}

impl Default for CoalesceSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Pending small writes for one path
pub struct CoalesceBuffer {
    id: u64,
    chunks: Vec<Bytes>,
    len: usize,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    deadline: Instant,
    hard_deadline: Instant,
    /// Scheduler slot, released when the buffer is dropped after its commit
    _slot: Permit,
}

impl CoalesceBuffer {
    fn new(id: u64, now: Instant, settings: &CoalesceSettings, slot: Permit) -> Self {
        Self {
            id,
            chunks: Vec::new(),
            len: 0,
            waiters: Vec::new(),
            deadline: now + settings.window,
            hard_deadline: now + settings.max_delay,
            _slot: slot,
        }
    }

    fn push(&mut self, data: Bytes, waiter: oneshot::Sender<Result<()>>, now: Instant, window: Duration) {
        self.len += data.len();
        self.chunks.push(data);
        self.waiters.push(waiter);
        self.deadline = (now + window).min(self.hard_deadline);
    }

    /// Chunks concatenated in arrival order
    fn payload(&mut self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.chunks.pop().unwrap_or_default();
        }
        let mut buf = BytesMut::with_capacity(self.len);
        for chunk in self.chunks.drain(..) {
            buf.extend_from_slice(&chunk);
        }
        buf.freeze()
    }
}

/// Serializes commits for one path; holds the last committed generation.
type CommitGate = tokio::sync::Mutex<u64>;

struct PathState {
    pending: Option<CoalesceBuffer>,
    gate: Arc<CommitGate>,
}

impl PathState {
    fn new() -> Self {
        Self {
            pending: None,
            gate: Arc::new(tokio::sync::Mutex::new(0)),
        }
    }
}

/// A buffer removed from the map, on its way to disk
struct TakenBuffer {
    buffer: CoalesceBuffer,
    generation: u64,
    gate: Arc<CommitGate>,
}

#[derive(Default)]
struct CoalesceCounters {
    flushes: AtomicU64,
    merged_chunks: AtomicU64,
    direct_writes: AtomicU64,
    superseded: AtomicU64,
    failures: AtomicU64,
}

/// Coalescer statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoalesceStats {
    pub pending_buffers: usize,
    pub pending_bytes: usize,
    pub flushes: u64,
    pub merged_chunks: u64,
    pub direct_writes: u64,
    /// Payloads skipped because newer content for the path was committed
    pub superseded: u64,
    pub failures: u64,
}

#[derive(Clone)]
pub struct WriteCoalescer {
    inner: Arc<Inner>,
}

struct Inner {
    paths: Mutex<HashMap<PathBuf, PathState>>,
    writer: Arc<AtomicWriter>,
    cache: Arc<ReadCache>,
    metrics: Metrics,
    scheduler: Scheduler,
    settings: CoalesceSettings,
    next_generation: AtomicU64,
    next_buffer_id: AtomicU64,
    counters: CoalesceCounters,
}

impl WriteCoalescer {
    pub fn new(
        settings: CoalesceSettings,
        writer: Arc<AtomicWriter>,
        cache: Arc<ReadCache>,
        metrics: Metrics,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                paths: Mutex::new(HashMap::new()),
                writer,
                cache,
                metrics,
                scheduler,
                settings,
                next_generation: AtomicU64::new(1),
                next_buffer_id: AtomicU64::new(0),
                counters: CoalesceCounters::default(),
            }),
        }
    }

    /// Whether a write of `len` bytes would be buffered
    pub fn would_coalesce(&self, len: usize, coalesce: bool) -> bool {
        coalesce && self.inner.settings.enabled && len < self.inner.settings.threshold_bytes
    }

    /// Write `data` as the new content of `path`. Resolves once the bytes are
    /// committed, or with the error shared by every write of the same flush.
    ///
    /// Fails with `Overloaded` or `Timeout` when the write needs a scheduler
    /// slot and cannot get one.
    pub async fn write(&self, path: PathBuf, data: Bytes, options: WriteOptions) -> Result<()> {
        let started = Instant::now();
        let op = OperationDescriptor::new(path, OperationKind::Write, options.priority);

        if !self.would_coalesce(data.len(), options.coalesce) {
            let permit = self.inner.scheduler.admit(&op, options.deadline).await?;
            let budget = remaining(options.deadline, started.elapsed());
            return self.write_direct(op.path().clone(), data, permit, budget).await;
        }

        let mut slot = None;
        let rx = loop {
            match self.enqueue(op.path(), &data, &mut slot) {
                Some(rx) => break rx,
                None => {
                    let budget = remaining(options.deadline, started.elapsed());
                    slot = Some(self.inner.scheduler.admit(&op, budget).await?);
                }
            }
        };
        // still set only if a buffer was opened while we queued; that one's slot covers us
        drop(slot);

        let outcome = match remaining(options.deadline, started.elapsed()) {
            Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| Error::Timeout {
                waited_ms: op.age().as_millis() as u64,
            })?,
            None => rx.await,
        };
        outcome.map_err(|_| Error::internal("coalesce buffer dropped before flush"))?
    }

    /// Append to the open buffer for `path`, or open one with `slot`. Returns
    /// `None` when a buffer must be opened and no slot is at hand.
    fn enqueue(
        &self,
        path: &Path,
        data: &Bytes,
        slot: &mut Option<Permit>,
    ) -> Option<oneshot::Receiver<Result<()>>> {
        let inner = &self.inner;
        let now = Instant::now();
        let mut new_buffer = None;
        let mut full = None;
        let (tx, rx) = oneshot::channel();

        {
            let mut paths = inner.paths.lock();
            if slot.is_none() && paths.get(path).map_or(true, |s| s.pending.is_none()) {
                return None;
            }
            let state = paths.entry(path.to_path_buf()).or_insert_with(PathState::new);
            let buffer = match state.pending.take() {
                Some(buffer) => buffer,
                None => {
                    let id = inner.next_buffer_id.fetch_add(1, Ordering::Relaxed);
                    new_buffer = Some(id);
                    CoalesceBuffer::new(id, now, &inner.settings, slot.take()?)
                }
            };
            let buffer = state.pending.insert(buffer);
            buffer.push(data.clone(), tx, now, inner.settings.window);

            if buffer.len >= inner.settings.max_buffer_bytes {
                full = inner.take(state);
            }
        }

        if let Some(id) = new_buffer {
            tokio::spawn(Arc::clone(inner).debounce(path.to_path_buf(), id));
        }
        if let Some(taken) = full {
            debug!(path = %path.display(), "Coalesce buffer full, flushing early");
            tokio::spawn(Arc::clone(inner).commit_taken(path.to_path_buf(), taken));
        }
        Some(rx)
    }

    async fn write_direct(
        &self,
        path: PathBuf,
        data: Bytes,
        permit: Permit,
        budget: Option<Duration>,
    ) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        inner.counters.direct_writes.fetch_add(1, Ordering::Relaxed);

        let (earlier, generation, gate) = {
            let mut paths = inner.paths.lock();
            let state = paths.entry(path.clone()).or_insert_with(PathState::new);
            // buffered writes arrived first and must get the older generation
            let earlier = inner.take(state);
            let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
            (earlier, generation, Arc::clone(&state.gate))
        };

        if let Some(taken) = earlier {
            tokio::spawn(Arc::clone(&inner).commit_taken(path.clone(), taken));
        }

        // spawned so a dropped caller cannot abandon a commit halfway
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let result = inner.commit_ordered(&path, data, generation, gate, 1).await;
            inner.release_path(&path);
            result
        });
        join_within(handle, budget).await
    }

    /// Flush the open buffer for `path`, if any, and wait for the outcome.
    pub async fn flush(&self, path: &Path) -> Result<()> {
        let taken = {
            let mut paths = self.inner.paths.lock();
            match paths.get_mut(path) {
                Some(state) => self.inner.take(state),
                None => None,
            }
        };
        match taken {
            Some(taken) => {
                let handle = tokio::spawn(Arc::clone(&self.inner).commit_taken(path.to_path_buf(), taken));
                handle
                    .await
                    .map_err(|e| Error::internal(format!("flush task failed: {}", e)))?
            }
            None => Ok(()),
        }
    }

    /// Flush every open buffer and wait for in-flight commits to finish.
    /// Returns the first failure, after all flushes have completed.
    pub async fn flush_all(&self) -> Result<()> {
        let (taken, gates): (Vec<_>, Vec<_>) = {
            let mut paths = self.inner.paths.lock();
            let taken = paths
                .iter_mut()
                .filter_map(|(path, state)| self.inner.take(state).map(|t| (path.clone(), t)))
                .collect();
            let gates = paths
                .iter()
                .map(|(path, s)| (path.clone(), Arc::clone(&s.gate)))
                .collect();
            (taken, gates)
        };

        let handles = taken
            .into_iter()
            .map(|(path, t)| tokio::spawn(Arc::clone(&self.inner).commit_taken(path, t)));
        let mut first_error = None;
        for joined in join_all(handles).await {
            let result = joined.map_err(|e| Error::internal(format!("flush task failed: {}", e)));
            if let Err(e) = result.and_then(|r| r) {
                first_error.get_or_insert(e);
            }
        }

        // commits started before this call still hold their gates
        for (path, gate) in gates {
            drop(gate.lock().await);
            drop(gate);
            self.inner.release_path(&path);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> CoalesceStats {
        let (pending_buffers, pending_bytes) = {
            let paths = self.inner.paths.lock();
            paths
                .values()
                .filter_map(|s| s.pending.as_ref())
                .fold((0, 0), |(n, bytes), b| (n + 1, bytes + b.len))
        };
        let c = &self.inner.counters;
        CoalesceStats {
            pending_buffers,
            pending_bytes,
            flushes: c.flushes.load(Ordering::Relaxed),
            merged_chunks: c.merged_chunks.load(Ordering::Relaxed),
            direct_writes: c.direct_writes.load(Ordering::Relaxed),
            superseded: c.superseded.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn take(&self, state: &mut PathState) -> Option<TakenBuffer> {
        let buffer = state.pending.take()?;
        Some(TakenBuffer {
            buffer,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            gate: Arc::clone(&state.gate),
        })
    }

    /// Timer task for one buffer: sleeps until its (re-armable) deadline and
    /// flushes it, unless someone else took it first.
    async fn debounce(self: Arc<Self>, path: PathBuf, id: u64) {
        loop {
            let wake = {
                let paths = self.paths.lock();
                match paths.get(&path).and_then(|s| s.pending.as_ref()) {
                    Some(buffer) if buffer.id == id => buffer.deadline,
                    _ => return,
                }
            };

            tokio::time::sleep_until(wake).await;

            let taken = {
                let mut paths = self.paths.lock();
                let Some(state) = paths.get_mut(&path) else {
                    return;
                };
                match state.pending.as_ref() {
                    Some(buffer) if buffer.id == id => {
                        if Instant::now() < buffer.deadline {
                            continue;
                        }
                        self.take(state)
                    }
                    _ => return,
                }
            };

            if let Some(taken) = taken {
                let _ = Arc::clone(&self).commit_taken(path, taken).await;
            }
            return;
        }
    }

    /// Commit a taken buffer and resolve all of its waiters with one outcome.
    async fn commit_taken(self: Arc<Self>, path: PathBuf, taken: TakenBuffer) -> Result<()> {
        let TakenBuffer {
            mut buffer,
            generation,
            gate,
        } = taken;
        let chunks = buffer.chunks.len() as u64;
        let payload = buffer.payload();

        let result = self
            .commit_ordered(&path, payload, generation, gate, chunks)
            .await;
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        self.counters.merged_chunks.fetch_add(chunks, Ordering::Relaxed);
        debug!(
            path = %path.display(),
            chunks,
            bytes = buffer.len,
            ok = result.is_ok(),
            "Flushed coalesce buffer"
        );

        let waiters = std::mem::take(&mut buffer.waiters);
        // frees the scheduler slot before anyone is told the write landed
        drop(buffer);
        for waiter in waiters {
            // a caller that went away does not affect the others
            let _ = waiter.send(result.clone());
        }
        self.release_path(&path);
        result
    }

    async fn commit_ordered(
        &self,
        path: &Path,
        payload: Bytes,
        generation: u64,
        gate: Arc<CommitGate>,
        chunks: u64,
    ) -> Result<()> {
        let mut committed = gate.lock().await;
        if *committed > generation {
            self.counters.superseded.fetch_add(1, Ordering::Relaxed);
            debug!(path = %path.display(), generation, "Skipping superseded payload");
            return Ok(());
        }

        let writer = Arc::clone(&self.writer);
        let target = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || writer.commit(&target, &payload))
            .await
            .map_err(|e| Error::internal(format!("write worker failed: {}", e)))
            .and_then(|r| r);

        match &result {
            Ok(()) => {
                *committed = generation;
                self.cache.invalidate(path);
                self.metrics.record_physical_write(chunks);
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = %path.display(), error = %e, "Commit failed");
            }
        }
        result
    }

    /// Forget a path once nothing is buffered or in flight for it.
    fn release_path(&self, path: &Path) {
        let mut paths = self.paths.lock();
        let idle = paths
            .get(path)
            .is_some_and(|s| s.pending.is_none() && Arc::strong_count(&s.gate) == 1);
        if idle {
            paths.remove(path);
        }
    }
}
