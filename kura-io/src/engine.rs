//! I/O Engine
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        IoEngine                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  Read Path:                                                 │
//! │  ┌─────────┐  hit  ┌───────────┐                            │
//! │  │  Query  │──────>│ ReadCache │                            │
//! │  └────┬────┘       └───────────┘                            │
//! │       │ miss                                                │
//! │       ▼                                                     │
//! │  ┌───────────┐    ┌──────────┐    ┌────────────┐            │
//! │  │ Scheduler │───>│ ReadPath │───>│ BufferPool │            │
//! │  └───────────┘    └──────────┘    └────────────┘            │
//! │                                                             │
//! │  Write Path:                                                │
//! │  ┌─────────┐    ┌───────────┐  small  ┌───────────┐         │
//! │  │  Write  │───>│ Scheduler │────────>│ Coalescer │         │
//! │  └─────────┘    └─────┬─────┘         └─────┬─────┘         │
//! │                       │ large               ▼               │
//! │                       └────────────> ┌──────────────┐       │
//! │                                      │ AtomicWriter │       │
//! │                                      └──────────────┘       │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use kura_core::{
    config::Config,
    error::{Error, Result},
    metrics::{Metrics, MetricsSnapshot, Timer},
    traits::ArtifactStore,
    types::{OperationDescriptor, OperationKind, ReadOptions, WriteOptions},
    utils::{format_bytes, normalize_path},
};

use crate::{
    atomic::AtomicWriter,
    cache::{CacheStats, ReadCache},
    coalesce::{CoalesceSettings, CoalesceStats, WriteCoalescer},
    pool::{BufferPool, PoolStats, Tier},
    read::ReadPath,
    scheduler::{join_within, remaining, Scheduler, SchedulerSettings, SchedulerStats},
};

/// Everything the engine knows about itself
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub metrics: MetricsSnapshot,
    pub cache: CacheStats,
    pub pool: PoolStats,
    pub scheduler: SchedulerStats,
    pub coalescer: CoalesceStats,
}

/// The I/O acceleration layer. Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct IoEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Config,
    pool: Arc<BufferPool>,
    cache: Arc<ReadCache>,
    reader: Arc<ReadPath>,
    coalescer: WriteCoalescer,
    scheduler: Scheduler,
    metrics: Metrics,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl IoEngine {
    pub async fn initialize(config: Config) -> Result<Self> {
        config.validate()?;

        for dir in config.storage.data_directories.all() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::from_io(e, dir))?;
        }

        let sweep_dirs = vec![
            config.storage.data_directories.primary.clone(),
            config.storage.data_directories.temp.clone(),
        ];
        let orphans = tokio::task::spawn_blocking(move || {
            let mut removed = 0;
            for dir in &sweep_dirs {
                match AtomicWriter::sweep_orphans(dir) {
                    Ok(n) => removed += n,
                    Err(e) => warn!(dir = %dir.display(), error = %e, "Orphan sweep failed"),
                }
            }
            removed
        })
        .await
        .map_err(|e| Error::internal(format!("orphan sweep task failed: {}", e)))?;
        if orphans > 0 {
            info!("Removed {} orphaned temp files", orphans);
        }

        let pool = Arc::new(BufferPool::new(&config.pool));
        if config.pool.prime_on_start {
            let stats = pool.stats();
            for tier in Tier::ALL {
                pool.prime(tier, stats.tier(tier).capacity);
            }
            debug!(
                "Primed buffer pool: {}",
                format_bytes(pool.stats().pooled_bytes() as u64)
            );
        }

        let metrics = Metrics::new();
        let cache = Arc::new(
            ReadCache::with_shards(config.storage.cache_max_bytes, config.cache.shards)
                .with_ttl(config.cache.ttl()),
        );
        let reader = Arc::new(ReadPath::new(
            Arc::clone(&pool),
            config.storage.read_ahead_bytes,
            config.storage.stream_threshold_bytes,
        ));
        let writer = Arc::new(AtomicWriter::new(config.storage.sync_writes));
        let scheduler = Scheduler::new(SchedulerSettings::from_config(&config));
        let coalescer = WriteCoalescer::new(
            CoalesceSettings::from_config(&config),
            writer,
            Arc::clone(&cache),
            metrics.clone(),
            scheduler.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            primary = %config.storage.data_directories.primary.display(),
            capacity = %format_bytes(config.storage.total_storage_bytes),
            cache = %format_bytes(config.storage.cache_max_bytes as u64),
            max_concurrent_ops = config.storage.max_concurrent_ops,
            "Initialized I/O engine"
        );

        let engine = Self {
            inner: Arc::new(EngineInner {
                config,
                pool,
                cache,
                reader,
                coalescer,
                scheduler,
                metrics,
                shutdown: shutdown_tx,
                closed: AtomicBool::new(false),
            }),
        };
        engine.start_background_tasks();
        Ok(engine)
    }

    fn start_background_tasks(&self) {
        let config = &self.inner.config;

        // Cache expiry sweeper
        if config.cache.enabled {
            let cache = Arc::clone(&self.inner.cache);
            let ttl = config.cache.ttl();
            let period = config.cache.sweep_interval();
            let mut shutdown_rx = self.inner.shutdown.subscribe();

            tokio::spawn(async move {
                let mut sweep_interval = interval(period);
                sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = sweep_interval.tick() => {
                            cache.sweep(ttl);
                        }
                        _ = shutdown_rx.changed() => {
                            info!("Shutting down cache sweeper");
                            break;
                        }
                    }
                }
            });
        }

        // Metrics reporter
        if config.monitoring.metrics.enabled {
            let metrics = self.inner.metrics.clone();
            let metrics_config = config.monitoring.metrics.clone();
            let mut shutdown_rx = self.inner.shutdown.subscribe();

            tokio::spawn(async move {
                let mut report_interval = interval(metrics_config.report_interval());
                report_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // the first tick fires immediately and would report nothing
                report_interval.tick().await;

                loop {
                    tokio::select! {
                        _ = report_interval.tick() => {
                            let snapshot = metrics.snapshot();
                            info!(
                                reads = snapshot.reads,
                                writes = snapshot.writes,
                                read_failures = snapshot.read_failures,
                                write_failures = snapshot.write_failures,
                                cache_hit_rate = snapshot.cache_hit_rate,
                                mean_read_ms = snapshot.mean_read_latency_ms,
                                mean_write_ms = snapshot.mean_write_latency_ms,
                                physical_writes = snapshot.physical_writes,
                                "I/O metrics"
                            );
                            for alert in snapshot.latency_alerts(&metrics_config) {
                                warn!("{}", alert);
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            info!("Shutting down metrics reporter");
                            break;
                        }
                    }
                }
            });
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Relative paths live under the primary data directory.
    fn resolve(&self, path: &Path) -> PathBuf {
        normalize_path(&self.inner.config.storage.data_directories.primary, path)
    }

    fn record(&self, kind: OperationKind, bytes: u64, latency: Duration, result: &Result<()>) {
        match result {
            Ok(()) => self.inner.metrics.record_completion(kind, bytes, latency),
            Err(e) => {
                self.inner.metrics.record_failure(kind, e);
                if !matches!(e, Error::NotFound { .. }) {
                    debug!(%kind, error = %e, code = e.error_code(), "Operation failed");
                }
            }
        }
    }

    pub async fn read_optimized(&self, path: &Path, options: ReadOptions) -> Result<Bytes> {
        self.ensure_open()?;
        let path = self.resolve(path);
        let timer = Timer::new("read_optimized");

        let use_cache = options.use_cache && self.inner.config.cache.enabled;
        if use_cache {
            if let Some(bytes) = self.inner.cache.get(&path) {
                self.inner.metrics.record_cache_hit();
                self.inner
                    .metrics
                    .record_completion(OperationKind::Read, bytes.len() as u64, timer.stop());
                return Ok(bytes);
            }
            self.inner.metrics.record_cache_miss();
        }

        let result = self.read_from_disk(path, &options, use_cache, timer.elapsed()).await;
        let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
        let bytes = result.as_ref().map_or(0, |b| b.len() as u64);
        self.record(OperationKind::Read, bytes, timer.stop(), &outcome);
        result
    }

    async fn read_from_disk(
        &self,
        path: PathBuf,
        options: &ReadOptions,
        use_cache: bool,
        spent: Duration,
    ) -> Result<Bytes> {
        let op = OperationDescriptor::new(path, OperationKind::Read, options.priority);
        let budget = remaining(options.deadline, spent);
        let permit = self.inner.scheduler.admit(&op, budget).await?;

        let inner = Arc::clone(&self.inner);
        let started = Instant::now();
        let task = tokio::spawn(async move {
            let _permit = permit;
            let epoch = inner.cache.epoch();
            let reader = Arc::clone(&inner.reader);
            let target = op.path().clone();
            let bytes = tokio::task::spawn_blocking(move || reader.read(&target))
                .await
                .map_err(|e| Error::internal(format!("read worker failed: {}", e)))??;

            if use_cache {
                inner.cache.put_if_current(op.path().clone(), bytes.clone(), epoch);
            }
            Ok(bytes)
        });

        join_within(task, budget.map(|limit| limit.saturating_sub(started.elapsed()))).await
    }

    /// Stream `path` through `sink` one read-ahead chunk at a time, without
    /// holding the whole file in memory. Bypasses the cache. The sink runs on
    /// a blocking worker; an error from it stops the read.
    pub async fn read_streamed<F>(&self, path: &Path, options: ReadOptions, sink: F) -> Result<u64>
    where
        F: FnMut(&[u8]) -> Result<()> + Send + 'static,
    {
        self.ensure_open()?;
        let path = self.resolve(path);
        let timer = Timer::new("read_streamed");

        let op = OperationDescriptor::new(path, OperationKind::Read, options.priority);
        let result = match self.inner.scheduler.admit(&op, options.deadline).await {
            Ok(permit) => {
                let reader = Arc::clone(&self.inner.reader);
                let task = tokio::spawn(async move {
                    let _permit = permit;
                    let target = op.path().clone();
                    tokio::task::spawn_blocking(move || reader.stream(&target, sink))
                        .await
                        .map_err(|e| Error::internal(format!("read worker failed: {}", e)))?
                });
                join_within(task, remaining(options.deadline, timer.elapsed())).await
            }
            Err(e) => Err(e),
        };

        let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
        let bytes = result.as_ref().map_or(0, |n| *n);
        self.record(OperationKind::Read, bytes, timer.stop(), &outcome);
        result
    }

    /// Write `data` as the new content of `path`. Small writes may be merged
    /// with others to the same path; every write is admitted by the scheduler.
    pub async fn write_optimized(&self, path: &Path, data: Bytes, options: WriteOptions) -> Result<()> {
        self.ensure_open()?;
        let path = self.resolve(path);
        let timer = Timer::new("write_optimized");
        let len = data.len() as u64;

        let result = self.inner.coalescer.write(path, data, options).await;

        self.record(OperationKind::Write, len, timer.stop(), &result);
        result
    }

    /// Flush the pending coalesce buffer of one path.
    pub async fn flush(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        self.inner.coalescer.flush(&self.resolve(path)).await
    }

    pub fn get_stats(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn detailed_stats(&self) -> EngineStats {
        EngineStats {
            metrics: self.inner.metrics.snapshot(),
            cache: self.inner.cache.stats(),
            pool: self.inner.pool.stats(),
            scheduler: self.inner.scheduler.stats(),
            coalescer: self.inner.coalescer.stats(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Flush every pending write, stop background tasks and release pooled
    /// memory. Every later call on this engine fails with `Closed`.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        info!("Shutting down I/O engine");

        let flushed = self.inner.coalescer.flush_all().await;
        if let Err(e) = &flushed {
            error!("Final flush failed: {}", e);
        }

        let _ = self.inner.shutdown.send(true);
        self.inner.pool.clear();
        self.inner.cache.clear();

        let snapshot = self.inner.metrics.snapshot();
        info!(
            reads = snapshot.reads,
            writes = snapshot.writes,
            physical_writes = snapshot.physical_writes,
            "I/O engine stopped"
        );
        flushed
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[async_trait]
impl ArtifactStore for IoEngine {
    async fn read_optimized(&self, path: &Path, options: ReadOptions) -> Result<Bytes> {
        IoEngine::read_optimized(self, path, options).await
    }

    async fn write_optimized(&self, path: &Path, data: Bytes, options: WriteOptions) -> Result<()> {
        IoEngine::write_optimized(self, path, data, options).await
    }

    fn get_stats(&self) -> MetricsSnapshot {
        IoEngine::get_stats(self)
    }

    async fn shutdown(&self) -> Result<()> {
        IoEngine::shutdown(self).await
    }
}
