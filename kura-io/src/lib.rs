//! # Kura I/O Layer
//!
//! In-process acceleration for artifact reads and writes.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Read Path                              │
//! │                                                             │
//! │  read_optimized ──> ReadCache ──miss──> Scheduler           │
//! │                                            │                │
//! │                                            ▼                │
//! │                          ReadPath (pooled blocks, worker)   │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Write Path                             │
//! │                                                             │
//! │  write_optimized ──> Scheduler ──small──> WriteCoalescer    │
//! │                          │                      │           │
//! │                          └──large──> AtomicWriter <┘        │
//! │                                  (temp file + rename)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod atomic;
pub mod cache;
pub mod coalesce;
pub mod engine;
pub mod pool;
pub mod read;
pub mod scheduler;

pub use atomic::{AtomicWriter, StagedFile};
pub use cache::{CacheStats, ReadCache};
pub use coalesce::{CoalesceSettings, CoalesceStats, WriteCoalescer};
pub use engine::{EngineStats, IoEngine};
pub use pool::{Block, BufferPool, PoolStats, Tier};
pub use read::{ReadPath, ReadStrategy};
pub use scheduler::{Lane, Permit, Scheduler, SchedulerSettings, SchedulerStats};
