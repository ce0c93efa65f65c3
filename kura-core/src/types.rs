//! # Operation Types
//!
//! Per-call options and the descriptor the scheduler queues.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Kind of I/O operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Read,
    Write,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Read => write!(f, "read"),
            OperationKind::Write => write!(f, "write"),
        }
    }
}

/// Scheduling priority. `High` operations go to the priority queue and are
/// dispatched before any queued read or write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// Options for `read_optimized`
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Consult and populate the read cache
    pub use_cache: bool,
    pub priority: Priority,
    /// Give up if still queued after this long
    pub deadline: Option<Duration>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            priority: Priority::Normal,
            deadline: None,
        }
    }
}

impl ReadOptions {
    pub fn uncached() -> Self {
        Self {
            use_cache: false,
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Options for `write_optimized`
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Allow small writes to be merged with others to the same path
    pub coalesce: bool,
    pub priority: Priority,
    pub deadline: Option<Duration>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            coalesce: true,
            priority: Priority::Normal,
            deadline: None,
        }
    }
}

impl WriteOptions {
    pub fn direct() -> Self {
        Self {
            coalesce: false,
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A submitted operation as seen by the scheduler. Immutable once built.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    path: PathBuf,
    kind: OperationKind,
    priority: Priority,
    submitted_at: Instant,
}

impl OperationDescriptor {
    pub fn new(path: impl Into<PathBuf>, kind: OperationKind, priority: Priority) -> Self {
        Self {
            path: path.into(),
            kind,
            priority,
            submitted_at: Instant::now(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Time since submission
    pub fn age(&self) -> Duration {
        self.submitted_at.elapsed()
    }
}
