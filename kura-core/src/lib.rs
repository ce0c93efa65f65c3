//! # Kura Core
//!
//! Shared building blocks for the Kura I/O layer:
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                    kura-core                    │
//! ├─────────────────────────────────────────────────┤
//! │  • config   - Sections, defaults, TOML loading  │
//! │  • error    - Typed, clonable error             │
//! │  • metrics  - Counters and running latencies    │
//! │  • types    - Operation options and descriptor  │
//! │  • traits   - ArtifactStore interface           │
//! │  • logging  - tracing-subscriber setup          │
//! │  • utils    - Path normalization, formatting    │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod traits;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use traits::ArtifactStore;
pub use types::{OperationDescriptor, OperationKind, Priority, ReadOptions, WriteOptions};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
