//! # Core Traits
//!
//! The interface consumers program against. The host constructs one
//! implementation and hands out references (or `Arc<dyn ArtifactStore>`);
//! there is no process-wide instance.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::metrics::MetricsSnapshot;
use crate::types::{ReadOptions, WriteOptions};
use crate::Result;

/// Artifact store trait
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Read a whole artifact
    async fn read_optimized(&self, path: &Path, options: ReadOptions) -> Result<Bytes>;

    /// Replace an artifact's content; readers never see a partial file
    async fn write_optimized(&self, path: &Path, data: Bytes, options: WriteOptions) -> Result<()>;

    /// Get current metrics
    fn get_stats(&self) -> MetricsSnapshot;

    /// Flush pending writes and release resources
    async fn shutdown(&self) -> Result<()>;
}
