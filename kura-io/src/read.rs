//! # Read Path
//!
//! Blocking file reads backed by the buffer pool. Always run on a worker
//! (`spawn_blocking`), never on the orchestration runtime.
//!
//! Strategy by file size:
//! - `Whole`    (< 4 KiB): one small block, a single read cycle
//! - `Chunked`  (< stream threshold): medium block checkout/read/release
//!   until EOF, chunks appended in order
//! - `Streamed` (otherwise): read-ahead sized chunks through one large block.
//!   `read` still gathers them into one buffer; `stream` hands each chunk to a
//!   sink as it arrives, so the file is never held whole

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use kura_core::error::{Error, Result};

use crate::pool::{BufferPool, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    Whole,
    Chunked,
    Streamed,
}

impl ReadStrategy {
    pub fn for_size(size: u64, stream_threshold: u64) -> Self {
        if size < Tier::Small.block_size() as u64 {
            ReadStrategy::Whole
        } else if size < stream_threshold {
            ReadStrategy::Chunked
        } else {
            ReadStrategy::Streamed
        }
    }
}

pub struct ReadPath {
    pool: Arc<BufferPool>,
    read_ahead: usize,
    stream_threshold: u64,
}

impl ReadPath {
    pub fn new(pool: Arc<BufferPool>, read_ahead: usize, stream_threshold: u64) -> Self {
        Self {
            pool,
            read_ahead: read_ahead.clamp(1, Tier::Large.block_size()),
            stream_threshold,
        }
    }

    /// Read the whole file. Fewer bytes than the size reported by `stat` is
    /// reported as `Corrupt`, never returned truncated.
    pub fn read(&self, path: &Path) -> Result<Bytes> {
        let mut file = File::open(path).map_err(|e| Error::from_io(e, path))?;
        let expected = file.metadata().map_err(|e| Error::from_io(e, path))?.len();
        let strategy = ReadStrategy::for_size(expected, self.stream_threshold);
        trace!(path = %path.display(), size = expected, ?strategy, "Reading file");

        let data = match strategy {
            ReadStrategy::Whole => self.read_whole(&mut file, path)?,
            ReadStrategy::Chunked => self.read_chunked(&mut file, path, expected)?,
            ReadStrategy::Streamed => {
                let mut out = BytesMut::with_capacity(expected as usize);
                self.stream_file(&mut file, path, |chunk| {
                    out.extend_from_slice(chunk);
                    Ok(())
                })?;
                out.freeze()
            }
        };

        check_length(path, expected, data.len() as u64)?;
        Ok(data)
    }

    /// Push the file through `sink` in read-ahead sized chunks without
    /// holding it in memory. Returns the number of bytes delivered.
    pub fn stream<F>(&self, path: &Path, sink: F) -> Result<u64>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let mut file = File::open(path).map_err(|e| Error::from_io(e, path))?;
        let expected = file.metadata().map_err(|e| Error::from_io(e, path))?.len();
        let total = self.stream_file(&mut file, path, sink)?;
        check_length(path, expected, total)?;
        Ok(total)
    }

    fn read_whole(&self, file: &mut File, path: &Path) -> Result<Bytes> {
        let mut block = self.pool.checkout(Tier::Small);
        let result = fill(file, &mut block).map(|n| Bytes::copy_from_slice(&block[..n]));
        self.pool.release(block);
        result.map_err(|e| Error::from_io(e, path))
    }

    fn read_chunked(&self, file: &mut File, path: &Path, expected: u64) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(expected as usize);
        loop {
            let mut block = self.pool.checkout(Tier::Medium);
            let result = fill(file, &mut block);
            if let Ok(n) = &result {
                out.extend_from_slice(&block[..*n]);
            }
            self.pool.release(block);

            match result {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => return Err(Error::from_io(e, path)),
            }
        }
        Ok(out.freeze())
    }

    fn stream_file<F>(&self, file: &mut File, path: &Path, mut sink: F) -> Result<u64>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let mut block = self.pool.checkout(Tier::Large);
        let chunk_len = self.read_ahead.min(block.capacity());
        let mut total = 0u64;

        let result = loop {
            match fill(file, &mut block[..chunk_len]) {
                Ok(0) => break Ok(total),
                Ok(n) => {
                    if let Err(e) = sink(&block[..n]) {
                        break Err(e);
                    }
                    total += n as u64;
                }
                Err(e) => break Err(Error::from_io(e, path)),
            }
        };

        self.pool.release(block);
        result
    }
}

fn check_length(path: &Path, expected: u64, actual: u64) -> Result<()> {
    if actual < expected {
        return Err(Error::Corrupt {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Read until `buf` is full or EOF. Returns bytes read.
fn fill(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kura_core::config::PoolConfig;
    use tempfile::TempDir;

    fn read_path(stream_threshold: u64) -> (ReadPath, Arc<BufferPool>) {
        let pool = Arc::new(BufferPool::new(&PoolConfig::default()));
        (ReadPath::new(Arc::clone(&pool), 256 * 1024, stream_threshold), pool)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_strategy_selection() {
        let threshold = 10 * 1024 * 1024;
        assert_eq!(ReadStrategy::for_size(0, threshold), ReadStrategy::Whole);
        assert_eq!(ReadStrategy::for_size(4095, threshold), ReadStrategy::Whole);
        assert_eq!(ReadStrategy::for_size(4096, threshold), ReadStrategy::Chunked);
        assert_eq!(ReadStrategy::for_size(threshold, threshold), ReadStrategy::Streamed);
    }

    #[test]
    fn test_reads_every_strategy() {
        let dir = TempDir::new().unwrap();
        // small threshold so the streamed path is exercised cheaply
        let (reader, pool) = read_path(512 * 1024);

        for len in [0usize, 17, 4096, 200_000, 1_300_000] {
            let path = dir.path().join(format!("f{}", len));
            let data = pattern(len);
            std::fs::write(&path, &data).unwrap();
            assert_eq!(reader.read(&path).unwrap().as_ref(), data.as_slice(), "len {}", len);
        }

        // every block went back to its pool
        let stats = pool.stats();
        assert!(stats.medium.reuses > 0);
        assert_eq!(stats.small.free, 1);
        assert_eq!(stats.large.free, 1);
    }

    #[test]
    fn test_stream_delivers_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big");
        let data = pattern(700_000);
        std::fs::write(&path, &data).unwrap();

        let (reader, _) = read_path(u64::MAX);
        let mut seen = Vec::new();
        let mut chunks = 0;
        let total = reader
            .stream(&path, |chunk| {
                assert!(chunk.len() <= 256 * 1024);
                chunks += 1;
                seen.extend_from_slice(chunk);
                Ok(())
            })
            .unwrap();
        assert_eq!(total, data.len() as u64);
        assert_eq!(chunks, 3);
        assert_eq!(seen, data);
    }

    #[test]
    fn test_sink_error_stops_stream() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big");
        std::fs::write(&path, pattern(600_000)).unwrap();

        let (reader, pool) = read_path(u64::MAX);
        let err = reader
            .stream(&path, |_| Err(Error::internal("sink full")))
            .unwrap_err();
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
        assert_eq!(pool.stats().large.free, 1);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (reader, _) = read_path(u64::MAX);
        let err = reader.read(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_short_read_is_corrupt() {
        let err = check_length(Path::new("/x"), 10, 4).unwrap_err();
        assert!(matches!(err, Error::Corrupt { expected: 10, actual: 4, .. }));
        assert!(check_length(Path::new("/x"), 10, 12).is_ok());
    }
}
