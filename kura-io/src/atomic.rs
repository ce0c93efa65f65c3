//! # Atomic Writer
//!
//! Temp-file-then-rename commits. The temp file is a sibling of the
//! destination so the rename never crosses a filesystem boundary; readers
//! observe either the old content or the new, never a partial file.
//!
//! ```text
//!   dir/.name.<pid>.<seq>.kura-tmp   ──rename──►   dir/name
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use kura_core::error::{Error, Result, ResultExt};

/// Suffix of every in-progress temp file
pub const TEMP_SUFFIX: &str = ".kura-tmp";

pub struct AtomicWriter {
    sync: bool,
    sequence: AtomicU64,
}

impl AtomicWriter {
    /// `sync` forces `sync_data` on the temp file before it is renamed.
    pub fn new(sync: bool) -> Self {
        Self {
            sync,
            sequence: AtomicU64::new(0),
        }
    }

    /// Replace `path` with `data`. On error the destination is untouched.
    pub fn commit(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.stage(path, data)
            .and_then(StagedFile::commit)
            .with_context(|| "atomic write".to_string())
    }

    /// Write `data` to a fresh temp file next to `path` without renaming it.
    pub fn stage(&self, path: &Path, data: &[u8]) -> Result<StagedFile> {
        let file_name = path
            .file_name()
            .ok_or_else(|| Error::internal(format!("no file name in {}", path.display())))?;
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|e| Error::from_io(e, parent))?;

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let temp = parent.join(format!(
            ".{}.{}.{}{}",
            file_name.to_string_lossy(),
            std::process::id(),
            seq,
            TEMP_SUFFIX
        ));

        // From here on, dropping `staged` removes the temp file.
        let staged = StagedFile {
            temp,
            dest: path.to_path_buf(),
            committed: false,
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staged.temp)
            .map_err(|e| Error::from_io(e, &staged.temp))?;
        file.write_all(data)
            .map_err(|e| Error::from_io(e, &staged.temp))?;
        if self.sync {
            file.sync_data()
                .map_err(|e| Error::from_io(e, &staged.temp))?;
        }

        Ok(staged)
    }

    /// Remove temp files left behind by other (crashed) processes under
    /// `dir`. Temp files of the current process are left alone.
    pub fn sweep_orphans(dir: &Path) -> Result<usize> {
        let own_pid = std::process::id().to_string();
        let mut removed = 0;
        let mut pending = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            let entries = match fs::read_dir(&current) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::from_io(e, &current)),
            };

            for entry in entries.flatten() {
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if temp_owner(&name).is_some_and(|pid| pid != own_pid) {
                    match fs::remove_file(&path) {
                        Ok(()) => {
                            debug!(path = %path.display(), "Removed orphaned temp file");
                            removed += 1;
                        }
                        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove orphaned temp file"),
                    }
                }
            }
        }

        Ok(removed)
    }
}

/// Process id embedded in a temp file name, if `name` is one of ours.
fn temp_owner(name: &str) -> Option<&str> {
    let stem = name.strip_prefix('.')?.strip_suffix(TEMP_SUFFIX)?;
    let mut parts = stem.rsplitn(3, '.');
    let _seq = parts.next()?.parse::<u64>().ok()?;
    let pid = parts.next()?;
    pid.parse::<u32>().ok()?;
    parts.next()?;
    Some(pid)
}

/// A fully written temp file that has not been renamed into place yet.
/// Dropping it without calling [`StagedFile::commit`] deletes the temp file.
#[derive(Debug)]
pub struct StagedFile {
    temp: PathBuf,
    dest: PathBuf,
    committed: bool,
}

impl StagedFile {
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub fn destination(&self) -> &Path {
        &self.dest
    }

    /// Atomically swap the temp file onto the destination.
    pub fn commit(mut self) -> Result<()> {
        fs::rename(&self.temp, &self.dest).map_err(|e| Error::from_io(e, &self.dest))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = fs::remove_file(&self.temp) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.temp.display(), error = %e, "Failed to remove temp file");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(TEMP_SUFFIX))
            .collect()
    }

    #[test]
    fn test_commit_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/state.bin");
        let writer = AtomicWriter::new(false);

        writer.commit(&path, b"payload").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"payload");
        assert!(temp_files(path.parent().unwrap()).is_empty());
    }

    #[test]
    fn test_commit_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        let writer = AtomicWriter::new(true);

        writer.commit(&path, b"a much longer first version").unwrap();
        writer.commit(&path, b"v2").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"v2");
    }

    #[test]
    fn test_interrupted_before_rename_leaves_destination() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.bin");
        fs::write(&path, b"old").unwrap();
        let writer = AtomicWriter::new(false);

        let staged = writer.stage(&path, b"new content").unwrap();
        assert_eq!(fs::read(staged.temp_path()).unwrap(), b"new content");
        assert_eq!(fs::read(&path).unwrap(), b"old");

        // abandoned without rename
        drop(staged);
        assert_eq!(fs::read(&path).unwrap(), b"old");
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn test_failed_rename_cleans_temp() {
        let dir = TempDir::new().unwrap();
        // a non-empty directory cannot be replaced by a file
        let path = dir.path().join("occupied");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("inner"), b"x").unwrap();

        let writer = AtomicWriter::new(false);
        assert!(writer.commit(&path, b"data").is_err());
        assert!(path.is_dir());
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn test_temp_owner_parsing() {
        assert_eq!(temp_owner(".state.bin.4242.7.kura-tmp"), Some("4242"));
        assert_eq!(temp_owner(".x.1.0.kura-tmp"), Some("1"));
        assert_eq!(temp_owner("state.bin"), None);
        assert_eq!(temp_owner(".state.bin.kura-tmp"), None);
        assert_eq!(temp_owner(".a.notapid.3.kura-tmp"), None);
    }

    #[test]
    fn test_sweep_orphans_skips_own_process() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();

        let foreign_pid = std::process::id().wrapping_add(1);
        fs::write(nested.join(format!(".a.bin.{}.0{}", foreign_pid, TEMP_SUFFIX)), b"x").unwrap();
        let own = format!(".b.bin.{}.0{}", std::process::id(), TEMP_SUFFIX);
        fs::write(dir.path().join(&own), b"y").unwrap();
        fs::write(dir.path().join("keep.bin"), b"z").unwrap();

        assert_eq!(AtomicWriter::sweep_orphans(dir.path()).unwrap(), 1);
        assert!(dir.path().join(own).exists());
        assert!(dir.path().join("keep.bin").exists());
        assert!(temp_files(&nested).is_empty());
    }
}
