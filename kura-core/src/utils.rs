//! # Common Utilities
//!
//! Helpers shared by the Kura crates.

use std::path::{Component, Path, PathBuf};

/// Format bytes in human readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let exp = (bytes_f64.log2() / 10.0).floor() as usize;
    let unit_index = exp.min(UNITS.len() - 1);
    let size = bytes_f64 / (1024_f64).powi(unit_index as i32);

    if unit_index == 0 || size >= 100.0 {
        format!("{:.0} {}", size, UNITS[unit_index])
    } else if size >= 10.0 {
        format!("{:.1} {}", size, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Resolve `path` against `base` and fold `.` and `..` lexically.
///
/// The filesystem is never consulted, so this works for files that do not
/// exist yet. Symlinks are not resolved; two spellings of one path through a
/// symlink stay distinct keys.
pub fn normalize_path(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` never climbs above the root
                if !matches!(out.components().next_back(), Some(Component::RootDir) | None) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_normalize_relative() {
        let base = Path::new("/srv/data");
        assert_eq!(
            normalize_path(base, Path::new("snapshots/./a.bin")),
            PathBuf::from("/srv/data/snapshots/a.bin")
        );
        assert_eq!(
            normalize_path(base, Path::new("logs/../b.log")),
            PathBuf::from("/srv/data/b.log")
        );
    }

    #[test]
    fn test_normalize_absolute_ignores_base() {
        let base = Path::new("/srv/data");
        assert_eq!(
            normalize_path(base, Path::new("/tmp//x/../y")),
            PathBuf::from("/tmp/y")
        );
        assert_eq!(
            normalize_path(base, Path::new("/../../etc")),
            PathBuf::from("/etc")
        );
    }
}
