//! Atomic file writes for persisted state
//!
//! Pipeline execution state is rewritten after every step. A crash in the
//! middle of a write must never leave a truncated record behind, so every
//! write goes through the same pattern:
//!
//! 1. Write to a uniquely named sibling temp file (`.tmp`)
//! 2. `sync_all()` the temp file
//! 3. Rename it over the final path (atomic on POSIX filesystems)
//!
//! Readers therefore observe either the previous version or the new one.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Errors that can occur during atomic operations
#[derive(Debug, thiserror::Error)]
pub enum AtomicError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("path has no file name: {0}")]
    InvalidPath(PathBuf),
}

/// Result type for atomic operations
pub type AtomicResult<T> = Result<T, AtomicError>;

fn temp_path_for(path: &Path) -> AtomicResult<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| AtomicError::InvalidPath(path.to_path_buf()))?
        .to_string_lossy();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    Ok(path.with_file_name(format!(".{}.{}.tmp", name, &suffix[..8])))
}

/// Atomically replace `path` with whatever `write_fn` produces
///
/// The parent directory is created if missing. On any failure the temp file
/// is removed and the destination is left untouched.
pub fn atomic_write_with<P, F>(path: P, write_fn: F) -> AtomicResult<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut BufWriter<File>) -> AtomicResult<()>,
{
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = temp_path_for(path)?;
    let result: AtomicResult<()> = (|| {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        write_fn(&mut writer)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Atomically write a value as pretty-printed JSON
pub fn atomic_write_json<P, T>(path: P, value: &T) -> AtomicResult<()>
where
    P: AsRef<Path>,
    T: Serialize + ?Sized,
{
    atomic_write_with(path, |w| {
        serde_json::to_writer_pretty(&mut *w, value)?;
        w.write_all(b"\n")?;
        Ok(())
    })
}

/// Remove temp files left behind by interrupted writes
///
/// Call on startup before reading the directory.
pub fn cleanup_temp_files<P: AsRef<Path>>(dir: P) -> AtomicResult<usize> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(0);
    }

    let mut cleaned = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e == "tmp").unwrap_or(false) {
            fs::remove_file(&path)?;
            cleaned += 1;
        }
    }

    Ok(cleaned)
}
