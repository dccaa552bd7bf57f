//! File system helpers for crash-safe state handling.
//!
//! Everything the agent persists next to its binary goes through these
//! helpers: whole-file replacement via write-then-rename, fsync'd appends
//! for the history log, and directory syncs so renames survive a power loss.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Atomically writes bytes to a file using a write-then-rename strategy.
///
/// 1. Writes the content to a uniquely named temporary file in the target's directory
/// 2. Syncs the temporary file to disk
/// 3. Renames it over the target and syncs the directory
///
/// Readers observe either the old content or the new content, never a
/// partial write. If any step fails the temporary file is removed.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = parent_dir(path);
    ensure_dir(parent)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    sync_dir(parent)
}

/// Appends one line to a file and flushes it to disk.
///
/// The line must not contain a newline; one is added.
pub fn append_line(path: &Path, line: &str) -> io::Result<()> {
    ensure_dir(parent_dir(path))?;

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    file.write_all(&buf)?;
    file.sync_data()
}

/// Flushes directory metadata so a preceding rename is durable.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

/// Directory handles cannot be synced on this platform; renames are
/// durable once the file system commits them.
#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Creates a directory and all parents if missing.
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path)
}

/// Confirms the directory accepts new files by creating and removing one.
pub fn check_writable(dir: &Path) -> io::Result<()> {
    let scratch = tempfile::Builder::new().prefix(".write-check-").tempfile_in(dir)?;
    scratch.close()
}

/// Expands `~` and `$VAR` references in a configured path.
pub fn expand_path(raw: &str) -> Result<PathBuf, String> {
    shellexpand::full(raw)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|e| format!("cannot expand '{raw}': {e}"))
}

/// Directory containing `path`, or `.` for a bare file name.
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
