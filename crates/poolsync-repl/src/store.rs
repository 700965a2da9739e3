//! JSON state files with atomic replace.
//!
//! Several processes may share one state file. Every read-modify-write runs
//! under an exclusive advisory lock on a sidecar `<file>.lock` and starts from
//! the document currently on disk.

use crate::error::{ReplError, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Load a JSON document, returning `T::default()` when the file does not exist yet.
pub fn load_json<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(T::default()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(ReplError::Io(e)),
    }
}

/// Write `value` to `path` through a synced temporary file and a rename.
///
/// Readers observe either the previous document or the new one, never a
/// partially written file.
pub fn save_json_atomic<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    create_parent(path)?;
    let encoded = serde_json::to_vec_pretty(value)?;

    let mut tmp_path = path.to_path_buf();
    tmp_path.set_extension("json.tmp");
    {
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(&encoded)?;
        tmp_file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Reload `path` under its exclusive lock, apply `f` and save the result.
///
/// The file is left untouched when `f` fails. The lock is released when the
/// sidecar handle is dropped.
pub fn update_json_locked<T, R>(path: &Path, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R>
where
    T: Serialize + DeserializeOwned + Default,
{
    create_parent(path)?;
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(lock_path(path))?;
    lock.lock_exclusive()?;

    let mut doc: T = load_json(path)?;
    let out = f(&mut doc)?;
    save_json_atomic(path, &doc)?;
    drop(lock);
    Ok(out)
}

/// Map a poisoned lock into a store error.
pub(crate) fn poisoned<E: std::fmt::Display>(e: E) -> ReplError {
    ReplError::Store { msg: e.to_string() }
}
