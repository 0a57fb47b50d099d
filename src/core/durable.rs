//! Whole-document JSON files committed by rename.
//!
//! Writers serialize into a temp file in the destination directory and
//! rename it over the target, so a concurrent reader sees either the old
//! document or the new one, never a torn write.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;

/// Serialize `value` and atomically replace `path` with it
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// Read a JSON document, treating a missing file as `None`
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// [`write_json_atomic`] on the blocking pool
pub async fn write_json<T>(path: PathBuf, value: T) -> io::Result<()>
where
    T: Serialize + Send + 'static,
{
    tokio::task::spawn_blocking(move || write_json_atomic(&path, &value))
        .await
        .map_err(io::Error::other)?
}

/// [`read_json`] on the blocking pool
pub async fn load_json<T>(path: PathBuf) -> io::Result<Option<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    tokio::task::spawn_blocking(move || read_json(&path))
        .await
        .map_err(io::Error::other)?
}
