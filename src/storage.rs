//! Filesystem layout under `data_dir` (spec §6).
//!
//! `internal_state/` holds files named
//! `<prefix>_data_YYYY-MM-DDTHH:MM:SS.ffffZ.pbstream`. The newest by
//! filename-embedded UTC timestamp is the authoritative prior state;
//! lexicographic filename order equals chronological order because
//! the timestamp format is fixed-width and zero-padded.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::CoreError;

const INTERNAL_STATE_DIRNAME: &str = "internal_state";
/// Matches the original implementation's on-disk timestamp format.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.4fZ";

pub fn internal_state_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(INTERNAL_STATE_DIRNAME)
}

/// Returns the bytes of the newest internal-state snapshot in
/// `data_dir/internal_state/`, or `None` if the directory is absent
/// or empty. "Newest" is determined by filename, not mtime.
pub fn newest_internal_state(data_dir: &Path) -> Result<Option<Vec<u8>>, CoreError> {
    let dir = internal_state_dir(data_dir);
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut names: Vec<String> = std::fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".pbstream"))
        .collect();
    names.sort();

    match names.last() {
        Some(newest) => Ok(Some(std::fs::read(dir.join(newest))?)),
        None => Ok(None),
    }
}

/// Builds an absolute filename embedding `prefix` and `timestamp`,
/// matching `<prefix>_data_<timestamp>.pbstream`.
pub fn timestamped_filename(data_dir: &Path, prefix: &str, timestamp: DateTime<Utc>) -> PathBuf {
    internal_state_dir(data_dir).join(format!(
        "{prefix}_data_{}.pbstream",
        timestamp.format(TIMESTAMP_FORMAT)
    ))
}

/// Writes `bytes` as a new internal-state snapshot, creating
/// `internal_state/` if needed.
pub fn write_internal_state_snapshot(
    data_dir: &Path,
    prefix: &str,
    timestamp: DateTime<Utc>,
    bytes: &[u8],
) -> Result<PathBuf, CoreError> {
    let dir = internal_state_dir(data_dir);
    std::fs::create_dir_all(&dir)?;
    let path = timestamped_filename(data_dir, prefix, timestamp);
    std::fs::write(&path, bytes)?;
    Ok(path)
}
