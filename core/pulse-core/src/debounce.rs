//! Debounce markers and reconciliation locks.
//!
//! Per-session coordination state lives on the filesystem so independent
//! worker processes (and daemon restarts) share it:
//!
//! ```text
//! debounce/
//! ├── {session_id}.marker   # JSON {"start": ..., "latest": ...}
//! └── {session_id}.lock     # RFC 3339 timestamp of lock acquisition
//! ```
//!
//! The marker coalesces hook bursts: the daemon refreshes `latest` on every
//! hook while preserving `start`; a worker only processes when it carries
//! the latest timestamp or the window since `start` has expired. The lock
//! serializes reconciliation per session; its content is the acquisition
//! time so a crashed holder can be detected and stolen.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PulseError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marker {
    pub start: String,
    pub latest: String,
}

pub fn marker_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{session_id}.marker"))
}

pub fn lock_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{session_id}.lock"))
}

/// Creates or refreshes the session marker: `start` is preserved from an
/// existing readable marker, `latest` is always set to `now`.
pub fn touch_marker(dir: &Path, session_id: &str, now: &str) -> Result<()> {
    fs_err::create_dir_all(dir)
        .map_err(|e| PulseError::io(format!("create {}", dir.display()), e))?;

    let path = marker_path(dir, session_id);
    let start = read_marker(dir, session_id)
        .map(|marker| marker.start)
        .unwrap_or_else(|| now.to_string());

    let marker = Marker {
        start,
        latest: now.to_string(),
    };
    let body = serde_json::to_string(&marker)
        .map_err(|e| PulseError::json("encode marker", e))?;
    fs_err::write(&path, body)
        .map_err(|e| PulseError::io(format!("write {}", path.display()), e))?;
    Ok(())
}

/// Reads the marker; `None` when missing or malformed.
pub fn read_marker(dir: &Path, session_id: &str) -> Option<Marker> {
    let text = fs_err::read_to_string(marker_path(dir, session_id)).ok()?;
    serde_json::from_str(&text).ok()
}

/// Deletes the marker only when its `latest` still matches what the caller
/// observed before processing. Returns true when the marker was removed.
/// A mismatch means another hook arrived mid-run; the marker is left for
/// that event's worker.
pub fn delete_marker_if_latest(dir: &Path, session_id: &str, observed_latest: &str) -> bool {
    let Some(current) = read_marker(dir, session_id) else {
        return false;
    };
    if current.latest != observed_latest {
        return false;
    }
    fs_err::remove_file(marker_path(dir, session_id)).is_ok()
}

/// Writes the lock file with the current time.
pub fn write_lock(path: &Path) -> Result<()> {
    fs_err::write(path, Utc::now().to_rfc3339())
        .map_err(|e| PulseError::io(format!("write {}", path.display()), e))
}

/// Age of the lock since acquisition; `None` when the file is gone or its
/// content does not parse (both mean the holder cannot be trusted).
pub fn lock_age(path: &Path) -> Option<Duration> {
    let text = fs_err::read_to_string(path).ok()?;
    let acquired = DateTime::parse_from_rfc3339(text.trim()).ok()?;
    let elapsed = Utc::now().signed_duration_since(acquired);
    elapsed.to_std().ok()
}

/// Removes the lock; a missing file is fine (another worker broke it).
pub fn remove_lock(path: &Path) {
    let _ = fs_err::remove_file(path);
}

/// Seconds elapsed since an RFC 3339 timestamp; `None` when unparsable.
pub fn age_of(timestamp: &str) -> Option<Duration> {
    let parsed = DateTime::parse_from_rfc3339(timestamp.trim()).ok()?;
    Utc::now().signed_duration_since(parsed).to_std().ok()
}
