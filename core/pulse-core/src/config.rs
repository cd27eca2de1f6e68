//! Runtime configuration resolved from the environment.
//!
//! All processes (daemon, reconciler, sweeper, hook client) share one
//! installation directory. Layout:
//!
//! ```text
//! ~/.pulse/
//! ├── daemon.sock      # intake socket
//! ├── data.db          # relational store (unless DATABASE_URL overrides)
//! ├── debounce/        # per-session {session_id}.marker / {session_id}.lock
//! └── locks/           # legacy lock directory, still swept
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PulseError, Result};

pub const SOCKET_NAME: &str = "daemon.sock";
pub const DEFAULT_DEBOUNCE_SECONDS: u64 = 2;

/// Multiplier applied to the debounce window to decide a reconciler lock
/// is stale and may be stolen.
pub const LOCK_STALE_MULTIPLIER: u32 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: PathBuf,
    pub db_path: PathBuf,
    pub debounce: Duration,
}

impl Config {
    /// Resolves configuration from `PULSE_HOME`, `DATABASE_URL` and
    /// `DEBOUNCE_SECONDS`, with defaults under `~/.pulse`.
    pub fn from_env() -> Result<Self> {
        let base_dir = match std::env::var_os("PULSE_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .ok_or(PulseError::HomeDirNotFound)?
                .join(".pulse"),
        };

        let db_path = match std::env::var("DATABASE_URL") {
            Ok(url) => database_path(&url),
            Err(_) => base_dir.join("data.db"),
        };

        let debounce_secs = std::env::var("DEBOUNCE_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_DEBOUNCE_SECONDS);

        Ok(Self {
            base_dir,
            db_path,
            debounce: Duration::from_secs(debounce_secs),
        })
    }

    /// Builds a configuration rooted at an explicit directory. Used by tests.
    pub fn at(base_dir: impl Into<PathBuf>, debounce: Duration) -> Self {
        let base_dir = base_dir.into();
        let db_path = base_dir.join("data.db");
        Self {
            base_dir,
            db_path,
            debounce,
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.base_dir.join(SOCKET_NAME)
    }

    pub fn debounce_dir(&self) -> PathBuf {
        self.base_dir.join("debounce")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.base_dir.join("locks")
    }

    /// Age after which a reconciler lock is considered abandoned.
    pub fn lock_stale_after(&self) -> Duration {
        self.debounce * LOCK_STALE_MULTIPLIER
    }
}

/// Interprets `DATABASE_URL` as a SQLite location. Accepts a bare path or a
/// `sqlite:`-prefixed URL.
fn database_path(url: &str) -> PathBuf {
    let trimmed = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    Path::new(trimmed).to_path_buf()
}
