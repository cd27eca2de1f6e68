//! Error types for pulse-core operations.

use std::path::PathBuf;

/// All errors that can occur in pulse-core operations.
#[derive(Debug, thiserror::Error)]
pub enum PulseError {
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Transcript file not found: {0}")]
    TranscriptNotFound(PathBuf),

    #[error("Debounce marker missing or malformed: {0}")]
    MarkerInvalid(String),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl PulseError {
    /// Short stable name of the error class, used for structured logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PulseError::HomeDirNotFound => "home_dir_not_found",
            PulseError::TranscriptNotFound(_) => "transcript_not_found",
            PulseError::MarkerInvalid(_) => "marker_invalid",
            PulseError::Io { .. } => "io",
            PulseError::Json { .. } => "json",
            PulseError::Db(_) => "db",
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PulseError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        PulseError::Json {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using PulseError.
pub type Result<T> = std::result::Result<T, PulseError>;
