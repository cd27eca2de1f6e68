//! Pulse core: shared engine of the session-telemetry pipeline.
//!
//! The assistant CLI emits lifecycle hooks; the intake daemon persists
//! them and schedules work; this crate holds everything those processes
//! share:
//!
//! - [`store`]: typed operations over the SQLite schema, including the
//!   transaction-scoped notification outbox
//! - [`transcript`]: pure parser for the assistant's JSON-lines transcript
//! - [`tools`]: projection of tool_use/tool_result pairs into summary JSON
//! - [`debounce`]: per-session marker and lock files on disk
//! - [`reconcile`]: the debounced worker that materializes messages
//! - [`sweep`]: periodic cleanup of sessions, rows and coordination files
//! - [`session_index`]: reader for the assistant's sessions-index.json
//!
//! Hooks only *trigger* work here; the transcript file is the canonical
//! log. Re-parsing is therefore always safe, and every ingestion path is
//! idempotent on `messages.uuid` or the todo content hash.

pub mod config;
pub mod debounce;
pub mod error;
pub mod reconcile;
pub mod session_index;
pub mod store;
pub mod sweep;
pub mod tools;
pub mod transcript;

pub use config::Config;
pub use error::{PulseError, Result};
