//! Periodic maintenance: stale sessions, empty sessions, aged rows and
//! leftover coordination files.
//!
//! Runs after every hook except SessionStart (suppressed there so the
//! freshly created null-prompt session is not collected mid-creation) and
//! is also runnable standalone. The expensive steps are throttled through
//! the `cleans` table; the cheap liveness steps run every time.

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;

use crate::config::Config;
use crate::error::Result;
use crate::store;

/// Sessions idle longer than this are transitioned to `ended`.
const SESSION_IDLE_CUTOFF: &str = "-5 minutes";

/// Age threshold for logs/hooks rows removed by the weekly pass.
const ROW_RETENTION_CUTOFF: &str = "-7 days";

/// Coordination files older than this are purged by the hourly pass.
const FILE_MAX_AGE: Duration = Duration::from_secs(3600);

pub fn run(config: &Config) -> Result<()> {
    let conn = store::open(config)?;
    sweep_data(&conn)?;
    sweep_locks(&conn, config)?;
    Ok(())
}

/// Database-side sweep. Liveness steps run unconditionally; row retention
/// runs at most once per week.
pub fn sweep_data(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    close_stale_sessions(&tx)?;
    delete_empty_sessions(&tx)?;
    delete_orphan_projects(&tx)?;
    delete_orphan_prompts(&tx)?;

    if clean_due(&tx, "data", ROW_RETENTION_CUTOFF)? {
        delete_old_rows(&tx)?;
        record_clean(&tx, "data")?;
    }

    tx.commit()?;
    Ok(())
}

/// Filesystem-side sweep of debounce markers and locks, at most hourly.
/// Both the current `debounce/` directory and the legacy `locks/`
/// directory are purged.
pub fn sweep_locks(conn: &Connection, config: &Config) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    if !clean_due(&tx, "locks", "-1 hours")? {
        return Ok(());
    }

    let removed = purge_old_files(&config.debounce_dir(), FILE_MAX_AGE)
        + purge_old_files(&config.locks_dir(), FILE_MAX_AGE);
    if removed > 0 {
        store::log(&tx, "Purged stale coordination files", json!({"removed": removed}))?;
    }

    record_clean(&tx, "locks")?;
    tx.commit()?;
    Ok(())
}

fn close_stale_sessions(conn: &Connection) -> Result<usize> {
    let updated = conn.execute(
        &format!(
            "UPDATE sessions SET status = 'ended'
             WHERE status IN ('started', 'active', 'permission_needed')
               AND updated_at < datetime('now', '{SESSION_IDLE_CUTOFF}')"
        ),
        [],
    )?;
    Ok(updated)
}

/// Deletes sessions with no messages and at most one body-less prompt,
/// sparing favorites. Favorites are read fresh from settings each sweep.
fn delete_empty_sessions(conn: &Connection) -> Result<()> {
    let favorites = store::get_favorite_sessions(conn)?;

    let mut stmt = conn.prepare(
        "SELECT s.session_id FROM sessions s
         WHERE NOT EXISTS (
                   SELECT 1 FROM prompts p
                   JOIN messages m ON m.prompt_id = p.id
                   WHERE p.session_id = s.session_id
               )
           AND (SELECT COUNT(*) FROM prompts p WHERE p.session_id = s.session_id) <= 1
           AND NOT EXISTS (
                   SELECT 1 FROM prompts p
                   WHERE p.session_id = s.session_id AND p.prompt IS NOT NULL
               )",
    )?;
    let empty: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;
    drop(stmt);

    let doomed: Vec<String> = empty
        .into_iter()
        .filter(|id| !favorites.contains(id))
        .collect();
    if doomed.is_empty() {
        return Ok(());
    }

    store::delete_sessions_cascade(conn, &doomed)?;
    store::notify(conn, "sessions_deleted", &json!({"session_ids": doomed}))?;
    Ok(())
}

fn delete_orphan_projects(conn: &Connection) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM projects
         WHERE id NOT IN (SELECT DISTINCT project_id FROM sessions)",
        [],
    )?;
    Ok(deleted)
}

fn delete_orphan_prompts(conn: &Connection) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM prompts
         WHERE session_id NOT IN (SELECT session_id FROM sessions)",
        [],
    )?;
    Ok(deleted)
}

fn delete_old_rows(conn: &Connection) -> Result<()> {
    conn.execute(
        &format!("DELETE FROM logs WHERE created_at < datetime('now', '{ROW_RETENTION_CUTOFF}')"),
        [],
    )?;
    conn.execute(
        &format!("DELETE FROM hooks WHERE created_at < datetime('now', '{ROW_RETENTION_CUTOFF}')"),
        [],
    )?;
    Ok(())
}

/// True when no `cleans` row of this kind exists within the window.
fn clean_due(conn: &Connection, kind: &str, window: &str) -> Result<bool> {
    let recent = conn
        .query_row(
            &format!(
                "SELECT id FROM cleans
                 WHERE kind = ?1 AND created_at > datetime('now', '{window}')
                 LIMIT 1"
            ),
            params![kind],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(recent.is_none())
}

fn record_clean(conn: &Connection, kind: &str) -> Result<()> {
    conn.execute("INSERT INTO cleans (kind) VALUES (?1)", params![kind])?;
    Ok(())
}

/// Removes regular files older than `max_age` from `dir` (by mtime).
/// Returns the number removed; a missing directory removes nothing.
fn purge_old_files(dir: &Path, max_age: Duration) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| mtime.elapsed().ok());
        if age.is_some_and(|age| age > max_age) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "Failed to remove stale file");
                }
            }
        }
    }
    removed
}
