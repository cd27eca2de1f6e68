//! SQLite persistence for the Pulse pipeline.
//!
//! All operations are free functions over a `&Connection` so callers can
//! compose them inside a single transaction (the daemon wraps each hook in
//! one; the reconciler writes message-by-message in autocommit mode).
//!
//! Publish/subscribe is an outbox: `notify` inserts a row into the
//! `notifications` table, so a payload only becomes visible when the
//! producing transaction commits and can never escape a rollback. The HTTP
//! relay drains that table and re-broadcasts to dashboard clients.

use std::path::Path;

use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::{PulseError, Result};
use crate::tools::{todo_identity, Todo};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    project_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    transcript_path TEXT,
    terminal_id INTEGER,
    shell_id TEXT,
    name TEXT,
    message_count INTEGER,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE TRIGGER IF NOT EXISTS sessions_touch_updated_at
AFTER UPDATE ON sessions FOR EACH ROW
WHEN NEW.updated_at = OLD.updated_at
BEGIN
    UPDATE sessions SET updated_at = CURRENT_TIMESTAMP
    WHERE session_id = NEW.session_id;
END;
CREATE TABLE IF NOT EXISTS prompts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    prompt TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_prompts_session ON prompts(session_id);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    prompt_id INTEGER NOT NULL,
    uuid TEXT NOT NULL UNIQUE,
    created_at TEXT,
    body TEXT,
    thinking INTEGER NOT NULL DEFAULT 0,
    is_user INTEGER NOT NULL DEFAULT 0,
    tools TEXT,
    todo_id TEXT,
    images TEXT,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_messages_prompt ON messages(prompt_id);
CREATE INDEX IF NOT EXISTS idx_messages_todo ON messages(todo_id);
CREATE TABLE IF NOT EXISTS hooks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    hook_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS cleans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    config TEXT NOT NULL DEFAULT '{}'
);
CREATE TABLE IF NOT EXISTS notifications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
";

/// Opens the store, creating the file and schema on first use.
pub fn open(config: &Config) -> Result<Connection> {
    open_at(&config.db_path)
}

pub fn open_at(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        fs_err::create_dir_all(parent)
            .map_err(|e| PulseError::io(format!("create {}", parent.display()), e))?;
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let conn = Connection::open_with_flags(db_path, flags)?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.execute_batch(SCHEMA)?;

    Ok(conn)
}

/// Cheap liveness check used by the daemon before each unit of work.
pub fn probe(conn: &Connection) -> Result<()> {
    conn.query_row("SELECT 1", [], |_| Ok(()))?;
    Ok(())
}

/// True when an error is a uniqueness/constraint race, which ingestion
/// treats as "already present".
pub fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ── Logs & notifications ─────────────────────────────────────────────────

/// Writes a structured diagnostic row. `fields` must be a JSON object; its
/// keys are merged next to `message`.
pub fn log(conn: &Connection, message: &str, fields: Value) -> Result<()> {
    let mut data = json!({ "message": message });
    if let (Some(obj), Some(extra)) = (data.as_object_mut(), fields.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    conn.execute("INSERT INTO logs (data) VALUES (?1)", params![data.to_string()])?;
    Ok(())
}

/// Publishes a payload on a named channel. The row commits (or rolls back)
/// with the caller's transaction.
pub fn notify(conn: &Connection, channel: &str, payload: &Value) -> Result<()> {
    conn.execute(
        "INSERT INTO notifications (channel, payload) VALUES (?1, ?2)",
        params![channel, payload.to_string()],
    )?;
    Ok(())
}

// ── Hooks ────────────────────────────────────────────────────────────────

pub fn save_hook(conn: &Connection, session_id: &str, hook_type: &str, payload: &Value) -> Result<()> {
    conn.execute(
        "INSERT INTO hooks (session_id, hook_type, payload) VALUES (?1, ?2, ?3)",
        params![session_id, hook_type, payload.to_string()],
    )?;
    Ok(())
}

// ── Projects ─────────────────────────────────────────────────────────────

pub fn upsert_project(conn: &Connection, path: &str) -> Result<i64> {
    let existing = conn
        .query_row("SELECT id FROM projects WHERE path = ?1", params![path], |row| {
            row.get::<_, i64>(0)
        })
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute("INSERT INTO projects (path) VALUES (?1)", params![path])?;
    Ok(conn.last_insert_rowid())
}

/// Moves a session's project to a new path. Returns false when the session
/// is unknown or the path already belongs to another project.
pub fn update_project_path_by_session(conn: &Connection, session_id: &str, path: &str) -> Result<bool> {
    let project_id = conn
        .query_row(
            "SELECT project_id FROM sessions WHERE session_id = ?1",
            params![session_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    let Some(project_id) = project_id else {
        return Ok(false);
    };

    let taken = conn
        .query_row(
            "SELECT id FROM projects WHERE path = ?1 AND id != ?2",
            params![path, project_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    if taken.is_some() {
        return Ok(false);
    }

    conn.execute(
        "UPDATE projects SET path = ?1 WHERE id = ?2",
        params![path, project_id],
    )?;
    Ok(true)
}

// ── Sessions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub session_id: String,
    pub project_id: i64,
    pub status: String,
    pub transcript_path: Option<String>,
    pub terminal_id: Option<i64>,
    pub shell_id: Option<String>,
    pub name: Option<String>,
    pub message_count: Option<i64>,
    pub updated_at: String,
}

/// Inserts or updates a session. `project_id` is only written on insert;
/// terminal and shell ids are preserved when the new values are null.
pub fn upsert_session(
    conn: &Connection,
    session_id: &str,
    project_id: i64,
    status: &str,
    transcript_path: &str,
    terminal_id: Option<i64>,
    shell_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions (session_id, project_id, terminal_id, shell_id, status, transcript_path)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(session_id) DO UPDATE SET
             terminal_id = COALESCE(excluded.terminal_id, sessions.terminal_id),
             shell_id = COALESCE(excluded.shell_id, sessions.shell_id),
             status = excluded.status,
             transcript_path = excluded.transcript_path",
        params![session_id, project_id, terminal_id, shell_id, status, transcript_path],
    )?;
    Ok(())
}

/// Updates name and message count; null inputs preserve the stored values.
pub fn update_session_metadata(
    conn: &Connection,
    session_id: &str,
    name: Option<&str>,
    message_count: Option<i64>,
) -> Result<()> {
    let name = name.map(clamp_name);
    conn.execute(
        "UPDATE sessions SET
             name = COALESCE(?1, name),
             message_count = COALESCE(?2, message_count)
         WHERE session_id = ?3",
        params![name, message_count, session_id],
    )?;
    Ok(())
}

/// Fills the display name only when none is set yet.
pub fn update_session_name_if_empty(conn: &Connection, session_id: &str, name: &str) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET name = ?1
         WHERE session_id = ?2 AND (name IS NULL OR name = '')",
        params![clamp_name(name), session_id],
    )?;
    Ok(())
}

pub fn get_session(conn: &Connection, session_id: &str) -> Result<Option<SessionRow>> {
    let row = conn
        .query_row(
            "SELECT session_id, project_id, status, transcript_path, terminal_id,
                    shell_id, name, message_count, updated_at
             FROM sessions WHERE session_id = ?1",
            params![session_id],
            |row| {
                Ok(SessionRow {
                    session_id: row.get(0)?,
                    project_id: row.get(1)?,
                    status: row.get(2)?,
                    transcript_path: row.get(3)?,
                    terminal_id: row.get(4)?,
                    shell_id: row.get(5)?,
                    name: row.get(6)?,
                    message_count: row.get(7)?,
                    updated_at: row.get(8)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn get_session_project_path(conn: &Connection, session_id: &str) -> Result<Option<String>> {
    let path = conn
        .query_row(
            "SELECT p.path FROM sessions s
             JOIN projects p ON s.project_id = p.id
             WHERE s.session_id = ?1",
            params![session_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(path)
}

/// Sessions still in `started` for this project other than the current one.
pub fn get_stale_session_ids(
    conn: &Connection,
    project_id: i64,
    current_session_id: &str,
) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT session_id FROM sessions
         WHERE project_id = ?1 AND session_id != ?2 AND status = 'started'",
    )?;
    let ids = stmt
        .query_map(params![project_id, current_session_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Deletes sessions and all dependent rows (messages, prompts, hooks).
pub fn delete_sessions_cascade(conn: &Connection, session_ids: &[String]) -> Result<()> {
    if session_ids.is_empty() {
        return Ok(());
    }

    let placeholders = vec!["?"; session_ids.len()].join(",");

    conn.execute(
        &format!(
            "DELETE FROM messages WHERE prompt_id IN (
                 SELECT id FROM prompts WHERE session_id IN ({placeholders})
             )"
        ),
        params_from_iter(session_ids),
    )?;
    conn.execute(
        &format!("DELETE FROM prompts WHERE session_id IN ({placeholders})"),
        params_from_iter(session_ids),
    )?;
    conn.execute(
        &format!("DELETE FROM hooks WHERE session_id IN ({placeholders})"),
        params_from_iter(session_ids),
    )?;
    conn.execute(
        &format!("DELETE FROM sessions WHERE session_id IN ({placeholders})"),
        params_from_iter(session_ids),
    )?;
    Ok(())
}

// ── Prompts ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PromptRow {
    pub id: i64,
    pub prompt: Option<String>,
}

pub fn create_prompt(conn: &Connection, session_id: &str, prompt_text: Option<&str>) -> Result<i64> {
    conn.execute(
        "INSERT INTO prompts (session_id, prompt) VALUES (?1, ?2)",
        params![session_id, prompt_text],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_latest_prompt(conn: &Connection, session_id: &str) -> Result<Option<PromptRow>> {
    let row = conn
        .query_row(
            "SELECT id, prompt FROM prompts WHERE session_id = ?1 ORDER BY id DESC LIMIT 1",
            params![session_id],
            |row| {
                Ok(PromptRow {
                    id: row.get(0)?,
                    prompt: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn update_prompt_text(conn: &Connection, prompt_id: i64, prompt_text: &str) -> Result<()> {
    conn.execute(
        "UPDATE prompts SET prompt = ?1 WHERE id = ?2",
        params![prompt_text, prompt_id],
    )?;
    Ok(())
}

// ── Messages ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct NewMessage<'a> {
    pub prompt_id: i64,
    pub uuid: &'a str,
    pub created_at: Option<&'a str>,
    pub body: Option<&'a str>,
    pub thinking: bool,
    pub user: bool,
    pub tools: Option<&'a Value>,
    pub todo_id: Option<&'a str>,
    pub images: Option<&'a Value>,
}

pub fn message_exists(conn: &Connection, uuid: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT id FROM messages WHERE uuid = ?1",
            params![uuid],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn create_message(conn: &Connection, message: NewMessage<'_>) -> Result<i64> {
    conn.execute(
        "INSERT INTO messages (prompt_id, uuid, created_at, body, thinking, is_user, tools, todo_id, images)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            message.prompt_id,
            message.uuid,
            message.created_at,
            message.body,
            message.thinking,
            message.user,
            message.tools.map(|v| v.to_string()),
            message.todo_id,
            message.images.map(|v| v.to_string()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

#[derive(Debug)]
pub struct TodoUpsert {
    pub message_id: i64,
    pub todo_id: String,
    pub is_new: bool,
    pub state_changed: bool,
}

/// Upserts the todo-list message for this todo set.
///
/// The row's identity is the content hash of the todo set, not the
/// tool-call id, so reprocessing the transcript or continuing the list
/// under a new tool call updates the existing row in place. `state_key`
/// tracks the status vector; a change replaces the stored payload and is
/// reported so the caller can emit an update notification.
pub fn upsert_todo_message(
    conn: &Connection,
    session_id: &str,
    prompt_id: i64,
    uuid: &str,
    created_at: Option<&str>,
    tools: &Value,
    todos: &[Todo],
    state_key: &str,
) -> Result<TodoUpsert> {
    let todo_id = todo_identity(session_id, todos);

    let existing = conn
        .query_row(
            "SELECT m.id, m.tools FROM messages m
             JOIN prompts p ON m.prompt_id = p.id
             WHERE p.session_id = ?1 AND m.todo_id = ?2
             ORDER BY m.id DESC LIMIT 1",
            params![session_id, todo_id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional()?;

    if let Some((message_id, stored_tools)) = existing {
        let state_changed = stored_state_key(stored_tools.as_deref()) != Some(state_key.to_string());
        if state_changed {
            conn.execute(
                "UPDATE messages SET tools = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
                params![tools.to_string(), message_id],
            )?;
        }
        return Ok(TodoUpsert {
            message_id,
            todo_id,
            is_new: false,
            state_changed,
        });
    }

    // Same tool call ingested before the content-hash scheme applied to it.
    let by_uuid = conn
        .query_row(
            "SELECT id, tools FROM messages WHERE uuid = ?1",
            params![uuid],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional()?;
    if let Some((message_id, stored_tools)) = by_uuid {
        let state_changed = stored_state_key(stored_tools.as_deref()) != Some(state_key.to_string());
        conn.execute(
            "UPDATE messages SET tools = ?1, todo_id = ?2, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?3",
            params![tools.to_string(), todo_id, message_id],
        )?;
        return Ok(TodoUpsert {
            message_id,
            todo_id,
            is_new: false,
            state_changed,
        });
    }

    let message_id = create_message(
        conn,
        NewMessage {
            prompt_id,
            uuid,
            created_at,
            tools: Some(tools),
            todo_id: Some(&todo_id),
            ..Default::default()
        },
    )?;
    Ok(TodoUpsert {
        message_id,
        todo_id,
        is_new: true,
        state_changed: true,
    })
}

fn stored_state_key(tools: Option<&str>) -> Option<String> {
    let parsed: Value = serde_json::from_str(tools?).ok()?;
    parsed
        .get("state_key")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn get_latest_user_message(conn: &Connection, prompt_id: i64) -> Result<Option<String>> {
    let body = conn
        .query_row(
            "SELECT body FROM messages
             WHERE prompt_id = ?1 AND is_user = 1
             ORDER BY id DESC LIMIT 1",
            params![prompt_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(body.flatten())
}

// ── Settings ─────────────────────────────────────────────────────────────

/// Session ids exempt from garbage collection. Read fresh at each sweep.
pub fn get_favorite_sessions(conn: &Connection) -> Result<Vec<String>> {
    let config = conn
        .query_row("SELECT config FROM settings WHERE id = 1", [], |row| {
            row.get::<_, String>(0)
        })
        .optional()?;
    let Some(config) = config else {
        return Ok(Vec::new());
    };
    let parsed: Value = serde_json::from_str(&config)
        .map_err(|e| PulseError::json("settings.config", e))?;
    let favorites = parsed
        .get("favorite_sessions")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    Ok(favorites)
}

pub fn put_settings(conn: &Connection, config: &Value) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (id, config) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET config = excluded.config",
        params![config.to_string()],
    )?;
    Ok(())
}

fn clamp_name(name: &str) -> String {
    name.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_conn(dir: &Path) -> Connection {
        open_at(&dir.join("test.db")).unwrap()
    }

    fn seed_session(conn: &Connection, session_id: &str) -> i64 {
        let project_id = upsert_project(conn, "/test").unwrap();
        upsert_session(conn, session_id, project_id, "active", "/t.jsonl", None, None).unwrap();
        project_id
    }

    #[test]
    fn upsert_project_is_idempotent() {
        let dir = tempdir().unwrap();
        let conn = test_conn(dir.path());
        let a = upsert_project(&conn, "/repo").unwrap();
        let b = upsert_project(&conn, "/repo").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, upsert_project(&conn, "/other").unwrap());
    }

    #[test]
    fn session_project_id_is_write_once() {
        let dir = tempdir().unwrap();
        let conn = test_conn(dir.path());
        let p1 = upsert_project(&conn, "/p").unwrap();
        let p2 = upsert_project(&conn, "/p/sub").unwrap();

        upsert_session(&conn, "s1", p1, "started", "/t.jsonl", None, None).unwrap();
        upsert_session(&conn, "s1", p2, "active", "/t.jsonl", None, None).unwrap();

        let session = get_session(&conn, "s1").unwrap().unwrap();
        assert_eq!(session.project_id, p1);
        assert_eq!(session.status, "active");
        assert_eq!(
            get_session_project_path(&conn, "s1").unwrap().as_deref(),
            Some("/p")
        );
    }

    #[test]
    fn terminal_and_shell_ids_are_preserved_on_null() {
        let dir = tempdir().unwrap();
        let conn = test_conn(dir.path());
        let project_id = upsert_project(&conn, "/p").unwrap();

        upsert_session(&conn, "s1", project_id, "started", "/t", Some(7), Some("sh-1")).unwrap();
        upsert_session(&conn, "s1", project_id, "active", "/t", None, None).unwrap();

        let session = get_session(&conn, "s1").unwrap().unwrap();
        assert_eq!(session.terminal_id, Some(7));
        assert_eq!(session.shell_id.as_deref(), Some("sh-1"));
    }

    #[test]
    fn metadata_update_preserves_existing_on_null() {
        let dir = tempdir().unwrap();
        let conn = test_conn(dir.path());
        seed_session(&conn, "s1");

        update_session_metadata(&conn, "s1", Some("first title"), Some(3)).unwrap();
        update_session_metadata(&conn, "s1", None, None).unwrap();

        let session = get_session(&conn, "s1").unwrap().unwrap();
        assert_eq!(session.name.as_deref(), Some("first title"));
        assert_eq!(session.message_count, Some(3));
    }

    #[test]
    fn name_if_empty_fills_once_and_truncates() {
        let dir = tempdir().unwrap();
        let conn = test_conn(dir.path());
        seed_session(&conn, "s1");

        let long = "x".repeat(300);
        update_session_name_if_empty(&conn, "s1", &long).unwrap();
        update_session_name_if_empty(&conn, "s1", "second").unwrap();

        let session = get_session(&conn, "s1").unwrap().unwrap();
        assert_eq!(session.name.as_deref().map(|n| n.len()), Some(200));
    }

    #[test]
    fn message_uuid_is_unique() {
        let dir = tempdir().unwrap();
        let conn = test_conn(dir.path());
        seed_session(&conn, "s1");
        let prompt_id = create_prompt(&conn, "s1", None).unwrap();

        create_message(
            &conn,
            NewMessage {
                prompt_id,
                uuid: "m1",
                body: Some("hello"),
                user: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(message_exists(&conn, "m1").unwrap());

        let dup = create_message(
            &conn,
            NewMessage {
                prompt_id,
                uuid: "m1",
                ..Default::default()
            },
        );
        match dup {
            Err(PulseError::Db(err)) => assert!(is_constraint_violation(&err)),
            other => panic!("expected constraint violation, got {other:?}"),
        }
    }

    #[test]
    fn cascade_delete_removes_all_session_rows() {
        let dir = tempdir().unwrap();
        let conn = test_conn(dir.path());
        seed_session(&conn, "s1");
        let prompt_id = create_prompt(&conn, "s1", Some("hi")).unwrap();
        create_message(
            &conn,
            NewMessage {
                prompt_id,
                uuid: "m1",
                ..Default::default()
            },
        )
        .unwrap();
        save_hook(&conn, "s1", "Stop", &json!({})).unwrap();

        delete_sessions_cascade(&conn, &["s1".to_string()]).unwrap();

        for table in ["sessions", "prompts", "messages", "hooks"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table} not emptied");
        }
    }

    #[test]
    fn todo_upsert_updates_in_place_on_status_change() {
        let dir = tempdir().unwrap();
        let conn = test_conn(dir.path());
        seed_session(&conn, "s1");
        let prompt_id = create_prompt(&conn, "s1", None).unwrap();

        let todos = vec![
            Todo::new("write tests", "pending"),
            Todo::new("ship it", "pending"),
        ];
        let first = upsert_todo_message(
            &conn,
            "s1",
            prompt_id,
            "tool-1",
            None,
            &json!({"name": "TodoWrite", "state_key": "aaa"}),
            &todos,
            "aaa",
        )
        .unwrap();
        assert!(first.is_new);

        // Same contents, new status vector, different tool call.
        let todos = vec![
            Todo::new("write tests", "in_progress"),
            Todo::new("ship it", "pending"),
        ];
        let second = upsert_todo_message(
            &conn,
            "s1",
            prompt_id,
            "tool-2",
            None,
            &json!({"name": "TodoWrite", "state_key": "bbb"}),
            &todos,
            "bbb",
        )
        .unwrap();
        assert!(!second.is_new);
        assert!(second.state_changed);
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.todo_id, first.todo_id);

        // Reprocessing the same state is a no-op.
        let third = upsert_todo_message(
            &conn,
            "s1",
            prompt_id,
            "tool-2",
            None,
            &json!({"name": "TodoWrite", "state_key": "bbb"}),
            &todos,
            "bbb",
        )
        .unwrap();
        assert!(!third.is_new);
        assert!(!third.state_changed);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn notify_does_not_escape_a_rolled_back_transaction() {
        let dir = tempdir().unwrap();
        let conn = test_conn(dir.path());

        {
            let tx = conn.unchecked_transaction().unwrap();
            notify(&tx, "hook", &json!({"session_id": "s1"})).unwrap();
            // dropped without commit
        }
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM notifications", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let tx = conn.unchecked_transaction().unwrap();
        notify(&tx, "hook", &json!({"session_id": "s1"})).unwrap();
        tx.commit().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM notifications", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn favorites_come_from_settings_config() {
        let dir = tempdir().unwrap();
        let conn = test_conn(dir.path());
        assert!(get_favorite_sessions(&conn).unwrap().is_empty());

        put_settings(&conn, &json!({"favorite_sessions": ["s1", "s2"]})).unwrap();
        assert_eq!(get_favorite_sessions(&conn).unwrap(), vec!["s1", "s2"]);
    }

    #[test]
    fn log_merges_structured_fields() {
        let dir = tempdir().unwrap();
        let conn = test_conn(dir.path());
        log(&conn, "Worker started", json!({"session_id": "s1"})).unwrap();

        let data: String = conn
            .query_row("SELECT data FROM logs", [], |r| r.get(0))
            .unwrap();
        let parsed: Value = serde_json::from_str(&data).unwrap();
        assert_eq!(parsed["message"], "Worker started");
        assert_eq!(parsed["session_id"], "s1");
    }

    #[test]
    fn update_project_path_by_session_respects_conflicts() {
        let dir = tempdir().unwrap();
        let conn = test_conn(dir.path());
        seed_session(&conn, "s1");
        upsert_project(&conn, "/elsewhere").unwrap();

        assert!(!update_project_path_by_session(&conn, "missing", "/x").unwrap());
        assert!(!update_project_path_by_session(&conn, "s1", "/elsewhere").unwrap());
        assert!(update_project_path_by_session(&conn, "s1", "/moved").unwrap());
        assert_eq!(
            get_session_project_path(&conn, "s1").unwrap().as_deref(),
            Some("/moved")
        );
    }
}
