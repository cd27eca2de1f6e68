//! Per-hook processing: persist the event, advance the session state
//! machine, then schedule background workers.
//!
//! All database work for one hook happens in a single transaction on the
//! shared connection, so hook order equals persistence order per session.
//! Worker spawning is strictly post-commit and outside the connection
//! mutex: a reconciler for every hook, plus a sweeper for everything but
//! SessionStart (sweeping there could collect the session we are in the
//! middle of creating).

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use chrono::Utc;
use pulse_core::{debounce, session_index, store, Config, Result};
use pulse_daemon_protocol::{ClientEnv, HookEnvelope, HookRequest, HookResponse};
use rusqlite::Connection;
use serde_json::json;
use tracing::warn;

/// The daemon's single store connection, probed before each use and
/// reopened after failures.
pub struct SharedDb {
    config: Config,
    conn: Mutex<Option<Connection>>,
}

impl SharedDb {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs `op` against a live connection. On error the connection is
    /// discarded, which rolls back any open transaction and forces a
    /// reconnect on the next call.
    fn with_conn<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().unwrap_or_else(|poisoned| {
            // A panicking handler thread must not wedge intake forever.
            poisoned.into_inner()
        });

        let healthy = guard.as_ref().map(|conn| store::probe(conn).is_ok());
        if healthy == Some(false) {
            *guard = None;
        }
        if guard.is_none() {
            *guard = Some(store::open(&self.config)?);
        }

        let conn = guard.as_ref().expect("connection opened above");
        let result = op(conn);
        if result.is_err() {
            *guard = None;
        }
        result
    }
}

/// Facts about a processed hook that drive post-commit scheduling.
#[derive(Debug)]
pub struct AppliedEvent {
    pub session_id: String,
    pub is_session_start: bool,
}

/// Handles one request end to end. Never fails outward: errors are logged
/// and the client is told to continue regardless.
pub fn process_event(db: &SharedDb, request: &HookRequest) -> HookResponse {
    let projects_dir = session_index::claude_projects_dir().ok();
    let applied = db.with_conn(|conn| {
        apply_event(conn, &request.event, &request.env, projects_dir.as_deref())
    });

    match applied {
        Ok(applied) => schedule_workers(db.config(), &applied),
        Err(err) => {
            warn!(error = %err, "Hook processing failed");
            let _ = db.with_conn(|conn| {
                store::log(
                    conn,
                    "Daemon processing error",
                    json!({"error": err.to_string(), "error_type": err.kind()}),
                )
            });
        }
    }

    HookResponse::proceed()
}

/// The transactional part of hook processing.
pub fn apply_event(
    conn: &Connection,
    event: &HookEnvelope,
    env: &ClientEnv,
    projects_dir: Option<&Path>,
) -> Result<AppliedEvent> {
    let tx = conn.unchecked_transaction()?;

    let session_id = event.session_id().to_string();
    let hook_type = event.hook_event_name().to_string();
    let transcript_path = event.transcript_path.clone().unwrap_or_default();
    let project_path = session_index::derive_project_path(&transcript_path)
        .or_else(|| event.cwd.clone())
        .unwrap_or_default();
    let terminal_id = env.terminal_id();

    store::log(
        &tx,
        "Received hook event",
        json!({
            "hook_type": &hook_type,
            "session_id": &session_id,
            "terminal_id": env.terminal_id.as_deref(),
        }),
    )?;
    let payload = serde_json::to_value(event)
        .map_err(|e| pulse_core::PulseError::json("encode hook envelope", e))?;
    store::save_hook(&tx, &session_id, &hook_type, &payload)?;

    let status = event.session_status();
    let project_id = store::upsert_project(&tx, &project_path)?;

    if let Some(status) = status {
        store::upsert_session(
            &tx,
            &session_id,
            project_id,
            status.as_str(),
            &transcript_path,
            terminal_id,
            env.shell_id(),
        )?;
    }

    if hook_type == "SessionStart" {
        // Abandoned `started` sessions of this project never got content;
        // replace them with the new one.
        let stale = store::get_stale_session_ids(&tx, project_id, &session_id)?;
        if !stale.is_empty() {
            store::delete_sessions_cascade(&tx, &stale)?;
            store::notify(&tx, "sessions_deleted", &json!({"session_ids": stale}))?;
        }
        store::create_prompt(&tx, &session_id, None)?;
        store::log(&tx, "Created prompt", json!({"session_id": &session_id}))?;
    }

    if hook_type == "SessionStart" || hook_type == "UserPromptSubmit" {
        // The stored path wins over cwd: the project is pinned at creation
        // even if the assistant later changes directory.
        let stored_path =
            store::get_session_project_path(&tx, &session_id)?.unwrap_or_else(|| project_path.clone());
        if let Some(projects_dir) = projects_dir {
            session_index::apply_to_session(&tx, projects_dir, &stored_path, &session_id)?;
        }
    }

    if hook_type == "UserPromptSubmit" {
        let prompt_text = event.prompt.clone().unwrap_or_default();
        store::create_prompt(&tx, &session_id, Some(&prompt_text))?;
        store::update_session_name_if_empty(&tx, &session_id, &prompt_text)?;
        store::log(
            &tx,
            "Created prompt",
            json!({"session_id": &session_id, "prompt_length": prompt_text.len()}),
        )?;
    }

    store::notify(
        &tx,
        "hook",
        &json!({
            "session_id": &session_id,
            "hook_type": &hook_type,
            "status": status.map(|s| s.as_str()),
            "project_path": project_path,
            "terminal_id": terminal_id,
        }),
    )?;

    tx.commit()?;

    Ok(AppliedEvent {
        session_id,
        is_session_start: hook_type == "SessionStart",
    })
}

/// Post-commit scheduling: refresh the debounce marker, then detach a
/// reconciler (and usually a sweeper) as independent processes.
fn schedule_workers(config: &Config, applied: &AppliedEvent) {
    let now = Utc::now().to_rfc3339();
    if let Err(err) = debounce::touch_marker(&config.debounce_dir(), &applied.session_id, &now) {
        warn!(error = %err, session_id = %applied.session_id, "Failed to update debounce marker");
        return;
    }

    spawn_detached(&["reconcile", &applied.session_id, &now]);
    if !applied.is_session_start {
        spawn_detached(&["sweep"]);
    }
}

fn spawn_detached(args: &[&str]) {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            warn!(error = %err, "Cannot resolve daemon executable for worker spawn");
            return;
        }
    };
    if let Err(err) = detached_command(&exe, args).spawn() {
        warn!(error = %err, args = ?args, "Failed to spawn worker");
    }
}

fn detached_command(exe: &Path, args: &[&str]) -> Command {
    use std::os::unix::process::CommandExt;

    let mut command = Command::new(exe);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);
    command
}
