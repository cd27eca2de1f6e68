//! Debounced per-session reconciliation worker.
//!
//! Invoked with `(session_id, event_timestamp)` for every hook, but most
//! invocations exit early: after the debounce sleep a worker only proceeds
//! when it carries the marker's latest timestamp or the window since the
//! burst started has expired. Surviving workers serialize on the session
//! lock file, re-read the transcript from scratch and upsert messages.
//!
//! The marker is deleted only when its `latest` still equals the value
//! observed before processing. If a hook landed mid-run, the marker stays
//! and that event's worker re-reconciles, so the tail of a burst is never
//! lost.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::thread;
use std::time::Duration;

use rusqlite::Connection;
use serde_json::json;

use crate::config::Config;
use crate::debounce;
use crate::error::{PulseError, Result};
use crate::store::{self, NewMessage};
use crate::tools;
use crate::transcript;

const LOCK_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Entry point of the worker process.
///
/// Errors are logged to the store as `Worker error` before propagating, so
/// the process can exit non-zero while the failure stays observable.
pub fn run(config: &Config, session_id: &str, timestamp: &str) -> Result<()> {
    let conn = store::open(config)?;
    match run_inner(&conn, config, session_id, timestamp) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = store::log(
                &conn,
                "Worker error",
                json!({
                    "error": err.to_string(),
                    "error_type": err.kind(),
                    "session_id": session_id,
                }),
            );
            Err(err)
        }
    }
}

fn run_inner(conn: &Connection, config: &Config, session_id: &str, timestamp: &str) -> Result<()> {
    store::log(
        conn,
        "Worker started",
        json!({"session_id": session_id, "timestamp": timestamp}),
    )?;

    thread::sleep(config.debounce);

    let dir = config.debounce_dir();
    let Some(marker) = debounce::read_marker(&dir, session_id) else {
        store::log(
            conn,
            "Marker file missing or invalid, skipping",
            json!({"session_id": session_id}),
        )?;
        return Ok(());
    };

    let is_latest = marker.latest == timestamp;
    let debounce_expired = debounce::age_of(&marker.start)
        .map(|age| age >= config.debounce)
        .unwrap_or(false);

    if !is_latest && !debounce_expired {
        // A younger worker owns this burst.
        store::log(
            conn,
            "Newer event detected, skipping",
            json!({
                "session_id": session_id,
                "our_timestamp": timestamp,
                "latest_timestamp": marker.latest,
            }),
        )?;
        return Ok(());
    }

    let lock = debounce::lock_path(&dir, session_id);
    while lock.exists() {
        match debounce::lock_age(&lock) {
            Some(age) if age >= config.lock_stale_after() => {
                debounce::remove_lock(&lock);
                break;
            }
            Some(age) => {
                store::log(
                    conn,
                    "Waiting for lock",
                    json!({"session_id": session_id, "lock_age": age.as_secs_f64()}),
                )?;
                thread::sleep(LOCK_WAIT_INTERVAL);
            }
            None => break,
        }
    }
    debounce::write_lock(&lock)?;

    let outcome = run_locked(conn, config, session_id, &marker.latest);
    debounce::remove_lock(&lock);
    let changed = outcome?;

    if !changed.is_empty() {
        let tx = conn.unchecked_transaction()?;
        store::notify(
            &tx,
            "session_update",
            &json!({"session_id": session_id, "message_ids": changed}),
        )?;
        tx.commit()?;
    }
    Ok(())
}

/// Work performed while holding the session lock. Returns the ids of
/// created or changed messages.
fn run_locked(
    conn: &Connection,
    config: &Config,
    session_id: &str,
    observed_latest: &str,
) -> Result<Vec<i64>> {
    let dir = config.debounce_dir();

    // Another worker may have finished the burst while we waited.
    if debounce::read_marker(&dir, session_id).is_none() {
        store::log(
            conn,
            "Marker gone after lock acquired, skipping",
            json!({"session_id": session_id}),
        )?;
        return Ok(Vec::new());
    }

    let Some(session) = store::get_session(conn, session_id)? else {
        store::log(conn, "Session not found", json!({"session_id": session_id}))?;
        return Ok(Vec::new());
    };

    let changed = match session.transcript_path.as_deref().filter(|p| !p.is_empty()) {
        Some(transcript_path) => process_transcript(conn, session_id, transcript_path)?,
        None => {
            store::log(
                conn,
                "No transcript path in session",
                json!({"session_id": session_id}),
            )?;
            Vec::new()
        }
    };

    debounce::delete_marker_if_latest(&dir, session_id, observed_latest);
    Ok(changed)
}

/// Parses the transcript and materializes messages. Each write is its own
/// implicit transaction, so a crash leaves a prefix that the next run
/// completes idempotently.
pub fn process_transcript(
    conn: &Connection,
    session_id: &str,
    transcript_path: &str,
) -> Result<Vec<i64>> {
    let path = Path::new(transcript_path);
    if !path.exists() {
        store::log(
            conn,
            "Transcript file not found",
            json!({"session_id": session_id, "path": transcript_path}),
        )?;
        return Ok(Vec::new());
    }

    let Some(prompt) = store::get_latest_prompt(conn, session_id)? else {
        store::log(
            conn,
            "No prompt found for session",
            json!({"session_id": session_id}),
        )?;
        return Ok(Vec::new());
    };

    let transcript = transcript::parse_file(path)?;
    let mut changed = Vec::new();

    // Rapidly mutating todo lists collapse to their final state: keep only
    // the last TodoWrite per content hash within this pass.
    let mut final_todo_writes: HashMap<String, usize> = HashMap::new();
    for (index, tool_use) in transcript.tool_uses.iter().enumerate() {
        if tool_use.name == "TodoWrite" {
            let todos = tools::parse_todos(&tool_use.input);
            final_todo_writes.insert(tools::todo_identity(session_id, &todos), index);
        }
    }
    let final_todo_indices: HashSet<usize> = final_todo_writes.into_values().collect();

    for (index, tool_use) in transcript.tool_uses.iter().enumerate() {
        let result = transcript.tool_results.get(&tool_use.id);
        let summary = tools::project(tool_use, result);

        if tool_use.name == "TodoWrite" {
            if !final_todo_indices.contains(&index) {
                continue;
            }
            let todos = tools::parse_todos(&tool_use.input);
            let state_key = tools::todo_state_key(&todos);
            let upsert = store::upsert_todo_message(
                conn,
                session_id,
                prompt.id,
                &tool_use.id,
                tool_use.timestamp.as_deref(),
                &summary,
                &todos,
                &state_key,
            )?;
            if upsert.is_new || upsert.state_changed {
                changed.push(upsert.message_id);
            }
            continue;
        }

        if store::message_exists(conn, &tool_use.id)? {
            continue;
        }
        match store::create_message(
            conn,
            NewMessage {
                prompt_id: prompt.id,
                uuid: &tool_use.id,
                created_at: tool_use.timestamp.as_deref(),
                tools: Some(&summary),
                ..Default::default()
            },
        ) {
            Ok(id) => changed.push(id),
            // A concurrent run won the insert race: already ingested.
            Err(PulseError::Db(err)) if store::is_constraint_violation(&err) => {}
            Err(err) => return Err(err),
        }
    }

    for record in &transcript.records {
        if store::message_exists(conn, &record.uuid)? {
            continue;
        }
        let images = if record.images.is_empty() {
            None
        } else {
            Some(json!(record.images))
        };
        match store::create_message(
            conn,
            NewMessage {
                prompt_id: prompt.id,
                uuid: &record.uuid,
                created_at: record.timestamp.as_deref(),
                body: Some(&record.body),
                thinking: record.is_thinking,
                user: record.is_user,
                images: images.as_ref(),
                ..Default::default()
            },
        ) {
            Ok(id) => changed.push(id),
            Err(PulseError::Db(err)) if store::is_constraint_violation(&err) => {}
            Err(err) => return Err(err),
        }
    }

    store::log(
        conn,
        "Processed transcript",
        json!({"session_id": session_id, "messages_added": changed.len()}),
    )?;

    if let Some(title) = &transcript.custom_title {
        store::update_session_metadata(conn, session_id, Some(title), None)?;
    } else if let Some(first_user) = transcript.records.iter().find(|r| r.is_user) {
        store::update_session_name_if_empty(conn, session_id, &first_user.body)?;
    }

    // A pre-prompt placeholder adopts the newest user message as its text.
    if let Some(latest_prompt) = store::get_latest_prompt(conn, session_id)? {
        let body_missing = latest_prompt
            .prompt
            .as_deref()
            .map(|p| p.is_empty())
            .unwrap_or(true);
        if body_missing {
            if let Some(body) = store::get_latest_user_message(conn, latest_prompt.id)? {
                store::update_prompt_text(conn, latest_prompt.id, &body)?;
                store::log(
                    conn,
                    "Set prompt from user message",
                    json!({"session_id": session_id}),
                )?;
            }
        }
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Config, Connection) {
        let dir = TempDir::new().unwrap();
        let config = Config::at(dir.path(), Duration::from_secs(0));
        let conn = store::open(&config).unwrap();
        (dir, config, conn)
    }

    fn seed_session(conn: &Connection, config: &Config, session_id: &str) -> String {
        let transcript_path = config.base_dir.join(format!("{session_id}.jsonl"));
        let project_id = store::upsert_project(conn, "/test").unwrap();
        store::upsert_session(
            conn,
            session_id,
            project_id,
            "active",
            transcript_path.to_str().unwrap(),
            None,
            None,
        )
        .unwrap();
        store::create_prompt(conn, session_id, None).unwrap();
        transcript_path.to_str().unwrap().to_string()
    }

    fn write_transcript(path: &str, lines: &[Value]) {
        let text: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        fs_err::write(path, text.join("\n")).unwrap();
    }

    fn user_entry(uuid: &str, text: &str) -> Value {
        json!({
            "type": "user",
            "uuid": uuid,
            "timestamp": "2026-01-30T12:00:00Z",
            "message": {"role": "user", "content": text},
        })
    }

    fn assistant_text(uuid: &str, text: &str) -> Value {
        json!({
            "type": "assistant",
            "uuid": uuid,
            "timestamp": "2026-01-30T12:00:01Z",
            "message": {"role": "assistant", "type": "message",
                        "content": [{"type": "text", "text": text}]},
        })
    }

    fn todo_write(uuid: &str, todos: Value) -> Value {
        json!({
            "type": "assistant",
            "uuid": format!("entry-{uuid}"),
            "timestamp": "2026-01-30T12:00:02Z",
            "message": {"role": "assistant", "type": "message",
                        "content": [{"type": "tool_use", "id": uuid, "name": "TodoWrite",
                                     "input": {"todos": todos}}]},
        })
    }

    fn message_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn ingestion_is_idempotent_across_runs() {
        let (_dir, config, conn) = setup();
        let path = seed_session(&conn, &config, "s1");
        write_transcript(
            &path,
            &[
                user_entry("u1", "Hello, how are you?"),
                assistant_text("a1", "Doing great."),
            ],
        );

        let first = process_transcript(&conn, "s1", &path).unwrap();
        assert_eq!(first.len(), 2);

        let second = process_transcript(&conn, "s1", &path).unwrap();
        assert!(second.is_empty());
        assert_eq!(message_count(&conn), 2);
    }

    #[test]
    fn synthetic_user_entries_are_not_persisted() {
        let (_dir, config, conn) = setup();
        let path = seed_session(&conn, &config, "s1");
        write_transcript(
            &path,
            &[
                user_entry("u1", "<local-command-stdout>ok</local-command-stdout>"),
                assistant_text("a1", "Just the assistant."),
            ],
        );

        process_transcript(&conn, "s1", &path).unwrap();
        assert_eq!(message_count(&conn), 1);
        let is_user: bool = conn
            .query_row("SELECT is_user FROM messages", [], |r| r.get(0))
            .unwrap();
        assert!(!is_user);
    }

    #[test]
    fn todo_sequence_collapses_to_one_updated_row() {
        let (_dir, config, conn) = setup();
        let path = seed_session(&conn, &config, "s");
        let contents = ["plan", "build", "test"];
        let todos = |statuses: [&str; 3]| -> Value {
            json!(contents
                .iter()
                .zip(statuses.iter())
                .map(|(c, s)| json!({"content": c, "status": s}))
                .collect::<Vec<_>>())
        };

        write_transcript(
            &path,
            &[todo_write("t1", todos(["pending", "pending", "pending"]))],
        );
        let first = process_transcript(&conn, "s", &path).unwrap();
        assert_eq!(first.len(), 1);

        write_transcript(
            &path,
            &[
                todo_write("t1", todos(["pending", "pending", "pending"])),
                todo_write("t2", todos(["in_progress", "pending", "pending"])),
            ],
        );
        let second = process_transcript(&conn, "s", &path).unwrap();
        assert_eq!(second.len(), 1, "status change reports the updated row");

        // One row, addressed by the content hash.
        assert_eq!(message_count(&conn), 1);
        let todo_id: String = conn
            .query_row("SELECT todo_id FROM messages", [], |r| r.get(0))
            .unwrap();
        let expected = tools::todo_identity(
            "s",
            &[
                tools::Todo::new("plan", "pending"),
                tools::Todo::new("build", "pending"),
                tools::Todo::new("test", "pending"),
            ],
        );
        assert_eq!(todo_id, expected);

        // Re-run without changes: nothing to report.
        let third = process_transcript(&conn, "s", &path).unwrap();
        assert!(third.is_empty());
    }

    #[test]
    fn only_final_todo_write_per_hash_is_ingested() {
        let (_dir, config, conn) = setup();
        let path = seed_session(&conn, &config, "s");
        write_transcript(
            &path,
            &[
                todo_write("t1", json!([{"content": "a", "status": "pending"}])),
                todo_write("t2", json!([{"content": "a", "status": "in_progress"}])),
                todo_write("t3", json!([{"content": "a", "status": "completed"}])),
            ],
        );

        process_transcript(&conn, "s", &path).unwrap();
        assert_eq!(message_count(&conn), 1);

        let tools_json: String = conn
            .query_row("SELECT tools FROM messages", [], |r| r.get(0))
            .unwrap();
        let parsed: Value = serde_json::from_str(&tools_json).unwrap();
        assert_eq!(parsed["input"]["todos"][0]["status"], "completed");
        assert_eq!(parsed["tool_use_id"], "t3");
    }

    #[test]
    fn tool_use_and_result_are_paired_into_one_message() {
        let (_dir, config, conn) = setup();
        let path = seed_session(&conn, &config, "s1");
        write_transcript(
            &path,
            &[
                json!({
                    "type": "assistant",
                    "uuid": "a1",
                    "timestamp": "2026-01-30T12:00:00Z",
                    "message": {"role": "assistant", "type": "message",
                                "content": [{"type": "tool_use", "id": "toolu_1", "name": "Bash",
                                             "input": {"command": "ls"}}]},
                }),
                json!({
                    "type": "user",
                    "uuid": "u1",
                    "message": {"role": "user", "content": [
                        {"type": "tool_result", "tool_use_id": "toolu_1", "content": "a.txt"},
                    ]},
                }),
            ],
        );

        process_transcript(&conn, "s1", &path).unwrap();
        assert_eq!(message_count(&conn), 1);
        let tools_json: String = conn
            .query_row("SELECT tools FROM messages WHERE uuid = 'toolu_1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        let parsed: Value = serde_json::from_str(&tools_json).unwrap();
        assert_eq!(parsed["output"], "a.txt");
        assert_eq!(parsed["status"], "success");
    }

    #[test]
    fn custom_title_overrides_and_first_user_message_fills_empty_name() {
        let (_dir, config, conn) = setup();
        let path = seed_session(&conn, &config, "s1");

        write_transcript(&path, &[user_entry("u1", "name me after this")]);
        process_transcript(&conn, "s1", &path).unwrap();
        let session = store::get_session(&conn, "s1").unwrap().unwrap();
        assert_eq!(session.name.as_deref(), Some("name me after this"));

        write_transcript(
            &path,
            &[
                user_entry("u1", "name me after this"),
                json!({"type": "custom-title", "title": "Renamed by user"}),
            ],
        );
        process_transcript(&conn, "s1", &path).unwrap();
        let session = store::get_session(&conn, "s1").unwrap().unwrap();
        assert_eq!(session.name.as_deref(), Some("Renamed by user"));
    }

    #[test]
    fn empty_prompt_adopts_latest_user_message() {
        let (_dir, config, conn) = setup();
        let path = seed_session(&conn, &config, "s1");
        write_transcript(&path, &[user_entry("u1", "promoted body")]);

        process_transcript(&conn, "s1", &path).unwrap();
        let prompt = store::get_latest_prompt(&conn, "s1").unwrap().unwrap();
        assert_eq!(prompt.prompt.as_deref(), Some("promoted body"));
    }

    #[test]
    fn images_are_stored_as_json() {
        let (_dir, config, conn) = setup();
        let path = seed_session(&conn, &config, "s1");
        write_transcript(
            &path,
            &[json!({
                "type": "user",
                "uuid": "u1",
                "message": {"role": "user", "content": [
                    {"type": "text", "text": "see screenshot"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}},
                ]},
            })],
        );

        process_transcript(&conn, "s1", &path).unwrap();
        let images: String = conn
            .query_row("SELECT images FROM messages", [], |r| r.get(0))
            .unwrap();
        let parsed: Value = serde_json::from_str(&images).unwrap();
        assert_eq!(parsed[0]["media_type"], "image/png");
        assert_eq!(parsed[0]["data"], "AAAA");
    }

    #[test]
    fn worker_skips_when_not_latest_and_window_open() {
        let (_dir, config, conn) = setup();
        let path = seed_session(&conn, &config, "s1");
        write_transcript(&path, &[user_entry("u1", "hello")]);
        drop(conn);

        // A burst that "started" in the future keeps the window open, so a
        // worker that is not the latest must yield to the younger one.
        let dir = config.debounce_dir();
        fs_err::create_dir_all(&dir).unwrap();
        let future = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        fs_err::write(
            debounce::marker_path(&dir, "s1"),
            json!({"start": future, "latest": "someone-else"}).to_string(),
        )
        .unwrap();

        run(&config, "s1", "our-timestamp").unwrap();

        assert!(debounce::read_marker(&dir, "s1").is_some());
        let conn = store::open(&config).unwrap();
        assert_eq!(message_count(&conn), 0);
    }

    #[test]
    fn worker_processes_and_clears_marker_when_latest() {
        let (_dir, config, conn) = setup();
        let path = seed_session(&conn, &config, "s1");
        write_transcript(&path, &[user_entry("u1", "hello")]);
        drop(conn);

        let dir = config.debounce_dir();
        let now = Utc::now().to_rfc3339();
        debounce::touch_marker(&dir, "s1", &now).unwrap();

        run(&config, "s1", &now).unwrap();

        assert!(debounce::read_marker(&dir, "s1").is_none());
        assert!(!debounce::lock_path(&dir, "s1").exists());

        let conn = store::open(&config).unwrap();
        assert_eq!(message_count(&conn), 1);
        let payload: String = conn
            .query_row(
                "SELECT payload FROM notifications WHERE channel = 'session_update'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        let parsed: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["session_id"], "s1");
        assert_eq!(parsed["message_ids"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn burst_last_event_wins_and_early_workers_skip() {
        let (_dir, config, conn) = setup();
        let path = seed_session(&conn, &config, "s1");
        write_transcript(&path, &[user_entry("u1", "hello")]);
        drop(conn);

        // Five hooks in quick succession: the daemon refreshes the marker
        // each time, preserving the burst start.
        let dir = config.debounce_dir();
        let stamps: Vec<String> = (0..5)
            .map(|i| (Utc::now() + chrono::Duration::milliseconds(i)).to_rfc3339())
            .collect();
        for stamp in &stamps {
            debounce::touch_marker(&dir, "s1", stamp).unwrap();
        }

        // The last event's worker processes and clears the marker.
        run(&config, "s1", &stamps[4]).unwrap();
        assert!(debounce::read_marker(&dir, "s1").is_none());

        // A straggler from earlier in the burst finds nothing left to do.
        run(&config, "s1", &stamps[0]).unwrap();

        let conn = store::open(&config).unwrap();
        assert_eq!(message_count(&conn), 1);
    }

    #[test]
    fn marker_survives_when_new_event_arrives_mid_run() {
        let (_dir, config, conn) = setup();
        let path = seed_session(&conn, &config, "s1");
        write_transcript(&path, &[user_entry("u1", "hello")]);

        let dir = config.debounce_dir();
        fs_err::create_dir_all(&dir).unwrap();
        debounce::touch_marker(&dir, "s1", "t1").unwrap();

        // Simulate a hook landing during processing: the marker now carries
        // a newer `latest` than the one this worker observed.
        debounce::touch_marker(&dir, "s1", "t2").unwrap();
        let changed = run_locked(&conn, &config, "s1", "t1").unwrap();
        assert_eq!(changed.len(), 1);

        let marker = debounce::read_marker(&dir, "s1").unwrap();
        assert_eq!(marker.latest, "t2", "marker preserved for the newer worker");

        // The newer worker completes the burst and clears the marker.
        let changed = run_locked(&conn, &config, "s1", "t2").unwrap();
        assert!(changed.is_empty());
        assert!(debounce::read_marker(&dir, "s1").is_none());
    }

    #[test]
    fn stale_lock_is_stolen_and_run_completes() {
        let (_dir, config, conn) = setup();
        let path = seed_session(&conn, &config, "s1");
        write_transcript(&path, &[user_entry("u1", "hello")]);
        drop(conn);

        let dir = config.debounce_dir();
        let now = Utc::now().to_rfc3339();
        debounce::touch_marker(&dir, "s1", &now).unwrap();

        // A lock left behind an hour ago is far past debounce × 30.
        let lock = debounce::lock_path(&dir, "s1");
        let old = (Utc::now() - chrono::Duration::seconds(3600)).to_rfc3339();
        fs_err::write(&lock, old).unwrap();

        run(&config, "s1", &now).unwrap();

        assert!(!lock.exists());
        assert!(debounce::read_marker(&dir, "s1").is_none());
    }

    #[test]
    fn worker_error_is_logged_and_propagated() {
        let (_dir, config, conn) = setup();
        // Session exists but its transcript is an unreadable path (a
        // directory), which fails the read with an I/O error.
        let project_id = store::upsert_project(&conn, "/test").unwrap();
        store::upsert_session(
            &conn,
            "s1",
            project_id,
            "active",
            config.base_dir.to_str().unwrap(),
            None,
            None,
        )
        .unwrap();
        store::create_prompt(&conn, "s1", None).unwrap();
        drop(conn);

        let dir = config.debounce_dir();
        let now = Utc::now().to_rfc3339();
        debounce::touch_marker(&dir, "s1", &now).unwrap();

        let err = run(&config, "s1", &now).unwrap_err();
        assert!(matches!(err, PulseError::Io { .. }));

        // Lock released, marker left for the retry.
        assert!(!debounce::lock_path(&dir, "s1").exists());
        assert!(debounce::read_marker(&dir, "s1").is_some());

        let conn = store::open(&config).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM logs WHERE data LIKE '%Worker error%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
