//! Unix socket server for hook intake.
//!
//! One connection carries exactly one request: a line of JSON from the
//! thin client, answered with `{"continue": true}` no matter what, since
//! the assistant CLI must never be blocked by our failures. Each connection is
//! handled on its own thread; database writes serialize on the shared
//! connection inside [`intake::SharedDb`].

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use pulse_core::{Config, PulseError, Result};
use pulse_daemon_protocol::{HookRequest, HookResponse, MAX_REQUEST_BYTES};
use tracing::{info, warn};

use crate::intake::SharedDb;

const READ_TIMEOUT_SECS: u64 = 5;
const READ_CHUNK_SIZE: usize = 4096;

/// Socket path seen by the signal handler for cleanup on shutdown.
static SOCKET_PATH: OnceLock<PathBuf> = OnceLock::new();

pub fn run(config: &Config) -> Result<()> {
    let socket_path = config.socket_path();
    fs_err::create_dir_all(&config.base_dir)
        .map_err(|e| PulseError::io(format!("create {}", config.base_dir.display()), e))?;

    // A previous instance may have died without cleanup.
    if socket_path.exists() {
        fs_err::remove_file(&socket_path)
            .map_err(|e| PulseError::io(format!("remove {}", socket_path.display()), e))?;
    }

    let listener = UnixListener::bind(&socket_path)
        .map_err(|e| PulseError::io(format!("bind {}", socket_path.display()), e))?;

    let _ = SOCKET_PATH.set(socket_path.clone());
    install_signal_handlers();

    let db = Arc::new(SharedDb::new(config.clone()));
    info!(path = %socket_path.display(), "Pulse daemon started");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let db = Arc::clone(&db);
                thread::spawn(move || handle_connection(stream, &db));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }

    Ok(())
}

fn handle_connection(mut stream: UnixStream, db: &SharedDb) {
    let response = match read_request(&mut stream) {
        Ok(request) => crate::intake::process_event(db, &request),
        Err(reason) => {
            // Corrupt input: skip the unit, still unblock the client.
            warn!(reason = %reason, "Dropping malformed hook request");
            HookResponse::proceed()
        }
    };
    if let Err(err) = write_response(&mut stream, &response) {
        warn!(error = %err, "Failed to write hook response");
    }
}

fn read_request(stream: &mut UnixStream) -> std::result::Result<HookRequest, String> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("request exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err("request timed out".to_string());
            }
            Err(err) => {
                return Err(format!("failed to read request: {err}"));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err("request body was empty".to_string());
    }

    serde_json::from_slice(request_bytes).map_err(|err| format!("request was not valid JSON: {err}"))
}

fn write_response(stream: &mut UnixStream, response: &HookResponse) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

fn install_signal_handlers() {
    let handler = handle_shutdown as extern "C" fn(libc::c_int);
    // SAFETY: installing a handler for SIGTERM/SIGINT; the handler only
    // unlinks the socket path and exits.
    #[allow(unsafe_code)]
    unsafe {
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

extern "C" fn handle_shutdown(_signal: libc::c_int) {
    if let Some(path) = SOCKET_PATH.get() {
        let _ = std::fs::remove_file(path);
    }
    std::process::exit(0);
}
