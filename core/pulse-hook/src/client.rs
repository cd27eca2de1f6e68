//! Socket forwarding for hook events.
//!
//! One connection, one line out, one line back. A missing socket or a
//! refused connection means the daemon (and with it the dashboard) is not
//! running; that is a normal state, answered locally with
//! `{"continue": true}`.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use pulse_core::Config;
use pulse_daemon_protocol::{ClientEnv, HookEnvelope, HookRequest, HookResponse, MAX_REQUEST_BYTES};

const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads the envelope from stdin, forwards it, prints the reply.
/// Always exits cleanly: the assistant CLI must proceed no matter what.
pub fn run() {
    let mut input = String::new();
    if std::io::stdin().read_to_string(&mut input).is_err() {
        print_continue();
        return;
    }

    let Ok(event) = serde_json::from_str::<HookEnvelope>(&input) else {
        print_continue();
        return;
    };

    let request = HookRequest {
        event,
        env: client_env(),
    };

    let socket = match Config::from_env() {
        Ok(config) => config.socket_path(),
        Err(_) => {
            print_continue();
            return;
        }
    };

    match forward(&socket, &request) {
        Ok(reply) => println!("{}", reply.trim()),
        Err(err) => {
            tracing::debug!(error = %err, "Daemon unreachable, continuing without it");
            print_continue();
        }
    }
}

fn client_env() -> ClientEnv {
    ClientEnv {
        terminal_id: std::env::var("CLAUDE_TERMINAL_ID").ok(),
        shell_id: std::env::var("WORKIO_SHELL_ID").ok(),
    }
}

fn print_continue() {
    match serde_json::to_string(&HookResponse::proceed()) {
        Ok(line) => println!("{line}"),
        Err(_) => println!("{{\"continue\": true}}"),
    }
}

/// Sends one request line and reads one reply line.
pub fn forward(socket: &Path, request: &HookRequest) -> Result<String, String> {
    let mut stream = UnixStream::connect(socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {err}"))?;
    let _ = stream.set_read_timeout(Some(SOCKET_TIMEOUT));
    let _ = stream.set_write_timeout(Some(SOCKET_TIMEOUT));

    serde_json::to_writer(&mut stream, request)
        .map_err(|err| format!("Failed to write request: {err}"))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {err}"))?;
    stream.flush().ok();

    read_reply(&mut stream)
}

fn read_reply(stream: &mut UnixStream) -> Result<String, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Reply exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err("Timed out waiting for daemon reply".to_string());
            }
            Err(err) => return Err(format!("Failed to read reply: {err}")),
        }
    }

    if buffer.is_empty() {
        return Err("Daemon reply was empty".to_string());
    }
    let end = buffer
        .iter()
        .position(|b| *b == b'\n')
        .unwrap_or(buffer.len());
    String::from_utf8(buffer[..end].to_vec()).map_err(|err| format!("Reply was not UTF-8: {err}"))
}
