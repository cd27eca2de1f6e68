//! IPC protocol types for the Pulse intake daemon.
//!
//! This crate is shared by the daemon and the thin hook client to prevent
//! schema drift. The wire format is one line of JSON per connection:
//! the client sends `{event, env}` terminated by `\n` and the daemon
//! always answers `{"continue": true}` so the assistant CLI is never
//! blocked on our account.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Upper bound on a single request line. Anything larger is dropped.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// A hook envelope as emitted by the assistant CLI on the hook command's
/// stdin. Only the fields the pipeline consumes are typed; everything else
/// is preserved in `extra` so the daemon can persist the full payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookEnvelope {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub hook_event_name: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HookEnvelope {
    pub fn session_id(&self) -> &str {
        self.session_id.as_deref().unwrap_or("unknown")
    }

    pub fn hook_event_name(&self) -> &str {
        self.hook_event_name.as_deref().unwrap_or("")
    }

    /// Maps this hook onto a session status, if any applies.
    pub fn session_status(&self) -> Option<SessionStatus> {
        match self.hook_event_name() {
            "SessionStart" => Some(SessionStatus::Started),
            "UserPromptSubmit" | "PreToolUse" | "PostToolUse" => Some(SessionStatus::Active),
            "Stop" => Some(SessionStatus::Done),
            "SessionEnd" => Some(SessionStatus::Ended),
            "Notification" => match self.notification_type.as_deref() {
                Some("permission_prompt") => Some(SessionStatus::PermissionNeeded),
                Some("idle_prompt") => Some(SessionStatus::Idle),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Session lifecycle states as stored in `sessions.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Started,
    Active,
    Done,
    Ended,
    PermissionNeeded,
    Idle,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Started => "started",
            SessionStatus::Active => "active",
            SessionStatus::Done => "done",
            SessionStatus::Ended => "ended",
            SessionStatus::PermissionNeeded => "permission_needed",
            SessionStatus::Idle => "idle",
        }
    }
}

/// Environment values the thin client forwards alongside the envelope.
/// Empty strings are normalized to `None` on access, not on decode, so the
/// raw request stays inspectable in the hooks table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientEnv {
    #[serde(default)]
    pub terminal_id: Option<String>,
    #[serde(default)]
    pub shell_id: Option<String>,
}

impl ClientEnv {
    pub fn terminal_id(&self) -> Option<i64> {
        self.terminal_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse().ok())
    }

    pub fn shell_id(&self) -> Option<&str> {
        self.shell_id.as_deref().filter(|s| !s.is_empty())
    }
}

/// One request from the thin client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookRequest {
    #[serde(default)]
    pub event: HookEnvelope,
    #[serde(default)]
    pub env: ClientEnv,
}

/// The daemon's only reply. `continue` tells the assistant CLI to proceed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResponse {
    #[serde(rename = "continue")]
    pub proceed: bool,
}

impl HookResponse {
    pub fn proceed() -> Self {
        Self { proceed: true }
    }
}
