pub mod github;
pub mod paths;
pub mod task;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub use task::{StepLog, StepStatus, Task, TaskStatus, TaskStep};

/// Unique identifier for a process session.
pub type SessionId = String;

/// Identifier of an automation task.
pub type TaskId = String;

/// The `(org, repo, branch)` triple a session is bound to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionIdentity {
    pub org: String,
    pub repo: String,
    pub branch: String,
}

impl SessionIdentity {
    pub fn new(org: impl Into<String>, repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            repo: repo.into(),
            branch: branch.into(),
        }
    }

    /// Stable string key, `org/repo/branch`.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.org, self.repo, self.branch)
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.org, self.repo, self.branch)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Interactive,
    Automation,
}

/// How a session's process is hosted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMode {
    /// Use tmux when the binary is available, otherwise a direct pty.
    #[default]
    Auto,
    Tmux,
    Direct,
}

/// Server-to-client messages on the terminal socket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Init {
        log: String,
        closed: bool,
    },
    Output {
        chunk: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        reset: bool,
    },
    Exit {
        code: Option<i32>,
        signal: Option<String>,
        error: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn is_exit(&self) -> bool {
        matches!(self, ServerMessage::Exit { .. })
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientEnvelope {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

/// Client-to-server messages on the terminal socket.
///
/// Text frames that are not a recognised envelope are kept verbatim as
/// [`ClientMessage::Raw`] and written to the process as input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Input(String),
    Resize { cols: u16, rows: u16 },
    Raw(String),
}

impl ClientMessage {
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<ClientEnvelope>(text) {
            Ok(ClientEnvelope::Input { data }) => ClientMessage::Input(data),
            Ok(ClientEnvelope::Resize { cols, rows }) => ClientMessage::Resize { cols, rows },
            Err(_) => ClientMessage::Raw(text.to_string()),
        }
    }
}

/// Error codes shared by HTTP responses and socket error messages.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    NotFound,
    Conflict,
    RateLimited,
    ServiceUnavailable,
    InternalError,
}

impl ErrorCode {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::BadRequest => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::NotFound => 404,
            ErrorCode::Conflict => 409,
            ErrorCode::RateLimited => 429,
            ErrorCode::ServiceUnavailable => 503,
            ErrorCode::InternalError => 500,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

/// JSON error body: `{"error": {"code", "message", "step"?}}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

/// Success envelope used by every JSON route.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiResponse<T> {
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self { data }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub key: String,
    pub org: String,
    pub repo: String,
    pub branch: String,
    pub kind: SessionKind,
    #[serde(default)]
    pub name: Option<String>,
    pub worktree_path: PathBuf,
    pub using_tmux: bool,
    #[serde(default)]
    pub tmux_session_name: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    pub ready: bool,
    pub closed: bool,
    pub idle: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub created_at_epoch_ms: u64,
    pub last_activity_epoch_ms: u64,
    /// Scrollback currently held for replay.
    #[serde(default)]
    pub log_bytes: usize,
    /// Scrollback dropped to stay under the log cap. Non-zero means a
    /// replay starts mid-stream.
    #[serde(default)]
    pub log_evicted_bytes: u64,
}

/// Body of `POST /api/terminal/open`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OpenTerminalRequest {
    pub org: String,
    pub repo: String,
    pub branch: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mode: Option<SpawnMode>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpenTerminalResponse {
    pub session_id: SessionId,
    pub created: bool,
    pub using_tmux: bool,
    #[serde(default)]
    pub tmux_session_name: Option<String>,
}

/// Result snapshot attached to a successful automation task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutomationResult {
    pub org: String,
    pub repo: String,
    pub branch: String,
    pub branch_source: String,
    pub plan: bool,
    pub agent: String,
    pub automation_request_id: String,
    pub terminal_session_created: bool,
    pub session_id: SessionId,
    #[serde(default)]
    pub pid: Option<u32>,
    pub using_tmux: bool,
    #[serde(default)]
    pub tmux_session_name: Option<String>,
    pub repository_path: PathBuf,
    pub repository_cloned: bool,
    pub worktree_path: PathBuf,
    pub worktree_created: bool,
}

/// Response body of `POST /api/automation/launch`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LaunchResponse {
    pub task_id: TaskId,
    pub result: AutomationResult,
}

/// One discovered repository: its checked-out worktree branches and the
/// optional command run in fresh terminals.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryEntry {
    pub branches: Vec<String>,
    #[serde(default)]
    pub init_command: Option<String>,
}

/// `org -> repo -> entry`, sorted for stable output.
pub type RepositorySnapshot = BTreeMap<String, BTreeMap<String, RepositoryEntry>>;

/// Server-sent event published when the repository tree changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RepositoryEvent {
    ReposUpdate { repositories: RepositorySnapshot },
}

pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_input_and_resize_envelopes() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"input","data":"ls\r"}"#),
            ClientMessage::Input("ls\r".to_string())
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"resize","cols":100,"rows":40}"#),
            ClientMessage::Resize {
                cols: 100,
                rows: 40
            }
        );
    }

    #[test]
    fn unknown_text_falls_back_to_raw_input() {
        assert_eq!(
            ClientMessage::parse("echo hi\r"),
            ClientMessage::Raw("echo hi\r".to_string())
        );
        let unknown = r#"{"type":"ping"}"#;
        assert_eq!(
            ClientMessage::parse(unknown),
            ClientMessage::Raw(unknown.to_string())
        );
    }

    #[test]
    fn output_omits_reset_unless_set() {
        let plain = serde_json::to_value(ServerMessage::Output {
            chunk: "x".to_string(),
            reset: false,
        })
        .expect("serialize");
        assert_eq!(plain, serde_json::json!({"type": "output", "chunk": "x"}));

        let reset = serde_json::to_value(ServerMessage::Output {
            chunk: "x".to_string(),
            reset: true,
        })
        .expect("serialize");
        assert_eq!(reset["reset"], true);
    }

    #[test]
    fn exit_serializes_null_fields() {
        let value = serde_json::to_value(ServerMessage::Exit {
            code: Some(0),
            signal: None,
            error: None,
        })
        .expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"type": "exit", "code": 0, "signal": null, "error": null})
        );
    }

    #[test]
    fn error_codes_map_to_http_statuses() {
        assert_eq!(ErrorCode::Conflict.http_status(), 409);
        assert_eq!(ErrorCode::ServiceUnavailable.http_status(), 503);
        assert_eq!(ErrorCode::RateLimited.http_status(), 429);
    }
}
