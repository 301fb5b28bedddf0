//! tmux plumbing for sessions that must outlive their pty attach client.
//!
//! A tmux-backed session is created detached, then a pty runs
//! `tmux attach-session` against it. Killing the attach client leaves the
//! tmux session (and the shell inside it) running.

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use agentrix_protocol::{SessionIdentity, SessionKind};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::warn;

use crate::error::AgentrixError;
use crate::pty::CommandSpec;

const TMUX: &str = "tmux";
const TMUX_TIMEOUT: Duration = Duration::from_secs(5);
const DIGEST_BYTES: usize = 5;

async fn run(args: &[&str], what: &str) -> Result<Output, AgentrixError> {
    let mut cmd = Command::new(TMUX);
    cmd.args(args).env_remove("TMUX").kill_on_drop(true);
    match tokio::time::timeout(TMUX_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(AgentrixError::ProcessSpawn(format!("{what}: {e}"))),
        Err(_) => Err(AgentrixError::ProcessSpawn(format!(
            "{what}: timed out after {}s",
            TMUX_TIMEOUT.as_secs()
        ))),
    }
}

/// Whether a usable tmux binary is on `PATH`.
pub async fn is_available() -> bool {
    run(&["-V"], "tmux -V")
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub async fn has_session(name: &str) -> Result<bool, AgentrixError> {
    let target = format!("={name}");
    let output = run(&["has-session", "-t", &target], "tmux has-session").await?;
    Ok(output.status.success())
}

/// Create a detached session rooted at `cwd`, running `command` instead of
/// the default shell when one is given.
pub async fn new_session(
    name: &str,
    cwd: &Path,
    command: Option<&str>,
) -> Result<(), AgentrixError> {
    if !cwd.is_dir() {
        return Err(AgentrixError::ProcessSpawn(format!(
            "working directory does not exist: {}",
            cwd.display()
        )));
    }
    let cwd = cwd.to_string_lossy();
    let mut args = vec!["new-session", "-d", "-s", name, "-c", cwd.as_ref()];
    args.extend(command);
    let output = run(&args, "tmux new-session").await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AgentrixError::ProcessSpawn(format!(
            "tmux new-session failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

/// Kill a tmux session. A session that is already gone is not an error.
pub async fn kill_session(name: &str) -> Result<(), AgentrixError> {
    let target = format!("={name}");
    let output = run(&["kill-session", "-t", &target], "tmux kill-session").await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(tmux_session = name, stderr = %stderr.trim(), "tmux kill-session reported failure");
    }
    Ok(())
}

/// pty command that attaches to an existing tmux session.
pub fn attach_command(name: &str, cwd: &Path) -> CommandSpec {
    let mut spec = CommandSpec::new(TMUX, cwd).args(["attach-session", "-t"]);
    spec.args.push(format!("={name}"));
    spec.unset_env.push("TMUX".to_string());
    spec
}

/// Deterministic tmux session name for an identity.
///
/// The readable part maps anything outside `[A-Za-z0-9_-]` to `-` (tmux
/// rejects `.` and `:`), which can make different identities look alike.
/// A digest of the exact identity, kind and name keeps them apart.
pub fn session_name(identity: &SessionIdentity, kind: SessionKind, name: Option<&str>) -> String {
    let mut raw = format!("{}-{}-{}", identity.org, identity.repo, identity.branch);
    if kind == SessionKind::Automation {
        raw.push_str("-automation");
    }
    if let Some(name) = name {
        raw.push('-');
        raw.push_str(name);
    }

    let mut readable = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            readable.push(ch);
        } else {
            readable.push('-');
        }
    }
    while readable.contains("--") {
        readable = readable.replace("--", "-");
    }

    let mut hasher = Sha256::new();
    hasher.update(identity.key().as_bytes());
    hasher.update([0]);
    hasher.update(match kind {
        SessionKind::Interactive => b"interactive".as_slice(),
        SessionKind::Automation => b"automation".as_slice(),
    });
    if let Some(name) = name {
        hasher.update([0]);
        hasher.update(name.as_bytes());
    }
    let digest = hasher.finalize();

    format!(
        "agentrix-{}-{}",
        readable.trim_matches('-'),
        hex::encode(&digest[..DIGEST_BYTES])
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readable_part(name: &str) -> &str {
        name.rsplit_once('-').map(|(head, _)| head).unwrap_or(name)
    }

    #[test]
    fn session_names_are_tmux_safe() {
        let id = SessionIdentity::new("acme", "app.web", "feature/login-revamp");
        let interactive = session_name(&id, SessionKind::Interactive, None);
        assert_eq!(
            readable_part(&interactive),
            "agentrix-acme-app-web-feature-login-revamp"
        );
        assert_eq!(
            readable_part(&session_name(&id, SessionKind::Automation, None)),
            "agentrix-acme-app-web-feature-login-revamp-automation"
        );
        assert_eq!(
            readable_part(&session_name(&id, SessionKind::Interactive, Some("logs"))),
            "agentrix-acme-app-web-feature-login-revamp-logs"
        );
        assert!(
            interactive
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert_eq!(interactive, session_name(&id, SessionKind::Interactive, None));
    }

    #[test]
    fn lookalike_identities_get_distinct_names() {
        let slashed = SessionIdentity::new("acme", "app", "feat/x");
        let dashed = SessionIdentity::new("acme", "app", "feat-x");
        assert_ne!(
            session_name(&slashed, SessionKind::Interactive, None),
            session_name(&dashed, SessionKind::Interactive, None)
        );

        let main = SessionIdentity::new("acme", "app", "main");
        let main_logs = SessionIdentity::new("acme", "app", "main-logs");
        assert_ne!(
            session_name(&main, SessionKind::Interactive, Some("logs")),
            session_name(&main_logs, SessionKind::Interactive, None)
        );

        let automation_branch = SessionIdentity::new("acme", "app", "main-automation");
        assert_ne!(
            session_name(&main, SessionKind::Automation, None),
            session_name(&automation_branch, SessionKind::Interactive, None)
        );
    }

    #[test]
    fn attach_command_targets_exact_session() {
        let spec = attach_command("agentrix-a-b-c", Path::new("/tmp"));
        assert_eq!(spec.program, "tmux");
        assert_eq!(spec.args, vec!["attach-session", "-t", "=agentrix-a-b-c"]);
        assert!(spec.unset_env.iter().any(|k| k == "TMUX"));
    }
}
