use std::sync::Arc;

use agentrix_protocol::{SessionKind, SpawnMode};
use async_trait::async_trait;
use tracing::info;

use super::services::{AgentLaunch, AgentLaunchRequest, AgentLauncher};
use crate::error::AgentrixError;
use crate::registry::{SessionRegistry, SpawnOptions};

/// Launches agents as automation sessions in the shared registry, so they
/// show up next to interactive terminals and can be attached to. The agent
/// is the session's process: when it exits the session closes with its
/// exit code.
pub struct RegistryAgentLauncher {
    registry: Arc<SessionRegistry>,
    mode: Option<SpawnMode>,
}

impl RegistryAgentLauncher {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            mode: None,
        }
    }

    /// Force a spawn mode instead of the registry default.
    pub fn with_mode(mut self, mode: SpawnMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

#[async_trait]
impl AgentLauncher for RegistryAgentLauncher {
    async fn launch(&self, request: &AgentLaunchRequest) -> Result<AgentLaunch, AgentrixError> {
        let mut options = SpawnOptions::new(SessionKind::Automation, request.workdir.clone());
        options.mode = self.mode;
        options.command = Some(agent_command_line(&request.command, &request.prompt));
        let spawned = self
            .registry
            .spawn(request.identity.clone(), options)
            .await?;
        let session = spawned.session;

        info!(
            session_id = %session.id(),
            identity = %request.identity,
            command = %request.command,
            tmux = session.tmux_session_name().unwrap_or("-"),
            "agent launched"
        );
        Ok(AgentLaunch {
            pid: session.pid(),
            session_id: session.id().clone(),
            tmux_session_name: session.tmux_session_name().map(str::to_string),
            using_tmux: session.using_tmux(),
            created_session: spawned.created,
        })
    }
}

/// Shell command line for the agent: the command, followed by the prompt as
/// a single quoted argument when there is one.
pub fn agent_command_line(command: &str, prompt: &str) -> String {
    if prompt.trim().is_empty() {
        command.to_string()
    } else {
        format!("{command} {}", shell_quote(prompt))
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_without_prompt() {
        assert_eq!(agent_command_line("codex", ""), "codex");
        assert_eq!(agent_command_line("codex", "   "), "codex");
    }

    #[test]
    fn prompt_is_single_quoted() {
        assert_eq!(
            agent_command_line("claude", "fix the build"),
            "claude 'fix the build'"
        );
        assert_eq!(
            agent_command_line("claude", "don't $break `this`"),
            r"claude 'don'\''t $break `this`'"
        );
    }
}
