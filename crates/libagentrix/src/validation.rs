use std::collections::BTreeMap;

use serde_json::Value;
use subtle::ConstantTimeEq;

use crate::error::AgentrixError;

/// Agent identifiers accepted by the automation endpoint, with the command
/// line each one runs.
pub const DEFAULT_AGENT_COMMANDS: &[(&str, &str)] = &[
    ("codex", "codex"),
    (
        "codex_dangerous",
        "codex --dangerously-bypass-approvals-and-sandbox",
    ),
    ("claude", "claude"),
    ("claude_dangerous", "claude --dangerously-skip-permissions"),
    ("cursor", "cursor-agent"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommands {
    commands: BTreeMap<String, String>,
}

impl AgentCommands {
    pub fn new(commands: BTreeMap<String, String>) -> Self {
        Self { commands }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.commands.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// Override or add entries.
    pub fn extend(&mut self, overrides: impl IntoIterator<Item = (String, String)>) {
        self.commands.extend(overrides);
    }
}

impl Default for AgentCommands {
    fn default() -> Self {
        Self::new(
            DEFAULT_AGENT_COMMANDS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

/// A request that passed payload validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub org: String,
    pub repo: String,
    pub worktree: Option<String>,
    pub prompt: String,
    pub plan: bool,
    /// Agent identifier as sent by the client.
    pub agent: String,
    /// Command line the identifier maps to.
    pub command: String,
}

/// Check the presented key against the configured one in constant time.
///
/// No configured key means the feature is off (503), not open.
pub fn verify_api_key(configured: Option<&str>, presented: Option<&str>) -> Result<(), AgentrixError> {
    let Some(expected) = configured.filter(|k| !k.is_empty()) else {
        return Err(AgentrixError::ServiceUnavailable(
            "automation API key is not configured".to_string(),
        ));
    };
    let Some(presented) = presented.filter(|k| !k.is_empty()) else {
        return Err(AgentrixError::Unauthorized("missing API key".to_string()));
    };
    if bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) {
        Ok(())
    } else {
        Err(AgentrixError::Unauthorized("invalid API key".to_string()))
    }
}

/// Validate the JSON body of an automation launch request.
pub fn validate_launch_payload(
    body: &Value,
    commands: &AgentCommands,
) -> Result<LaunchRequest, AgentrixError> {
    let Some(obj) = body.as_object() else {
        return Err(bad("request body must be a JSON object"));
    };

    let repo_field = obj
        .get("repo")
        .and_then(Value::as_str)
        .ok_or_else(|| bad("repo is required and must be a string"))?;
    let (org, repo) = split_repo(repo_field)?;

    let prompt = match obj.get("prompt") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(bad("prompt must be a string")),
    };

    let plan = match obj.get("plan") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(bad("plan must be a boolean")),
    };

    let worktree = match obj.get("worktree") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(_) => return Err(bad("worktree must be a string")),
    };

    let agent = obj
        .get("command")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad("command is required"))?;
    let Some(command) = commands.get(agent) else {
        let allowed: Vec<&str> = commands.keys().collect();
        return Err(bad(&format!(
            "unknown command '{agent}', expected one of: {}",
            allowed.join(", ")
        )));
    };

    if plan && prompt.trim().is_empty() {
        return Err(bad("prompt is required when plan is true"));
    }

    Ok(LaunchRequest {
        org,
        repo,
        worktree,
        prompt,
        plan,
        agent: agent.to_string(),
        command: command.to_string(),
    })
}

fn split_repo(value: &str) -> Result<(String, String), AgentrixError> {
    let mut parts = value.trim().split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(org), Some(repo), None) if !org.trim().is_empty() && !repo.trim().is_empty() => {
            Ok((org.trim().to_string(), repo.trim().to_string()))
        }
        _ => Err(bad("repo must look like 'org/repo'")),
    }
}

fn bad(message: &str) -> AgentrixError {
    AgentrixError::BadRequest(message.to_string())
}
