//! Branch-name and plan generators backed by an external command.
//!
//! The command runs through `sh -c` with the prompt on stdin; its stdout is
//! the answer. A non-zero exit is a failure carrying stderr.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use libagentrix::automation::{BranchNameGenerator, BranchNameRequest, PlanGenerator, PlanRequest};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

async fn run_with_stdin(
    command: &str,
    input: &str,
    cwd: Option<&Path>,
    env: &[(&str, &str)],
) -> Result<String> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to run '{command}'"))?;
    // Commands that ignore stdin may exit before reading it.
    if let Some(mut stdin) = child.stdin.take()
        && let Err(e) = stdin.write_all(input.as_bytes()).await
    {
        debug!(error = %e, "generator closed stdin early");
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("'{command}' exited with {}: {}", output.status, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub struct CommandBranchNameGenerator {
    command: String,
}

impl CommandBranchNameGenerator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl BranchNameGenerator for CommandBranchNameGenerator {
    async fn generate_branch_name(&self, request: &BranchNameRequest) -> Result<String> {
        let stdout = run_with_stdin(
            &self.command,
            &request.prompt,
            None,
            &[
                ("AGENTRIX_ORG", request.org.as_str()),
                ("AGENTRIX_REPO", request.repo.as_str()),
            ],
        )
        .await?;
        let name = stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default()
            .to_string();
        debug!(org = %request.org, repo = %request.repo, branch = %name, "branch name generated");
        Ok(name)
    }
}

pub struct CommandPlanGenerator {
    command: String,
}

impl CommandPlanGenerator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl PlanGenerator for CommandPlanGenerator {
    async fn create_plan_text(&self, request: &PlanRequest) -> Result<String> {
        let stdout = run_with_stdin(&self.command, &request.prompt, Some(&request.cwd), &[]).await?;
        Ok(stdout.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn branch_name_is_first_non_empty_line() {
        let generator = CommandBranchNameGenerator::new("echo; echo \"feat-$AGENTRIX_REPO\"; echo ignored");
        let name = generator
            .generate_branch_name(&BranchNameRequest {
                prompt: "anything".to_string(),
                org: "acme".to_string(),
                repo: "app".to_string(),
            })
            .await
            .expect("generate");
        assert_eq!(name, "feat-app");
    }

    #[tokio::test]
    async fn plan_reads_prompt_from_stdin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let generator = CommandPlanGenerator::new("printf 'PLAN: '; cat");
        let plan = generator
            .create_plan_text(&PlanRequest {
                prompt: "Improve DX".to_string(),
                cwd: dir.path().to_path_buf(),
            })
            .await
            .expect("plan");
        assert_eq!(plan, "PLAN: Improve DX");
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let generator = CommandPlanGenerator::new("echo boom >&2; exit 3");
        let err = generator
            .create_plan_text(&PlanRequest {
                prompt: String::new(),
                cwd: std::env::temp_dir(),
            })
            .await
            .expect_err("non-zero exit");
        assert!(format!("{err:#}").contains("boom"));
    }
}
