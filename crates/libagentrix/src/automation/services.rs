//! Collaborators the automation runner drives. Implementations live in other
//! crates (git, generators) or are test doubles.

use std::path::{Path, PathBuf};

use agentrix_protocol::{RepositorySnapshot, SessionId, SessionIdentity};
use async_trait::async_trait;

use crate::error::AgentrixError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryCheckout {
    pub repository_path: PathBuf,
    pub cloned: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeOptions {
    /// Base branch for a new worktree branch, instead of the repository's
    /// default branch.
    pub default_branch_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeCheckout {
    pub worktree_path: PathBuf,
    pub created: bool,
}

#[async_trait]
pub trait GitRepositoryService: Send + Sync {
    /// Clone `org/repo` under `workdir` unless it is already there.
    async fn ensure_repository_exists(
        &self,
        workdir: &Path,
        org: &str,
        repo: &str,
    ) -> anyhow::Result<RepositoryCheckout>;

    /// Check out `branch` into its own worktree unless one already exists.
    async fn ensure_worktree_exists(
        &self,
        workdir: &Path,
        org: &str,
        repo: &str,
        branch: &str,
        options: &WorktreeOptions,
    ) -> anyhow::Result<WorktreeCheckout>;

    async fn discover_repositories(&self, workdir: &Path) -> anyhow::Result<RepositorySnapshot>;

    /// Path of an existing worktree for `branch`, if there is one.
    async fn locate_worktree(
        &self,
        workdir: &Path,
        org: &str,
        repo: &str,
        branch: &str,
    ) -> Option<PathBuf>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchNameRequest {
    pub prompt: String,
    pub org: String,
    pub repo: String,
}

#[async_trait]
pub trait BranchNameGenerator: Send + Sync {
    async fn generate_branch_name(&self, request: &BranchNameRequest) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub prompt: String,
    pub cwd: PathBuf,
}

#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn create_plan_text(&self, request: &PlanRequest) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLaunchRequest {
    pub command: String,
    pub workdir: PathBuf,
    pub identity: SessionIdentity,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLaunch {
    pub pid: Option<u32>,
    pub session_id: SessionId,
    pub tmux_session_name: Option<String>,
    pub using_tmux: bool,
    pub created_session: bool,
}

#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, request: &AgentLaunchRequest) -> Result<AgentLaunch, AgentrixError>;
}

/// Fire-and-forget notification that the repository tree changed.
pub trait RepositoryEvents: Send + Sync {
    fn emit_repos_update(&self, snapshot: RepositorySnapshot);
}
