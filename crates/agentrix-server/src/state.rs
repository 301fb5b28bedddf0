use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use agentrix_git::GitRepositories;
use libagentrix::automation::{
    BranchNameGenerator, GitRepositoryService, PlanGenerator, RegistryAgentLauncher,
};
use libagentrix::{
    AgentCommands, AgentrixError, AutomationRunner, AutomationServices, RateLimiter,
    SessionRegistry, TaskStore,
};
use anyhow::Result;
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::events::BroadcastRepositoryEvents;
use crate::generators::{CommandBranchNameGenerator, CommandPlanGenerator};
use crate::github::GitHubClient;

/// Everything a request handler can reach.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub tasks: Arc<TaskStore>,
    pub runner: AutomationRunner,
    pub git: Arc<dyn GitRepositoryService>,
    pub events: BroadcastRepositoryEvents,
    pub agent_commands: AgentCommands,
    pub api_key: Option<String>,
    pub session_tokens: Vec<String>,
    pub idle_threshold: Duration,
    pub workdir: PathBuf,
    /// Absent unless a GitHub token is configured.
    pub github: Option<GitHubClient>,
    rate_limiter: Mutex<RateLimiter>,
    closed_retention: Duration,
    task_retention: Duration,
}

impl AppState {
    pub fn from_config(cfg: &RuntimeConfig) -> Result<Self> {
        let git = Arc::new(GitRepositories::new(cfg.clone_url_template.clone()));
        Self::with_git(cfg, git)
    }

    /// Build the state around a specific git collaborator.
    pub fn with_git(cfg: &RuntimeConfig, git: Arc<dyn GitRepositoryService>) -> Result<Self> {
        let registry = Arc::new(SessionRegistry::new(cfg.registry.clone()));
        let events = BroadcastRepositoryEvents::new();

        let branch_names = cfg.branch_name_command.as_ref().map(|command| {
            Arc::new(CommandBranchNameGenerator::new(command.clone())) as Arc<dyn BranchNameGenerator>
        });
        let plans = cfg.plan_command.as_ref().map(|command| {
            Arc::new(CommandPlanGenerator::new(command.clone())) as Arc<dyn PlanGenerator>
        });

        let services = AutomationServices {
            git: Arc::clone(&git),
            branch_names,
            plans,
            launcher: Arc::new(RegistryAgentLauncher::new(Arc::clone(&registry))),
            events: Arc::new(events.clone()),
        };
        let runner = AutomationRunner::new(
            services,
            Arc::clone(&registry),
            cfg.workdir.clone(),
            cfg.default_branches.clone(),
        );

        let github = GitHubClient::from_token(cfg.github_token.clone(), &cfg.github_api_url)?;
        if github.is_some() {
            info!(api_url = %cfg.github_api_url, "GitHub views enabled");
        }

        Ok(Self {
            registry,
            tasks: Arc::new(TaskStore::new()),
            runner,
            git,
            events,
            agent_commands: cfg.agent_commands.clone(),
            api_key: cfg.api_key.clone(),
            session_tokens: cfg.session_tokens.clone(),
            idle_threshold: cfg.idle_threshold,
            workdir: cfg.workdir.clone(),
            github,
            rate_limiter: Mutex::new(RateLimiter::new(
                cfg.rate_limit_max_attempts,
                cfg.rate_limit_window,
            )),
            closed_retention: cfg.closed_retention,
            task_retention: cfg.task_retention,
        })
    }

    /// Count an automation attempt against `key`.
    pub fn check_rate_limit(&self, key: &str) -> Result<(), AgentrixError> {
        let mut limiter = self
            .rate_limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        limiter.check(key).map_err(|retry_after| AgentrixError::RateLimited {
            retry_after_secs: retry_after.as_secs().max(1),
        })
    }

    /// Periodic cleanup of closed sessions, finished tasks and idle limiter
    /// keys.
    pub async fn run_maintenance(&self) {
        let sessions = self.registry.prune_closed(self.closed_retention).await;
        let tasks = self.tasks.prune_finished(self.task_retention);
        self.rate_limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sweep();
        if sessions > 0 || tasks > 0 {
            debug!(sessions, tasks, "maintenance pruned records");
        }
    }
}
