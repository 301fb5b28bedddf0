//! The automation pipeline: resolve a branch, make sure the repository and
//! worktree exist, optionally turn the prompt into a plan, launch the agent
//! and refresh repository views.

pub mod branch;
pub mod launcher;
pub mod services;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use agentrix_protocol::{AutomationResult, SessionIdentity, TaskId};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::AgentrixError;
use crate::registry::SessionRegistry;
use crate::task::{TaskProgress, TaskStore};
use crate::validation::LaunchRequest;

pub use branch::{BranchSource, ResolvedBranch, sanitize_branch_name};
pub use launcher::RegistryAgentLauncher;
pub use services::{
    AgentLaunch, AgentLaunchRequest, AgentLauncher, BranchNameGenerator, BranchNameRequest,
    GitRepositoryService, PlanGenerator, PlanRequest, RepositoryCheckout, RepositoryEvents,
    WorktreeCheckout, WorktreeOptions,
};

pub const TASK_TYPE: &str = "automation-launch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepId {
    ResolveBranch,
    EnsureRepo,
    EnsureWorktree,
    GeneratePlan,
    LaunchAgent,
    RefreshViews,
}

impl StepId {
    pub const ALL: [StepId; 6] = [
        StepId::ResolveBranch,
        StepId::EnsureRepo,
        StepId::EnsureWorktree,
        StepId::GeneratePlan,
        StepId::LaunchAgent,
        StepId::RefreshViews,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepId::ResolveBranch => "RESOLVE_BRANCH",
            StepId::EnsureRepo => "ENSURE_REPO",
            StepId::EnsureWorktree => "ENSURE_WORKTREE",
            StepId::GeneratePlan => "GENERATE_PLAN",
            StepId::LaunchAgent => "LAUNCH_AGENT",
            StepId::RefreshViews => "REFRESH_VIEWS",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StepId::ResolveBranch => "Resolve branch",
            StepId::EnsureRepo => "Ensure repository",
            StepId::EnsureWorktree => "Ensure worktree",
            StepId::GeneratePlan => "Generate plan",
            StepId::LaunchAgent => "Launch agent",
            StepId::RefreshViews => "Refresh views",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The first failing step and why it failed.
#[derive(Error, Debug)]
#[error("{step} failed: {error}")]
pub struct StepFailure {
    pub step: StepId,
    #[source]
    pub error: AgentrixError,
}

pub struct AutomationServices {
    pub git: Arc<dyn GitRepositoryService>,
    pub branch_names: Option<Arc<dyn BranchNameGenerator>>,
    pub plans: Option<Arc<dyn PlanGenerator>>,
    pub launcher: Arc<dyn AgentLauncher>,
    pub events: Arc<dyn RepositoryEvents>,
}

pub struct AutomationRunner {
    services: AutomationServices,
    registry: Arc<SessionRegistry>,
    workdir: PathBuf,
    /// `org/repo` to base branch for new worktrees.
    default_branches: HashMap<String, String>,
}

impl AutomationRunner {
    pub fn new(
        services: AutomationServices,
        registry: Arc<SessionRegistry>,
        workdir: PathBuf,
        default_branches: HashMap<String, String>,
    ) -> Self {
        Self {
            services,
            registry,
            workdir,
            default_branches,
        }
    }

    pub fn workdir(&self) -> &PathBuf {
        &self.workdir
    }

    pub fn services(&self) -> &AutomationServices {
        &self.services
    }

    /// Create a task in `tasks`, run the pipeline against it and record the
    /// outcome on the task.
    pub async fn execute(
        &self,
        tasks: &TaskStore,
        request: &LaunchRequest,
    ) -> (TaskId, Result<AutomationResult, StepFailure>) {
        let mut metadata = Map::new();
        metadata.insert("org".to_string(), Value::from(request.org.as_str()));
        metadata.insert("repo".to_string(), Value::from(request.repo.as_str()));
        metadata.insert("agent".to_string(), Value::from(request.agent.as_str()));
        metadata.insert("plan".to_string(), Value::from(request.plan));
        let title = format!("Launch {} on {}/{}", request.agent, request.org, request.repo);
        let task = tasks.create(TASK_TYPE, &title, metadata);
        let task_id = task.id();
        task.start();

        let outcome = self.run(request, &task).await;
        match &outcome {
            Ok(result) => {
                task.succeed(serde_json::to_value(result).unwrap_or(Value::Null));
                info!(task_id = %task_id, session_id = %result.session_id, "automation task completed");
            }
            Err(failure) => {
                task.fail(Some(failure.step.as_str()), &failure.error.to_string());
                warn!(task_id = %task_id, step = %failure.step, error = %failure.error, "automation task failed");
            }
        }
        (task_id, outcome)
    }

    /// Run every step in order, reporting through `progress`. Stops at the
    /// first failure; earlier side effects are not rolled back.
    pub async fn run(
        &self,
        request: &LaunchRequest,
        progress: &dyn TaskProgress,
    ) -> Result<AutomationResult, StepFailure> {
        let request_id = uuid::Uuid::new_v4().to_string();
        progress.set_metadata("automationRequestId", Value::from(request_id.as_str()));

        if request.plan && self.services.plans.is_none() {
            return Err(fail_unstarted(
                progress,
                StepId::GeneratePlan,
                AgentrixError::ServiceUnavailable("plan generation is not configured".to_string()),
            ));
        }

        let resolved = run_step(progress, StepId::ResolveBranch, self.resolve_branch(request)).await?;
        if let Some(base) = &resolved.default_branch_override {
            progress.log_step(
                StepId::ResolveBranch.as_str(),
                format!("new branches for {}/{} start from {base}", request.org, request.repo),
            );
        }
        progress.complete_step(
            StepId::ResolveBranch.as_str(),
            Some(format!("{} ({})", resolved.branch, resolved.source.as_str())),
        );
        progress.set_metadata("branch", Value::from(resolved.branch.as_str()));

        let identity = SessionIdentity::new(&request.org, &request.repo, &resolved.branch);
        let (_guard, repository) = run_step(progress, StepId::EnsureRepo, async {
            let guard = self.registry.begin_automation(&identity)?;
            if self.registry.live_automation_session(&identity).await.is_some() {
                return Err(AgentrixError::Conflict(format!(
                    "an automation session is already running for {identity}"
                )));
            }
            progress.log_step(
                StepId::EnsureRepo.as_str(),
                format!("checking {}/{} under {}", request.org, request.repo, self.workdir.display()),
            );
            let checkout = self
                .services
                .git
                .ensure_repository_exists(&self.workdir, &request.org, &request.repo)
                .await
                .map_err(AgentrixError::from_service)?;
            Ok::<_, AgentrixError>((guard, checkout))
        })
        .await?;
        progress.log_step(
            StepId::EnsureRepo.as_str(),
            format!(
                "repository at {} (cloned: {})",
                repository.repository_path.display(),
                repository.cloned
            ),
        );
        progress.complete_step(
            StepId::EnsureRepo.as_str(),
            Some(if repository.cloned {
                format!("cloned into {}", repository.repository_path.display())
            } else {
                format!("using {}", repository.repository_path.display())
            }),
        );

        let worktree_options = WorktreeOptions {
            default_branch_override: resolved.default_branch_override.clone(),
        };
        let worktree = run_step(progress, StepId::EnsureWorktree, async {
            progress.log_step(
                StepId::EnsureWorktree.as_str(),
                match &worktree_options.default_branch_override {
                    Some(base) => format!("branch {} (new branches from {base})", resolved.branch),
                    None => format!("branch {} (new branches from HEAD)", resolved.branch),
                },
            );
            self.services
                .git
                .ensure_worktree_exists(
                    &self.workdir,
                    &request.org,
                    &request.repo,
                    &resolved.branch,
                    &worktree_options,
                )
                .await
                .map_err(AgentrixError::from_service)
        })
        .await?;
        progress.log_step(
            StepId::EnsureWorktree.as_str(),
            format!("worktree at {}", worktree.worktree_path.display()),
        );
        progress.complete_step(
            StepId::EnsureWorktree.as_str(),
            Some(if worktree.created {
                format!("created {}", worktree.worktree_path.display())
            } else {
                format!("using {}", worktree.worktree_path.display())
            }),
        );

        let prompt = if request.plan {
            let plan = run_step(progress, StepId::GeneratePlan, async {
                self.generate_plan(&request.prompt, &worktree.worktree_path).await
            })
            .await?;
            progress.complete_step(
                StepId::GeneratePlan.as_str(),
                Some(format!("{} characters", plan.chars().count())),
            );
            plan
        } else {
            progress.ensure_step(StepId::GeneratePlan.as_str(), StepId::GeneratePlan.label());
            progress.skip_step(
                StepId::GeneratePlan.as_str(),
                Some("plan mode disabled".to_string()),
            );
            request.prompt.clone()
        };

        let launch_request = AgentLaunchRequest {
            command: request.command.clone(),
            workdir: worktree.worktree_path.clone(),
            identity: identity.clone(),
            prompt,
        };
        let launch = run_step(progress, StepId::LaunchAgent, async {
            progress.log_step(
                StepId::LaunchAgent.as_str(),
                format!(
                    "running {} in {}",
                    launch_request.command,
                    launch_request.workdir.display()
                ),
            );
            self.services.launcher.launch(&launch_request).await
        })
        .await?;
        progress.log_step(
            StepId::LaunchAgent.as_str(),
            match (&launch.tmux_session_name, launch.pid) {
                (Some(name), _) => format!("attached through tmux session {name}"),
                (None, Some(pid)) => format!("agent pid {pid}"),
                (None, None) => "agent started".to_string(),
            },
        );
        progress.complete_step(
            StepId::LaunchAgent.as_str(),
            Some(format!("session {}", launch.session_id)),
        );

        self.refresh_views(progress).await;

        Ok(AutomationResult {
            org: request.org.clone(),
            repo: request.repo.clone(),
            branch: resolved.branch,
            branch_source: resolved.source.as_str().to_string(),
            plan: request.plan,
            agent: request.agent.clone(),
            automation_request_id: request_id,
            terminal_session_created: launch.created_session,
            session_id: launch.session_id,
            pid: launch.pid,
            using_tmux: launch.using_tmux,
            tmux_session_name: launch.tmux_session_name,
            repository_path: repository.repository_path,
            repository_cloned: repository.cloned,
            worktree_path: worktree.worktree_path,
            worktree_created: worktree.created,
        })
    }

    async fn resolve_branch(&self, request: &LaunchRequest) -> Result<ResolvedBranch, AgentrixError> {
        let default_branch_override = self
            .default_branches
            .get(&format!("{}/{}", request.org, request.repo))
            .cloned();

        if let Some(descriptor) = request.worktree.as_deref() {
            let branch = sanitize_branch_name(descriptor);
            if branch.is_empty() {
                return Err(AgentrixError::BadRequest(format!(
                    "worktree '{descriptor}' does not contain a usable branch name"
                )));
            }
            return Ok(ResolvedBranch {
                branch,
                source: BranchSource::Worktree,
                default_branch_override,
            });
        }

        let Some(generator) = self.services.branch_names.as_ref() else {
            return Err(AgentrixError::ServiceUnavailable(
                "branch name generation is not configured".to_string(),
            ));
        };
        let generated = generator
            .generate_branch_name(&BranchNameRequest {
                prompt: request.prompt.clone(),
                org: request.org.clone(),
                repo: request.repo.clone(),
            })
            .await
            .map_err(|e| AgentrixError::Internal(e.context("branch name generation failed")))?;
        let branch = sanitize_branch_name(&generated);
        if branch.is_empty() {
            return Err(AgentrixError::internal(format!(
                "branch name generator returned an unusable name: {generated:?}"
            )));
        }
        Ok(ResolvedBranch {
            branch,
            source: BranchSource::Generated,
            default_branch_override,
        })
    }

    async fn generate_plan(&self, prompt: &str, cwd: &std::path::Path) -> Result<String, AgentrixError> {
        if prompt.trim().is_empty() {
            return Err(AgentrixError::BadRequest(
                "a prompt is required to generate a plan".to_string(),
            ));
        }
        let Some(plans) = self.services.plans.as_ref() else {
            return Err(AgentrixError::ServiceUnavailable(
                "plan generation is not configured".to_string(),
            ));
        };
        let plan = plans
            .create_plan_text(&PlanRequest {
                prompt: prompt.to_string(),
                cwd: cwd.to_path_buf(),
            })
            .await
            .map_err(|e| AgentrixError::Internal(e.context("plan generation failed")))?;
        if plan.trim().is_empty() {
            return Err(AgentrixError::internal("plan generator returned an empty plan"));
        }
        Ok(plan)
    }

    /// Discovery failures are logged and reported on the step, never raised.
    async fn refresh_views(&self, progress: &dyn TaskProgress) {
        let step = StepId::RefreshViews;
        progress.ensure_step(step.as_str(), step.label());
        progress.start_step(step.as_str());
        match self.services.git.discover_repositories(&self.workdir).await {
            Ok(snapshot) => {
                self.services.events.emit_repos_update(snapshot);
                progress.complete_step(step.as_str(), None);
            }
            Err(e) => {
                warn!(error = %e, "repository discovery failed after launch");
                progress.skip_step(step.as_str(), Some(format!("refresh failed: {e:#}")));
            }
        }
    }
}

/// Declare and start `step`, await `work`, and record a failure. The caller
/// completes the step so it can attach its own message.
async fn run_step<T>(
    progress: &dyn TaskProgress,
    step: StepId,
    work: impl Future<Output = Result<T, AgentrixError>>,
) -> Result<T, StepFailure> {
    progress.ensure_step(step.as_str(), step.label());
    progress.start_step(step.as_str());
    match work.await {
        Ok(value) => Ok(value),
        Err(error) => {
            progress.fail_step(step.as_str(), error.to_string());
            Err(StepFailure { step, error })
        }
    }
}

fn fail_unstarted(progress: &dyn TaskProgress, step: StepId, error: AgentrixError) -> StepFailure {
    progress.ensure_step(step.as_str(), step.label());
    progress.fail_step(step.as_str(), error.to_string());
    StepFailure { step, error }
}
