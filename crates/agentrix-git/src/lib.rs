//! Repository and worktree management on disk.
//!
//! Layout under a workdir:
//!
//! ```text
//! <workdir>/<org>/<repo>/repository      primary clone
//! <workdir>/<org>/<repo>/<branch_dir>    one worktree per branch ('/' -> '%2F')
//! <workdir>/<org>/<repo>/.agentrix-init  optional init command
//! ```

use std::path::{Path, PathBuf};

use agentrix_protocol::paths::{branch_dir_name, branch_from_dir_name};
use agentrix_protocol::{RepositoryEntry, RepositorySnapshot};
use anyhow::Context;
use async_trait::async_trait;
use git2::{BranchType, Repository, WorktreeAddOptions, WorktreePruneOptions, build::RepoBuilder};
use libagentrix::AgentrixError;
use libagentrix::automation::{
    GitRepositoryService, RepositoryCheckout, WorktreeCheckout, WorktreeOptions,
};
use thiserror::Error;
use tracing::{debug, info};

pub const REPOSITORY_DIR: &str = "repository";
pub const INIT_COMMAND_FILE: &str = ".agentrix-init";
pub const DEFAULT_CLONE_URL_TEMPLATE: &str = "https://github.com/{org}/{repo}.git";

#[derive(Error, Debug)]
pub enum GitError {
    #[error("invalid {what} '{value}'")]
    InvalidName { what: &'static str, value: String },

    #[error("base branch '{0}' not found locally or on origin")]
    BaseBranchNotFound(String),

    #[error("{0} exists but is not a directory")]
    NotADirectory(PathBuf),

    #[error("branch '{0}' would share a directory with the primary clone")]
    ReservedBranch(String),

    #[error("{} is checked out on {found}, not '{expected}'", path.display())]
    BranchMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn repository_path(workdir: &Path, org: &str, repo: &str) -> PathBuf {
    workdir.join(org).join(repo).join(REPOSITORY_DIR)
}

pub fn worktree_path(workdir: &Path, org: &str, repo: &str, branch: &str) -> PathBuf {
    workdir.join(org).join(repo).join(branch_dir_name(branch))
}

/// Expand `{org}` and `{repo}` in a clone URL template.
pub fn clone_url(template: &str, org: &str, repo: &str) -> String {
    template.replace("{org}", org).replace("{repo}", repo)
}

fn check_component(what: &'static str, value: &str) -> Result<(), GitError> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.starts_with('.')
        || value.contains(['/', '\\', '\0']);
    if bad {
        return Err(GitError::InvalidName {
            what,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Clone `org/repo` into its primary location unless a repository is already
/// there. Returns the path and whether a clone happened.
pub fn ensure_repository(
    workdir: &Path,
    org: &str,
    repo: &str,
    url_template: &str,
) -> Result<(PathBuf, bool), GitError> {
    check_component("organization", org)?;
    check_component("repository", repo)?;
    let path = repository_path(workdir, org, repo);
    if path.exists() {
        if !path.is_dir() {
            return Err(GitError::NotADirectory(path));
        }
        Repository::open(&path)?;
        return Ok((path, false));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let url = clone_url(url_template, org, repo);
    info!(url = %url, path = %path.display(), "cloning repository");
    RepoBuilder::new().clone(&url, &path)?;
    Ok((path, true))
}

/// Make sure `branch` has a worktree. A new local branch starts from
/// `base` (remote-tracking first, then local) or from the clone's HEAD.
pub fn ensure_worktree(
    workdir: &Path,
    org: &str,
    repo: &str,
    branch: &str,
    base: Option<&str>,
) -> Result<(PathBuf, bool), GitError> {
    check_branch(branch)?;
    let path = worktree_path(workdir, org, repo, branch);
    if path.exists() {
        if !path.is_dir() {
            return Err(GitError::NotADirectory(path));
        }
        let found = checked_out_branch(&path);
        if found.as_deref() != Some(branch) {
            return Err(GitError::BranchMismatch {
                path,
                expected: branch.to_string(),
                found: found.map_or_else(|| "no branch".to_string(), |b| format!("'{b}'")),
            });
        }
        return Ok((path, false));
    }

    let repository = Repository::open(repository_path(workdir, org, repo))?;
    let name = branch_dir_name(branch);
    prune_stale_worktree(&repository, &name)?;

    let branch_ref = ensure_local_branch(&repository, branch, base)?;
    let mut opts = WorktreeAddOptions::new();
    opts.reference(Some(&branch_ref));
    repository.worktree(&name, &path, Some(&opts))?;
    info!(branch, path = %path.display(), "worktree created");
    Ok((path, true))
}

fn check_branch(branch: &str) -> Result<(), GitError> {
    if branch.trim().is_empty() || branch.starts_with('.') {
        return Err(GitError::InvalidName {
            what: "branch",
            value: branch.to_string(),
        });
    }
    if is_reserved_branch(branch) {
        return Err(GitError::ReservedBranch(branch.to_string()));
    }
    Ok(())
}

/// The primary clone's directory name can never be a worktree. Compared
/// case-insensitively for case-folding filesystems.
fn is_reserved_branch(branch: &str) -> bool {
    branch_dir_name(branch).eq_ignore_ascii_case(REPOSITORY_DIR)
}

/// Local branch HEAD points at in the checkout at `dir`.
fn checked_out_branch(dir: &Path) -> Option<String> {
    let repo = Repository::open(dir).ok()?;
    let head = repo.head().ok()?;
    if !head.is_branch() {
        return None;
    }
    head.shorthand().map(ToOwned::to_owned)
}

/// A worktree registered under `name` whose directory was deleted blocks a
/// new one with the same name.
fn prune_stale_worktree(repo: &Repository, name: &str) -> Result<(), GitError> {
    if let Ok(existing) = repo.find_worktree(name)
        && existing.validate().is_err()
    {
        debug!(worktree = name, "pruning stale worktree entry");
        let mut opts = WorktreePruneOptions::new();
        opts.valid(false).working_tree(false);
        existing.prune(Some(&mut opts))?;
    }
    Ok(())
}

fn ensure_local_branch<'repo>(
    repo: &'repo Repository,
    branch: &str,
    base: Option<&str>,
) -> Result<git2::Reference<'repo>, GitError> {
    if let Ok(existing) = repo.find_branch(branch, BranchType::Local) {
        return Ok(existing.into_reference());
    }

    // A branch that only exists on origin is checked out from there.
    let start = if let Ok(remote) = repo.find_branch(&format!("origin/{branch}"), BranchType::Remote)
    {
        remote.get().peel_to_commit()?
    } else if let Some(base) = base {
        resolve_base(repo, base)?
    } else {
        repo.head()?.peel_to_commit()?
    };
    let created = repo.branch(branch, &start, false)?;
    Ok(created.into_reference())
}

fn resolve_base<'repo>(repo: &'repo Repository, base: &str) -> Result<git2::Commit<'repo>, GitError> {
    if let Ok(remote) = repo.find_branch(&format!("origin/{base}"), BranchType::Remote) {
        return Ok(remote.get().peel_to_commit()?);
    }
    if let Ok(local) = repo.find_branch(base, BranchType::Local) {
        return Ok(local.get().peel_to_commit()?);
    }
    Err(GitError::BaseBranchNotFound(base.to_string()))
}

/// Existing worktree directory for `branch`, if any.
pub fn find_worktree(workdir: &Path, org: &str, repo: &str, branch: &str) -> Option<PathBuf> {
    check_component("org", org).ok()?;
    check_component("repo", repo).ok()?;
    if branch.is_empty()
        || is_reserved_branch(branch)
        || branch.split('/').any(|part| part.is_empty() || part == "..")
    {
        return None;
    }
    let path = worktree_path(workdir, org, repo, branch);
    path.is_dir().then_some(path)
}

/// Command queued into fresh terminals for `org/repo`, from its
/// `.agentrix-init` file.
pub fn init_command(workdir: &Path, org: &str, repo: &str) -> Option<String> {
    check_component("org", org).ok()?;
    check_component("repo", repo).ok()?;
    read_init_command(&workdir.join(org).join(repo))
}

fn read_init_command(repo_dir: &Path) -> Option<String> {
    std::fs::read_to_string(repo_dir.join(INIT_COMMAND_FILE))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Scan `workdir` for cloned repositories and their worktrees. A missing
/// workdir is an empty snapshot.
pub fn discover(workdir: &Path) -> Result<RepositorySnapshot, GitError> {
    let mut snapshot = RepositorySnapshot::new();
    if !workdir.is_dir() {
        return Ok(snapshot);
    }

    for org_dir in visible_dirs(workdir)? {
        let mut repos = std::collections::BTreeMap::new();
        for repo_dir in visible_dirs(&org_dir)? {
            if !repo_dir.join(REPOSITORY_DIR).is_dir() {
                continue;
            }
            let mut branches = Vec::new();
            for entry in visible_dirs(&repo_dir)? {
                if entry.file_name().is_some_and(|n| n == REPOSITORY_DIR) {
                    continue;
                }
                if let Some(branch) = worktree_branch(&entry) {
                    branches.push(branch);
                }
            }
            branches.sort();
            let init_command = read_init_command(&repo_dir);
            repos.insert(
                file_name(&repo_dir),
                RepositoryEntry {
                    branches,
                    init_command,
                },
            );
        }
        if !repos.is_empty() {
            snapshot.insert(file_name(&org_dir), repos);
        }
    }
    Ok(snapshot)
}

/// Branch checked out in a worktree directory. Falls back to the decoded
/// directory name when HEAD is detached or unreadable.
fn worktree_branch(dir: &Path) -> Option<String> {
    if !dir.join(".git").exists() {
        return None;
    }
    checked_out_branch(dir).or_else(|| branch_from_dir_name(&file_name(dir)))
}

fn visible_dirs(dir: &Path) -> Result<Vec<PathBuf>, GitError> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type()?.is_dir() {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// [`GitRepositoryService`] over libgit2. Every call runs on the blocking
/// pool.
#[derive(Debug, Clone)]
pub struct GitRepositories {
    clone_url_template: String,
}

impl GitRepositories {
    pub fn new(clone_url_template: impl Into<String>) -> Self {
        Self {
            clone_url_template: clone_url_template.into(),
        }
    }
}

impl Default for GitRepositories {
    fn default() -> Self {
        Self::new(DEFAULT_CLONE_URL_TEMPLATE)
    }
}

async fn blocking<T, F>(what: &'static str, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, GitError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .with_context(|| format!("{what} task panicked"))?
        .map_err(|e| service_error(what, e))
}

/// Caller mistakes and on-disk conflicts keep their meaning across the
/// service boundary. Everything else is an internal failure.
fn service_error(what: &'static str, error: GitError) -> anyhow::Error {
    match error {
        GitError::InvalidName { .. } | GitError::ReservedBranch(_) => {
            AgentrixError::BadRequest(error.to_string()).into()
        }
        GitError::BranchMismatch { .. } => AgentrixError::Conflict(error.to_string()).into(),
        other => anyhow::Error::new(other).context(what),
    }
}

#[async_trait]
impl GitRepositoryService for GitRepositories {
    async fn ensure_repository_exists(
        &self,
        workdir: &Path,
        org: &str,
        repo: &str,
    ) -> anyhow::Result<RepositoryCheckout> {
        let (workdir, org, repo) = (workdir.to_path_buf(), org.to_string(), repo.to_string());
        let template = self.clone_url_template.clone();
        let (repository_path, cloned) = blocking("ensure repository", move || {
            ensure_repository(&workdir, &org, &repo, &template)
        })
        .await?;
        Ok(RepositoryCheckout {
            repository_path,
            cloned,
        })
    }

    async fn ensure_worktree_exists(
        &self,
        workdir: &Path,
        org: &str,
        repo: &str,
        branch: &str,
        options: &WorktreeOptions,
    ) -> anyhow::Result<WorktreeCheckout> {
        let (workdir, org, repo, branch) = (
            workdir.to_path_buf(),
            org.to_string(),
            repo.to_string(),
            branch.to_string(),
        );
        let base = options.default_branch_override.clone();
        let (worktree_path, created) = blocking("ensure worktree", move || {
            ensure_worktree(&workdir, &org, &repo, &branch, base.as_deref())
        })
        .await?;
        Ok(WorktreeCheckout {
            worktree_path,
            created,
        })
    }

    async fn discover_repositories(&self, workdir: &Path) -> anyhow::Result<RepositorySnapshot> {
        let workdir = workdir.to_path_buf();
        blocking("discover repositories", move || discover(&workdir)).await
    }

    async fn locate_worktree(
        &self,
        workdir: &Path,
        org: &str,
        repo: &str,
        branch: &str,
    ) -> Option<PathBuf> {
        find_worktree(workdir, org, repo, branch)
    }
}
