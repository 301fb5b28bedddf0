use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agentrix_protocol::SpawnMode;
use anyhow::{Context, Result, bail};
use clap::Parser;
use libagentrix::RegistryConfig;
use libagentrix::registry::default_shell;
use libagentrix::validation::AgentCommands;
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 4567;
pub const DEFAULT_RATE_LIMIT_ATTEMPTS: u32 = 10;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
pub const DEFAULT_IDLE_THRESHOLD_SECS: u64 = 90;
pub const DEFAULT_CLOSED_RETENTION_SECS: u64 = 300;
pub const DEFAULT_TASK_RETENTION_SECS: u64 = 3600;

pub const API_KEY_ENV: &str = "AGENTRIX_API_KEY";
pub const SESSION_TOKEN_ENV: &str = "AGENTRIX_SESSION_TOKEN";
pub const GITHUB_TOKEN_ENV: &str = "AGENTRIX_GITHUB_TOKEN";

#[derive(Parser, Debug, Clone)]
#[command(name = "agentrix", version, about = "agentrix session & automation server")]
pub struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Root directory holding `<org>/<repo>` checkouts.
    #[arg(long, default_value = ".")]
    pub workdir: PathBuf,

    /// TOML config file. Defaults to the user config path when it exists.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// CORS origin allowed to call the API (repeatable, `*` for any).
    #[arg(long = "allow-origin")]
    pub allow_origins: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub automation: AutomationSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub git: GitSection,
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub repositories: BTreeMap<String, RepositorySection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutomationSection {
    pub api_key: Option<String>,
    pub rate_limit_max_attempts: Option<u32>,
    pub rate_limit_window_secs: Option<u64>,
    /// Extra or overridden agent identifiers.
    #[serde(default)]
    pub agent_commands: BTreeMap<String, String>,
    /// Command that prints a branch name for the prompt on stdin.
    pub branch_name_command: Option<String>,
    /// Command that prints a plan for the prompt on stdin.
    pub plan_command: Option<String>,
    pub task_retention_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionsSection {
    pub log_capacity: Option<usize>,
    pub ready_delay_ms: Option<u64>,
    pub idle_threshold_secs: Option<u64>,
    pub mode: Option<SpawnMode>,
    pub shell: Option<String>,
    pub shell_args: Option<Vec<String>>,
    #[serde(default)]
    pub tokens: Vec<String>,
    pub closed_retention_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitSection {
    pub clone_url_template: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitHubSection {
    /// Enables the issue and pull request views.
    pub token: Option<String>,
    pub api_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositorySection {
    pub default_branch: Option<String>,
}

/// Fully resolved settings the server runs with.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: SocketAddr,
    pub workdir: PathBuf,
    pub allow_origins: Vec<String>,
    pub api_key: Option<String>,
    pub rate_limit_max_attempts: u32,
    pub rate_limit_window: Duration,
    pub agent_commands: AgentCommands,
    pub branch_name_command: Option<String>,
    pub plan_command: Option<String>,
    pub task_retention: Duration,
    pub registry: RegistryConfig,
    pub idle_threshold: Duration,
    pub session_tokens: Vec<String>,
    pub closed_retention: Duration,
    pub clone_url_template: String,
    pub github_token: Option<String>,
    pub github_api_url: String,
    /// `org/repo` to base branch for new worktrees.
    pub default_branches: HashMap<String, String>,
}

impl RuntimeConfig {
    pub fn load(args: &Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => read_file_config(path)?,
            None => {
                let default_path = agentrix_protocol::paths::config_path();
                if default_path.exists() {
                    read_file_config(&default_path)?
                } else {
                    FileConfig::default()
                }
            }
        };
        Self::resolve(args, file, |key| std::env::var(key).ok())
    }

    /// Merge CLI arguments, file settings and environment overrides, in that
    /// order of precedence for the fields each one can set.
    pub fn resolve(
        args: &Args,
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let listen: SocketAddr = format!("{}:{}", args.host, args.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", args.host, args.port))?;

        let workdir = if args.workdir.is_absolute() {
            args.workdir.clone()
        } else {
            std::env::current_dir()
                .context("failed to read current directory")?
                .join(&args.workdir)
        };

        let automation = file.automation;
        let api_key = env(API_KEY_ENV)
            .or(automation.api_key)
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        let mut agent_commands = AgentCommands::default();
        agent_commands.extend(automation.agent_commands);

        let rate_limit_max_attempts = automation
            .rate_limit_max_attempts
            .unwrap_or(DEFAULT_RATE_LIMIT_ATTEMPTS);
        if rate_limit_max_attempts == 0 {
            bail!("automation.rate_limit_max_attempts must be > 0");
        }

        let sessions = file.sessions;
        let defaults = RegistryConfig::default();
        let registry = RegistryConfig {
            log_capacity: sessions.log_capacity.unwrap_or(defaults.log_capacity),
            ready_delay: sessions
                .ready_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.ready_delay),
            watcher_queue: defaults.watcher_queue,
            default_mode: sessions.mode.unwrap_or(defaults.default_mode),
            shell: sessions.shell.unwrap_or_else(default_shell),
            shell_args: sessions.shell_args.unwrap_or(defaults.shell_args),
        };
        if registry.log_capacity == 0 {
            bail!("sessions.log_capacity must be > 0");
        }

        let mut session_tokens: Vec<String> = sessions
            .tokens
            .into_iter()
            .filter(|t| !t.trim().is_empty())
            .collect();
        if let Some(token) = env(SESSION_TOKEN_ENV).filter(|t| !t.trim().is_empty()) {
            session_tokens.push(token);
        }

        let default_branches = file
            .repositories
            .into_iter()
            .filter_map(|(key, section)| section.default_branch.map(|b| (key, b)))
            .collect();

        Ok(Self {
            listen,
            workdir,
            allow_origins: args.allow_origins.clone(),
            api_key,
            rate_limit_max_attempts,
            rate_limit_window: Duration::from_secs(
                automation
                    .rate_limit_window_secs
                    .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECS),
            ),
            agent_commands,
            branch_name_command: non_blank(automation.branch_name_command),
            plan_command: non_blank(automation.plan_command),
            task_retention: Duration::from_secs(
                automation
                    .task_retention_secs
                    .unwrap_or(DEFAULT_TASK_RETENTION_SECS),
            ),
            registry,
            idle_threshold: Duration::from_secs(
                sessions
                    .idle_threshold_secs
                    .unwrap_or(DEFAULT_IDLE_THRESHOLD_SECS),
            ),
            session_tokens,
            closed_retention: Duration::from_secs(
                sessions
                    .closed_retention_secs
                    .unwrap_or(DEFAULT_CLOSED_RETENTION_SECS),
            ),
            clone_url_template: file
                .git
                .clone_url_template
                .unwrap_or_else(|| agentrix_git::DEFAULT_CLONE_URL_TEMPLATE.to_string()),
            github_token: non_blank(env(GITHUB_TOKEN_ENV).or(file.github.token)),
            github_api_url: file
                .github
                .api_url
                .unwrap_or_else(|| crate::github::DEFAULT_API_URL.to_string()),
            default_branches,
        })
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str::<FileConfig>(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Args {
        Args::parse_from(["agentrix", "--workdir", "/srv/work"])
    }

    #[test]
    fn defaults_without_file_or_env() {
        let cfg = RuntimeConfig::resolve(&args(), FileConfig::default(), |_| None).expect("config");
        assert_eq!(cfg.listen.port(), DEFAULT_PORT);
        assert_eq!(cfg.workdir, PathBuf::from("/srv/work"));
        assert_eq!(cfg.api_key, None);
        assert_eq!(cfg.rate_limit_max_attempts, 10);
        assert_eq!(cfg.rate_limit_window, Duration::from_secs(60));
        assert_eq!(cfg.agent_commands.get("cursor"), Some("cursor-agent"));
        assert!(cfg.session_tokens.is_empty());
        assert_eq!(cfg.registry.default_mode, SpawnMode::Auto);
        assert_eq!(cfg.github_token, None);
        assert_eq!(cfg.github_api_url, "https://api.github.com");
    }

    #[test]
    fn file_sections_are_applied() {
        let file: FileConfig = toml::from_str(
            r#"
            [automation]
            api_key = "from-file"
            rate_limit_max_attempts = 3
            plan_command = "plan-cli"
            [automation.agent_commands]
            aider = "aider --yes"

            [sessions]
            mode = "direct"
            ready_delay_ms = 100
            tokens = ["t1"]

            [git]
            clone_url_template = "git@example.com:{org}/{repo}.git"

            [repositories."acme/app"]
            default_branch = "develop"
            "#,
        )
        .expect("parse");
        let cfg = RuntimeConfig::resolve(&args(), file, |_| None).expect("config");
        assert_eq!(cfg.api_key.as_deref(), Some("from-file"));
        assert_eq!(cfg.rate_limit_max_attempts, 3);
        assert_eq!(cfg.plan_command.as_deref(), Some("plan-cli"));
        assert_eq!(cfg.branch_name_command, None);
        assert_eq!(cfg.agent_commands.get("aider"), Some("aider --yes"));
        assert_eq!(cfg.agent_commands.get("codex"), Some("codex"));
        assert_eq!(cfg.registry.default_mode, SpawnMode::Direct);
        assert_eq!(cfg.registry.ready_delay, Duration::from_millis(100));
        assert_eq!(cfg.session_tokens, vec!["t1".to_string()]);
        assert_eq!(cfg.clone_url_template, "git@example.com:{org}/{repo}.git");
        assert_eq!(cfg.default_branches.get("acme/app").map(String::as_str), Some("develop"));
    }

    #[test]
    fn env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            [automation]
            api_key = "from-file"
            "#,
        )
        .expect("parse");
        let cfg = RuntimeConfig::resolve(&args(), file, |key| match key {
            API_KEY_ENV => Some("from-env".to_string()),
            SESSION_TOKEN_ENV => Some("tok".to_string()),
            GITHUB_TOKEN_ENV => Some("gh-env".to_string()),
            _ => None,
        })
        .expect("config");
        assert_eq!(cfg.api_key.as_deref(), Some("from-env"));
        assert_eq!(cfg.session_tokens, vec!["tok".to_string()]);
        assert_eq!(cfg.github_token.as_deref(), Some("gh-env"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<FileConfig>("[sessions]\nlog_capactiy = 5\n").is_err());
    }

    #[test]
    fn invalid_host_is_an_error() {
        let args = Args::parse_from(["agentrix", "--host", "not a host"]);
        assert!(RuntimeConfig::resolve(&args, FileConfig::default(), |_| None).is_err());
    }
}
