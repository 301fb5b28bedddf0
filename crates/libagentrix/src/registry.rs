use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use agentrix_protocol::{DEFAULT_COLS, DEFAULT_ROWS, SessionId, SessionIdentity, SessionKind, SpawnMode};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::broker::DEFAULT_WATCHER_QUEUE;
use crate::error::AgentrixError;
use crate::output::DEFAULT_LOG_CAPACITY;
use crate::pty::{self, CommandSpec};
use crate::session::{ProcessSession, SessionConfig};
use crate::tmux;

pub const DEFAULT_READY_DELAY: Duration = Duration::from_millis(400);

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub log_capacity: usize,
    pub ready_delay: Duration,
    pub watcher_queue: usize,
    pub default_mode: SpawnMode,
    pub shell: String,
    pub shell_args: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            log_capacity: DEFAULT_LOG_CAPACITY,
            ready_delay: DEFAULT_READY_DELAY,
            watcher_queue: DEFAULT_WATCHER_QUEUE,
            default_mode: SpawnMode::Auto,
            shell: default_shell(),
            shell_args: vec!["-l".to_string()],
        }
    }
}

pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub kind: SessionKind,
    pub name: Option<String>,
    pub worktree_path: PathBuf,
    /// Falls back to the registry's default mode.
    pub mode: Option<SpawnMode>,
    /// Run this shell command as the session's process instead of an
    /// interactive shell. The session ends when the command does.
    pub command: Option<String>,
    /// Queued as input, but only when a fresh process was created.
    pub initial_input: Vec<String>,
    pub cols: u16,
    pub rows: u16,
}

impl SpawnOptions {
    pub fn new(kind: SessionKind, worktree_path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            name: None,
            worktree_path: worktree_path.into(),
            mode: None,
            command: None,
            initial_input: Vec::new(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CloseOptions {
    /// Also terminate the tmux session behind the pty.
    pub close_remote: bool,
}

pub struct SpawnedSession {
    pub session: Arc<ProcessSession>,
    /// False when an existing session (local or tmux) was reused.
    pub created: bool,
}

/// Marks an identity as having an automation pipeline in flight. Released on
/// drop.
#[derive(Debug)]
pub struct AutomationGuard {
    key: String,
    in_flight: Arc<StdMutex<HashSet<String>>>,
}

impl Drop for AutomationGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.key);
        }
    }
}

/// Owner of every process session, keyed by id.
pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: RwLock<HashMap<SessionId, Arc<ProcessSession>>>,
    in_flight: Arc<StdMutex<HashSet<String>>>,
    /// Held while an identity's default interactive session is looked up
    /// and, if missing, spawned.
    default_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
            default_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Spawn a new process session for `identity`.
    ///
    /// In tmux mode a same-named tmux session is attached to when it already
    /// exists, otherwise it is created first. A session that must run
    /// `options.command` never attaches to an existing tmux session.
    pub async fn spawn(
        &self,
        identity: SessionIdentity,
        options: SpawnOptions,
    ) -> Result<SpawnedSession, AgentrixError> {
        if !options.worktree_path.is_dir() {
            return Err(AgentrixError::ProcessSpawn(format!(
                "working directory does not exist: {}",
                options.worktree_path.display()
            )));
        }
        if options.kind == SessionKind::Automation
            && self.live_automation_session(&identity).await.is_some()
        {
            return Err(AgentrixError::Conflict(format!(
                "an automation session is already running for {identity}"
            )));
        }

        let use_tmux = match options.mode.unwrap_or(self.config.default_mode) {
            SpawnMode::Direct => false,
            SpawnMode::Auto => tmux::is_available().await,
            SpawnMode::Tmux => {
                if !tmux::is_available().await {
                    return Err(AgentrixError::ProcessSpawn(
                        "tmux is not installed or not on PATH".to_string(),
                    ));
                }
                true
            }
        };

        let (mut spec, tmux_session_name, created) = if use_tmux {
            let name = tmux::session_name(&identity, options.kind, options.name.as_deref());
            let existed = tmux::has_session(&name).await?;
            if existed && options.command.is_some() {
                return Err(AgentrixError::Conflict(format!(
                    "tmux session {name} is still running for {identity}"
                )));
            }
            if !existed {
                tmux::new_session(&name, &options.worktree_path, options.command.as_deref())
                    .await?;
            }
            (
                tmux::attach_command(&name, &options.worktree_path),
                Some(name),
                !existed,
            )
        } else {
            let mut spec = CommandSpec::new(self.config.shell.clone(), options.worktree_path.clone())
                .args(self.config.shell_args.iter().cloned());
            if let Some(command) = &options.command {
                spec = spec.args(["-c".to_string(), command.clone()]);
            }
            (spec, None, true)
        };
        spec.cols = options.cols;
        spec.rows = options.rows;

        let (handle, events) = pty::spawn_pty(&spec)?;
        let mut config = SessionConfig::new(
            identity.clone(),
            options.kind,
            options.worktree_path.clone(),
        );
        config.name = options.name.clone();
        config.tmux_session_name = tmux_session_name;
        config.log_capacity = self.config.log_capacity;
        config.watcher_queue = self.config.watcher_queue;

        let session = ProcessSession::new(config, Box::new(handle));
        if created {
            for input in &options.initial_input {
                session.write(input).await?;
            }
        }
        session.start_pump(events);
        session.schedule_ready(self.config.ready_delay);

        info!(
            session_id = %session.id(),
            identity = %identity,
            kind = ?options.kind,
            tmux = session.tmux_session_name().unwrap_or("-"),
            created,
            "session spawned"
        );
        self.insert(Arc::clone(&session)).await;
        Ok(SpawnedSession { session, created })
    }

    /// Resume the identity's default interactive session, or spawn one. A
    /// named request always spawns a new session.
    pub async fn open_interactive(
        &self,
        identity: SessionIdentity,
        mut options: SpawnOptions,
    ) -> Result<SpawnedSession, AgentrixError> {
        options.kind = SessionKind::Interactive;
        if options.name.is_some() {
            return self.spawn(identity, options).await;
        }

        let lock = self.default_lock(&identity)?;
        let _claim = lock.lock().await;
        for session in self.list_by_identity(&identity).await {
            if session.kind() == SessionKind::Interactive
                && session.name().is_none()
                && !session.is_closed().await
            {
                return Ok(SpawnedSession {
                    session,
                    created: false,
                });
            }
        }
        self.spawn(identity, options).await
    }

    fn default_lock(&self, identity: &SessionIdentity) -> Result<Arc<Mutex<()>>, AgentrixError> {
        let mut locks = self
            .default_locks
            .lock()
            .map_err(|_| AgentrixError::internal("default session lock table poisoned"))?;
        Ok(Arc::clone(locks.entry(identity.key()).or_default()))
    }

    /// Track a session created outside [`SessionRegistry::spawn`].
    pub async fn insert(&self, session: Arc<ProcessSession>) {
        self.sessions
            .write()
            .await
            .insert(session.id().clone(), session);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ProcessSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Arc<ProcessSession>, AgentrixError> {
        self.get(id)
            .await
            .ok_or_else(|| AgentrixError::SessionNotFound(id.to_string()))
    }

    /// Sessions for one identity, oldest first.
    pub async fn list_by_identity(&self, identity: &SessionIdentity) -> Vec<Arc<ProcessSession>> {
        let mut found: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.identity() == identity)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.created_at());
        found
    }

    pub async fn list(&self) -> Vec<Arc<ProcessSession>> {
        let mut all: Vec<_> = self.sessions.read().await.values().cloned().collect();
        all.sort_by_key(|s| s.created_at());
        all
    }

    /// Close a session. Closing an already-closed session is a no-op, except
    /// that `close_remote` still makes sure the tmux session is gone.
    pub async fn close(&self, id: &str, options: CloseOptions) -> Result<(), AgentrixError> {
        let session = self.get_by_id(id).await?;
        if options.close_remote
            && let Some(name) = session.tmux_session_name()
            && let Err(e) = tmux::kill_session(name).await
        {
            warn!(session_id = %id, error = %e, "failed to kill tmux session");
        }
        session.close().await;
        Ok(())
    }

    /// Forget sessions that have been closed for at least `older_than`.
    pub async fn prune_closed(&self, older_than: Duration) -> usize {
        let mut expired = Vec::new();
        for session in self.list().await {
            if session
                .closed_for()
                .await
                .is_some_and(|elapsed| elapsed >= older_than)
            {
                expired.push(session.id().clone());
            }
        }
        let mut sessions = self.sessions.write().await;
        for id in &expired {
            sessions.remove(id);
        }
        drop(sessions);
        if let Ok(mut locks) = self.default_locks.lock() {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        expired.len()
    }

    /// Release every local process handle. tmux sessions keep running.
    pub async fn shutdown(&self) {
        for session in self.list().await {
            session.close().await;
        }
    }

    /// Claim the automation slot for `identity`.
    pub fn begin_automation(
        &self,
        identity: &SessionIdentity,
    ) -> Result<AutomationGuard, AgentrixError> {
        let key = identity.key();
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| AgentrixError::internal("automation registry lock poisoned"))?;
        if !set.insert(key.clone()) {
            return Err(AgentrixError::Conflict(format!(
                "an automation request is already in flight for {identity}"
            )));
        }
        Ok(AutomationGuard {
            key,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub async fn live_automation_session(
        &self,
        identity: &SessionIdentity,
    ) -> Option<Arc<ProcessSession>> {
        for session in self.list_by_identity(identity).await {
            if session.kind() == SessionKind::Automation && !session.is_closed().await {
                return Some(session);
            }
        }
        None
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
