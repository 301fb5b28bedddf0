use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use agentrix_protocol::{ServerMessage, SessionId, SessionIdentity, SessionKind, SessionSummary};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::broker::{DEFAULT_WATCHER_QUEUE, WatcherBroker, WatcherId};
use crate::epoch_ms;
use crate::error::AgentrixError;
use crate::output::{DEFAULT_LOG_CAPACITY, LogBuffer, Utf8Decoder};
use crate::pty::{ProcessHandle, PtyEvent};

/// How a session's process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<String>,
    pub error: Option<String>,
}

impl ExitStatus {
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Exit {
            code: self.code,
            signal: self.signal.clone(),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Spawned; input is queued until the process looks ready.
    Initializing,
    Ready,
    /// A write to the process failed. Output and exit are still recorded.
    Errored,
    Closed,
}

/// Static attributes of a session, fixed at spawn.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub identity: SessionIdentity,
    pub kind: SessionKind,
    pub name: Option<String>,
    pub worktree_path: PathBuf,
    pub tmux_session_name: Option<String>,
    pub log_capacity: usize,
    pub watcher_queue: usize,
}

impl SessionConfig {
    pub fn new(identity: SessionIdentity, kind: SessionKind, worktree_path: PathBuf) -> Self {
        Self {
            identity,
            kind,
            name: None,
            worktree_path,
            tmux_session_name: None,
            log_capacity: DEFAULT_LOG_CAPACITY,
            watcher_queue: DEFAULT_WATCHER_QUEUE,
        }
    }
}

/// A watcher's end of an attachment.
pub struct Attachment {
    /// `None` when the session was already closed; the receiver then yields
    /// `init` and `exit` and ends.
    pub watcher_id: Option<WatcherId>,
    pub rx: mpsc::Receiver<ServerMessage>,
}

struct SessionState {
    phase: SessionPhase,
    log: LogBuffer,
    watchers: WatcherBroker,
    pending_inputs: Vec<String>,
    last_activity: Instant,
    last_activity_at: SystemTime,
    exit: Option<ExitStatus>,
    closed_at: Option<Instant>,
    process: Option<Box<dyn ProcessHandle>>,
}

impl SessionState {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = SystemTime::now();
    }

    fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }

    fn write_to_process(&mut self, data: &str) -> Result<(), AgentrixError> {
        let Some(process) = self.process.as_mut() else {
            return Err(AgentrixError::Pty("process handle released".to_string()));
        };
        if let Err(e) = process.write_all(data.as_bytes()) {
            self.phase = SessionPhase::Errored;
            return Err(AgentrixError::Pty(format!("write failed: {e}")));
        }
        Ok(())
    }

    /// Flush queued input in arrival order and discard the queue.
    fn become_ready(&mut self, session_id: &str) {
        if self.phase != SessionPhase::Initializing {
            return;
        }
        self.phase = SessionPhase::Ready;
        let pending = std::mem::take(&mut self.pending_inputs);
        if !pending.is_empty() {
            debug!(session_id, count = pending.len(), "flushing queued input");
        }
        for input in pending {
            if let Err(e) = self.write_to_process(&input) {
                warn!(session_id, error = %e, "dropping queued input");
                break;
            }
        }
    }

    fn finish(&mut self, status: ExitStatus) -> Option<Box<dyn ProcessHandle>> {
        self.phase = SessionPhase::Closed;
        self.closed_at = Some(Instant::now());
        self.pending_inputs.clear();
        self.watchers.close_all(&status.to_message());
        self.exit = Some(status);
        self.process.take()
    }
}

/// One spawned terminal process, its scrollback and its watchers.
pub struct ProcessSession {
    id: SessionId,
    config: SessionConfig,
    created_at: SystemTime,
    pid: Option<u32>,
    state: Mutex<SessionState>,
}

impl ProcessSession {
    pub fn new(config: SessionConfig, process: Box<dyn ProcessHandle>) -> Arc<Self> {
        let now = Instant::now();
        let pid = process.pid();
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: SystemTime::now(),
            pid,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Initializing,
                log: LogBuffer::new(config.log_capacity),
                watchers: WatcherBroker::new(),
                pending_inputs: Vec::new(),
                last_activity: now,
                last_activity_at: SystemTime::now(),
                exit: None,
                closed_at: None,
                process: Some(process),
            }),
            config,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.config.identity
    }

    pub fn kind(&self) -> SessionKind {
        self.config.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    pub fn worktree_path(&self) -> &Path {
        &self.config.worktree_path
    }

    pub fn tmux_session_name(&self) -> Option<&str> {
        self.config.tmux_session_name.as_deref()
    }

    pub fn using_tmux(&self) -> bool {
        self.config.tmux_session_name.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Feed pty events into the session until the process exits.
    pub fn start_pump(self: &Arc<Self>, mut events: mpsc::Receiver<PtyEvent>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut decoder = Utf8Decoder::default();
            while let Some(event) = events.recv().await {
                match event {
                    PtyEvent::Output(bytes) => {
                        let chunk = decoder.decode(&bytes);
                        session.record_output(&chunk).await;
                    }
                    PtyEvent::Exited(status) => {
                        let tail = decoder.finish();
                        session.record_output(&tail).await;
                        session.record_exit(status).await;
                        return;
                    }
                }
            }
            session
                .record_exit(ExitStatus {
                    error: Some("pty reader stopped".to_string()),
                    ..ExitStatus::default()
                })
                .await;
        });
    }

    /// Mark the session ready after `delay` unless output arrives first.
    pub fn schedule_ready(self: &Arc<Self>, delay: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(session) = weak.upgrade() {
                session.mark_ready().await;
            }
        });
    }

    pub async fn mark_ready(&self) {
        let mut state = self.state.lock().await;
        state.become_ready(&self.id);
    }

    /// Send input to the process, or queue it while the session initializes.
    pub async fn write(&self, data: &str) -> Result<(), AgentrixError> {
        let mut state = self.state.lock().await;
        match state.phase {
            SessionPhase::Closed => Err(AgentrixError::SessionClosed(self.id.clone())),
            SessionPhase::Errored => Err(AgentrixError::Pty(format!(
                "session {} is in an error state",
                self.id
            ))),
            SessionPhase::Initializing => {
                state.pending_inputs.push(data.to_string());
                state.touch();
                Ok(())
            }
            SessionPhase::Ready => {
                state.touch();
                state.write_to_process(data)
            }
        }
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), AgentrixError> {
        let mut state = self.state.lock().await;
        if state.is_closed() {
            return Err(AgentrixError::SessionClosed(self.id.clone()));
        }
        match state.process.as_mut() {
            Some(process) => process.resize(cols, rows),
            None => Err(AgentrixError::SessionClosed(self.id.clone())),
        }
    }

    /// Append a chunk to the log and fan it out. The first chunk also marks
    /// the session ready.
    pub async fn record_output(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        if state.is_closed() {
            return;
        }
        state.log.push(chunk);
        state.touch();
        state.watchers.broadcast(&ServerMessage::Output {
            chunk: chunk.to_string(),
            reset: false,
        });
        state.become_ready(&self.id);
    }

    /// Record process exit. Returns false if the session was already closed.
    pub async fn record_exit(&self, status: ExitStatus) -> bool {
        let released = {
            let mut state = self.state.lock().await;
            if state.is_closed() {
                return false;
            }
            info!(
                session_id = %self.id,
                code = ?status.code,
                signal = ?status.signal,
                "session exited"
            );
            state.finish(status)
        };
        drop(released);
        true
    }

    /// Close the session locally: kill the process this server holds and
    /// notify watchers. Idempotent.
    pub async fn close(&self) -> bool {
        let released = {
            let mut state = self.state.lock().await;
            if state.is_closed() {
                return false;
            }
            let mut process = state.finish(ExitStatus::default());
            if let Some(process) = process.as_mut()
                && let Err(e) = process.kill()
            {
                debug!(session_id = %self.id, error = %e, "kill after close");
            }
            process
        };
        drop(released);
        info!(session_id = %self.id, "session closed");
        true
    }

    /// Open a watcher queue. It starts with `init`, then either live
    /// `output` messages or, for a closed session, a single `exit`.
    pub async fn attach(&self) -> Attachment {
        let (tx, rx) = mpsc::channel(self.config.watcher_queue.max(2));
        let mut state = self.state.lock().await;
        let closed = state.is_closed();
        let _ = tx.try_send(ServerMessage::Init {
            log: state.log.snapshot(),
            closed,
        });
        if closed {
            let status = state.exit.clone().unwrap_or_default();
            let _ = tx.try_send(status.to_message());
            return Attachment {
                watcher_id: None,
                rx,
            };
        }
        let watcher_id = state.watchers.register(tx);
        debug!(session_id = %self.id, watcher_id, "watcher attached");
        Attachment {
            watcher_id: Some(watcher_id),
            rx,
        }
    }

    pub async fn detach(&self, watcher_id: WatcherId) {
        let mut state = self.state.lock().await;
        if state.watchers.remove(watcher_id) {
            debug!(session_id = %self.id, watcher_id, "watcher detached");
        }
    }

    /// Replay the whole log to every watcher with `reset` set.
    pub async fn refresh(&self) {
        let mut state = self.state.lock().await;
        if state.is_closed() {
            return;
        }
        let chunk = state.log.snapshot();
        state.watchers.broadcast(&ServerMessage::Output { chunk, reset: true });
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.is_closed()
    }

    /// Idle means open with no input or output for at least `threshold`.
    pub async fn is_idle(&self, threshold: Duration) -> bool {
        let state = self.state.lock().await;
        !state.is_closed() && state.last_activity.elapsed() >= threshold
    }

    pub async fn log_snapshot(&self) -> String {
        self.state.lock().await.log.snapshot()
    }

    pub async fn log_len(&self) -> usize {
        self.state.lock().await.log.retained()
    }

    pub async fn pending_input_count(&self) -> usize {
        self.state.lock().await.pending_inputs.len()
    }

    pub async fn watcher_count(&self) -> usize {
        self.state.lock().await.watchers.len()
    }

    pub async fn exit_status(&self) -> Option<ExitStatus> {
        self.state.lock().await.exit.clone()
    }

    /// How long ago the session closed, if it has.
    pub async fn closed_for(&self) -> Option<Duration> {
        self.state.lock().await.closed_at.map(|at| at.elapsed())
    }

    pub async fn summary(&self, idle_threshold: Duration) -> SessionSummary {
        let state = self.state.lock().await;
        let closed = state.is_closed();
        SessionSummary {
            id: self.id.clone(),
            key: self.config.identity.key(),
            org: self.config.identity.org.clone(),
            repo: self.config.identity.repo.clone(),
            branch: self.config.identity.branch.clone(),
            kind: self.config.kind,
            name: self.config.name.clone(),
            worktree_path: self.config.worktree_path.clone(),
            using_tmux: self.using_tmux(),
            tmux_session_name: self.config.tmux_session_name.clone(),
            pid: self.pid,
            ready: state.phase == SessionPhase::Ready,
            closed,
            idle: !closed && state.last_activity.elapsed() >= idle_threshold,
            exit_code: state.exit.as_ref().and_then(|e| e.code),
            created_at_epoch_ms: epoch_ms(self.created_at),
            last_activity_epoch_ms: epoch_ms(state.last_activity_at),
            log_bytes: state.log.retained(),
            log_evicted_bytes: state.log.evicted(),
        }
    }
}
