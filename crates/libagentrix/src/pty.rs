use std::io::{Read, Write};
use std::path::PathBuf;

use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::AgentrixError;
use crate::session::ExitStatus;

const READ_BUF_BYTES: usize = 8192;
const EVENT_QUEUE: usize = 256;

/// Program, arguments and environment for a pty child.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub unset_env: Vec<String>,
    pub cols: u16,
    pub rows: u16,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            unset_env: Vec::new(),
            cols: agentrix_protocol::DEFAULT_COLS,
            rows: agentrix_protocol::DEFAULT_ROWS,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Events produced by a pty reader thread, in order. `Exited` is always last.
#[derive(Debug)]
pub enum PtyEvent {
    Output(Vec<u8>),
    Exited(ExitStatus),
}

/// The write side of a running process. Implemented by [`PtyHandle`] for real
/// processes; sessions only talk to this trait.
pub trait ProcessHandle: Send {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()>;
    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), AgentrixError>;
    fn kill(&mut self) -> std::io::Result<()>;
    fn pid(&self) -> Option<u32>;
}

pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
}

impl ProcessHandle for PtyHandle {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), AgentrixError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| AgentrixError::Pty(e.to_string()))
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.killer.kill()
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        // The child may already be gone; the reader thread reaps it either way.
        let _ = self.killer.kill();
    }
}

/// Spawn `spec` on a fresh pty. Output and the final exit status arrive on
/// the returned channel from a dedicated reader thread.
pub fn spawn_pty(spec: &CommandSpec) -> Result<(PtyHandle, mpsc::Receiver<PtyEvent>), AgentrixError> {
    if !spec.cwd.is_dir() {
        return Err(AgentrixError::ProcessSpawn(format!(
            "working directory does not exist: {}",
            spec.cwd.display()
        )));
    }

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: spec.rows,
            cols: spec.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| AgentrixError::Pty(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&spec.program);
    cmd.args(&spec.args);
    cmd.cwd(&spec.cwd);
    for key in &spec.unset_env {
        cmd.env_remove(key);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| AgentrixError::ProcessSpawn(format!("{}: {e}", spec.program)))?;
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| AgentrixError::Pty(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| AgentrixError::Pty(e.to_string()))?;
    let killer = child.clone_killer();
    let pid = child.process_id();

    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    std::thread::Builder::new()
        .name("agentrix-pty".to_string())
        .spawn(move || read_until_exit(reader, child, tx))?;

    Ok((
        PtyHandle {
            master: pair.master,
            writer,
            killer,
            pid,
        },
        rx,
    ))
}

fn read_until_exit(
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    tx: mpsc::Sender<PtyEvent>,
) {
    let mut buf = [0u8; READ_BUF_BYTES];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(PtyEvent::Output(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // Linux reports EIO once the last slave fd closes.
            Err(e) => {
                debug!(error = %e, "pty read ended");
                break;
            }
        }
    }

    let status = match child.wait() {
        Ok(status) => match status.signal() {
            Some(signal) => ExitStatus {
                code: None,
                signal: Some(signal.to_string()),
                error: None,
            },
            None => ExitStatus {
                code: i32::try_from(status.exit_code()).ok(),
                signal: None,
                error: None,
            },
        },
        Err(e) => ExitStatus {
            code: None,
            signal: None,
            error: Some(e.to_string()),
        },
    };
    let _ = tx.blocking_send(PtyEvent::Exited(status));
}
