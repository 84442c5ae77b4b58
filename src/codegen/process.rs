//! Launching and controlling the external code-generation tool.
//!
//! The executor only sees [`ToolLauncher`] and [`ProcessControl`]: start a
//! process, interrupt it, force-kill it, wait for it. [`TokioLauncher`] is the
//! POSIX implementation (SIGINT via nix, SIGKILL via tokio); sandboxed or
//! remote runners can supply their own.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Everything needed to start the tool.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

/// How the tool process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolExit {
    pub code: Option<i32>,
    /// Terminating signal, when the process was killed by one.
    pub signal: Option<i32>,
}

impl ToolExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ToolExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit status {}", code),
            (None, Some(sig)) => write!(f, "killed by signal {}", sig),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

impl From<std::process::ExitStatus> for ToolExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Control over a running tool process.
pub trait ProcessControl: Send + Sync {
    fn id(&self) -> Option<u32>;

    /// Ask the process to stop (SIGINT on POSIX).
    fn interrupt(&self) -> io::Result<()>;

    /// Stop the process unconditionally.
    fn force_kill(&self);

    fn has_exited(&self) -> bool;
}

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// A started tool: its output streams, a control handle, and a receiver
/// that resolves once the process has exited.
pub struct SpawnedTool {
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
    pub control: Arc<dyn ProcessControl>,
    pub exit: oneshot::Receiver<io::Result<ToolExit>>,
}

#[async_trait]
pub trait ToolLauncher: Send + Sync {
    async fn launch(&self, invocation: &ToolInvocation) -> io::Result<SpawnedTool>;
}

/// Runs the tool as a local child process.
#[derive(Debug, Clone, Default)]
pub struct TokioLauncher;

struct ChildControl {
    pid: Option<u32>,
    kill_tx: mpsc::Sender<()>,
    exited: Arc<AtomicBool>,
}

impl ProcessControl for ChildControl {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    #[cfg(unix)]
    fn interrupt(&self) -> io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if self.has_exited() {
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pid = i32::try_from(pid)
            .map(Pid::from_raw)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        match kill(pid, Signal::SIGINT) {
            Ok(()) => Ok(()),
            // Exited between the check and the signal.
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&self) -> io::Result<()> {
        self.force_kill();
        Ok(())
    }

    fn force_kill(&self) {
        // A full channel means a kill is already pending.
        let _ = self.kill_tx.try_send(());
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolLauncher for TokioLauncher {
    async fn launch(&self, invocation: &ToolInvocation) -> io::Result<SpawnedTool> {
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("tool stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("tool stderr was not captured"))?;
        let pid = child.id();

        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let (exit_tx, exit_rx) = oneshot::channel();
        let exited = Arc::new(AtomicBool::new(false));

        // The supervisor owns the child; controls talk to it over `kill_tx`.
        let exited_flag = exited.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Some(()) = kill_rx.recv() => {
                    debug!(pid, "Force-killing tool process");
                    if let Err(e) = child.start_kill() {
                        warn!(pid, error = %e, "Failed to kill tool process");
                    }
                    child.wait().await
                }
            };
            exited_flag.store(true, Ordering::SeqCst);
            let _ = exit_tx.send(status.map(ToolExit::from));
        });

        Ok(SpawnedTool {
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            control: Arc::new(ChildControl {
                pid,
                kill_tx,
                exited,
            }),
            exit: exit_rx,
        })
    }
}
