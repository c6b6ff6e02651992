//! Encoder process lifecycle.
//!
//! A [`ProcessHandle`] owns one encoder invocation, either a single command or
//! a primary process piped into a secondary one. The child processes
//! themselves are moved into a waiter task; the handle keeps pids, a shared
//! liveness flag, and a cancellation token, so every control operation is
//! synchronous and safe to call at any time.
//!
//! For a piped pair, liveness follows the secondary process: once it exits
//! the handle reports dead, and the primary is reaped (or killed) by the
//! waiter afterwards.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

use crate::error::{Error, Result};

/// How long a kill is given to take effect before we give up waiting.
const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the primary may outlive the secondary before it is killed.
const PRIMARY_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// A running encoder invocation.
pub struct ProcessHandle {
    primary_pid: Option<u32>,
    secondary_pid: Option<u32>,
    alive: Arc<AtomicBool>,
    exit: Arc<Mutex<Option<ExitStatus>>>,
    terminate_token: CancellationToken,
    waiter: JoinHandle<()>,
    // Held open, never written: the encoder must not see EOF on stdin.
    _stdin: Option<tokio::process::ChildStdin>,
    _primary_stderr: Option<tokio::process::ChildStderr>,
}

impl ProcessHandle {
    /// Start a single command.
    ///
    /// With `shell_mode` the line goes through the platform shell, otherwise
    /// it is token-split and executed directly. `stdout`/`stderr` are usually
    /// the step's mirror files. Launch failures (missing executable, bad
    /// working directory) surface here, synchronously.
    pub fn launch(
        command_line: &str,
        work_dir: Option<&Path>,
        shell_mode: bool,
        stdout: Stdio,
        stderr: Stdio,
    ) -> Result<Self> {
        let mut command = if shell_mode {
            process_utils::tokio_shell_command(command_line)
        } else {
            let args = process_utils::split_command_line(command_line)
                .map_err(|e| Error::launch(format!("Invalid command: {e}")))?;
            let (program, rest) = args
                .split_first()
                .ok_or_else(|| Error::launch("Command is empty"))?;
            let mut command = process_utils::tokio_command(program);
            command.args(rest);
            command
        };
        command
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        if let Some(dir) = work_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::launch(format!("Failed to start encoder: {e}")))?;
        info!(pid = ?child.id(), "Encoder started");

        let stdin = child.stdin.take();
        let primary_pid = child.id();
        let alive = Arc::new(AtomicBool::new(true));
        let exit = Arc::new(Mutex::new(None));
        let terminate_token = CancellationToken::new();
        let waiter = spawn_waiter(
            child,
            alive.clone(),
            exit.clone(),
            terminate_token.clone(),
        );

        Ok(Self {
            primary_pid,
            secondary_pid: None,
            alive,
            exit,
            terminate_token,
            waiter,
            _stdin: stdin,
            _primary_stderr: None,
        })
    }

    /// Start `primary_line | secondary_line` with the primary's stdout wired
    /// directly into the secondary's stdin.
    ///
    /// Both command lines are token-split, not interpreted by a shell. The
    /// secondary's `stdout`/`stderr` go to the given handles; the primary's
    /// stderr is captured and held unread.
    pub fn launch_piped(
        primary_line: &str,
        secondary_line: &str,
        work_dir: Option<&Path>,
        stdout: Stdio,
        stderr: Stdio,
    ) -> Result<Self> {
        let primary_args = process_utils::split_command_line(primary_line)
            .map_err(|e| Error::launch(format!("Invalid primary command: {e}")))?;
        let secondary_args = process_utils::split_command_line(secondary_line)
            .map_err(|e| Error::launch(format!("Invalid secondary command: {e}")))?;
        let (primary_program, primary_rest) = primary_args
            .split_first()
            .ok_or_else(|| Error::launch("Primary command is empty"))?;
        let (secondary_program, secondary_rest) = secondary_args
            .split_first()
            .ok_or_else(|| Error::launch("Secondary command is empty"))?;

        let mut primary_cmd = process_utils::tokio_command(primary_program);
        primary_cmd
            .args(primary_rest)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = work_dir {
            primary_cmd.current_dir(dir);
        }
        let mut primary = primary_cmd
            .spawn()
            .map_err(|e| Error::launch(format!("Failed to start primary: {e}")))?;

        let primary_stdout = primary
            .stdout
            .take()
            .ok_or_else(|| Error::launch("Primary stdout was not captured"))?;
        let secondary_stdin: Stdio = primary_stdout
            .try_into()
            .map_err(|e| Error::launch(format!("Failed to connect pipeline: {e}")))?;

        let mut secondary_cmd = process_utils::tokio_command(secondary_program);
        secondary_cmd
            .args(secondary_rest)
            .stdin(secondary_stdin)
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        if let Some(dir) = work_dir {
            secondary_cmd.current_dir(dir);
        }
        let mut secondary = match secondary_cmd.spawn() {
            Ok(secondary) => secondary,
            Err(e) => {
                // The primary is already running; take it down with us.
                let _ = primary.start_kill();
                return Err(Error::launch(format!("Failed to start secondary: {e}")));
            }
        };
        info!(
            primary_pid = ?primary.id(),
            secondary_pid = ?secondary.id(),
            "Encoder pipeline started"
        );

        let stdin = primary.stdin.take();
        let primary_stderr = primary.stderr.take();
        let primary_pid = primary.id();
        let secondary_pid = secondary.id();
        let alive = Arc::new(AtomicBool::new(true));
        let exit = Arc::new(Mutex::new(None));
        let terminate_token = CancellationToken::new();
        let waiter = spawn_piped_waiter(
            primary,
            secondary,
            alive.clone(),
            exit.clone(),
            terminate_token.clone(),
        );

        Ok(Self {
            primary_pid,
            secondary_pid,
            alive,
            exit,
            terminate_token,
            waiter,
            _stdin: stdin,
            _primary_stderr: primary_stderr,
        })
    }

    /// Whether the process (for a pipeline, the secondary) is still running.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// The exit status, once the process has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit.lock()
    }

    /// Shared liveness flag, for the output reader.
    pub fn alive_flag(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    /// Request termination of every process owned by this handle.
    ///
    /// Idempotent, and safe to call after the process has already exited.
    pub fn terminate(&self) {
        self.terminate_token.cancel();
    }

    /// Terminate and wait for the waiter task to finish reaping.
    pub async fn shutdown(self) {
        self.terminate_token.cancel();
        if let Err(e) = self.waiter.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Process waiter task failed");
            }
        }
    }

    /// Whether the active invocation can be suspended and resumed.
    ///
    /// Piped pairs cannot: suspending one half of a pipe can deadlock the
    /// other half on a full pipe buffer.
    pub fn supports_pause(&self) -> bool {
        cfg!(unix) && self.secondary_pid.is_none()
    }

    /// Suspend the primary process.
    pub fn pause(&self) -> Result<()> {
        self.signal_primary(PauseSignal::Stop)
    }

    /// Resume a previously suspended primary process.
    pub fn resume(&self) -> Result<()> {
        self.signal_primary(PauseSignal::Cont)
    }

    #[cfg(unix)]
    fn signal_primary(&self, signal: PauseSignal) -> Result<()> {
        if self.secondary_pid.is_some() {
            return Err(Error::unsupported(
                "Pause is not supported for piped pipelines",
            ));
        }
        if !self.is_alive() {
            return Err(Error::NoActiveProcess);
        }
        let pid = self.primary_pid.ok_or(Error::NoActiveProcess)?;
        let signal = match signal {
            PauseSignal::Stop => Signal::SIGSTOP,
            PauseSignal::Cont => Signal::SIGCONT,
        };
        signal::kill(Pid::from_raw(pid as i32), signal)
            .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))
    }

    #[cfg(not(unix))]
    fn signal_primary(&self, _signal: PauseSignal) -> Result<()> {
        Err(Error::unsupported(
            "Pause is not available on this platform",
        ))
    }
}

enum PauseSignal {
    Stop,
    Cont,
}

fn spawn_waiter(
    mut child: Child,
    alive: Arc<AtomicBool>,
    exit: Arc<Mutex<Option<ExitStatus>>>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => {
                    debug!(code = ?status.code(), "Encoder exited");
                    *exit.lock() = Some(status);
                }
                Err(e) => warn!(error = %e, "Failed to wait on encoder"),
            },
            _ = token.cancelled() => {
                shutdown_child(&mut child, "encoder").await;
            }
        }
        alive.store(false, Ordering::SeqCst);
    })
}

fn spawn_piped_waiter(
    mut primary: Child,
    mut secondary: Child,
    alive: Arc<AtomicBool>,
    exit: Arc<Mutex<Option<ExitStatus>>>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            status = secondary.wait() => {
                match status {
                    Ok(status) => {
                        debug!(code = ?status.code(), "Secondary exited");
                        *exit.lock() = Some(status);
                    }
                    Err(e) => warn!(error = %e, "Failed to wait on secondary"),
                }
                alive.store(false, Ordering::SeqCst);
                reap_primary(&mut primary).await;
            }
            _ = token.cancelled() => {
                // Reverse of launch order: secondary first, then primary.
                shutdown_child(&mut secondary, "secondary").await;
                shutdown_child(&mut primary, "primary").await;
                alive.store(false, Ordering::SeqCst);
            }
        }
    })
}

/// Graceful termination, immediately followed by a kill, then a bounded wait.
async fn shutdown_child(child: &mut Child, label: &'static str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(error = %e, "Failed to deliver SIGTERM to {}", label);
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Failed to kill {}", label);
    }
    match tokio::time::timeout(KILL_WAIT_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => debug!(code = ?status.code(), "{} exited after kill", label),
        Ok(Err(e)) => warn!(error = %e, "Failed to wait on {} after kill", label),
        Err(_) => warn!("{} did not exit after kill", label),
    }
}

async fn reap_primary(primary: &mut Child) {
    match tokio::time::timeout(PRIMARY_REAP_TIMEOUT, primary.wait()).await {
        Ok(Ok(status)) => debug!(code = ?status.code(), "Primary exited"),
        Ok(Err(e)) => warn!(error = %e, "Failed to wait on primary"),
        Err(_) => {
            warn!("Primary outlived secondary, killing it");
            shutdown_child(primary, "primary").await;
        }
    }
}
