use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::process::Stdio;
use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::fs::create_dir_all;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::path::{LOG_SUFFIX, SUPERVISOR_LOG_FILENAME};
use crate::{PodutilsError, PodutilsResult, ProcessMonitor, RotatingLog};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A supervisor that manages a child process and its logging.
///
/// The supervisor spawns the child, hands its stdout/stderr to the process monitor,
/// and watches for exit in a background task. The exit status is reported through
/// the [`oneshot::Receiver`] returned by [`Supervisor::start`] rather than awaited
/// inline, so callers can fold it into their own event loop.
pub struct Supervisor<M>
where
    M: ProcessMonitor + Send + 'static,
{
    /// Path to the child executable
    child_exe: PathBuf,

    /// Arguments to pass to the child executable
    child_args: Vec<String>,

    /// Name of the child process
    child_name: String,

    /// Prefix for the child's log file
    child_log_prefix: String,

    /// Path to the supervisor's log directory
    log_dir: PathBuf,

    /// The process monitor
    process_monitor: M,

    /// Environment variables for the child process
    child_envs: Vec<(String, String)>,
}

/// A handle to a supervised child process.
///
/// Cloneable; signals are routed through the watcher task that owns the child.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    /// The supervised child process ID
    pid: u32,

    /// Channel to the watcher task that owns the child
    signal_tx: mpsc::UnboundedSender<Signal>,
}

/// The exit report of a supervised child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// The process ID the child ran under
    pub pid: u32,

    /// The exit code, if the child exited normally
    pub code: Option<i32>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<M> Supervisor<M>
where
    M: ProcessMonitor + Send + 'static,
{
    /// Creates a new supervisor instance.
    ///
    /// ## Arguments
    ///
    /// * `child_exe` - Path to the child executable
    /// * `child_args` - Arguments to pass to the child executable
    /// * `child_envs` - Environment variables for the child process
    /// * `child_name` - Name of the child process
    /// * `child_log_prefix` - Prefix for the child's log file
    /// * `log_dir` - Path to the supervisor's log directory
    /// * `process_monitor` - The process monitor to use
    pub fn new(
        child_exe: impl AsRef<Path>,
        child_args: impl IntoIterator<Item = impl Into<String>>,
        child_envs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
        child_name: impl Into<String>,
        child_log_prefix: impl Into<String>,
        log_dir: impl AsRef<Path>,
        process_monitor: M,
    ) -> Self {
        Self {
            child_exe: child_exe.as_ref().to_path_buf(),
            child_args: child_args.into_iter().map(Into::into).collect(),
            child_envs: child_envs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            child_name: child_name.into(),
            child_log_prefix: child_log_prefix.into(),
            log_dir: log_dir.as_ref().to_path_buf(),
            process_monitor,
        }
    }

    /// Generates a unique child ID using name, process ID, and current timestamp.
    ///
    /// The ID format is: "{name}-{pid}-{timestamp}"
    fn generate_child_id(&self, child_pid: u32) -> String {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        format!("{}-{}-{}", self.child_name, child_pid, timestamp)
    }

    /// Starts the child process and its watcher task.
    ///
    /// This method:
    /// 1. Creates the log directory if it doesn't exist
    /// 2. Starts the child process
    /// 3. Passes stdout/stderr to the process monitor
    /// 4. Spawns a watcher task that owns the child and reports its exit
    ///
    /// Returns a signal handle plus the receiver on which the exit report is
    /// delivered.
    pub async fn start(
        mut self,
    ) -> PodutilsResult<(SupervisorHandle, oneshot::Receiver<ChildExit>)> {
        if !self.child_exe.exists() {
            return Err(PodutilsError::BinaryNotFound(
                self.child_exe.display().to_string(),
            ));
        }

        // Create log directory if it doesn't exist
        create_dir_all(&self.log_dir).await?;

        // Setup supervisor's rotating log
        let _supervisor_log = RotatingLog::new(self.log_dir.join(SUPERVISOR_LOG_FILENAME)).await?;

        // Start child process
        let mut child = Command::new(&self.child_exe)
            .args(&self.child_args)
            .envs(self.child_envs.iter().map(|(k, v)| (k, v)))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let child_pid = child.id().ok_or(PodutilsError::NoChildProcess)?;

        // Generate unique child ID
        let child_id = self.generate_child_id(child_pid);

        // Setup child's log path
        let child_log_name = format!("{}-{}.{}", self.child_log_prefix, child_id, LOG_SUFFIX);
        let child_log_path = self.log_dir.join(child_log_name);

        // Take ownership of child's stdout/stderr and start monitoring
        let stdout = child.stdout.take().ok_or(PodutilsError::NoChildProcess)?;
        let stderr = child.stderr.take().ok_or(PodutilsError::NoChildProcess)?;
        self.process_monitor
            .start(child_pid, stdout, stderr, child_log_path)
            .await?;

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<Signal>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let mut process_monitor = self.process_monitor;
        let child_name = self.child_name;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(signal) = signal_rx.recv() => {
                        tracing::info!(pid = child_pid, signal = %signal, "forwarding signal to child process");
                        if signal == Signal::SIGKILL {
                            if let Err(e) = child.start_kill() {
                                tracing::error!(pid = child_pid, error = %e, "failed to kill child process");
                            }
                        } else if let Err(e) =
                            nix::sys::signal::kill(Pid::from_raw(child_pid as i32), signal)
                        {
                            tracing::error!(pid = child_pid, error = %e, "failed to signal child process");
                        }
                    }
                    status = child.wait() => {
                        let code = match &status {
                            Ok(exit_status) => {
                                tracing::info!(
                                    pid = child_pid,
                                    "child process {} exited with status: {:?}",
                                    child_name,
                                    exit_status
                                );
                                exit_status.code()
                            }
                            Err(e) => {
                                tracing::error!(pid = child_pid, error = %e, "failed to wait for child process");
                                None
                            }
                        };

                        if let Err(e) = process_monitor.stop().await {
                            tracing::warn!(pid = child_pid, error = %e, "failed to stop process monitor");
                        }

                        let _ = exit_tx.send(ChildExit {
                            pid: child_pid,
                            code,
                        });
                        break;
                    }
                }
            }
        });

        Ok((SupervisorHandle::new(child_pid, signal_tx), exit_rx))
    }
}

impl SupervisorHandle {
    /// Creates a handle from a raw signal channel.
    ///
    /// Used by [`Supervisor::start`]; also useful for wiring a custom watcher.
    pub fn new(pid: u32, signal_tx: mpsc::UnboundedSender<Signal>) -> Self {
        Self { pid, signal_tx }
    }

    /// Returns the supervised child's process ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Asks the watcher to send SIGTERM to the child.
    pub fn terminate(&self) -> PodutilsResult<()> {
        self.signal_tx
            .send(Signal::SIGTERM)
            .map_err(|_| PodutilsError::NoChildProcess)
    }

    /// Asks the watcher to hard-kill the child.
    pub fn kill(&self) -> PodutilsResult<()> {
        self.signal_tx
            .send(Signal::SIGKILL)
            .map_err(|_| PodutilsError::NoChildProcess)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
