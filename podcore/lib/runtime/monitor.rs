use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use podutils::{ProcessMonitor, PodutilsResult, RotatingLog};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{ChildStderr, ChildStdout},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Captures the hypervisor's stdout and stderr into a rotating log file.
///
/// The pump tasks end on their own when the process exits and its pipes
/// close.
#[derive(Default)]
pub struct HypervisorMonitor {
    /// The rotating log; kept alive while the process runs.
    log: Option<RotatingLog>,

    /// The stdout/stderr pump tasks.
    pumps: Vec<JoinHandle<()>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HypervisorMonitor {
    /// Creates an idle monitor.
    pub fn new() -> Self {
        Self::default()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn spawn_pump<R>(mut reader: R, log: &RotatingLog, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut writer = log.get_sync_writer();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    trace!(stream, "hypervisor stream closed");
                    break;
                }
                Ok(n) => {
                    if let Err(e) = writer.write_all(&buf[..n]) {
                        warn!(stream, error = %e, "failed to write hypervisor output");
                        break;
                    }
                }
                Err(e) => {
                    warn!(stream, error = %e, "failed to read hypervisor output");
                    break;
                }
            }
        }
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ProcessMonitor for HypervisorMonitor {
    async fn start(
        &mut self,
        pid: u32,
        stdout: ChildStdout,
        stderr: ChildStderr,
        log_path: PathBuf,
    ) -> PodutilsResult<()> {
        debug!(pid, log = %log_path.display(), "capturing hypervisor output");
        let log = RotatingLog::new(&log_path).await?;

        self.pumps.push(spawn_pump(stdout, &log, "stdout"));
        self.pumps.push(spawn_pump(stderr, &log, "stderr"));
        self.log = Some(log);

        podutils::Ok(())
    }

    async fn stop(&mut self) -> PodutilsResult<()> {
        // The pumps drain to EOF on their own; dropping the log lets its
        // background writer finish.
        for pump in self.pumps.drain(..) {
            let _ = pump.await;
        }
        self.log = None;
        podutils::Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[test_log::test(tokio::test)]
    async fn test_monitor_captures_child_output() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let log_path = temp_dir.path().join("hypervisor.log");

        let mut child = Command::new("/bin/sh")
            .args(["-c", "echo booted; echo oops >&2"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = child.id().unwrap();
        let stdout = child.stdout.take().unwrap();
        let stderr = child.stderr.take().unwrap();

        let mut monitor = HypervisorMonitor::new();
        monitor.start(pid, stdout, stderr, log_path.clone()).await?;
        child.wait().await?;
        monitor.stop().await?;

        // Let the log's background writer drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let contents = tokio::fs::read_to_string(&log_path).await?;
        assert!(contents.contains("booted"));
        assert!(contents.contains("oops"));
        Ok(())
    }
}
