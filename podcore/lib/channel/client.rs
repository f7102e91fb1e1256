use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{session::Event, spec::GuestSpec, PodcoreResult};

use super::{read_frame, write_frame, CMD_EXEC, CMD_GUEST_ERROR, CMD_SHUTDOWN, CMD_START_POD};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The write side of the guest init channel.
///
/// Acknowledgements are correlated by command code, not by a request id, so
/// requests must be serialized: the writer mutex orders frames on the wire,
/// and the session state machine keeps at most one command outstanding.
pub struct ChannelClient<W> {
    /// The channel connection's write half.
    writer: Mutex<W>,
}

/// A channel client whose write half is erased behind a box, so the session
/// does not carry the transport type.
pub type BoxedChannelClient = ChannelClient<Box<dyn AsyncWrite + Unpin + Send>>;

/// The JSON payload of an exec command.
#[derive(Debug, Serialize)]
struct ExecPayload<'a> {
    cmd: &'a [String],
    container: &'a str,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<W> ChannelClient<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Creates a client over the channel connection's write half.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Sends the start-pod command carrying the serialized guest spec.
    pub async fn start_pod(&self, spec: &GuestSpec) -> PodcoreResult<()> {
        let payload = serde_json::to_vec(spec)?;
        self.send(CMD_START_POD, &payload).await
    }

    /// Sends an exec command for the named container (or the pod itself when
    /// the container is empty).
    pub async fn exec(&self, container: &str, cmd: &[String]) -> PodcoreResult<()> {
        let payload = serde_json::to_vec(&ExecPayload { cmd, container })?;
        self.send(CMD_EXEC, &payload).await
    }

    /// Sends the shutdown command.
    pub async fn shutdown(&self) -> PodcoreResult<()> {
        self.send(CMD_SHUTDOWN, &[]).await
    }

    async fn send(&self, code: u32, payload: &[u8]) -> PodcoreResult<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, code, payload).await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Spawns the dedicated reader task for the channel connection's read half.
///
/// Every acknowledgement frame becomes a [`Event::CommandAck`] on the hub;
/// a guest error report becomes [`Event::InitFailed`]. A transport error is
/// fatal to this task and is surfaced as an init failure; a clean end of
/// stream just ends the task, since the channel closes as part of normal
/// teardown.
pub fn spawn_channel_reader<R>(mut reader: R, hub_tx: mpsc::Sender<Event>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(frame) if frame.code == CMD_GUEST_ERROR => {
                    let reason = String::from_utf8_lossy(&frame.payload).into_owned();
                    warn!(reason = %reason, "guest init reported failure");
                    if hub_tx.send(Event::InitFailed { reason }).await.is_err() {
                        break;
                    }
                }
                Ok(frame) => {
                    debug!(code = frame.code, "received init channel acknowledgement");
                    let event = Event::CommandAck {
                        code: frame.code,
                        payload: frame.payload,
                    };
                    if hub_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(crate::PodcoreError::Io(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    debug!("init channel closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "init channel read failed");
                    let _ = hub_tx
                        .send(Event::InitFailed {
                            reason: format!("init channel read failed: {}", e),
                        })
                        .await;
                    break;
                }
            }
        }
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Frame;

    #[test_log::test(tokio::test)]
    async fn test_client_emits_exec_frame_with_json_payload() -> anyhow::Result<()> {
        let (tx, mut rx) = tokio::io::duplex(4096);
        let client = ChannelClient::new(tx);

        let cmd = vec!["/bin/ls".to_string(), "-l".to_string()];
        client.exec("web", &cmd).await?;

        let frame: Frame = read_frame(&mut rx).await?;
        assert_eq!(frame.code, CMD_EXEC);
        let value: serde_json::Value = serde_json::from_slice(&frame.payload)?;
        assert_eq!(value["container"], "web");
        assert_eq!(value["cmd"][0], "/bin/ls");
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_reader_turns_acks_into_hub_events() -> anyhow::Result<()> {
        let (mut guest, host) = tokio::io::duplex(4096);
        let (hub_tx, mut hub_rx) = mpsc::channel(8);
        let _task = spawn_channel_reader(host, hub_tx);

        write_frame(&mut guest, CMD_START_POD, &[]).await?;

        match hub_rx.recv().await {
            Some(Event::CommandAck { code, .. }) => assert_eq!(code, CMD_START_POD),
            other => panic!("expected CommandAck, got {:?}", other),
        }
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_reader_turns_guest_error_into_init_failure() -> anyhow::Result<()> {
        let (mut guest, host) = tokio::io::duplex(4096);
        let (hub_tx, mut hub_rx) = mpsc::channel(8);
        let _task = spawn_channel_reader(host, hub_tx);

        write_frame(&mut guest, CMD_GUEST_ERROR, b"mount failed").await?;

        match hub_rx.recv().await {
            Some(Event::InitFailed { reason }) => assert_eq!(reason, "mount failed"),
            other => panic!("expected InitFailed, got {:?}", other),
        }
        Ok(())
    }
}
