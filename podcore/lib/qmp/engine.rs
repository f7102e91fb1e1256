use std::io::IoSlice;
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    net::{unix::OwnedWriteHalf, UnixStream},
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{session::Event, PodcoreError, PodcoreResult};

use super::{parse_monitor_frame, MonitorFrame, MonitorSession, QmpCommand};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How many times a command is attempted before its session fails.
const MAX_COMMAND_ATTEMPTS: u32 = 3;

/// The pause between command attempts.
const COMMAND_RETRY_BACKOFF: Duration = Duration::from_secs(1);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The monitor protocol engine: one connection to the hypervisor's control
/// socket, a dedicated reader task, and a dispatcher that executes queued
/// [`MonitorSession`]s one at a time, each command retried with backoff.
#[derive(Debug, Clone)]
pub struct MonitorEngine {
    /// The session queue into the dispatcher task.
    session_tx: mpsc::Sender<MonitorSession>,
}

/// The write side of the monitor connection.
///
/// Commands with a file descriptor must pass it out-of-band on the same
/// message as the command line, which only unix sockets support; other
/// transports refuse such commands.
#[async_trait]
pub trait MonitorWriter: Send {
    /// Writes one command line (newline appended), passing the descriptor
    /// with it when present.
    async fn write_command(&mut self, line: &str, fd: Option<&OwnedFd>) -> PodcoreResult<()>;
}

/// A [`MonitorWriter`] over the write half of a unix socket, with SCM_RIGHTS
/// fd passing.
#[derive(Debug)]
pub struct UnixMonitorWriter {
    write_half: OwnedWriteHalf,
}

/// A [`MonitorWriter`] over any byte stream; refuses fd-passing commands.
#[derive(Debug)]
pub struct PlainMonitorWriter<W> {
    writer: W,
}

/// A classified reply to the command currently in flight.
#[derive(Debug)]
enum CommandReply {
    Return(Value),
    Error { class: String, desc: String },
    Malformed(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MonitorEngine {
    /// Performs the handshake on an accepted monitor connection and spawns
    /// the reader and dispatcher tasks.
    ///
    /// The handshake reads the greeting, sends the capabilities negotiation
    /// command, and expects one success response before any session is
    /// accepted.
    pub async fn connect<R, W>(
        reader: R,
        mut writer: W,
        hub_tx: mpsc::Sender<Event>,
    ) -> PodcoreResult<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: MonitorWriter + 'static,
    {
        let mut lines = BufReader::new(reader).lines();

        let greeting = next_handshake_line(&mut lines).await?;
        match parse_monitor_frame(&greeting)? {
            MonitorFrame::Greeting(version) => {
                debug!(version = %version, "received monitor greeting")
            }
            other => {
                return Err(PodcoreError::MonitorHandshake(format!(
                    "expected greeting, got {:?}",
                    other
                )))
            }
        }

        let capabilities = QmpCommand::new("qmp_capabilities", Value::Null).to_wire_line()?;
        writer.write_command(&capabilities, None).await?;

        let reply = next_handshake_line(&mut lines).await?;
        match parse_monitor_frame(&reply)? {
            MonitorFrame::Return(_) => info!("monitor handshake complete"),
            other => {
                return Err(PodcoreError::MonitorHandshake(format!(
                    "capabilities negotiation rejected: {:?}",
                    other
                )))
            }
        }

        let (reply_tx, reply_rx) = mpsc::channel(8);
        let (session_tx, session_rx) = mpsc::channel(16);
        tokio::spawn(reader_loop(lines, reply_tx, hub_tx.clone()));
        tokio::spawn(dispatcher_loop(writer, session_rx, reply_rx, hub_tx));

        crate::Ok(Self { session_tx })
    }

    /// Performs the handshake over a unix socket connection.
    pub async fn connect_unix(
        stream: UnixStream,
        hub_tx: mpsc::Sender<Event>,
    ) -> PodcoreResult<Self> {
        let (read_half, write_half) = stream.into_split();
        Self::connect(read_half, UnixMonitorWriter::new(write_half), hub_tx).await
    }

    /// Queues a session for execution.
    pub async fn submit(&self, session: MonitorSession) -> PodcoreResult<()> {
        self.session_tx
            .send(session)
            .await
            .map_err(|_| PodcoreError::MonitorProtocol("monitor engine stopped".to_string()))
    }
}

impl UnixMonitorWriter {
    /// Creates a writer over the write half of the monitor socket.
    pub fn new(write_half: OwnedWriteHalf) -> Self {
        Self { write_half }
    }
}

impl<W> PlainMonitorWriter<W> {
    /// Creates a writer over a plain byte stream.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn next_handshake_line<R>(lines: &mut Lines<BufReader<R>>) -> PodcoreResult<String>
where
    R: AsyncRead + Unpin,
{
    lines.next_line().await?.ok_or_else(|| {
        PodcoreError::MonitorHandshake("connection closed during handshake".to_string())
    })
}

/// Decodes frames off the monitor connection and routes each to whoever is
/// waiting: command results and errors to the dispatcher, unsolicited events
/// to the hub. A guest-shutdown notification terminates the task after
/// forwarding.
async fn reader_loop<R>(
    mut lines: Lines<BufReader<R>>,
    reply_tx: mpsc::Sender<CommandReply>,
    hub_tx: mpsc::Sender<Event>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("monitor connection closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "monitor read failed");
                break;
            }
        };

        match parse_monitor_frame(&line) {
            Ok(MonitorFrame::Return(value)) => {
                if reply_tx.send(CommandReply::Return(value)).await.is_err() {
                    break;
                }
            }
            Ok(MonitorFrame::Error { class, desc }) => {
                if reply_tx
                    .send(CommandReply::Error { class, desc })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(MonitorFrame::Event { name, data }) => {
                let is_shutdown = name == "SHUTDOWN";
                debug!(event = %name, "monitor event");
                if hub_tx
                    .send(Event::MonitorEvent { name, data })
                    .await
                    .is_err()
                {
                    break;
                }
                if is_shutdown {
                    debug!("guest shutdown, monitor reader done");
                    break;
                }
            }
            Ok(MonitorFrame::Greeting(_)) => {
                warn!("unexpected greeting after handshake");
                if reply_tx
                    .send(CommandReply::Malformed(
                        "unexpected greeting after handshake".to_string(),
                    ))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "malformed monitor frame");
                if reply_tx
                    .send(CommandReply::Malformed(e.to_string()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

/// Executes queued sessions one at a time, commands strictly in order.
async fn dispatcher_loop<W>(
    mut writer: W,
    mut session_rx: mpsc::Receiver<MonitorSession>,
    mut reply_rx: mpsc::Receiver<CommandReply>,
    hub_tx: mpsc::Sender<Event>,
) where
    W: MonitorWriter,
{
    while let Some(session) = session_rx.recv().await {
        let MonitorSession {
            commands,
            done,
            fail_op,
        } = session;

        match run_session(&mut writer, &mut reply_rx, &commands).await {
            Ok(()) => {
                if let Some(event) = done {
                    if hub_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "monitor session failed");
                if let Some(op) = fail_op {
                    let failed = Event::DeviceFailed {
                        op,
                        detail: e.to_string(),
                    };
                    if hub_tx.send(failed).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn run_session<W>(
    writer: &mut W,
    reply_rx: &mut mpsc::Receiver<CommandReply>,
    commands: &[QmpCommand],
) -> PodcoreResult<()>
where
    W: MonitorWriter,
{
    for command in commands {
        let line = command.to_wire_line()?;
        let mut last_error = None;

        for attempt in 1..=MAX_COMMAND_ATTEMPTS {
            writer.write_command(&line, command.fd.as_ref()).await?;

            match reply_rx.recv().await {
                Some(CommandReply::Return(_)) => {
                    last_error = None;
                    break;
                }
                Some(CommandReply::Error { class, desc }) => {
                    warn!(
                        command = %command.name,
                        attempt,
                        class = %class,
                        desc = %desc,
                        "monitor command returned error"
                    );
                    last_error = Some(PodcoreError::MonitorCommand {
                        command: command.name.clone(),
                        detail: desc,
                    });
                    if attempt < MAX_COMMAND_ATTEMPTS {
                        tokio::time::sleep(COMMAND_RETRY_BACKOFF).await;
                    }
                }
                // Malformed and unexpected replies fail the session outright.
                Some(CommandReply::Malformed(detail)) => {
                    return Err(PodcoreError::MonitorProtocol(detail));
                }
                None => {
                    return Err(PodcoreError::MonitorProtocol(
                        "monitor connection closed mid-command".to_string(),
                    ));
                }
            }
        }

        if let Some(error) = last_error {
            return Err(error);
        }
    }

    crate::Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl MonitorWriter for UnixMonitorWriter {
    async fn write_command(&mut self, line: &str, fd: Option<&OwnedFd>) -> PodcoreResult<()> {
        let mut payload = line.as_bytes().to_vec();
        payload.push(b'\n');

        match fd {
            None => {
                self.write_half.write_all(&payload).await?;
                self.write_half.flush().await?;
            }
            Some(fd) => {
                let stream = self.write_half.as_ref();
                let raw = stream.as_raw_fd();
                let fds = [fd.as_raw_fd()];
                loop {
                    stream.writable().await?;
                    let iov = [IoSlice::new(&payload)];
                    let cmsgs = [ControlMessage::ScmRights(&fds)];
                    match sendmsg::<UnixAddr>(raw, &iov, &cmsgs, MsgFlags::MSG_DONTWAIT, None) {
                        Ok(_) => break,
                        Err(nix::errno::Errno::EAGAIN) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        crate::Ok(())
    }
}

#[async_trait]
impl<W> MonitorWriter for PlainMonitorWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_command(&mut self, line: &str, fd: Option<&OwnedFd>) -> PodcoreResult<()> {
        if fd.is_some() {
            return Err(PodcoreError::MonitorProtocol(
                "transport cannot pass file descriptors".to_string(),
            ));
        }
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        crate::Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    /// A scripted hypervisor side: greets, accepts the handshake, then
    /// answers each command line from the given replies in order.
    async fn scripted_monitor(stream: DuplexStream, replies: Vec<&'static str>) {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();

        // qmp_capabilities
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(line.contains("qmp_capabilities"));
        write_half.write_all(b"{\"return\": {}}\n").await.unwrap();

        for reply in replies {
            if lines.next_line().await.unwrap().is_none() {
                break;
            }
            write_half.write_all(reply.as_bytes()).await.unwrap();
            write_half.write_all(b"\n").await.unwrap();
        }
    }

    async fn connect_scripted(
        replies: Vec<&'static str>,
        hub_tx: mpsc::Sender<Event>,
    ) -> PodcoreResult<MonitorEngine> {
        let (engine_side, monitor_side) = tokio::io::duplex(4096);
        tokio::spawn(scripted_monitor(monitor_side, replies));

        let (read_half, write_half): (ReadHalf<_>, WriteHalf<_>) = tokio::io::split(engine_side);
        MonitorEngine::connect(read_half, PlainMonitorWriter::new(write_half), hub_tx).await
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_session_retries_then_succeeds_on_third_attempt() -> anyhow::Result<()> {
        let (hub_tx, mut hub_rx) = mpsc::channel(8);
        let engine = connect_scripted(
            vec![
                r#"{"error": {"class": "GenericError", "desc": "busy"}}"#,
                r#"{"error": {"class": "GenericError", "desc": "busy"}}"#,
                r#"{"return": {}}"#,
            ],
            hub_tx,
        )
        .await?;

        engine
            .submit(MonitorSession {
                commands: vec![QmpCommand::new("device_add", serde_json::json!({"id": "net-9"}))],
                done: Some(Event::NetworkInserted { index: 9 }),
                fail_op: Some(crate::session::DeviceOp::NetworkAttach),
            })
            .await?;

        match hub_rx.recv().await {
            Some(Event::NetworkInserted { index }) => assert_eq!(index, 9),
            other => panic!("expected NetworkInserted, got {:?}", other),
        }
        Ok(())
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_three_errors_fail_the_session_with_last_detail() -> anyhow::Result<()> {
        let (hub_tx, mut hub_rx) = mpsc::channel(8);
        let engine = connect_scripted(
            vec![
                r#"{"error": {"class": "GenericError", "desc": "first"}}"#,
                r#"{"error": {"class": "GenericError", "desc": "second"}}"#,
                r#"{"error": {"class": "GenericError", "desc": "no space on bus"}}"#,
            ],
            hub_tx,
        )
        .await?;

        engine
            .submit(MonitorSession {
                commands: vec![QmpCommand::new("device_add", serde_json::json!({"id": "sda"}))],
                done: Some(Event::BlockDeviceInserted {
                    name: "web".into(),
                    device: "sda".into(),
                }),
                fail_op: Some(crate::session::DeviceOp::DiskAttach),
            })
            .await?;

        match hub_rx.recv().await {
            Some(Event::DeviceFailed { op, detail }) => {
                assert_eq!(op, crate::session::DeviceOp::DiskAttach);
                assert!(detail.contains("no space on bus"));
            }
            other => panic!("expected DeviceFailed, got {:?}", other),
        }
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_unsolicited_events_reach_the_hub() -> anyhow::Result<()> {
        let (hub_tx, mut hub_rx) = mpsc::channel(8);
        let (engine_side, monitor_side) = tokio::io::duplex(4096);
        let (read_half, mut write_half) = tokio::io::split(monitor_side);
        let mut lines = BufReader::new(read_half).lines();

        let (our_read, our_write) = tokio::io::split(engine_side);
        let connect = tokio::spawn(MonitorEngine::connect(
            our_read,
            PlainMonitorWriter::new(our_write),
            hub_tx,
        ));

        write_half
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await?;
        lines.next_line().await?;
        write_half.write_all(b"{\"return\": {}}\n").await?;
        let _engine = connect.await??;

        write_half
            .write_all(b"{\"event\": \"SHUTDOWN\", \"data\": {\"guest\": true}}\n")
            .await?;

        match hub_rx.recv().await {
            Some(Event::MonitorEvent { name, data }) => {
                assert_eq!(name, "SHUTDOWN");
                assert_eq!(data["guest"], true);
            }
            other => panic!("expected MonitorEvent, got {:?}", other),
        }
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_handshake_rejects_missing_greeting() {
        let (engine_side, monitor_side) = tokio::io::duplex(4096);
        let (_read_half, mut write_half) = tokio::io::split(monitor_side);
        tokio::spawn(async move {
            let _ = write_half.write_all(b"{\"return\": {}}\n").await;
        });

        let (hub_tx, _hub_rx) = mpsc::channel(8);
        let (our_read, our_write) = tokio::io::split(engine_side);
        let result =
            MonitorEngine::connect(our_read, PlainMonitorWriter::new(our_write), hub_tx).await;
        assert!(matches!(result, Err(PodcoreError::MonitorHandshake(_))));
    }
}
