use bytes::Bytes;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{mpsc, oneshot},
};
use tracing::{debug, warn};

use crate::{config::DEFAULT_TTY_BUFFER_LINES, PodcoreError, PodcoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Fan-out for one serial line (the VM console, or one container's tty).
///
/// A reader task consumes the line, buffers until a newline, and broadcasts
/// the completed line to every attached observer with a non-blocking send;
/// an observer whose buffer is full misses that line. A writer task drains
/// the shared input sink. Observers attach and detach dynamically without
/// disturbing each other or the underlying connection.
#[derive(Debug)]
pub struct SerialMultiplexer {
    /// The serial line's label, for logs.
    label: String,

    /// Control channel into the reader task.
    control_tx: mpsc::Sender<Control>,

    /// The shared write sink, cloned into every tty handle.
    input_tx: mpsc::Sender<TtyInput>,
}

/// The observer end of a serial line, handed out by attach.
#[derive(Debug)]
pub struct TtyHandle {
    /// The observer id, needed to detach.
    pub observer: u64,

    /// Completed lines from the serial line.
    pub output: mpsc::Receiver<String>,

    /// The shared write sink of the line.
    pub input: mpsc::Sender<TtyInput>,
}

/// One item on a serial line's write sink.
#[derive(Debug)]
pub enum TtyInput {
    /// Bytes to write to the line.
    Data(Bytes),

    /// Close the write side of the line.
    Close,
}

/// Commands into the reader task, which owns the observer list.
#[derive(Debug)]
enum Control {
    Attach {
        reply: oneshot::Sender<TtyHandle>,
    },
    Detach {
        observer: u64,
        reply: oneshot::Sender<PodcoreResult<()>>,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SerialMultiplexer {
    /// Spawns the reader and writer tasks for a serial line and returns the
    /// multiplexer handle.
    pub fn spawn<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let label = label.into();
        let (control_tx, control_rx) = mpsc::channel(8);
        let (input_tx, input_rx) = mpsc::channel(DEFAULT_TTY_BUFFER_LINES);

        tokio::spawn(reader_loop(
            label.clone(),
            reader,
            control_rx,
            input_tx.clone(),
        ));
        tokio::spawn(writer_loop(label.clone(), writer, input_rx));

        Self {
            label,
            control_tx,
            input_tx,
        }
    }

    /// Attaches a new observer, returning its tty handle.
    pub async fn attach(&self) -> PodcoreResult<TtyHandle> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control_tx
            .send(Control::Attach { reply: reply_tx })
            .await
            .map_err(|_| PodcoreError::ChannelClosed)?;
        reply_rx.await.map_err(|_| PodcoreError::ChannelClosed)
    }

    /// Detaches one observer, leaving the others and the line undisturbed.
    pub async fn detach(&self, observer: u64) -> PodcoreResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control_tx
            .send(Control::Detach {
                observer,
                reply: reply_tx,
            })
            .await
            .map_err(|_| PodcoreError::ChannelClosed)?;
        reply_rx.await.map_err(|_| PodcoreError::ChannelClosed)?
    }

    /// Asks the writer task to close the write side of the line.
    pub async fn close_input(&self) {
        let _ = self.input_tx.send(TtyInput::Close).await;
    }

    /// Returns the line's label.
    pub fn label(&self) -> &str {
        &self.label
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn reader_loop<R>(
    label: String,
    reader: R,
    mut control_rx: mpsc::Receiver<Control>,
    input_tx: mpsc::Sender<TtyInput>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    let mut observers: Vec<(u64, mpsc::Sender<String>)> = Vec::new();
    let mut next_observer: u64 = 0;

    loop {
        tokio::select! {
            control = control_rx.recv() => match control {
                Some(Control::Attach { reply }) => {
                    let (line_tx, line_rx) = mpsc::channel(DEFAULT_TTY_BUFFER_LINES);
                    let observer = next_observer;
                    next_observer += 1;
                    observers.push((observer, line_tx));
                    debug!(line = %label, observer, "observer attached");
                    let _ = reply.send(TtyHandle {
                        observer,
                        output: line_rx,
                        input: input_tx.clone(),
                    });
                }
                Some(Control::Detach { observer, reply }) => {
                    let before = observers.len();
                    observers.retain(|(id, _)| *id != observer);
                    let result = if observers.len() < before {
                        debug!(line = %label, observer, "observer detached");
                        Ok(())
                    } else {
                        Err(PodcoreError::UnknownTtyObserver(observer))
                    };
                    let _ = reply.send(result);
                }
                // The multiplexer handle is gone; stop pumping.
                None => break,
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    // Best-effort fan-out: a full observer misses the line,
                    // a closed observer is dropped.
                    observers.retain(|(id, tx)| match tx.try_send(line.clone()) {
                        Ok(()) => true,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!(line = %label, observer = id, "observer buffer full, line dropped");
                            true
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => false,
                    });
                }
                Ok(None) => {
                    debug!(line = %label, "serial line reached end of stream");
                    break;
                }
                Err(e) => {
                    warn!(line = %label, error = %e, "serial line read failed");
                    break;
                }
            },
        }
    }

    // End of stream closes every observer sink and the write side.
    observers.clear();
    let _ = input_tx.send(TtyInput::Close).await;
}

async fn writer_loop<W>(label: String, mut writer: W, mut input_rx: mpsc::Receiver<TtyInput>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(input) = input_rx.recv().await {
        match input {
            TtyInput::Data(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!(line = %label, error = %e, "serial line write failed");
                    break;
                }
                if let Err(e) = writer.flush().await {
                    warn!(line = %label, error = %e, "serial line flush failed");
                    break;
                }
            }
            TtyInput::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test_log::test(tokio::test)]
    async fn test_line_fans_out_to_all_observers() -> anyhow::Result<()> {
        let (mut line, host) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host);
        let mux = SerialMultiplexer::spawn("console", host_read, host_write);

        let mut first = mux.attach().await?;
        let mut second = mux.attach().await?;

        line.write_all(b"hello from the guest\n").await?;

        assert_eq!(first.output.recv().await.as_deref(), Some("hello from the guest"));
        assert_eq!(second.output.recv().await.as_deref(), Some("hello from the guest"));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_detach_leaves_remaining_observer_delivering() -> anyhow::Result<()> {
        let (mut line, host) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host);
        let mux = SerialMultiplexer::spawn("console", host_read, host_write);

        let first = mux.attach().await?;
        let mut second = mux.attach().await?;

        mux.detach(first.observer).await?;
        line.write_all(b"still here\n").await?;

        assert_eq!(second.output.recv().await.as_deref(), Some("still here"));
        assert!(matches!(
            mux.detach(first.observer).await,
            Err(PodcoreError::UnknownTtyObserver(_))
        ));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_input_sink_reaches_the_line() -> anyhow::Result<()> {
        let (line, host) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host);
        let mux = SerialMultiplexer::spawn("console", host_read, host_write);

        let handle = mux.attach().await?;
        handle
            .input
            .send(TtyInput::Data(Bytes::from_static(b"reboot\n")))
            .await?;

        let (mut line_read, _line_write) = tokio::io::split(line);
        let mut buf = [0u8; 7];
        line_read.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"reboot\n");
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_end_of_stream_closes_observer_sinks() -> anyhow::Result<()> {
        let (line, host) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host);
        let mux = SerialMultiplexer::spawn("console", host_read, host_write);

        let mut handle = mux.attach().await?;
        drop(line);

        assert_eq!(handle.output.recv().await, None);
        Ok(())
    }
}
