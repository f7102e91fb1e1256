use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{serial::TtyHandle, PodcoreError, PodcoreResult};

use super::{Event, SessionResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The caller-facing handle of a running VM session.
///
/// Every operation is a hub event with a reply channel; the session's
/// consumer applies it in order with everything else it is processing.
#[derive(Debug)]
pub struct SessionHandle {
    /// The producer side of the session's hub.
    hub_tx: mpsc::Sender<Event>,

    /// The session's event loop task.
    join: JoinHandle<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SessionHandle {
    pub(crate) fn new(hub_tx: mpsc::Sender<Event>, join: JoinHandle<()>) -> Self {
        Self { hub_tx, join }
    }

    /// Returns a producer for wiring external event sources into the hub
    /// (the process watcher, serial port notifications).
    pub fn hub_sender(&self) -> mpsc::Sender<Event> {
        self.hub_tx.clone()
    }

    /// Asks the session to shut down and returns the receiver on which the
    /// final result is delivered once teardown completes.
    pub async fn request_shutdown(&self) -> PodcoreResult<oneshot::Receiver<SessionResult>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Event::ShutdownRequested {
            reply: Some(reply_tx),
        })
        .await?;
        crate::Ok(reply_rx)
    }

    /// Shuts the session down and waits for teardown to complete.
    pub async fn shutdown(&self) -> PodcoreResult<SessionResult> {
        let reply_rx = self.request_shutdown().await?;
        reply_rx.await.map_err(|_| PodcoreError::HubClosed)
    }

    /// Executes a command in the named container, or in the pod itself when
    /// the container is empty.
    pub async fn exec(
        &self,
        container: impl Into<String>,
        cmd: Vec<String>,
    ) -> PodcoreResult<SessionResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Event::ExecRequested {
            container: container.into(),
            cmd,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| PodcoreError::HubClosed)
    }

    /// Attaches to a container's tty, or to the VM console when `container`
    /// is `None`.
    pub async fn attach(&self, container: Option<String>) -> PodcoreResult<TtyHandle> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Event::AttachRequested {
            container,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| PodcoreError::HubClosed)?
    }

    /// Detaches one tty observer.
    pub async fn detach(&self, container: Option<String>, observer: u64) -> PodcoreResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Event::DetachRequested {
            container,
            observer,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| PodcoreError::HubClosed)?
    }

    /// Waits for the session's event loop to finish.
    pub async fn wait(self) -> PodcoreResult<()> {
        self.join.await.map_err(PodcoreError::JoinError)
    }

    async fn send(&self, event: Event) -> PodcoreResult<()> {
        self.hub_tx
            .send(event)
            .await
            .map_err(|_| PodcoreError::HubClosed)
    }
}
