use std::path::PathBuf;

use bytes::Bytes;
use tokio::{net::UnixStream, sync::oneshot};

use crate::{serial::TtyHandle, PodcoreResult};

use super::{ContainerInfo, NetworkLink, VolumeInfo};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An event on the session hub.
///
/// The hub is the session's single buffered multi-producer single-consumer
/// queue; every independently running task reports back by posting one of
/// these. Events are immutable once enqueued and each carries only the data
/// needed to apply its effect. The state machine matches them exhaustively,
/// one arm per state and event kind.
#[derive(Debug)]
pub enum Event {
    /// The hypervisor process exited, for any reason.
    ProcessExited {
        /// The exit code, if the process exited normally.
        code: Option<i32>,
    },

    /// The monitor reported an unsolicited event notification.
    MonitorEvent {
        /// The event's name, e.g. "SHUTDOWN".
        name: String,

        /// The event's data object.
        data: serde_json::Value,
    },

    /// The guest init process acknowledged a channel command.
    CommandAck {
        /// The command code being acknowledged.
        code: u32,

        /// The acknowledgement payload, if any.
        payload: Bytes,
    },

    /// The image collaborator finished creating a container.
    ContainerCreated(ContainerInfo),

    /// The storage collaborator finished preparing a volume.
    VolumeReady(VolumeInfo),

    /// A monitor disk-attach session completed for a block device.
    BlockDeviceInserted {
        /// The logical name of the device's owner (container or volume).
        name: String,

        /// The assigned guest device name, e.g. "sda".
        device: String,
    },

    /// The network collaborator allocated a link.
    NetworkCreated(NetworkLink),

    /// A monitor network-attach session completed for a link.
    NetworkInserted {
        /// The link's index within the pod.
        index: u32,
    },

    /// The hypervisor exposed a serial port for the console or a container.
    SerialAttached {
        /// The container the port belongs to; `None` for the VM console.
        container: Option<String>,

        /// The host-side socket path of the serial line.
        path: PathBuf,
    },

    /// A serial line's connection is open and ready to multiplex.
    TtyOpened {
        /// The container the line belongs to; `None` for the VM console.
        container: Option<String>,

        /// The connected serial line.
        stream: UnixStream,
    },

    /// The guest init process reported a failure.
    InitFailed {
        /// The human-readable reason.
        reason: String,
    },

    /// A device provisioning or insertion operation failed.
    DeviceFailed {
        /// The kind of operation that failed.
        op: DeviceOp,

        /// The last error detail.
        detail: String,
    },

    /// A caller asked the session to shut down.
    ShutdownRequested {
        /// Where to deliver the session result, if the caller wants one.
        reply: Option<oneshot::Sender<SessionResult>>,
    },

    /// A caller asked to execute a command in the guest.
    ExecRequested {
        /// The target container; empty targets the pod itself.
        container: String,

        /// The argv to execute.
        cmd: Vec<String>,

        /// Where to deliver the result.
        reply: oneshot::Sender<SessionResult>,
    },

    /// A caller asked to attach to a serial line.
    AttachRequested {
        /// The container to attach to; `None` for the VM console.
        container: Option<String>,

        /// Where to deliver the tty handle.
        reply: oneshot::Sender<PodcoreResult<TtyHandle>>,
    },

    /// A caller asked to detach a tty observer.
    DetachRequested {
        /// The container the observer is attached to; `None` for the console.
        container: Option<String>,

        /// The observer id from the tty handle.
        observer: u64,

        /// Where to deliver the outcome.
        reply: oneshot::Sender<PodcoreResult<()>>,
    },

    /// A deferred timer fired while the session was still alive.
    Timeout(TimeoutKind),
}

/// The kinds of deferred timers the session arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The guest did not wind down within the graceful shutdown window.
    GracefulShutdown,

    /// The hypervisor did not exit after the forced monitor quit.
    ForcedQuit,

    /// The guest did not acknowledge a channel command in time.
    ChannelAck {
        /// The command code that went unacknowledged.
        code: u32,
    },
}

/// The kinds of device operations that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    /// Creating a container from its image.
    ContainerCreate,

    /// Preparing a volume.
    VolumePrepare,

    /// Allocating a network link.
    NetworkAllocate,

    /// Inserting a disk through the monitor.
    DiskAttach,

    /// Inserting a network device through the monitor.
    NetworkAttach,
}

/// The outcome of a session operation, reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResult {
    /// The result code.
    pub code: ResultCode,

    /// A human-readable cause.
    pub cause: String,
}

/// Result codes for session operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// The operation succeeded.
    Ok,

    /// The session was shut down before the operation completed.
    Shutdown,

    /// A spec could not be parsed or serialized.
    JsonParseFail,

    /// The session context could not be initialized.
    ContextInitFail,

    /// A device operation failed.
    DeviceFail,

    /// The guest init process failed.
    InitFail,

    /// A guest command failed.
    CommandFail,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SessionResult {
    /// Creates a success result.
    pub fn ok() -> Self {
        Self {
            code: ResultCode::Ok,
            cause: String::new(),
        }
    }

    /// Creates a result with the given code and cause.
    pub fn new(code: ResultCode, cause: impl Into<String>) -> Self {
        Self {
            code,
            cause: cause.into(),
        }
    }

    /// Returns whether the result is a success.
    pub fn is_ok(&self) -> bool {
        self.code == ResultCode::Ok
    }
}
