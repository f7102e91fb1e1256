use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a podcore-related operation.
pub type PodcoreResult<T> = Result<T, PodcoreError>;

/// An error that occurred during a pod session operation.
#[derive(Debug, Error)]
pub enum PodcoreError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error that occurred during JSON serialization or parsing.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred in a runtime utility.
    #[error("runtime error: {0}")]
    Runtime(#[from] podutils::PodutilsError),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that occurred during an OS-level socket operation.
    #[error("socket error: {0}")]
    Socket(#[from] nix::Error),

    /// An error that occurred when an invalid VM configuration was used.
    #[error("invalid VM configuration: {0}")]
    InvalidVmConfig(#[from] InvalidVmConfigError),

    /// The monitor returned an error response for a command.
    #[error("monitor command `{command}` failed: {detail}")]
    MonitorCommand {
        /// The command that failed.
        command: String,
        /// The error detail reported by the monitor.
        detail: String,
    },

    /// The monitor connection produced a malformed or unexpected frame.
    #[error("unexpected monitor frame: {0}")]
    MonitorProtocol(String),

    /// The monitor connection closed before the handshake completed.
    #[error("monitor handshake failed: {0}")]
    MonitorHandshake(String),

    /// The guest init channel produced a malformed frame.
    #[error("init channel protocol error: {0}")]
    ChannelProtocol(String),

    /// The init channel is closed.
    #[error("init channel closed")]
    ChannelClosed,

    /// The session hub is closed, so the event could not be delivered.
    #[error("session hub closed")]
    HubClosed,

    /// The session is not in a state that allows the requested command.
    #[error("session is {state}: {reason}")]
    InvalidSessionState {
        /// The state the session is in.
        state: String,
        /// Why the command was rejected.
        reason: String,
    },

    /// A tty handle was detached that is not attached to the multiplexer.
    #[error("unknown tty observer: {0}")]
    UnknownTtyObserver(u64),

    /// A named container does not exist in the pod.
    #[error("container not found: {0}")]
    ContainerNotFound(String),
}

/// An error that occurred when an invalid VM configuration was used.
#[derive(Debug, Error)]
pub enum InvalidVmConfigError {
    /// The kernel path does not exist.
    #[error("kernel path does not exist: {0}")]
    KernelPathDoesNotExist(String),

    /// The initrd path does not exist.
    #[error("initrd path does not exist: {0}")]
    InitrdPathDoesNotExist(String),

    /// The number of vCPUs is zero.
    #[error("number of vCPUs is zero")]
    NumVCPUsIsZero,

    /// The amount of memory is zero.
    #[error("amount of memory is zero")]
    MemoryIsZero,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PodcoreError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> PodcoreError {
        PodcoreError::Custom(AnyError {
            error: error.into(),
        })
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `PodcoreResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> PodcoreResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
