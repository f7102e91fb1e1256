use std::time::Duration;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default number of vCPUs to use for the VM.
pub const DEFAULT_NUM_VCPUS: u8 = 1;

/// The default amount of memory in MiB to use for the VM.
pub const DEFAULT_MEMORY_MIB: u32 = 1024;

/// How long to wait for the guest to acknowledge a shutdown before forcing a
/// monitor quit.
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// How long to wait after a forced monitor quit before hard-killing the
/// hypervisor process.
pub const DEFAULT_FORCED_QUIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the guest init process to acknowledge a channel
/// command before treating the command as failed.
pub const DEFAULT_CHANNEL_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// The capacity of the session hub event queue.
pub const DEFAULT_HUB_CAPACITY: usize = 256;

/// The capacity of a tty observer's line buffer. An observer that falls this
/// many lines behind starts missing lines.
pub const DEFAULT_TTY_BUFFER_LINES: usize = 64;

/// The virtserialport name of the guest init channel.
pub const CHANNEL_PORT_NAME: &str = "pod.channel.0";

/// Where the guest sees the init channel port. virtio-serial exposes a named
/// port under /dev/virtio-ports.
pub const GUEST_CHANNEL_PATH: &str = "/dev/virtio-ports/pod.channel.0";
