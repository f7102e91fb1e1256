use std::{path::PathBuf, time::Duration};

use getset::Getters;

use crate::{InvalidVmConfigError, PodcoreResult};

use super::VmConfigBuilder;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Configuration for one hypervisor-backed VM session.
///
/// This struct holds the settings needed to boot the hypervisor for a pod:
/// resources, boot artifacts, and the timeouts that drive shutdown escalation.
///
/// Rather than creating this directly, use [`VmConfig::builder`] for a more
/// ergonomic interface.
///
/// ## Examples
///
/// ```rust
/// use podcore::config::VmConfig;
/// use tempfile::NamedTempFile;
///
/// # fn main() -> anyhow::Result<()> {
/// let kernel = NamedTempFile::new()?;
/// let initrd = NamedTempFile::new()?;
/// let config = VmConfig::builder()
///     .kernel_path(kernel.path())
///     .initrd_path(initrd.path())
///     .memory_mib(512)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct VmConfig {
    /// The path to the hypervisor executable.
    hypervisor_path: PathBuf,

    /// The path to the guest kernel image.
    kernel_path: PathBuf,

    /// The path to the guest initrd image.
    initrd_path: PathBuf,

    /// The number of vCPUs to use for the VM.
    num_vcpus: u8,

    /// The amount of memory in MiB to use for the VM.
    memory_mib: u32,

    /// The directory holding the session's sockets and logs.
    run_dir: PathBuf,

    /// How long to wait for the guest to acknowledge a shutdown before
    /// forcing a monitor quit.
    graceful_shutdown_timeout: Duration,

    /// How long to wait after a forced monitor quit before hard-killing the
    /// hypervisor process.
    forced_quit_timeout: Duration,

    /// How long to wait for a guest init channel acknowledgement.
    channel_ack_timeout: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmConfig {
    /// Starts building a new VM configuration.
    pub fn builder() -> VmConfigBuilder<(), ()> {
        VmConfigBuilder::default()
    }

    /// Creates a configuration from already-validated parts.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        hypervisor_path: PathBuf,
        kernel_path: PathBuf,
        initrd_path: PathBuf,
        num_vcpus: u8,
        memory_mib: u32,
        run_dir: PathBuf,
        graceful_shutdown_timeout: Duration,
        forced_quit_timeout: Duration,
        channel_ack_timeout: Duration,
    ) -> Self {
        Self {
            hypervisor_path,
            kernel_path,
            initrd_path,
            num_vcpus,
            memory_mib,
            run_dir,
            graceful_shutdown_timeout,
            forced_quit_timeout,
            channel_ack_timeout,
        }
    }

    /// Validates the configuration.
    ///
    /// ## Errors
    ///
    /// Returns an [`InvalidVmConfigError`] if the kernel or initrd paths do
    /// not exist, or if the vCPU count or memory size is zero.
    pub fn validate(&self) -> PodcoreResult<()> {
        if !self.kernel_path.exists() {
            return Err(InvalidVmConfigError::KernelPathDoesNotExist(
                self.kernel_path.display().to_string(),
            )
            .into());
        }

        if !self.initrd_path.exists() {
            return Err(InvalidVmConfigError::InitrdPathDoesNotExist(
                self.initrd_path.display().to_string(),
            )
            .into());
        }

        if self.num_vcpus == 0 {
            return Err(InvalidVmConfigError::NumVCPUsIsZero.into());
        }

        if self.memory_mib == 0 {
            return Err(InvalidVmConfigError::MemoryIsZero.into());
        }

        crate::Ok(())
    }
}
