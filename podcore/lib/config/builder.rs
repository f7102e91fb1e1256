use std::{env::temp_dir, path::PathBuf, time::Duration};

use crate::PodcoreResult;

use super::{
    VmConfig, DEFAULT_CHANNEL_ACK_TIMEOUT, DEFAULT_FORCED_QUIT_TIMEOUT,
    DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT, DEFAULT_MEMORY_MIB, DEFAULT_NUM_VCPUS,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The builder for a VM configuration.
///
/// ## Required Fields
/// - `kernel_path`: The path to the guest kernel image.
/// - `initrd_path`: The path to the guest initrd image.
///
/// ## Optional Fields
/// - `hypervisor_path`: The path to the hypervisor executable.
/// - `num_vcpus`: The number of virtual CPUs to use for the VM.
/// - `memory_mib`: The amount of memory in MiB to use for the VM.
/// - `run_dir`: The directory holding the session's sockets and logs.
/// - `graceful_shutdown_timeout`: Grace period before a forced monitor quit.
/// - `forced_quit_timeout`: Grace period before a hard process kill.
/// - `channel_ack_timeout`: Deadline for guest init acknowledgements.
#[derive(Debug)]
pub struct VmConfigBuilder<K, I> {
    hypervisor_path: PathBuf,
    kernel_path: K,
    initrd_path: I,
    num_vcpus: u8,
    memory_mib: u32,
    run_dir: PathBuf,
    graceful_shutdown_timeout: Duration,
    forced_quit_timeout: Duration,
    channel_ack_timeout: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<K, I> VmConfigBuilder<K, I> {
    /// Sets the path to the hypervisor executable.
    pub fn hypervisor_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.hypervisor_path = path.into();
        self
    }

    /// Sets the path to the guest kernel image.
    pub fn kernel_path(self, path: impl Into<PathBuf>) -> VmConfigBuilder<PathBuf, I> {
        VmConfigBuilder {
            hypervisor_path: self.hypervisor_path,
            kernel_path: path.into(),
            initrd_path: self.initrd_path,
            num_vcpus: self.num_vcpus,
            memory_mib: self.memory_mib,
            run_dir: self.run_dir,
            graceful_shutdown_timeout: self.graceful_shutdown_timeout,
            forced_quit_timeout: self.forced_quit_timeout,
            channel_ack_timeout: self.channel_ack_timeout,
        }
    }

    /// Sets the path to the guest initrd image.
    pub fn initrd_path(self, path: impl Into<PathBuf>) -> VmConfigBuilder<K, PathBuf> {
        VmConfigBuilder {
            hypervisor_path: self.hypervisor_path,
            kernel_path: self.kernel_path,
            initrd_path: path.into(),
            num_vcpus: self.num_vcpus,
            memory_mib: self.memory_mib,
            run_dir: self.run_dir,
            graceful_shutdown_timeout: self.graceful_shutdown_timeout,
            forced_quit_timeout: self.forced_quit_timeout,
            channel_ack_timeout: self.channel_ack_timeout,
        }
    }

    /// Sets the number of vCPUs to use for the VM.
    pub fn num_vcpus(mut self, num_vcpus: u8) -> Self {
        self.num_vcpus = num_vcpus;
        self
    }

    /// Sets the amount of memory in MiB to use for the VM.
    pub fn memory_mib(mut self, memory_mib: u32) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    /// Sets the directory holding the session's sockets and logs.
    pub fn run_dir(mut self, run_dir: impl Into<PathBuf>) -> Self {
        self.run_dir = run_dir.into();
        self
    }

    /// Sets the grace period before a forced monitor quit.
    pub fn graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    /// Sets the grace period before a hard process kill.
    pub fn forced_quit_timeout(mut self, timeout: Duration) -> Self {
        self.forced_quit_timeout = timeout;
        self
    }

    /// Sets the deadline for guest init acknowledgements.
    pub fn channel_ack_timeout(mut self, timeout: Duration) -> Self {
        self.channel_ack_timeout = timeout;
        self
    }
}

impl VmConfigBuilder<PathBuf, PathBuf> {
    /// Builds and validates the VM configuration.
    pub fn build(self) -> PodcoreResult<VmConfig> {
        let config = VmConfig::from_parts(
            self.hypervisor_path,
            self.kernel_path,
            self.initrd_path,
            self.num_vcpus,
            self.memory_mib,
            self.run_dir,
            self.graceful_shutdown_timeout,
            self.forced_quit_timeout,
            self.channel_ack_timeout,
        );
        config.validate()?;
        crate::Ok(config)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for VmConfigBuilder<(), ()> {
    fn default() -> Self {
        Self {
            hypervisor_path: PathBuf::from("qemu-system-x86_64"),
            kernel_path: (),
            initrd_path: (),
            num_vcpus: DEFAULT_NUM_VCPUS,
            memory_mib: DEFAULT_MEMORY_MIB,
            run_dir: temp_dir(),
            graceful_shutdown_timeout: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT,
            forced_quit_timeout: DEFAULT_FORCED_QUIT_TIMEOUT,
            channel_ack_timeout: DEFAULT_CHANNEL_ACK_TIMEOUT,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InvalidVmConfigError, PodcoreError};
    use tempfile::NamedTempFile;

    #[test]
    fn test_vm_config_builder_defaults() -> anyhow::Result<()> {
        let kernel = NamedTempFile::new()?;
        let initrd = NamedTempFile::new()?;

        let config = VmConfig::builder()
            .kernel_path(kernel.path())
            .initrd_path(initrd.path())
            .build()?;

        assert_eq!(*config.get_num_vcpus(), DEFAULT_NUM_VCPUS);
        assert_eq!(*config.get_memory_mib(), DEFAULT_MEMORY_MIB);
        assert_eq!(
            *config.get_graceful_shutdown_timeout(),
            DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT
        );
        Ok(())
    }

    #[test]
    fn test_vm_config_builder_rejects_zero_vcpus() -> anyhow::Result<()> {
        let kernel = NamedTempFile::new()?;
        let initrd = NamedTempFile::new()?;

        let result = VmConfig::builder()
            .kernel_path(kernel.path())
            .initrd_path(initrd.path())
            .num_vcpus(0)
            .build();

        assert!(matches!(
            result,
            Err(PodcoreError::InvalidVmConfig(
                InvalidVmConfigError::NumVCPUsIsZero
            ))
        ));
        Ok(())
    }

    #[test]
    fn test_vm_config_builder_rejects_missing_kernel() -> anyhow::Result<()> {
        let initrd = NamedTempFile::new()?;

        let result = VmConfig::builder()
            .kernel_path("/nonexistent/bzImage")
            .initrd_path(initrd.path())
            .build();

        assert!(matches!(
            result,
            Err(PodcoreError::InvalidVmConfig(
                InvalidVmConfigError::KernelPathDoesNotExist(_)
            ))
        ));
        Ok(())
    }
}
