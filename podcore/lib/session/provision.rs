use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{
    spec::{ContainerSpec, PodSpec, VolumeSpec},
    PodcoreResult,
};

use super::{DeviceOp, DiskFormat, Event, NetworkLink};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A container as reported by the image collaborator once created.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// The container's index within the pod spec.
    pub index: u32,

    /// The created container's id.
    pub id: String,

    /// The container's name from the pod spec.
    pub name: String,

    /// The staged rootfs path on the host.
    pub rootfs: PathBuf,

    /// The backing image reference.
    pub image: String,

    /// The rootfs filesystem type.
    pub fstype: String,

    /// The working directory for the container's command.
    pub workdir: String,

    /// The environment map for the container's command.
    pub envs: HashMap<String, String>,

    /// The command to execute.
    pub command: Vec<String>,

    /// The block backing file, when the rootfs is block-storage-backed and
    /// needs a monitor disk-attach before the guest can see it.
    pub block_backing: Option<BlockBacking>,
}

/// A volume as reported by the storage collaborator once ready.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    /// The volume's name from the pod spec.
    pub name: String,

    /// The volume's path on the host.
    pub path: PathBuf,

    /// The volume's filesystem type.
    pub fstype: String,

    /// The on-disk format, when the volume is block-storage-backed; `None`
    /// for volumes reached through the shared filesystem.
    pub format: Option<DiskFormat>,
}

/// The backing file of a block-storage-backed artifact.
#[derive(Debug, Clone)]
pub struct BlockBacking {
    /// The backing file path on the host.
    pub path: PathBuf,

    /// The on-disk format of the backing file.
    pub format: DiskFormat,
}

/// The image/filesystem-staging collaborator.
///
/// Invoked as an opaque provisioning step; implementations pull images,
/// stage filesystems, and eventually report "container created" or
/// "volume ready".
#[async_trait]
pub trait PodProvisioner: Send + Sync + 'static {
    /// Creates a container from its spec, staging its root filesystem.
    async fn create_container(
        &self,
        index: u32,
        spec: &ContainerSpec,
    ) -> PodcoreResult<ContainerInfo>;

    /// Prepares a declared volume.
    async fn prepare_volume(&self, spec: &VolumeSpec) -> PodcoreResult<VolumeInfo>;
}

/// The bridge/tap network collaborator, consumed only through an
/// "allocate address" call.
#[async_trait]
pub trait NetworkAllocator: Send + Sync + 'static {
    /// Allocates a tap-backed link, optionally at a requested address.
    async fn allocate(&self, index: u32, address: Option<&str>) -> PodcoreResult<NetworkLink>;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Spawns one provisioning task per container, volume, and network link of
/// the pod. Each task runs concurrently and reports back to the hub with a
/// created/ready event, or with a device failure that is fatal to the
/// session.
pub fn spawn_provisioning_tasks(
    pod: &PodSpec,
    provisioner: Arc<dyn PodProvisioner>,
    allocator: Arc<dyn NetworkAllocator>,
    hub_tx: mpsc::Sender<Event>,
) {
    for (index, container) in pod.containers.iter().enumerate() {
        let provisioner = provisioner.clone();
        let hub_tx = hub_tx.clone();
        let container = container.clone();
        tokio::spawn(async move {
            let event = match provisioner.create_container(index as u32, &container).await {
                Ok(info) => Event::ContainerCreated(info),
                Err(e) => {
                    warn!(container = %container.name, error = %e, "container creation failed");
                    Event::DeviceFailed {
                        op: DeviceOp::ContainerCreate,
                        detail: e.to_string(),
                    }
                }
            };
            let _ = hub_tx.send(event).await;
        });
    }

    for volume in pod.volumes.iter() {
        let provisioner = provisioner.clone();
        let hub_tx = hub_tx.clone();
        let volume = volume.clone();
        tokio::spawn(async move {
            let event = match provisioner.prepare_volume(&volume).await {
                Ok(info) => Event::VolumeReady(info),
                Err(e) => {
                    warn!(volume = %volume.name, error = %e, "volume preparation failed");
                    Event::DeviceFailed {
                        op: DeviceOp::VolumePrepare,
                        detail: e.to_string(),
                    }
                }
            };
            let _ = hub_tx.send(event).await;
        });
    }

    for (index, network) in pod.networks.iter().enumerate() {
        let allocator = allocator.clone();
        let hub_tx = hub_tx.clone();
        let address = network.address.clone();
        tokio::spawn(async move {
            let event = match allocator.allocate(index as u32, address.as_deref()).await {
                Ok(link) => Event::NetworkCreated(link),
                Err(e) => {
                    warn!(index, error = %e, "network allocation failed");
                    Event::DeviceFailed {
                        op: DeviceOp::NetworkAllocate,
                        detail: e.to_string(),
                    }
                }
            };
            let _ = hub_tx.send(event).await;
        });
    }
}
