use std::{
    collections::{BTreeMap, HashMap},
    os::fd::OwnedFd,
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The session's keyed device collections: image descriptors by name,
/// volume descriptors by name, network links by index.
///
/// Mutated only by the session state machine in response to
/// provisioning-completion events; no other task holds a reference.
#[derive(Debug, Default)]
pub struct DeviceMap {
    /// Image-backed block descriptors, keyed by container name.
    images: HashMap<String, BlockDescriptor>,

    /// Volume block descriptors, keyed by volume name.
    volumes: HashMap<String, BlockDescriptor>,

    /// Network links, keyed by interface index.
    networks: BTreeMap<u32, NetworkLink>,
}

/// One block-type device: its backing file on the host and, once insertion
/// is confirmed, its assigned guest device name.
#[derive(Debug, Clone)]
pub struct BlockDescriptor {
    /// The logical name (container or volume name).
    pub name: String,

    /// The backing file path on the host.
    pub path: PathBuf,

    /// The on-disk format of the backing file.
    pub format: DiskFormat,

    /// The filesystem type inside the device.
    pub fstype: String,

    /// The assigned guest device name; empty until insertion is confirmed.
    pub device_name: String,
}

/// The on-disk format of a block device's backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    /// A raw disk image.
    Raw,

    /// A qcow2 disk image.
    Qcow2,
}

/// A tap-backed network link as handed out by the network collaborator.
#[derive(Debug)]
pub struct NetworkLink {
    /// The link's index within the pod.
    pub index: u32,

    /// The host-side tap device name.
    pub host_device: String,

    /// The open tap file descriptor, passed to the hypervisor over the
    /// monitor socket. Taken out of the link when the insertion session is
    /// built.
    pub fd: Option<OwnedFd>,

    /// The guest-side interface address.
    pub ip_address: String,

    /// The guest-side network mask.
    pub net_mask: String,

    /// The gateway address, if any.
    pub gateway: Option<String>,

    /// The guest device name; empty until insertion is confirmed.
    pub guest_device: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DeviceMap {
    /// Creates an empty device map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an image-backed block descriptor.
    pub fn insert_image(&mut self, descriptor: BlockDescriptor) {
        self.images.insert(descriptor.name.clone(), descriptor);
    }

    /// Records a volume block descriptor.
    pub fn insert_volume(&mut self, descriptor: BlockDescriptor) {
        self.volumes.insert(descriptor.name.clone(), descriptor);
    }

    /// Records a network link.
    pub fn insert_network(&mut self, link: NetworkLink) {
        self.networks.insert(link.index, link);
    }

    /// Looks up an image descriptor by container name.
    pub fn image(&self, name: &str) -> Option<&BlockDescriptor> {
        self.images.get(name)
    }

    /// Looks up a volume descriptor by volume name.
    pub fn volume(&self, name: &str) -> Option<&BlockDescriptor> {
        self.volumes.get(name)
    }

    /// Looks up a network link by index.
    pub fn network(&self, index: u32) -> Option<&NetworkLink> {
        self.networks.get(&index)
    }

    /// Looks up a network link mutably by index.
    pub fn network_mut(&mut self, index: u32) -> Option<&mut NetworkLink> {
        self.networks.get_mut(&index)
    }

    /// Records the guest device name assigned to an inserted block device,
    /// searching images first, then volumes.
    ///
    /// Returns whether a descriptor with that logical name existed.
    pub fn set_block_device_name(&mut self, name: &str, device_name: &str) -> bool {
        if let Some(descriptor) = self.images.get_mut(name) {
            descriptor.device_name = device_name.to_string();
            return true;
        }
        if let Some(descriptor) = self.volumes.get_mut(name) {
            descriptor.device_name = device_name.to_string();
            return true;
        }
        false
    }

    /// Iterates over all network links in index order.
    pub fn networks(&self) -> impl Iterator<Item = &NetworkLink> {
        self.networks.values()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskFormat::Raw => write!(f, "raw"),
            DiskFormat::Qcow2 => write!(f, "qcow2"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_name_assignment_reaches_images_and_volumes() {
        let mut map = DeviceMap::new();
        map.insert_image(BlockDescriptor {
            name: "web".into(),
            path: "/var/lib/pods/web.img".into(),
            format: DiskFormat::Raw,
            fstype: "ext4".into(),
            device_name: String::new(),
        });
        map.insert_volume(BlockDescriptor {
            name: "data".into(),
            path: "/var/lib/pods/data.qcow2".into(),
            format: DiskFormat::Qcow2,
            fstype: "xfs".into(),
            device_name: String::new(),
        });

        assert!(map.set_block_device_name("web", "sda"));
        assert!(map.set_block_device_name("data", "sdb"));
        assert!(!map.set_block_device_name("missing", "sdc"));

        assert_eq!(map.image("web").unwrap().device_name, "sda");
        assert_eq!(map.volume("data").unwrap().device_name, "sdb");
    }
}
