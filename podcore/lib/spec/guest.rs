use serde::{Deserialize, Serialize};

use super::PodSpec;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The resolved, VM-facing description of a pod.
///
/// Derived once from the user-supplied [`PodSpec`] at session start and
/// progressively filled in as containers, volumes, and network links resolve
/// to concrete guest devices. Sent to the guest init process exactly once,
/// as the start-pod payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestSpec {
    /// The pod's hostname inside the guest.
    pub hostname: String,

    /// The containers in guest-device terms.
    pub containers: Vec<GuestContainer>,

    /// The network interfaces to bring up inside the guest.
    pub interfaces: Vec<GuestInterface>,

    /// The routes to install inside the guest.
    pub routes: Vec<GuestRoute>,

    /// The guest-side path of the init channel socket.
    pub channel_path: String,
}

/// One container of the pod, described in guest-device terms.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestContainer {
    /// The container's id, as reported by the image collaborator.
    pub id: String,

    /// The container's name from the pod spec.
    pub name: String,

    /// The guest block device carrying the container's root filesystem,
    /// empty until device insertion is confirmed.
    #[serde(default)]
    pub rootfs_device: String,

    /// The filesystem type of the rootfs device.
    #[serde(default)]
    pub fstype: String,

    /// The volumes visible to this container.
    #[serde(default)]
    pub volumes: Vec<GuestVolume>,

    /// Host-shared directories mapped into the container.
    #[serde(default)]
    pub fsmap: Vec<FsMapEntry>,

    /// The environment variables for the container's command.
    #[serde(default)]
    pub envs: Vec<EnvVar>,

    /// The command to execute.
    #[serde(default)]
    pub command: Vec<String>,

    /// The working directory for the command.
    #[serde(default)]
    pub workdir: String,
}

/// A volume resolved to a guest block device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestVolume {
    /// The guest block device carrying the volume.
    pub device: String,

    /// The filesystem type of the device.
    pub fstype: String,

    /// Where the volume is mounted inside the container.
    pub mount_path: String,
}

/// A host directory shared into the guest through the shared filesystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsMapEntry {
    /// The source path within the shared directory.
    pub source: String,

    /// The mount path inside the container.
    pub path: String,
}

/// An environment variable pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    /// The variable's name.
    pub env: String,

    /// The variable's value.
    pub value: String,
}

/// A network interface to bring up inside the guest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestInterface {
    /// The guest device name, e.g. "eth0".
    pub device: String,

    /// The interface's IP address.
    pub ip_address: String,

    /// The interface's network mask.
    pub net_mask: String,
}

/// A route to install inside the guest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestRoute {
    /// The destination network, or "default".
    pub dest: String,

    /// The gateway address, if any.
    #[serde(default)]
    pub gateway: String,

    /// The device the route goes through.
    #[serde(default)]
    pub device: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GuestSpec {
    /// Derives the initial guest spec from a user pod spec.
    ///
    /// Containers, interfaces, and routes are filled in progressively as the
    /// collaborators resolve them; this only carries over what is known up
    /// front.
    pub fn from_pod_spec(pod: &PodSpec, channel_path: impl Into<String>) -> Self {
        Self {
            hostname: pod.hostname.clone(),
            containers: Vec::new(),
            interfaces: Vec::new(),
            routes: Vec::new(),
            channel_path: channel_path.into(),
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
    fn test_guest_spec_serializes_with_camel_case_keys() -> anyhow::Result<()> {
        let spec = GuestSpec {
            hostname: "pod-0".into(),
            containers: vec![GuestContainer {
                id: "c-1".into(),
                name: "app".into(),
                rootfs_device: "sda".into(),
                fstype: "ext4".into(),
                ..Default::default()
            }],
            interfaces: vec![GuestInterface {
                device: "eth0".into(),
                ip_address: "10.0.0.2".into(),
                net_mask: "255.255.255.0".into(),
            }],
            routes: vec![],
            channel_path: "/dev/vport0p1".into(),
        };

        let json = serde_json::to_value(&spec)?;
        assert_eq!(json["hostname"], "pod-0");
        assert_eq!(json["containers"][0]["rootfsDevice"], "sda");
        assert_eq!(json["interfaces"][0]["ipAddress"], "10.0.0.2");
        assert_eq!(json["channelPath"], "/dev/vport0p1");
        Ok(())
    }

    #[test]
    fn test_guest_spec_derivation_carries_hostname() {
        let pod = PodSpec {
            hostname: "web".into(),
            ..Default::default()
        };
        let spec = GuestSpec::from_pod_spec(&pod, "/run/pod/channel.sock");
        assert_eq!(spec.hostname, "web");
        assert!(spec.containers.is_empty());
    }
}
