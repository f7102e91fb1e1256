use std::collections::HashMap;

use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A user-declared group of containers sharing one VM session.
///
/// This is the parsed form handed to the session orchestrator; validation of
/// the raw pod JSON happens in the caller's front end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// The pod's hostname inside the guest.
    pub hostname: String,

    /// The containers that make up the pod.
    pub containers: Vec<ContainerSpec>,

    /// The volumes declared by the pod, shared between containers.
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,

    /// The network links the pod expects.
    #[serde(default)]
    pub networks: Vec<NetworkRequest>,
}

/// One container within a pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// The container's name, unique within the pod.
    pub name: String,

    /// The image reference the container is created from.
    pub image: String,

    /// The command to execute inside the container.
    #[serde(default)]
    pub command: Vec<String>,

    /// The environment variables for the command.
    #[serde(default)]
    pub envs: HashMap<String, String>,

    /// The working directory for the command.
    #[serde(default)]
    pub workdir: String,

    /// The volumes mounted into this container.
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

/// A volume declared at the pod level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// The volume's name, unique within the pod.
    pub name: String,
}

/// A mount of a pod volume into a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// The name of the pod volume being mounted.
    pub volume: String,

    /// Where the volume appears inside the container.
    pub mount_path: String,
}

/// A network link the pod expects, resolved by the network collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    /// The address to request from the allocator, if any.
    #[serde(default)]
    pub address: Option<String>,
}
