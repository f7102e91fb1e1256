use std::os::fd::OwnedFd;
use std::path::Path;

use serde_json::{json, Value};

use crate::{
    session::{scsi_device_name, DeviceOp, DiskFormat, Event, NetworkLink},
    PodcoreResult,
};

use super::MonitorRequest;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One low-level monitor command, with an optional file descriptor passed
/// out-of-band on the same sendmsg as the command line.
#[derive(Debug)]
pub struct QmpCommand {
    /// The command name.
    pub name: String,

    /// The command arguments; `Null` when the command takes none.
    pub arguments: Value,

    /// A file descriptor to pass with the command.
    pub fd: Option<OwnedFd>,
}

/// An ordered list of monitor commands that execute atomically as one unit.
///
/// Sessions are queued on the engine; only one session's commands run at a
/// time, strictly in order. On success the completion event is pushed to the
/// hub; on failure a device-failure event carrying `fail_op` is pushed
/// instead.
#[derive(Debug)]
pub struct MonitorSession {
    /// The commands to execute, in order.
    pub commands: Vec<QmpCommand>,

    /// The event to enqueue on success.
    pub done: Option<Event>,

    /// The device operation to report on failure; `None` suppresses the
    /// failure event (used by the forced quit, where escalation continues on
    /// a timer regardless).
    pub fail_op: Option<DeviceOp>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl QmpCommand {
    /// Creates a command with arguments.
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            fd: None,
        }
    }

    /// Creates a command that passes a file descriptor out-of-band.
    pub fn with_fd(name: impl Into<String>, arguments: Value, fd: OwnedFd) -> Self {
        Self {
            name: name.into(),
            arguments,
            fd: Some(fd),
        }
    }

    /// Serializes the command to its wire line, without the trailing newline.
    pub fn to_wire_line(&self) -> PodcoreResult<String> {
        let arguments = match &self.arguments {
            Value::Null => None,
            other => Some(other),
        };
        let line = serde_json::to_string(&MonitorRequest {
            execute: &self.name,
            arguments,
        })?;
        crate::Ok(line)
    }
}

impl MonitorSession {
    /// Builds the two-command disk-attach session: attach the backing store,
    /// then attach the controller-visible device at the given SCSI id.
    ///
    /// Returns the session and the guest device name derived from the id.
    pub fn disk_attach(
        owner: impl Into<String>,
        path: &Path,
        format: DiskFormat,
        scsi_id: u32,
    ) -> (Self, String) {
        let owner = owner.into();
        let device = scsi_device_name(scsi_id);
        let node = format!("drive-{}", device);

        let commands = vec![
            QmpCommand::new(
                "blockdev-add",
                json!({
                    "node-name": node,
                    "driver": format.to_string(),
                    "file": { "driver": "file", "filename": path.display().to_string() },
                }),
            ),
            QmpCommand::new(
                "device_add",
                json!({
                    "driver": "scsi-hd",
                    "drive": node,
                    "id": device,
                    "scsi-id": scsi_id,
                }),
            ),
        ];

        let session = Self {
            commands,
            done: Some(Event::BlockDeviceInserted {
                name: owner,
                device: device.clone(),
            }),
            fail_op: Some(DeviceOp::DiskAttach),
        };
        (session, device)
    }

    /// Builds the network-attach session: pass the tap file descriptor,
    /// create the virtual network backend, then attach the PCI device at the
    /// allocated slot. The fd command is skipped when the link carries no
    /// descriptor and the backend opens the tap by name instead.
    pub fn network_attach(link: &mut NetworkLink, pci_slot: u32) -> Self {
        let index = link.index;
        let fdname = format!("tapfd-{}", index);
        let netdev = format!("netdev-{}", index);
        let mut commands = Vec::new();

        let backend_args = match link.fd.take() {
            Some(fd) => {
                commands.push(QmpCommand::with_fd(
                    "getfd",
                    json!({ "fdname": fdname }),
                    fd,
                ));
                json!({ "type": "tap", "id": netdev, "fd": fdname })
            }
            None => json!({ "type": "tap", "id": netdev, "ifname": link.host_device }),
        };
        commands.push(QmpCommand::new("netdev_add", backend_args));
        commands.push(QmpCommand::new(
            "device_add",
            json!({
                "driver": "virtio-net-pci",
                "netdev": netdev,
                "id": format!("net-{}", index),
                "addr": format!("{:#x}", pci_slot),
            }),
        ));

        Self {
            commands,
            done: Some(Event::NetworkInserted { index }),
            fail_op: Some(DeviceOp::NetworkAttach),
        }
    }

    /// Builds the single-command forced quit session.
    pub fn quit() -> Self {
        Self {
            commands: vec![QmpCommand::new("quit", Value::Null)],
            done: None,
            fail_op: None,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
