use std::{collections::HashMap, fmt, path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use getset::Getters;
use podutils::SupervisorHandle;
use tokio::{
    net::UnixStream,
    sync::{mpsc, oneshot},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    channel::{BoxedChannelClient, CMD_EXEC, CMD_SHUTDOWN, CMD_START_POD},
    config::VmConfig,
    qmp::{MonitorEngine, MonitorSession},
    serial::SerialMultiplexer,
    spec::{EnvVar, FsMapEntry, GuestContainer, GuestInterface, GuestRoute, GuestSpec, GuestVolume, PodSpec},
    PodcoreError,
};

use super::{
    spawn_provisioning_tasks, AddressAllocator, BlockDescriptor, ContainerInfo, DeviceMap,
    Event, NetworkAllocator, NetworkLink, PodProvisioner, ReadinessTracker, ResourceKind,
    ResultCode, SessionResult, TimeoutKind, VolumeInfo,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle state of a VM session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The pod spec has been received and devices are being attached.
    Init,

    /// The guest init accepted the pod and is executing containers.
    Running,

    /// Shutdown has been issued; awaiting guest acknowledgement or process
    /// exit, escalating on timers.
    Terminating,

    /// The hypervisor process has exited; resources are being released.
    CleaningUp,

    /// The session is finished.
    Closed,
}

/// One VM session: the single consumer of the hub event queue, owner of all
/// session-wide mutable state.
///
/// Every independently running task (process watcher, monitor reader, init
/// channel reader, serial pumps, provisioning tasks, timers) reports back by
/// posting an [`Event`]; the session applies it and issues follow-up commands
/// to the monitor engine and the init channel. Handlers never block on guest
/// progress: long operations run as tasks that loop back through the hub.
///
/// The only session state reachable outside this consumer is the PCI/SCSI
/// address allocator, which sits behind its own mutex.
#[derive(Getters)]
#[getset(get = "pub with_prefix")]
pub struct VmSession {
    /// The session's id.
    id: Uuid,

    /// When the session was created.
    created_at: DateTime<Utc>,

    /// When the session last applied an event.
    modified_at: DateTime<Utc>,

    /// The session's VM configuration.
    #[getset(skip)]
    config: VmConfig,

    /// The current lifecycle state.
    state: SessionState,

    /// The user-supplied pod spec.
    #[getset(skip)]
    pod: PodSpec,

    /// The resolved guest spec, finalized once when devices are ready.
    #[getset(skip)]
    guest_spec: GuestSpec,

    /// The session's device bookkeeping.
    #[getset(skip)]
    devices: DeviceMap,

    /// Volumes reached through the shared filesystem rather than a block
    /// device, kept aside until the guest spec is finalized.
    #[getset(skip)]
    shared_volumes: HashMap<String, VolumeInfo>,

    /// Pending provisioning operations gating pod start.
    #[getset(skip)]
    readiness: ReadinessTracker,

    /// The PCI/SCSI address counters.
    #[getset(skip)]
    addresses: Arc<AddressAllocator>,

    /// The producer side of the hub, cloned into timers and send tasks.
    #[getset(skip)]
    hub_tx: mpsc::Sender<Event>,

    /// The consumer side of the hub.
    #[getset(skip)]
    hub_rx: mpsc::Receiver<Event>,

    /// The guest init channel's write side.
    #[getset(skip)]
    channel: Arc<BoxedChannelClient>,

    /// The monitor protocol engine.
    #[getset(skip)]
    monitor: MonitorEngine,

    /// The hypervisor process's signal handle.
    #[getset(skip)]
    supervisor: SupervisorHandle,

    /// The image/filesystem-staging collaborator.
    #[getset(skip)]
    provisioner: Arc<dyn PodProvisioner>,

    /// The network collaborator.
    #[getset(skip)]
    network: Arc<dyn NetworkAllocator>,

    /// Serial multiplexers, keyed by container name; `None` is the console.
    #[getset(skip)]
    ttys: HashMap<Option<String>, SerialMultiplexer>,

    /// Whether start-pod has been sent; it goes out exactly once.
    #[getset(skip)]
    start_pod_sent: bool,

    /// The command code awaiting a guest acknowledgement, if any.
    #[getset(skip)]
    pending_ack: Option<u32>,

    /// Whether the forced monitor quit has been issued.
    #[getset(skip)]
    forced_quit_issued: bool,

    /// Where to deliver the run-pod result, pending until Running.
    #[getset(skip)]
    run_reply: Option<oneshot::Sender<SessionResult>>,

    /// Where to deliver the in-flight exec result, if any.
    #[getset(skip)]
    exec_reply: Option<oneshot::Sender<SessionResult>>,

    /// Callers waiting for shutdown to complete.
    #[getset(skip)]
    shutdown_replies: Vec<oneshot::Sender<SessionResult>>,

    /// The first fatal failure, reported to all callers at close.
    #[getset(skip)]
    failure: Option<SessionResult>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmSession {
    /// Creates a session over already-connected collaborators.
    ///
    /// ## Arguments
    ///
    /// * `config` - The VM configuration
    /// * `pod` - The pod to run
    /// * `channel` - The guest init channel's write side
    /// * `monitor` - The monitor protocol engine, handshake complete
    /// * `supervisor` - The hypervisor process's signal handle
    /// * `provisioner` - The image/filesystem-staging collaborator
    /// * `network` - The network collaborator
    /// * `hub_tx` / `hub_rx` - The hub event queue
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: VmConfig,
        pod: PodSpec,
        channel: Arc<BoxedChannelClient>,
        monitor: MonitorEngine,
        supervisor: SupervisorHandle,
        provisioner: Arc<dyn PodProvisioner>,
        network: Arc<dyn NetworkAllocator>,
        hub_tx: mpsc::Sender<Event>,
        hub_rx: mpsc::Receiver<Event>,
    ) -> Self {
        let guest_spec = GuestSpec::from_pod_spec(&pod, crate::config::GUEST_CHANNEL_PATH);
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            created_at: now,
            modified_at: now,
            config,
            state: SessionState::Init,
            pod,
            guest_spec,
            devices: DeviceMap::new(),
            shared_volumes: HashMap::new(),
            readiness: ReadinessTracker::new(),
            addresses: Arc::new(AddressAllocator::new()),
            hub_tx,
            hub_rx,
            channel,
            monitor,
            supervisor,
            provisioner,
            network,
            ttys: HashMap::new(),
            start_pod_sent: false,
            pending_ack: None,
            forced_quit_issued: false,
            run_reply: None,
            exec_reply: None,
            shutdown_replies: Vec::new(),
            failure: None,
        }
    }

    /// Starts the session's event loop, kicking off device provisioning.
    ///
    /// Returns the command handle and the receiver on which the run-pod
    /// result is delivered once the guest accepts the pod (or the session
    /// fails first).
    pub fn spawn(mut self) -> (super::SessionHandle, oneshot::Receiver<SessionResult>) {
        let (run_tx, run_rx) = oneshot::channel();
        self.run_reply = Some(run_tx);
        let hub_tx = self.hub_tx.clone();
        let join = tokio::spawn(self.run());
        (super::SessionHandle::new(hub_tx, join), run_rx)
    }

    async fn run(mut self) {
        info!(session = %self.id, pod = %self.pod.hostname, "session started");
        self.begin();

        while let Some(event) = self.hub_rx.recv().await {
            self.modified_at = Utc::now();
            self.handle(event).await;
            if matches!(self.state, SessionState::Closed) {
                break;
            }
        }
    }

    /// Populates the readiness tracker and launches one provisioning task
    /// per container, volume, and network link.
    fn begin(&mut self) {
        for container in &self.pod.containers {
            self.readiness
                .start_adding(ResourceKind::Container, container.name.clone());
        }
        for volume in &self.pod.volumes {
            self.readiness
                .start_adding(ResourceKind::Volume, volume.name.clone());
        }
        for index in 0..self.pod.networks.len() {
            self.readiness
                .start_adding(ResourceKind::Network, net_id(index as u32));
        }

        spawn_provisioning_tasks(
            &self.pod,
            self.provisioner.clone(),
            self.network.clone(),
            self.hub_tx.clone(),
        );

        // A pod with no resources is ready immediately.
        self.check_readiness();
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::ProcessExited { code } => self.on_process_exited(code),
            Event::MonitorEvent { name, data } => {
                info!(session = %self.id, event = %name, data = %data, "monitor event");
                if name == "SHUTDOWN"
                    && !matches!(self.state, SessionState::CleaningUp | SessionState::Closed)
                {
                    self.begin_cleanup();
                }
            }
            Event::CommandAck { code, payload } => self.on_command_ack(code, payload),
            Event::ContainerCreated(info) => self.on_container_created(info).await,
            Event::VolumeReady(info) => self.on_volume_ready(info).await,
            Event::BlockDeviceInserted { name, device } => self.on_block_inserted(name, device),
            Event::NetworkCreated(link) => self.on_network_created(link).await,
            Event::NetworkInserted { index } => self.on_network_inserted(index),
            Event::SerialAttached { container, path } => self.on_serial_attached(container, path),
            Event::TtyOpened { container, stream } => self.on_tty_opened(container, stream),
            Event::InitFailed { reason } => {
                self.on_fatal(SessionResult::new(ResultCode::InitFail, reason))
                    .await
            }
            Event::DeviceFailed { op, detail } => {
                let cause = format!("{:?} failed: {}", op, detail);
                self.on_fatal(SessionResult::new(ResultCode::DeviceFail, cause))
                    .await
            }
            Event::ShutdownRequested { reply } => self.on_shutdown_requested(reply),
            Event::ExecRequested {
                container,
                cmd,
                reply,
            } => self.on_exec_requested(container, cmd, reply),
            Event::AttachRequested { container, reply } => {
                self.on_attach_requested(container, reply).await
            }
            Event::DetachRequested {
                container,
                observer,
                reply,
            } => self.on_detach_requested(container, observer, reply).await,
            Event::Timeout(kind) => self.on_timeout(kind).await,
        }
    }

    fn on_process_exited(&mut self, code: Option<i32>) {
        match self.state {
            SessionState::CleaningUp => self.close(),
            SessionState::Closed => debug!(session = %self.id, "duplicate process exit event"),
            _ => {
                info!(session = %self.id, code = ?code, "hypervisor process exited");
                self.release_resources();
                self.close();
            }
        }
    }

    fn on_command_ack(&mut self, code: u32, payload: Bytes) {
        match self.pending_ack {
            Some(expected) if expected == code => {
                self.pending_ack = None;
                match code {
                    CMD_START_POD => match self.state {
                        SessionState::Init | SessionState::Running => {
                            info!(session = %self.id, "guest accepted the pod");
                            self.state = SessionState::Running;
                            if let Some(reply) = self.run_reply.take() {
                                let _ = reply.send(SessionResult::ok());
                            }
                        }
                        state => {
                            debug!(session = %self.id, state = %state, "start-pod acknowledged too late")
                        }
                    },
                    CMD_EXEC => {
                        info!(
                            session = %self.id,
                            output = %String::from_utf8_lossy(&payload),
                            "guest acknowledged exec"
                        );
                        if let Some(reply) = self.exec_reply.take() {
                            let _ = reply.send(SessionResult::ok());
                        }
                    }
                    CMD_SHUTDOWN => {
                        // Remain Terminating; process exit completes teardown.
                        info!(session = %self.id, "guest acknowledged shutdown");
                    }
                    _ => warn!(session = %self.id, code, "acknowledgement for unknown command"),
                }
            }
            _ => warn!(session = %self.id, code, "acknowledgement code does not match the command in flight"),
        }
    }

    async fn on_container_created(&mut self, info: ContainerInfo) {
        if !matches!(self.state, SessionState::Init) {
            warn!(session = %self.id, container = %info.name, state = %self.state, "container created outside Init, dropped");
            return;
        }
        info!(session = %self.id, container = %info.name, id = %info.id, "container created");

        let mut container = GuestContainer {
            id: info.id.clone(),
            name: info.name.clone(),
            fstype: info.fstype.clone(),
            command: info.command.clone(),
            workdir: info.workdir.clone(),
            envs: info
                .envs
                .iter()
                .map(|(env, value)| EnvVar {
                    env: env.clone(),
                    value: value.clone(),
                })
                .collect(),
            ..Default::default()
        };

        match &info.block_backing {
            Some(backing) => {
                self.devices.insert_image(BlockDescriptor {
                    name: info.name.clone(),
                    path: backing.path.clone(),
                    format: backing.format,
                    fstype: info.fstype.clone(),
                    device_name: String::new(),
                });
                self.readiness
                    .start_adding(ResourceKind::BlockDev, info.name.clone());
                let scsi_id = self.addresses.next_scsi_id();
                let (session, _device) =
                    MonitorSession::disk_attach(&info.name, &backing.path, backing.format, scsi_id);
                self.submit_monitor(session).await;
            }
            None => {
                // Rootfs reached through the shared filesystem.
                container.fsmap.push(FsMapEntry {
                    source: info.rootfs.display().to_string(),
                    path: "/".to_string(),
                });
            }
        }

        self.guest_spec.containers.push(container);
        self.readiness.finish(ResourceKind::Container, &info.name);
        self.check_readiness();
    }

    async fn on_volume_ready(&mut self, info: VolumeInfo) {
        if !matches!(self.state, SessionState::Init) {
            warn!(session = %self.id, volume = %info.name, state = %self.state, "volume ready outside Init, dropped");
            return;
        }
        info!(session = %self.id, volume = %info.name, "volume ready");

        self.readiness.finish(ResourceKind::Volume, &info.name);
        match info.format {
            Some(format) => {
                self.devices.insert_volume(BlockDescriptor {
                    name: info.name.clone(),
                    path: info.path.clone(),
                    format,
                    fstype: info.fstype.clone(),
                    device_name: String::new(),
                });
                self.readiness
                    .start_adding(ResourceKind::BlockDev, info.name.clone());
                let scsi_id = self.addresses.next_scsi_id();
                let (session, _device) =
                    MonitorSession::disk_attach(&info.name, &info.path, format, scsi_id);
                self.submit_monitor(session).await;
            }
            None => {
                self.shared_volumes.insert(info.name.clone(), info);
            }
        }
        self.check_readiness();
    }

    fn on_block_inserted(&mut self, name: String, device: String) {
        info!(session = %self.id, name = %name, device = %device, "block device inserted");
        if !self.devices.set_block_device_name(&name, &device) {
            warn!(session = %self.id, name = %name, "inserted block device has no descriptor");
        }
        self.readiness.finish(ResourceKind::BlockDev, &name);
        self.check_readiness();
    }

    async fn on_network_created(&mut self, mut link: NetworkLink) {
        if !matches!(self.state, SessionState::Init) {
            warn!(session = %self.id, index = link.index, state = %self.state, "network created outside Init, dropped");
            return;
        }
        info!(session = %self.id, index = link.index, host_device = %link.host_device, "network link created");

        link.guest_device = format!("eth{}", link.index);
        let pci_slot = self.addresses.next_pci_slot();
        let session = MonitorSession::network_attach(&mut link, pci_slot);
        self.devices.insert_network(link);

        // The link stays pending until insertion is confirmed.
        self.submit_monitor(session).await;
    }

    fn on_network_inserted(&mut self, index: u32) {
        info!(session = %self.id, index, "network device inserted");
        self.readiness.finish(ResourceKind::Network, &net_id(index));
        self.check_readiness();
    }

    fn on_serial_attached(&mut self, container: Option<String>, path: PathBuf) {
        info!(session = %self.id, container = ?container, path = %path.display(), "serial port attached");
        let hub_tx = self.hub_tx.clone();
        tokio::spawn(async move {
            match UnixStream::connect(&path).await {
                Ok(stream) => {
                    let _ = hub_tx.send(Event::TtyOpened { container, stream }).await;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to connect serial line")
                }
            }
        });
    }

    fn on_tty_opened(&mut self, container: Option<String>, stream: UnixStream) {
        let label = container.clone().unwrap_or_else(|| "console".to_string());
        debug!(session = %self.id, line = %label, "serial line open");
        let (read_half, write_half) = stream.into_split();
        let mux = SerialMultiplexer::spawn(label, read_half, write_half);
        self.ttys.insert(container, mux);
    }

    async fn on_fatal(&mut self, result: SessionResult) {
        match self.state {
            SessionState::Init | SessionState::Running => {
                error!(session = %self.id, code = ?result.code, cause = %result.cause, "fatal session failure");
                if self.failure.is_none() {
                    self.failure = Some(result.clone());
                }
                if let Some(reply) = self.run_reply.take() {
                    let _ = reply.send(result.clone());
                }
                if let Some(reply) = self.exec_reply.take() {
                    let _ = reply.send(result);
                }
                self.begin_shutdown();
            }
            SessionState::Terminating => {
                warn!(session = %self.id, cause = %result.cause, "failure while terminating");
                if self.failure.is_none() {
                    self.failure = Some(result);
                }
            }
            SessionState::CleaningUp | SessionState::Closed => {
                debug!(session = %self.id, cause = %result.cause, "failure after teardown, dropped")
            }
        }
    }

    fn on_shutdown_requested(&mut self, reply: Option<oneshot::Sender<SessionResult>>) {
        match self.state {
            SessionState::Init | SessionState::Running => {
                info!(session = %self.id, "shutdown requested");
                if let Some(reply) = reply {
                    self.shutdown_replies.push(reply);
                }
                self.begin_shutdown();
            }
            SessionState::Terminating | SessionState::CleaningUp => {
                if let Some(reply) = reply {
                    self.shutdown_replies.push(reply);
                }
            }
            SessionState::Closed => {
                if let Some(reply) = reply {
                    let _ = reply.send(self.failure.clone().unwrap_or_else(SessionResult::ok));
                }
            }
        }
    }

    fn on_exec_requested(
        &mut self,
        container: String,
        cmd: Vec<String>,
        reply: oneshot::Sender<SessionResult>,
    ) {
        if !matches!(self.state, SessionState::Running) {
            let _ = reply.send(SessionResult::new(
                ResultCode::CommandFail,
                format!("session is {}", self.state),
            ));
            return;
        }
        if self.pending_ack.is_some() {
            let _ = reply.send(SessionResult::new(
                ResultCode::CommandFail,
                "another guest command is in flight",
            ));
            return;
        }

        info!(session = %self.id, container = %container, "exec requested");
        self.pending_ack = Some(CMD_EXEC);
        self.exec_reply = Some(reply);
        self.arm_timeout(
            TimeoutKind::ChannelAck { code: CMD_EXEC },
            *self.config.get_channel_ack_timeout(),
        );

        let channel = self.channel.clone();
        let hub_tx = self.hub_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.exec(&container, &cmd).await {
                let _ = hub_tx
                    .send(Event::InitFailed {
                        reason: format!("failed to send exec: {}", e),
                    })
                    .await;
            }
        });
    }

    async fn on_attach_requested(
        &mut self,
        container: Option<String>,
        reply: oneshot::Sender<crate::PodcoreResult<crate::serial::TtyHandle>>,
    ) {
        let result = match self.ttys.get(&container) {
            Some(mux) => mux.attach().await,
            None => Err(no_serial_line(container)),
        };
        let _ = reply.send(result);
    }

    async fn on_detach_requested(
        &mut self,
        container: Option<String>,
        observer: u64,
        reply: oneshot::Sender<crate::PodcoreResult<()>>,
    ) {
        let result = match self.ttys.get(&container) {
            Some(mux) => mux.detach(observer).await,
            None => Err(no_serial_line(container)),
        };
        let _ = reply.send(result);
    }

    async fn on_timeout(&mut self, kind: TimeoutKind) {
        match kind {
            TimeoutKind::ChannelAck { code } => {
                if self.pending_ack == Some(code) {
                    self.pending_ack = None;
                    self.on_fatal(SessionResult::new(
                        ResultCode::InitFail,
                        format!("guest did not acknowledge command {} in time", code),
                    ))
                    .await;
                }
            }
            TimeoutKind::GracefulShutdown => {
                if matches!(self.state, SessionState::Terminating) && !self.forced_quit_issued {
                    warn!(session = %self.id, "graceful shutdown window elapsed, forcing monitor quit");
                    self.forced_quit_issued = true;
                    if let Err(e) = self.monitor.submit(MonitorSession::quit()).await {
                        // Escalation continues on the second timer regardless.
                        warn!(session = %self.id, error = %e, "failed to queue forced quit");
                    }
                    self.arm_timeout(
                        TimeoutKind::ForcedQuit,
                        *self.config.get_forced_quit_timeout(),
                    );
                }
            }
            TimeoutKind::ForcedQuit => {
                if matches!(
                    self.state,
                    SessionState::Terminating | SessionState::CleaningUp
                ) {
                    warn!(session = %self.id, "hypervisor still running after forced quit, killing process");
                    if let Err(e) = self.supervisor.kill() {
                        error!(session = %self.id, error = %e, "failed to kill hypervisor process");
                    }
                }
            }
        }
    }

    /// Evaluates overall device readiness; when everything is in, finalizes
    /// the guest spec and sends start-pod, exactly once per session.
    fn check_readiness(&mut self) {
        if self.start_pod_sent || !matches!(self.state, SessionState::Init) {
            return;
        }
        if !self.readiness.all_clear() {
            return;
        }

        self.finalize_guest_spec();
        self.start_pod_sent = true;
        self.pending_ack = Some(CMD_START_POD);
        self.arm_timeout(
            TimeoutKind::ChannelAck {
                code: CMD_START_POD,
            },
            *self.config.get_channel_ack_timeout(),
        );

        info!(session = %self.id, "pod devices ready, sending start-pod");
        let channel = self.channel.clone();
        let spec = self.guest_spec.clone();
        let hub_tx = self.hub_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.start_pod(&spec).await {
                let _ = hub_tx
                    .send(Event::InitFailed {
                        reason: format!("failed to send start-pod: {}", e),
                    })
                    .await;
            }
        });
    }

    /// Resolves device names into the guest spec from the device map.
    fn finalize_guest_spec(&mut self) {
        for container in &mut self.guest_spec.containers {
            if let Some(descriptor) = self.devices.image(&container.name) {
                container.rootfs_device = descriptor.device_name.clone();
            }
        }

        for pod_container in &self.pod.containers {
            let Some(guest) = self
                .guest_spec
                .containers
                .iter_mut()
                .find(|c| c.name == pod_container.name)
            else {
                continue;
            };
            for mount in &pod_container.volume_mounts {
                if let Some(descriptor) = self.devices.volume(&mount.volume) {
                    guest.volumes.push(GuestVolume {
                        device: descriptor.device_name.clone(),
                        fstype: descriptor.fstype.clone(),
                        mount_path: mount.mount_path.clone(),
                    });
                } else if let Some(info) = self.shared_volumes.get(&mount.volume) {
                    guest.fsmap.push(FsMapEntry {
                        source: info.path.display().to_string(),
                        path: mount.mount_path.clone(),
                    });
                } else {
                    warn!(volume = %mount.volume, "volume mount references unknown volume");
                }
            }
        }

        for link in self.devices.networks() {
            self.guest_spec.interfaces.push(GuestInterface {
                device: link.guest_device.clone(),
                ip_address: link.ip_address.clone(),
                net_mask: link.net_mask.clone(),
            });
            if let Some(gateway) = &link.gateway {
                self.guest_spec.routes.push(GuestRoute {
                    dest: "default".to_string(),
                    gateway: gateway.clone(),
                    device: link.guest_device.clone(),
                });
            }
        }
    }

    /// Sends shutdown to the guest and arms the graceful window.
    fn begin_shutdown(&mut self) {
        self.state = SessionState::Terminating;
        self.pending_ack = Some(CMD_SHUTDOWN);
        info!(session = %self.id, "sending shutdown to guest");

        let channel = self.channel.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.shutdown().await {
                warn!(error = %e, "failed to send guest shutdown");
            }
        });

        self.arm_timeout(
            TimeoutKind::GracefulShutdown,
            *self.config.get_graceful_shutdown_timeout(),
        );
    }

    /// Enters cleanup once the guest has announced its shutdown. The session
    /// stays on the hub until the hypervisor process exit arrives; a kill
    /// timer covers a hypervisor that lingers after its guest is gone.
    fn begin_cleanup(&mut self) {
        self.release_resources();
        if !self.forced_quit_issued {
            self.forced_quit_issued = true;
            self.arm_timeout(
                TimeoutKind::ForcedQuit,
                *self.config.get_forced_quit_timeout(),
            );
        }
    }

    /// Releases per-session resources ahead of close.
    fn release_resources(&mut self) {
        self.state = SessionState::CleaningUp;
        self.pending_ack = None;
        // Dropping the multiplexers ends their pump tasks and closes every
        // observer sink.
        self.ttys.clear();
    }

    fn close(&mut self) {
        self.state = SessionState::Closed;
        let result = self.failure.clone().unwrap_or_else(SessionResult::ok);

        if let Some(reply) = self.run_reply.take() {
            let run_result = self.failure.clone().unwrap_or_else(|| {
                SessionResult::new(ResultCode::Shutdown, "session shut down before the pod started")
            });
            let _ = reply.send(run_result);
        }
        if let Some(reply) = self.exec_reply.take() {
            let exec_result = self
                .failure
                .clone()
                .unwrap_or_else(|| SessionResult::new(ResultCode::Shutdown, "session shut down"));
            let _ = reply.send(exec_result);
        }
        for reply in self.shutdown_replies.drain(..) {
            let _ = reply.send(result.clone());
        }

        info!(session = %self.id, code = ?result.code, "session closed");
    }

    async fn submit_monitor(&mut self, session: MonitorSession) {
        let op = session.fail_op;
        if let Err(e) = self.monitor.submit(session).await {
            warn!(session = %self.id, error = %e, "failed to queue monitor session");
            if let Some(op) = op {
                self.on_fatal(SessionResult::new(
                    ResultCode::DeviceFail,
                    format!("{:?} failed: {}", op, e),
                ))
                .await;
            }
        }
    }

    /// Arms a deferred timer that re-injects a timeout event if the session
    /// is still consuming the hub when it fires.
    fn arm_timeout(&self, kind: TimeoutKind, after: Duration) {
        let hub_tx = self.hub_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = hub_tx.send(Event::Timeout(kind)).await;
        });
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn net_id(index: u32) -> String {
    format!("net-{}", index)
}

fn no_serial_line(container: Option<String>) -> PodcoreError {
    match container {
        Some(name) => PodcoreError::ContainerNotFound(name),
        None => PodcoreError::custom(anyhow::anyhow!("no serial line for the console")),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Init => write!(f, "initializing"),
            SessionState::Running => write!(f, "running"),
            SessionState::Terminating => write!(f, "terminating"),
            SessionState::CleaningUp => write!(f, "cleaning up"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{read_frame, write_frame, ChannelClient, Frame, spawn_channel_reader},
        config::DEFAULT_HUB_CAPACITY,
        qmp::PlainMonitorWriter,
        session::{BlockBacking, DiskFormat},
        spec::{ContainerSpec, NetworkRequest, VolumeSpec},
    };
    use async_trait::async_trait;
    use nix::sys::signal::Signal;
    use std::collections::HashMap;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    struct StubProvisioner {
        block_backed: bool,
    }

    #[async_trait]
    impl PodProvisioner for StubProvisioner {
        async fn create_container(
            &self,
            index: u32,
            spec: &ContainerSpec,
        ) -> crate::PodcoreResult<ContainerInfo> {
            crate::Ok(ContainerInfo {
                index,
                id: format!("c-{}", index),
                name: spec.name.clone(),
                rootfs: PathBuf::from(format!("/run/pods/{}", spec.name)),
                image: spec.image.clone(),
                fstype: "ext4".to_string(),
                workdir: spec.workdir.clone(),
                envs: spec.envs.clone(),
                command: spec.command.clone(),
                block_backing: self.block_backed.then(|| BlockBacking {
                    path: PathBuf::from(format!("/var/lib/pods/{}.img", spec.name)),
                    format: DiskFormat::Raw,
                }),
            })
        }

        async fn prepare_volume(&self, spec: &VolumeSpec) -> crate::PodcoreResult<VolumeInfo> {
            crate::Ok(VolumeInfo {
                name: spec.name.clone(),
                path: PathBuf::from(format!("/var/lib/pods/{}.qcow2", spec.name)),
                fstype: "xfs".to_string(),
                format: Some(DiskFormat::Qcow2),
            })
        }
    }

    struct StubNetwork;

    #[async_trait]
    impl NetworkAllocator for StubNetwork {
        async fn allocate(
            &self,
            index: u32,
            _address: Option<&str>,
        ) -> crate::PodcoreResult<NetworkLink> {
            crate::Ok(NetworkLink {
                index,
                host_device: format!("tap{}", index),
                fd: None,
                ip_address: "10.0.0.2".to_string(),
                net_mask: "255.255.255.0".to_string(),
                gateway: Some("10.0.0.1".to_string()),
                guest_device: String::new(),
            })
        }
    }

    /// Answers every monitor command with the given reply and records the
    /// command lines for assertions.
    async fn agreeable_monitor(
        stream: DuplexStream,
        reply: &'static str,
        seen_tx: mpsc::UnboundedSender<String>,
    ) {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();
        let _capabilities = lines.next_line().await.unwrap();
        write_half.write_all(b"{\"return\": {}}\n").await.unwrap();

        while let Ok(Some(line)) = lines.next_line().await {
            let _ = seen_tx.send(line);
            write_half.write_all(reply.as_bytes()).await.unwrap();
            write_half.write_all(b"\n").await.unwrap();
        }
    }

    struct Harness {
        handle: crate::session::SessionHandle,
        run_rx: oneshot::Receiver<SessionResult>,
        guest: DuplexStream,
        monitor_lines: mpsc::UnboundedReceiver<String>,
        signal_rx: mpsc::UnboundedReceiver<Signal>,
        hub_tx: mpsc::Sender<Event>,
    }

    async fn start_session(
        pod: PodSpec,
        block_backed: bool,
        monitor_reply: &'static str,
        config: VmConfig,
    ) -> anyhow::Result<Harness> {
        let (hub_tx, hub_rx) = mpsc::channel(DEFAULT_HUB_CAPACITY);

        // Guest init channel over an in-memory pipe.
        let (host_side, guest_side) = tokio::io::duplex(16384);
        let (channel_read, channel_write) = tokio::io::split(host_side);
        let _reader = spawn_channel_reader(channel_read, hub_tx.clone());
        let boxed: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = Box::new(channel_write);
        let channel = Arc::new(ChannelClient::new(boxed));

        // Scripted hypervisor monitor.
        let (engine_side, monitor_side) = tokio::io::duplex(16384);
        let (seen_tx, monitor_lines) = mpsc::unbounded_channel();
        tokio::spawn(agreeable_monitor(monitor_side, monitor_reply, seen_tx));
        let (monitor_read, monitor_write) = tokio::io::split(engine_side);
        let monitor = MonitorEngine::connect(
            monitor_read,
            PlainMonitorWriter::new(monitor_write),
            hub_tx.clone(),
        )
        .await?;

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let supervisor = SupervisorHandle::new(4242, signal_tx);

        let session = VmSession::new(
            config,
            pod,
            channel,
            monitor,
            supervisor,
            Arc::new(StubProvisioner { block_backed }),
            Arc::new(StubNetwork),
            hub_tx.clone(),
            hub_rx,
        );
        let (handle, run_rx) = session.spawn();

        Ok(Harness {
            handle,
            run_rx,
            guest: guest_side,
            monitor_lines,
            signal_rx,
            hub_tx,
        })
    }

    fn test_config() -> anyhow::Result<(VmConfig, tempfile::NamedTempFile, tempfile::NamedTempFile)>
    {
        let kernel = tempfile::NamedTempFile::new()?;
        let initrd = tempfile::NamedTempFile::new()?;
        let config = VmConfig::builder()
            .kernel_path(kernel.path())
            .initrd_path(initrd.path())
            .graceful_shutdown_timeout(Duration::from_millis(100))
            .forced_quit_timeout(Duration::from_millis(100))
            .channel_ack_timeout(Duration::from_millis(200))
            .build()?;
        Ok((config, kernel, initrd))
    }

    #[test_log::test(tokio::test)]
    async fn test_full_run_reaches_running_with_one_start_pod() -> anyhow::Result<()> {
        let (config, _k, _i) = test_config()?;
        let pod = PodSpec {
            hostname: "web".to_string(),
            containers: vec![ContainerSpec {
                name: "web".to_string(),
                image: "docker.io/library/nginx".to_string(),
                command: vec!["nginx".to_string()],
                envs: HashMap::new(),
                workdir: "/".to_string(),
                volume_mounts: vec![],
            }],
            volumes: vec![],
            networks: vec![NetworkRequest { address: None }],
        };

        let mut harness = start_session(pod, true, r#"{"return": {}}"#, config).await?;

        let frame: Frame = read_frame(&mut harness.guest).await?;
        assert_eq!(frame.code, CMD_START_POD);
        let spec: GuestSpec = serde_json::from_slice(&frame.payload)?;
        assert_eq!(spec.hostname, "web");
        assert_eq!(spec.containers[0].rootfs_device, "sda");
        assert_eq!(spec.interfaces[0].device, "eth0");
        assert_eq!(spec.interfaces[0].ip_address, "10.0.0.2");
        assert_eq!(spec.routes[0].gateway, "10.0.0.1");
        assert_eq!(spec.channel_path, crate::config::GUEST_CHANNEL_PATH);

        write_frame(&mut harness.guest, CMD_START_POD, &[]).await?;
        let result = harness.run_rx.await?;
        assert!(result.is_ok());

        // Disk attach (2 commands) and network attach (2 commands, no fd).
        let mut seen = Vec::new();
        while let Ok(line) = harness.monitor_lines.try_recv() {
            seen.push(line);
        }
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().any(|l| l.contains("blockdev-add")));
        assert!(seen.iter().any(|l| l.contains("netdev_add")));

        // No second start-pod.
        let extra = tokio::time::timeout(
            Duration::from_millis(100),
            read_frame(&mut harness.guest),
        )
        .await;
        assert!(extra.is_err());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_shutdown_escalates_to_quit_then_kill() -> anyhow::Result<()> {
        let (config, _k, _i) = test_config()?;
        let pod = PodSpec {
            hostname: "empty".to_string(),
            ..Default::default()
        };

        let mut harness = start_session(pod, false, r#"{"return": {}}"#, config).await?;

        // Empty pod starts immediately; ack it to reach Running.
        let frame = read_frame(&mut harness.guest).await?;
        assert_eq!(frame.code, CMD_START_POD);
        write_frame(&mut harness.guest, CMD_START_POD, &[]).await?;
        assert!(harness.run_rx.await?.is_ok());

        let shutdown_rx = harness.handle.request_shutdown().await?;

        // The guest receives shutdown but never acknowledges it.
        let frame = read_frame(&mut harness.guest).await?;
        assert_eq!(frame.code, CMD_SHUTDOWN);

        // Graceful window elapses: forced monitor quit.
        let quit = tokio::time::timeout(Duration::from_secs(2), harness.monitor_lines.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("monitor closed"))?;
        assert!(quit.contains("quit"));

        // Second window elapses: hard kill reaches the supervisor.
        let signal = tokio::time::timeout(Duration::from_secs(2), harness.signal_rx.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("no signal"))?;
        assert_eq!(signal, Signal::SIGKILL);

        // The kill takes effect and teardown completes.
        harness
            .hub_tx
            .send(Event::ProcessExited { code: None })
            .await?;
        let result = shutdown_rx
            .await
            .map_err(|_| anyhow::anyhow!("shutdown reply dropped"))?;
        assert!(result.is_ok());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_device_failure_is_fatal_and_routes_to_shutdown() -> anyhow::Result<()> {
        let (config, _k, _i) = test_config()?;
        let pod = PodSpec {
            hostname: "web".to_string(),
            containers: vec![ContainerSpec {
                name: "web".to_string(),
                image: "docker.io/library/nginx".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let mut harness = start_session(
            pod,
            true,
            r#"{"error": {"class": "GenericError", "desc": "no bus"}}"#,
            config,
        )
        .await?;

        let result = tokio::time::timeout(Duration::from_secs(10), harness.run_rx).await??;
        assert_eq!(result.code, ResultCode::DeviceFail);
        assert!(result.cause.contains("no bus"));

        // The failure routed to shutdown.
        let frame = read_frame(&mut harness.guest).await?;
        assert_eq!(frame.code, CMD_SHUTDOWN);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_unacknowledged_start_pod_times_out() -> anyhow::Result<()> {
        let (config, _k, _i) = test_config()?;
        let pod = PodSpec {
            hostname: "empty".to_string(),
            ..Default::default()
        };

        let mut harness = start_session(pod, false, r#"{"return": {}}"#, config).await?;

        let frame = read_frame(&mut harness.guest).await?;
        assert_eq!(frame.code, CMD_START_POD);
        // Never acknowledge; the ack deadline is fatal.

        let result = tokio::time::timeout(Duration::from_secs(2), harness.run_rx).await??;
        assert_eq!(result.code, ResultCode::InitFail);

        let frame = read_frame(&mut harness.guest).await?;
        assert_eq!(frame.code, CMD_SHUTDOWN);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_process_exit_in_running_closes_the_session() -> anyhow::Result<()> {
        let (config, _k, _i) = test_config()?;
        let pod = PodSpec {
            hostname: "empty".to_string(),
            ..Default::default()
        };

        let mut harness = start_session(pod, false, r#"{"return": {}}"#, config).await?;
        let frame = read_frame(&mut harness.guest).await?;
        assert_eq!(frame.code, CMD_START_POD);
        write_frame(&mut harness.guest, CMD_START_POD, &[]).await?;
        assert!(harness.run_rx.await?.is_ok());

        harness
            .hub_tx
            .send(Event::ProcessExited { code: Some(0) })
            .await?;
        harness.handle.wait().await?;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_guest_shutdown_event_waits_for_process_exit() -> anyhow::Result<()> {
        let (config, _k, _i) = test_config()?;
        let pod = PodSpec {
            hostname: "empty".to_string(),
            ..Default::default()
        };

        let mut harness = start_session(pod, false, r#"{"return": {}}"#, config).await?;
        let frame = read_frame(&mut harness.guest).await?;
        assert_eq!(frame.code, CMD_START_POD);
        write_frame(&mut harness.guest, CMD_START_POD, &[]).await?;
        assert!(harness.run_rx.await?.is_ok());

        // The guest powers itself off; the hypervisor announces it.
        harness
            .hub_tx
            .send(Event::MonitorEvent {
                name: "SHUTDOWN".to_string(),
                data: serde_json::json!({}),
            })
            .await?;

        // The session stays on the hub awaiting process exit, escalating to
        // a kill when the hypervisor lingers past the quit window.
        let signal = tokio::time::timeout(Duration::from_secs(2), harness.signal_rx.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("no signal"))?;
        assert_eq!(signal, Signal::SIGKILL);

        // Still consuming: the exit report is accepted and completes
        // teardown.
        let shutdown_rx = harness.handle.request_shutdown().await?;
        harness
            .hub_tx
            .send(Event::ProcessExited { code: Some(0) })
            .await?;
        let result = shutdown_rx
            .await
            .map_err(|_| anyhow::anyhow!("shutdown reply dropped"))?;
        assert!(result.is_ok());
        harness.handle.wait().await?;
        Ok(())
    }
}
