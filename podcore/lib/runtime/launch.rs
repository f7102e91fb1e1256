use std::sync::Arc;

use podutils::Supervisor;
use tokio::{
    io::AsyncWrite,
    net::UnixListener,
    sync::{mpsc, oneshot},
};
use tracing::{info, warn};

use crate::{
    channel::{spawn_channel_reader, ChannelClient},
    config::{VmConfig, DEFAULT_HUB_CAPACITY},
    qmp::MonitorEngine,
    session::{Event, NetworkAllocator, PodProvisioner, SessionHandle, SessionResult, VmSession},
    spec::PodSpec,
    PodcoreResult,
};

use super::HypervisorMonitor;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Boots the hypervisor for a pod and spawns its session.
///
/// This wires everything around the state machine: the monitor and init
/// channel sockets, the supervised hypervisor process whose exit feeds back
/// as a hub event, and the console serial line. Returns once the monitor
/// handshake is complete and the guest init channel is connected; the run
/// result arrives on the returned receiver when the guest accepts the pod.
pub async fn launch_session(
    config: VmConfig,
    pod: PodSpec,
    provisioner: Arc<dyn PodProvisioner>,
    network: Arc<dyn NetworkAllocator>,
) -> PodcoreResult<(SessionHandle, oneshot::Receiver<SessionResult>)> {
    config.validate()?;

    let run_dir = config.get_run_dir().clone();
    tokio::fs::create_dir_all(&run_dir).await?;
    let monitor_path = run_dir.join("monitor.sock");
    let channel_path = run_dir.join("channel.sock");
    let console_path = run_dir.join("console.sock");

    // Listen before the hypervisor starts so it can connect straight away.
    let monitor_listener = UnixListener::bind(&monitor_path)?;
    let channel_listener = UnixListener::bind(&channel_path)?;

    let args = hypervisor_args(&config, &monitor_path, &channel_path, &console_path);
    let supervisor = Supervisor::new(
        config.get_hypervisor_path(),
        args,
        std::iter::empty::<(String, String)>(),
        "hypervisor",
        "hypervisor",
        run_dir.join("logs"),
        HypervisorMonitor::new(),
    );
    let (supervisor_handle, exit_rx) = supervisor.start().await?;
    info!(pid = supervisor_handle.pid(), "hypervisor started");

    let (hub_tx, hub_rx) = mpsc::channel(DEFAULT_HUB_CAPACITY);

    // The process watcher's exit report becomes a hub event.
    {
        let hub_tx = hub_tx.clone();
        tokio::spawn(async move {
            match exit_rx.await {
                Ok(exit) => {
                    let _ = hub_tx.send(Event::ProcessExited { code: exit.code }).await;
                }
                Err(_) => warn!("hypervisor watcher dropped its exit report"),
            }
        });
    }

    let (monitor_stream, _) = monitor_listener.accept().await?;
    let monitor = MonitorEngine::connect_unix(monitor_stream, hub_tx.clone()).await?;

    let (channel_stream, _) = channel_listener.accept().await?;
    let (channel_read, channel_write) = channel_stream.into_split();
    spawn_channel_reader(channel_read, hub_tx.clone());
    let boxed_write: Box<dyn AsyncWrite + Unpin + Send> = Box::new(channel_write);
    let channel = Arc::new(ChannelClient::new(boxed_write));

    // The console serial line is connected lazily by the session.
    let _ = hub_tx
        .send(Event::SerialAttached {
            container: None,
            path: console_path,
        })
        .await;

    let session = VmSession::new(
        config,
        pod,
        channel,
        monitor,
        supervisor_handle,
        provisioner,
        network,
        hub_tx,
        hub_rx,
    );
    crate::Ok(session.spawn())
}

/// Assembles the hypervisor command line for a session.
///
/// The hypervisor dials our monitor and channel listeners as a client, and
/// serves the console socket for the session to connect to.
fn hypervisor_args(
    config: &VmConfig,
    monitor_path: &std::path::Path,
    channel_path: &std::path::Path,
    console_path: &std::path::Path,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut push = |parts: &[&str]| {
        for part in parts {
            args.push(part.to_string());
        }
    };

    push(&["-machine", "q35,accel=kvm"]);
    push(&["-cpu", "host"]);
    push(&["-smp", &config.get_num_vcpus().to_string()]);
    push(&["-m", &format!("{}M", config.get_memory_mib())]);
    push(&["-kernel", &config.get_kernel_path().display().to_string()]);
    push(&["-initrd", &config.get_initrd_path().display().to_string()]);
    push(&["-append", "console=ttyS0 reboot=k panic=1"]);
    push(&["-nodefaults", "-no-user-config", "-nographic"]);
    push(&["-device", "virtio-scsi-pci,id=scsi0"]);
    push(&["-qmp", &format!("unix:{}", monitor_path.display())]);
    push(&[
        "-chardev",
        &format!("socket,id=channel0,path={}", channel_path.display()),
    ]);
    push(&["-device", "virtio-serial-pci"]);
    push(&[
        "-device",
        &format!(
            "virtserialport,chardev=channel0,name={}",
            crate::config::CHANNEL_PORT_NAME
        ),
    ]);
    push(&[
        "-serial",
        &format!("unix:{},server=on,wait=off", console_path.display()),
    ]);

    args
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_hypervisor_args_carry_resources_and_sockets() -> anyhow::Result<()> {
        let kernel = tempfile::NamedTempFile::new()?;
        let initrd = tempfile::NamedTempFile::new()?;
        let config = VmConfig::builder()
            .kernel_path(kernel.path())
            .initrd_path(initrd.path())
            .num_vcpus(4)
            .memory_mib(2048)
            .build()?;

        let args = hypervisor_args(
            &config,
            Path::new("/run/pod/monitor.sock"),
            Path::new("/run/pod/channel.sock"),
            Path::new("/run/pod/console.sock"),
        );

        let smp = args.iter().position(|a| a == "-smp").unwrap();
        assert_eq!(args[smp + 1], "4");
        let mem = args.iter().position(|a| a == "-m").unwrap();
        assert_eq!(args[mem + 1], "2048M");
        assert!(args.contains(&"unix:/run/pod/monitor.sock".to_string()));
        assert!(args
            .iter()
            .any(|a| a.contains("path=/run/pod/channel.sock")));
        assert!(args.iter().any(|a| a.contains("console.sock")));
        Ok(())
    }
}
