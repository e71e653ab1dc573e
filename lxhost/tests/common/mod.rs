//! Shared test fixture: an in-process guest simulator speaking the init
//! protocol over the loopback transport, plus a session environment wired
//! to the in-memory platform adapters.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use uuid::Uuid;

use lxhost::platform::loopback::LoopbackTransport;
use lxhost::platform::memory::{
    MemoryComputeService, MemoryFirewallRegistry, MemoryNatRegistry, MemoryShareProvider,
};
use lxhost::platform::{ComputeService, ComputeSystem, ProcessHandle, VmTransport};
use lxhost::plugin::PluginManager;
use lxhost::registry::MemoryStore;
use lxhost::session::{SessionConfig, SessionPlatform};
use lxhost::vm::{VmSettings, INIT_PORT};
use lxhost_shared::channel::SocketChannel;
use lxhost_shared::errors::{LxError, LxResult};
use lxhost_shared::protocol::*;
use lxhost_shared::sync::Event;

/// Observable guest-side state and failure injection knobs.
#[derive(Default)]
pub struct SimBehavior {
    /// Distribution names the guest refuses to launch an init for.
    pub refuse_launch_names: Mutex<HashSet<String>>,
    /// Session leaders stop replying to create-process (they wait for VM
    /// teardown instead), to simulate a blocked operation.
    pub block_create_process: AtomicBool,
    /// Init refuses non-forced termination, as if user processes remain.
    pub refuse_graceful_stop: AtomicBool,
    /// Timezones pushed to instances.
    pub timezones: Mutex<Vec<String>>,
    /// resolv.conf contents pushed to instances.
    pub network_updates: Mutex<Vec<String>>,
    /// Console ids the host asked to disconnect.
    pub disconnected_consoles: Mutex<Vec<u32>>,
    /// Create-process requests observed by session leaders.
    pub created_processes: Mutex<Vec<CreateProcessVm>>,
    next_port: AtomicU32,
    next_pid: AtomicU32,
}

impl SimBehavior {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_port: AtomicU32::new(60000),
            next_pid: AtomicU32::new(100),
            ..Default::default()
        })
    }

    fn allocate_port(&self) -> u32 {
        self.next_port.fetch_add(1, Ordering::SeqCst)
    }

    fn allocate_pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }
}

/// Compute service wrapper that boots a guest simulator for every created
/// system.
pub struct SimComputeService {
    pub inner: Arc<MemoryComputeService>,
    transport: Arc<LoopbackTransport>,
    behavior: Arc<SimBehavior>,
}

impl ComputeService for SimComputeService {
    fn create_system(
        &self,
        id: Uuid,
        document: &str,
    ) -> LxResult<Arc<dyn ComputeSystem>> {
        let system = self.inner.create_system(id, document)?;

        // Wire a per-VM stop event to the compute exit event so every sim
        // thread unblocks when the system terminates.
        let stop = Arc::new(Event::new()?);
        {
            let stop = stop.clone();
            system.register_exit_callback(Box::new(move |_| stop.set()))?;
        }

        let transport = self.transport.clone();
        let behavior = self.behavior.clone();
        let typed_system = self.inner.system(id).expect("system just created");
        std::thread::Builder::new()
            .name("guest-sim".into())
            .spawn(move || {
                guest_main(transport, id, behavior, stop);
                // The root init exiting takes the whole VM down with it.
                let _ = typed_system.terminate();
            })?;

        Ok(system)
    }

    fn open_system(&self, id: Uuid) -> LxResult<Arc<dyn ComputeSystem>> {
        self.inner.open_system(id)
    }

    fn grant_vm_access(&self, vm_id: Uuid, path: &std::path::Path) -> LxResult<()> {
        self.inner.grant_vm_access(vm_id, path)
    }

    fn revoke_vm_access(&self, vm_id: Uuid, path: &std::path::Path) -> LxResult<()> {
        self.inner.revoke_vm_access(vm_id, path)
    }
}

/// Everything a test needs: platform adapters, config, and handles to the
/// underlying fakes.
pub struct TestEnv {
    pub dir: TempDir,
    pub platform: SessionPlatform,
    pub config: SessionConfig,
    pub compute: Arc<MemoryComputeService>,
    pub transport: Arc<LoopbackTransport>,
    pub store: Arc<MemoryStore>,
    pub nat: Arc<MemoryNatRegistry>,
    pub firewall: Arc<MemoryFirewallRegistry>,
    pub shares: Arc<MemoryShareProvider>,
    pub behavior: Arc<SimBehavior>,
}

pub fn test_env() -> TestEnv {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = Arc::new(LoopbackTransport::new(dir.path().join("sockets")));
    let compute = MemoryComputeService::new();
    let store = MemoryStore::new();
    let nat = MemoryNatRegistry::new();
    let firewall = MemoryFirewallRegistry::new();
    let shares = MemoryShareProvider::new();
    let behavior = SimBehavior::new();

    let platform = SessionPlatform {
        compute: Arc::new(SimComputeService {
            inner: compute.clone(),
            transport: transport.clone(),
            behavior: behavior.clone(),
        }),
        transport: transport.clone(),
        shares: shares.clone(),
        nat: nat.clone(),
        firewall: firewall.clone(),
        store: store.clone(),
        pico: None,
        timezone: None,
    };

    let config = SessionConfig {
        install_root: dir.path().join("distributions"),
        temp_root: dir.path().join("temp"),
        vm: VmSettings {
            boot_timeout: Duration::from_secs(10),
            crash_dump_dir: dir.path().join("crashes"),
            ..Default::default()
        },
        // Idle termination is opted into per test.
        vm_idle_timeout: None,
        instance_idle_timeout: Some(Duration::from_millis(100)),
        shutdown_lock_timeout: Duration::from_millis(500),
        ..Default::default()
    };

    TestEnv {
        dir,
        platform,
        config,
        compute,
        transport,
        store,
        nat,
        firewall,
        shares,
        behavior,
    }
}

/// A fake client process handle whose exit is controlled by dropping the
/// returned keepalive fd.
pub fn fake_client(pid: u32) -> (ProcessHandle, std::os::fd::OwnedFd) {
    let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();
    (ProcessHandle::from_waitable_fd(pid, read), write)
}

pub fn console_for(client: &ProcessHandle) -> lxhost::console::ConsoleData {
    lxhost::console::ConsoleData {
        console_id: client.pid(),
        conhost: None,
        client_process: client.try_clone().unwrap(),
    }
}

// ---------------------------------------------------------------------------
// Guest simulator
// ---------------------------------------------------------------------------

fn guest_main(
    transport: Arc<LoopbackTransport>,
    vm_id: Uuid,
    behavior: Arc<SimBehavior>,
    stop: Arc<Event>,
) {
    let stream = match transport.connect(vm_id, INIT_PORT, Duration::from_secs(10), Some(stop.as_ref())) {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("guest sim failed to connect init channel: {err}");
            return;
        }
    };
    let channel = SocketChannel::with_cancel(stream, "sim-mini-init", Some(stop.clone()));

    loop {
        let (header, body) = match channel.receive_raw(None) {
            Ok(message) => message,
            Err(_) => return,
        };

        match MessageType::from_u32(header.message_type) {
            Some(MessageType::LaunchInit) => {
                let request = LaunchInit::decode(&body).expect("malformed LaunchInit");
                if behavior.refuse_launch_names.lock().contains(&request.name) {
                    let _ = channel.send(&ResultMessage { result: -1 });
                    continue;
                }

                let port = behavior.allocate_port();
                spawn_instance_init(&transport, vm_id, port, &behavior, &stop);
                let _ = channel.send(&ResultMessage {
                    result: port as i32,
                });
            }
            Some(MessageType::GetDisk) => {
                let request = GetDisk::decode(&body).expect("malformed GetDisk");
                let _ = channel.send(&GetDiskResponse {
                    result: 0,
                    device: format!("/dev/sd{}", (b'c' + request.lun as u8) as char),
                });
            }
            Some(MessageType::Signal) => {
                let _ = channel.send(&ResultMessage { result: 0 });
            }
            Some(other) => {
                eprintln!("guest sim: unexpected VM message {other:?}");
                return;
            }
            None => return,
        }
    }
}

fn spawn_instance_init(
    transport: &Arc<LoopbackTransport>,
    vm_id: Uuid,
    port: u32,
    behavior: &Arc<SimBehavior>,
    stop: &Arc<Event>,
) {
    let listener = transport.listen(vm_id, port).expect("listen init port");
    let transport = transport.clone();
    let behavior = behavior.clone();
    let stop = stop.clone();

    std::thread::Builder::new()
        .name("sim-init".into())
        .spawn(move || {
            let Ok(stream) = listener.accept(Some(Duration::from_secs(10)), Some(stop.as_ref())) else {
                return;
            };
            let channel = SocketChannel::with_cancel(stream, "sim-init", Some(stop.clone()));
            let init_pid = behavior.allocate_pid();

            loop {
                let Ok((header, body)) = channel.receive_raw(None) else {
                    return;
                };

                match MessageType::from_u32(header.message_type) {
                    Some(MessageType::ConfigurationInformation) => {
                        let request = ConfigurationInformation::decode(&body)
                            .expect("malformed ConfigurationInformation");
                        let _ = channel.send(&ConfigurationInformationResponse {
                            default_uid: request.default_uid,
                            init_pid,
                            plan9_port: 0,
                            flavor: Some("testdistro".to_string()),
                            os_version: Some("1.0".to_string()),
                        });
                    }
                    Some(MessageType::NetworkInformation) => {
                        let request = NetworkInformation::decode(&body)
                            .expect("malformed NetworkInformation");
                        behavior.network_updates.lock().push(request.resolv_conf);
                    }
                    Some(MessageType::TimezoneInformation) => {
                        let request = TimezoneInformation::decode(&body)
                            .expect("malformed TimezoneInformation");
                        behavior.timezones.lock().push(request.timezone);
                    }
                    Some(MessageType::CreateSession) => {
                        let leader_port = behavior.allocate_port();
                        spawn_session_leader(&transport, vm_id, leader_port, &behavior, &stop);
                        let _ = channel.send(&ResultMessage {
                            result: leader_port as i32,
                        });
                    }
                    Some(MessageType::DisconnectConsole) => {
                        let request =
                            DisconnectConsole::decode(&body).expect("malformed DisconnectConsole");
                        behavior
                            .disconnected_consoles
                            .lock()
                            .push(request.console_id);
                    }
                    Some(MessageType::TerminateInstance) => {
                        let request = TerminateInstance::decode(&body)
                            .expect("malformed TerminateInstance");
                        if !request.force && behavior.refuse_graceful_stop.load(Ordering::SeqCst) {
                            let _ = channel.send(&ResultMessage { result: 1 });
                            continue;
                        }
                        let _ = channel.send(&ResultMessage { result: 0 });
                        return;
                    }
                    _ => return,
                }
            }
        })
        .expect("spawn sim-init");
}

fn spawn_session_leader(
    transport: &Arc<LoopbackTransport>,
    vm_id: Uuid,
    port: u32,
    behavior: &Arc<SimBehavior>,
    stop: &Arc<Event>,
) {
    let listener = transport.listen(vm_id, port).expect("listen leader port");
    let transport = transport.clone();
    let behavior = behavior.clone();
    let stop = stop.clone();

    std::thread::Builder::new()
        .name("sim-leader".into())
        .spawn(move || {
            let Ok(stream) = listener.accept(Some(Duration::from_secs(10)), Some(stop.as_ref())) else {
                return;
            };
            let channel = SocketChannel::with_cancel(stream, "sim-leader", Some(stop.clone()));

            loop {
                let Ok((header, body)) = channel.receive_raw(None) else {
                    return;
                };

                match MessageType::from_u32(header.message_type) {
                    Some(MessageType::RemountDrvfs) => {
                        let _ = RemountDrvfs::decode(&body).expect("malformed RemountDrvfs");
                        let _ = channel.send(&ResultMessage { result: 0 });
                    }
                    Some(MessageType::CreateProcessUtilityVm) => {
                        let request =
                            CreateProcessVm::decode(&body).expect("malformed CreateProcessVm");
                        behavior.created_processes.lock().push(request.clone());

                        if behavior.block_create_process.load(Ordering::SeqCst) {
                            // Simulate a wedged guest: hold the reply until
                            // the VM goes away.
                            stop.wait(None);
                            return;
                        }

                        let process_port = behavior.allocate_port();
                        spawn_guest_process(&transport, vm_id, process_port, request, &stop);
                        let _ = channel.send(&ResultMessage {
                            result: process_port as i32,
                        });
                    }
                    _ => return,
                }
            }
        })
        .expect("spawn sim-leader");
}

/// Accept the fixed-order fd connections and run a tiny command
/// interpreter: `/bin/echo` writes its arguments to stdout; everything else
/// just exits 0. The exit status is reported on the control channel.
fn spawn_guest_process(
    transport: &Arc<LoopbackTransport>,
    vm_id: Uuid,
    port: u32,
    request: CreateProcessVm,
    stop: &Arc<Event>,
) {
    let listener = transport.listen(vm_id, port).expect("listen process port");
    let stop = stop.clone();

    std::thread::Builder::new()
        .name("sim-process".into())
        .spawn(move || {
            let accept = |name: &str| {
                listener
                    .accept(Some(Duration::from_secs(10)), Some(&stop))
                    .unwrap_or_else(|err| panic!("accept {name}: {err}"))
            };

            let _stdin = accept("stdin");
            let mut stdout = accept("stdout");
            let _stderr = accept("stderr");
            let control = accept("control");
            let _interop = accept("interop");
            let _oobe = if request.allow_oobe {
                Some(accept("oobe"))
            } else {
                None
            };

            if request.common.filename == "/bin/echo" {
                let output = request.common.command_line[1..].join(" ");
                let _ = stdout.write_all(output.as_bytes());
                let _ = stdout.write_all(b"\n");
            }
            drop(stdout);

            // Exit status on the control channel.
            let control_channel = SocketChannel::with_cancel(control, "sim-control", Some(stop));
            let _ = control_channel.send(&ResultMessage { result: 0 });
        })
        .expect("spawn sim-process");
}

/// Wait until `condition` holds, polling, for at most 5 seconds.
pub fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

/// Ignore "already set" errors from repeated tracing initialization.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn register_test_distribution(
    session: &lxhost::UserSession,
    name: &str,
) -> LxResult<Uuid> {
    session.register_distribution(lxhost::session::RegisterDistributionRequest {
        name: name.to_string(),
        version: 2,
        base_path: None,
        package_family_name: None,
        enable_oobe: false,
    })
}

/// Read until EOF with a timeout, returning the collected bytes.
pub fn read_to_end_with_timeout(stream: &mut std::os::unix::net::UnixStream) -> Vec<u8> {
    use std::io::Read;
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buffer = Vec::new();
    let _ = stream.read_to_end(&mut buffer);
    buffer
}

pub fn expect_channel_result(stream: std::os::unix::net::UnixStream) -> i32 {
    let channel = SocketChannel::new(stream, "test-control");
    match channel.receive::<ResultMessage>(Some(Duration::from_secs(5))) {
        Ok(message) => message.result,
        Err(LxError::ChannelClosed) => 0,
        Err(err) => panic!("control channel error: {err}"),
    }
}
