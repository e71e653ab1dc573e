//! Legacy in-kernel instance flavor, driven through a mock kernel
//! subsystem: init handshake, process creation with handle marshalling,
//! iptables attachment, and teardown.

mod common;

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use lxhost::instance::{CreateProcessParams, CreatedProcess};
use lxhost::netfilter::{IpTablesRequest, Ipv4Cidr};
use lxhost::platform::memory::QueueUserCallbackSource;
use lxhost::platform::{
    NatRegistry, PicoInstanceHandle, PicoLaunchConfig, PicoSubsystem, ProcessHandle,
    UserCallbackSource,
};
use lxhost::plugin::PluginManager;
use lxhost::session::RegisterDistributionRequest;
use lxhost::SessionFactory;
use lxhost_shared::channel::SocketChannel;
use lxhost_shared::errors::{LxError, LxResult};
use lxhost_shared::protocol::*;
use lxhost_shared::sync::Event;

#[derive(Default)]
struct MockPicoState {
    session_connections: Mutex<VecDeque<UnixStream>>,
    session_ready: Condvar,
    released_ids: Mutex<Vec<u32>>,
    disconnected_clients: Mutex<Vec<u32>>,
}

struct MockPicoHandle {
    init_connection: Mutex<Option<UnixStream>>,
    state: Arc<MockPicoState>,
    callback_source: Arc<QueueUserCallbackSource>,
    next_marshal_id: AtomicU32,
    terminated: Arc<Event>,
    /// Keeps the guest-side ends of session leader channels alive.
    _leader_peers: Arc<Mutex<Vec<UnixStream>>>,
}

struct MockPicoSubsystem {
    state: Arc<MockPicoState>,
    callback_source: Arc<QueueUserCallbackSource>,
}

impl MockPicoSubsystem {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(MockPicoState::default()),
            callback_source: QueueUserCallbackSource::new(),
        })
    }
}

impl PicoSubsystem for MockPicoSubsystem {
    fn create_instance(
        &self,
        _config: &PicoLaunchConfig,
    ) -> LxResult<Box<dyn PicoInstanceHandle>> {
        let (host_end, guest_end) = UnixStream::pair()?;
        let state = self.state.clone();
        let leader_peers = Arc::new(Mutex::new(Vec::new()));

        {
            let leader_peers = leader_peers.clone();
            std::thread::Builder::new()
                .name("mock-pico-init".into())
                .spawn(move || pico_init_main(guest_end, state, leader_peers))?;
        }

        Ok(Box::new(MockPicoHandle {
            init_connection: Mutex::new(Some(host_end)),
            state: self.state.clone(),
            callback_source: self.callback_source.clone(),
            next_marshal_id: AtomicU32::new(1),
            terminated: Arc::new(Event::new()?),
            _leader_peers: leader_peers,
        }))
    }
}

/// The in-kernel init: answers the configuration exchange and launches
/// processes.
fn pico_init_main(
    stream: UnixStream,
    state: Arc<MockPicoState>,
    leader_peers: Arc<Mutex<Vec<UnixStream>>>,
) {
    let channel = SocketChannel::new(stream, "mock-pico-init");

    loop {
        let Ok((header, body)) = channel.receive_raw(None) else {
            return;
        };

        match MessageType::from_u32(header.message_type) {
            Some(MessageType::ConfigurationInformation) => {
                let request =
                    ConfigurationInformation::decode(&body).expect("malformed configuration");
                let _ = channel.send(&ConfigurationInformationResponse {
                    default_uid: request.default_uid,
                    init_pid: 0,
                    plan9_port: 0,
                    flavor: None,
                    os_version: None,
                });
            }
            Some(MessageType::NetworkInformation) | Some(MessageType::TimezoneInformation) => {}
            Some(MessageType::CreateSession) => {
                let (host_end, guest_end) = UnixStream::pair().expect("leader pair");
                leader_peers.lock().push(guest_end);
                state.session_connections.lock().push_back(host_end);
                state.session_ready.notify_all();
            }
            Some(MessageType::CreateProcess) => {
                let request =
                    CreateProcessLegacy::decode(&body).expect("malformed create-process");
                assert!(request.stdio_ids.iter().all(|id| *id != 0));
                assert_ne!(request.token_id, 0);
                let _ = channel.send(&ResultMessage { result: 77 });
                // The host acknowledges the unmarshal.
                let ack: ResultMessage = channel
                    .receive(Some(Duration::from_secs(5)))
                    .expect("unmarshal ack");
                assert_eq!(ack.result, 0);
            }
            Some(MessageType::TerminateInstance) => {
                let _ = channel.send(&ResultMessage { result: 0 });
                return;
            }
            _ => return,
        }
    }
}

impl PicoInstanceHandle for MockPicoHandle {
    fn wait_for_init_connection(&self, _timeout: Duration) -> LxResult<UnixStream> {
        self.init_connection
            .lock()
            .take()
            .ok_or(LxError::ChannelClosed)
    }

    fn wait_for_session_connection(&self, timeout: Duration) -> LxResult<UnixStream> {
        let mut connections = self.state.session_connections.lock();
        if connections.is_empty() {
            self.state
                .session_ready
                .wait_for(&mut connections, timeout);
        }
        connections.pop_front().ok_or(LxError::Timeout(timeout))
    }

    fn marshal_console(&self, _client_pid: u32) -> LxResult<u32> {
        Ok(self.next_marshal_id.fetch_add(1, Ordering::SeqCst))
    }

    fn release_console(&self, console_id: u32) -> LxResult<()> {
        self.state.released_ids.lock().push(console_id);
        Ok(())
    }

    fn disconnect_console(&self, client_pid: u32) -> LxResult<()> {
        self.state.disconnected_clients.lock().push(client_pid);
        Ok(())
    }

    fn marshal_handle(&self, _fd: BorrowedFd<'_>) -> LxResult<u32> {
        Ok(self.next_marshal_id.fetch_add(1, Ordering::SeqCst))
    }

    fn marshal_fork_token(&self) -> LxResult<u32> {
        Ok(self.next_marshal_id.fetch_add(1, Ordering::SeqCst))
    }

    fn release_handle(&self, handle_id: u32) -> LxResult<()> {
        self.state.released_ids.lock().push(handle_id);
        Ok(())
    }

    fn unmarshal_process(&self, process_id: u32) -> LxResult<ProcessHandle> {
        let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
            .map_err(|errno| LxError::Internal(errno.to_string()))?;
        // Leak the keepalive: the mock "process" outlives the test body.
        std::mem::forget(write);
        Ok(ProcessHandle::from_waitable_fd(process_id, read))
    }

    fn callback_source(&self) -> Arc<dyn UserCallbackSource> {
        self.callback_source.clone()
    }

    fn request_stop(&self) -> LxResult<()> {
        self.terminated.set();
        Ok(())
    }

    fn wait_for_termination(&self, timeout: Duration) -> LxResult<()> {
        if self.terminated.wait(Some(timeout)) {
            Ok(())
        } else {
            Err(LxError::Timeout(timeout))
        }
    }
}

fn stdio_fds() -> [OwnedFd; 3] {
    let null = || {
        let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();
        std::mem::forget(write);
        read
    };
    [null(), null(), null()]
}

fn legacy_env() -> (TestEnv, Arc<MockPicoSubsystem>) {
    let mut env = test_env();
    let pico = MockPicoSubsystem::new();
    env.platform.pico = Some(pico.clone() as Arc<dyn PicoSubsystem>);
    env.config.enable_legacy_instances = true;
    (env, pico)
}

fn legacy_factory(env: &TestEnv) -> SessionFactory {
    SessionFactory::new(
        env.platform.clone(),
        env.config.clone(),
        Arc::new(PluginManager::empty()),
    )
}

fn register_legacy(session: &lxhost::UserSession, name: &str) -> Uuid {
    session
        .register_distribution(RegisterDistributionRequest {
            name: name.to_string(),
            version: 1,
            base_path: None,
            package_family_name: None,
            enable_oobe: false,
        })
        .unwrap()
}

#[test]
fn legacy_instance_launches_processes_without_a_vm() {
    init_tracing();
    let (env, _pico) = legacy_env();
    let factory = legacy_factory(&env);
    let session = factory.get_or_create("S-1-5-21-6000", 1).unwrap();

    let distro = register_legacy(&session, "legacy");

    let (client, _alive) = fake_client(1000);
    session.create_instance(Some(distro), Some(&client)).unwrap();
    assert!(
        !session.has_vm(),
        "legacy instances never instantiate the utility VM"
    );

    let created = session
        .create_process(
            Some(distro),
            Some(&client),
            console_for(&client),
            CreateProcessParams {
                filename: "/bin/sh".to_string(),
                current_directory: "/root".to_string(),
                command_line: vec!["sh".to_string()],
                stdio: Some(stdio_fds()),
                ..Default::default()
            },
        )
        .unwrap();

    let CreatedProcess::Pico { process } = created else {
        panic!("expected a legacy process");
    };
    assert_eq!(process.pid(), 77);

    session.terminate_distribution(Some(distro)).unwrap();
    assert_eq!(session.running_instance_count(), 0);

    factory.clear_all_and_block();
}

#[test]
fn legacy_create_process_requires_stdio_handles() {
    init_tracing();
    let (env, _pico) = legacy_env();
    let factory = legacy_factory(&env);
    let session = factory.get_or_create("S-1-5-21-6001", 1).unwrap();
    let distro = register_legacy(&session, "nostdio");

    let (client, _alive) = fake_client(1001);
    let err = session
        .create_process(
            Some(distro),
            Some(&client),
            console_for(&client),
            CreateProcessParams {
                filename: "/bin/sh".to_string(),
                current_directory: "/".to_string(),
                command_line: vec!["sh".to_string()],
                stdio: None,
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, LxError::InvalidArgument(_)));

    factory.clear_all_and_block();
}

#[test]
fn guest_iptables_requests_create_host_rules() {
    init_tracing();
    let (env, pico) = legacy_env();
    let factory = legacy_factory(&env);
    let session = factory.get_or_create("S-1-5-21-6002", 1).unwrap();
    let distro = register_legacy(&session, "netcfg");

    let (client, _alive) = fake_client(1002);
    session.create_instance(Some(distro), Some(&client)).unwrap();

    // The emulator is attached to the instance's callback pipe; inject a
    // masquerade request as the kernel driver would.
    let request = IpTablesRequest::Masquerade {
        prefix: Ipv4Cidr {
            address: Ipv4Addr::new(172, 17, 0, 0),
            prefix_length: 16,
        },
        enable: true,
    };
    let id = pico.callback_source.submit(request.encode());
    assert_eq!(pico.callback_source.wait_for_response(id), 0);
    assert_eq!(env.nat.list_names().unwrap().len(), 1);

    // Teardown of the instance reverses the rule.
    session.terminate_distribution(Some(distro)).unwrap();
    assert!(wait_until(|| env.nat.list_names().unwrap().is_empty()));

    factory.clear_all_and_block();
}

#[test]
fn set_version_converts_between_formats() {
    init_tracing();
    let (env, _pico) = legacy_env();
    let factory = legacy_factory(&env);
    let session = factory.get_or_create("S-1-5-21-6004", 1).unwrap();

    let distro = register_test_distribution(&session, "convertme").unwrap();
    session.set_version(Some(distro), 1).unwrap();

    let summaries = session.list_distributions().unwrap();
    let summary = summaries.iter().find(|s| s.id == distro).unwrap();
    assert!(!summary
        .flags
        .contains(lxhost::registry::DistributionFlags::VM_MODE));
    assert_eq!(summary.version, 1);
    assert_eq!(
        summary.state,
        lxhost::registry::DistributionState::Installed
    );

    // Converted back to the VM-hosted format, it boots in the utility VM.
    session.set_version(Some(distro), 2).unwrap();
    let (client, _alive) = fake_client(1010);
    session.create_instance(Some(distro), Some(&client)).unwrap();
    assert!(session.has_vm());

    factory.clear_all_and_block();
}

#[test]
fn legacy_instances_count_as_idle_for_the_vm_timer() {
    init_tracing();
    let (mut env, _pico) = legacy_env();
    env.config.vm_idle_timeout = Some(Duration::from_millis(150));

    let factory = legacy_factory(&env);
    let session = factory.get_or_create("S-1-5-21-6003", 1).unwrap();

    // A VM-mode distribution boots the VM...
    let vm_distro = register_test_distribution(&session, "vmdistro").unwrap();
    let legacy_distro = register_legacy(&session, "legacy-idle");

    let (client, _alive) = fake_client(1003);
    session.create_instance(Some(vm_distro), Some(&client)).unwrap();
    session
        .create_instance(Some(legacy_distro), Some(&client))
        .unwrap();

    // ...and terminating only the VM-hosted instance leaves the VM idle
    // even while the legacy instance keeps running.
    session.terminate_distribution(Some(vm_distro)).unwrap();
    assert_eq!(session.running_instance_count(), 1);
    assert!(wait_until(|| !session.has_vm()));
    assert_eq!(session.running_instance_count(), 1);

    factory.clear_all_and_block();
}
