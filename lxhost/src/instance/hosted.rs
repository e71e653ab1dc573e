//! VM-hosted instance flavor.
//!
//! Process creation is two-phase: obtain a session leader for the caller's
//! console, then send the create message on the leader channel and connect
//! the returned port once per fd, in fixed order. Drive mounting is set up
//! at most once per elevation bucket per instance.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use lxhost_shared::channel::SocketChannel;
use lxhost_shared::errors::{LxError, LxResult};
use lxhost_shared::sync::Event;
use lxhost_shared::protocol::{
    ConfigurationInformation, ConfigurationInformationResponse, CreateProcessCommon,
    CreateProcessVm, CreateSession, DisconnectConsole, NetworkInformation, OobeResult,
    RemountDrvfs, ResultMessage, TerminateInstance, TimezoneInformation,
};

use crate::console::{ConsoleData, ConsoleManager, InitPort};
use crate::lifetime::LifetimeManager;
use crate::platform::ProcessHandle;
use crate::plugin::DistributionInfo;
use crate::registry::{DistributionFlags, DistributionRegistration};
use crate::vm::VirtualMachine;

use super::{CreateProcessParams, CreatedProcess, DistributionConfig, InstanceEnvironment};

/// Response wait for the initial configuration exchange.
const INIT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-instance drvfs mount namespaces, one bucket per elevation level.
#[derive(Default)]
struct DrvfsBuckets {
    admin: bool,
    non_admin: bool,
}

pub struct VmInstance {
    instance_id: Uuid,
    config: Mutex<DistributionConfig>,
    registration: DistributionRegistration,
    environment: InstanceEnvironment,
    vm: Arc<VirtualMachine>,
    init_channel: Arc<SocketChannel>,
    client_id: AtomicU32,
    plan9_port: AtomicU32,
    lifetime_key: u64,
    console_manager: OnceLock<Arc<ConsoleManager>>,
    running: AtomicBool,
    initialized: AtomicBool,
    drvfs_mounted: Mutex<DrvfsBuckets>,
    /// GUI sibling distribution, dropped together with this instance.
    system_distro: Mutex<Option<Arc<VmInstance>>>,
    oobe_cancel: Arc<Event>,
    oobe_thread: Mutex<Option<JoinHandle<()>>>,
}

impl VmInstance {
    /// Connect a fresh control channel for the distribution and run the
    /// initialization exchange.
    pub fn create(
        vm: Arc<VirtualMachine>,
        registration: DistributionRegistration,
        config: DistributionConfig,
        environment: InstanceEnvironment,
        lifetime_manager: Arc<LifetimeManager>,
    ) -> LxResult<Arc<Self>> {
        let stream = vm.connect_instance_channel(config.id, &config.name)?;
        let init_channel = Arc::new(SocketChannel::with_cancel(
            stream,
            format!("init-{}", config.name),
            Some(vm.terminating_event().clone()),
        ));

        let lifetime_key = lifetime_manager.register_id();
        let instance = Arc::new(Self {
            instance_id: Uuid::new_v4(),
            config: Mutex::new(config),
            registration,
            environment,
            vm,
            init_channel,
            client_id: AtomicU32::new(0),
            plan9_port: AtomicU32::new(0),
            lifetime_key,
            console_manager: OnceLock::new(),
            running: AtomicBool::new(true),
            initialized: AtomicBool::new(false),
            drvfs_mounted: Mutex::new(DrvfsBuckets::default()),
            system_distro: Mutex::new(None),
            oobe_cancel: Arc::new(Event::new()?),
            oobe_thread: Mutex::new(None),
        });

        let console_manager = ConsoleManager::new(
            Arc::downgrade(&instance) as std::sync::Weak<dyn InitPort>,
            lifetime_manager,
        );
        let _ = instance.console_manager.set(console_manager);

        instance.initialize()?;
        Ok(instance)
    }

    fn initialize(&self) -> LxResult<()> {
        let (message, name) = {
            let config = self.config.lock();
            (
                ConfigurationInformation {
                    feature_flags: self.environment.feature_flags,
                    default_uid: config.default_uid,
                    drive_bitmap: self.environment.drive_bitmap,
                    mount_drives: config
                        .flags
                        .contains(DistributionFlags::ENABLE_DRIVE_MOUNTING),
                    timezone: self.environment.timezone.clone(),
                    hostname: self.environment.hostname.clone(),
                    plan9_socket_path: self.environment.plan9_socket_path.clone(),
                },
                config.name.clone(),
            )
        };

        let response: ConfigurationInformationResponse = {
            let mut guard = self.init_channel.lock();
            guard.send(&message)?;
            guard.receive(Some(INIT_RESPONSE_TIMEOUT))?
        };

        self.client_id.store(response.init_pid, Ordering::SeqCst);
        self.plan9_port.store(response.plan9_port, Ordering::SeqCst);

        {
            let mut config = self.config.lock();
            if response.default_uid != config.default_uid {
                config.default_uid = response.default_uid;
                self.registration.set_default_uid(response.default_uid)?;
            }
        }
        if let Some(flavor) = &response.flavor {
            self.registration.set_flavor(flavor)?;
        }
        if let Some(os_version) = &response.os_version {
            self.registration.set_os_version(os_version)?;
        }

        self.init_channel.send(&NetworkInformation {
            resolv_conf: self.environment.resolv_conf.clone(),
        })?;

        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(
            distribution = %name,
            init_pid = response.init_pid,
            plan9_port = response.plan9_port,
            "instance initialized"
        );
        Ok(())
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn distribution_id(&self) -> Uuid {
        self.config.lock().id
    }

    pub fn client_id(&self) -> u32 {
        self.client_id.load(Ordering::SeqCst)
    }

    pub fn lifetime_key(&self) -> u64 {
        self.lifetime_key
    }

    pub fn plan9_port(&self) -> Option<u32> {
        match self.plan9_port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    pub fn default_uid(&self) -> u32 {
        self.config.lock().default_uid
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn init_channel(&self) -> &Arc<SocketChannel> {
        &self.init_channel
    }

    pub fn set_system_distro(&self, sibling: Arc<VmInstance>) {
        *self.system_distro.lock() = Some(sibling);
    }

    pub fn distribution_information(&self) -> DistributionInfo {
        let config = self.config.lock();
        DistributionInfo {
            id: config.id,
            name: config.name.clone(),
            package_family_name: config.package_family_name.clone(),
            init_pid: self.client_id(),
        }
    }

    pub fn create_process(
        &self,
        console: ConsoleData,
        params: CreateProcessParams,
    ) -> LxResult<CreatedProcess> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(LxError::IllegalStateChange("create-process on a stopped instance"));
        }

        let leader = self
            .console_manager
            .get()
            .expect("console manager wired at construction")
            .get_session_leader(&console, params.elevated)?;

        self.mount_drives_if_needed(&leader, params.elevated)?;

        let (default_uid, allow_oobe) = {
            let config = self.config.lock();
            (config.default_uid, config.run_oobe && params.allow_oobe)
        };

        let message = CreateProcessVm {
            common: CreateProcessCommon {
                default_uid,
                filename: params.filename.clone(),
                current_directory: params.current_directory.clone(),
                command_line: params.command_line.clone(),
                environment: params.environment.clone(),
                nt_environment: params.nt_environment.clone(),
                shell_options: params.shell_options,
                nt_path: params.nt_path.clone().unwrap_or_default(),
                username: params.username.clone().unwrap_or_default(),
                flags: params.flags,
            },
            columns: params.columns,
            rows: params.rows,
            std_console_flags: params.std_console_flags,
            elevated: params.elevated,
            interop_enabled: params.interop_enabled,
            allow_oobe,
        };

        let response: ResultMessage = leader.transaction(&message)?;
        if response.result <= 0 {
            return Err(LxError::Internal(format!(
                "guest create-process failed: {}",
                response.result
            )));
        }
        let port = response.result as u32;

        // Fixed connection order: stdin, stdout, stderr, control channel,
        // interop socket, then the OOBE channel when requested.
        let mut connect = || {
            self.vm.transport().connect(
                self.vm.id(),
                port,
                INIT_RESPONSE_TIMEOUT,
                Some(self.vm.terminating_event().as_ref()),
            )
        };
        let stdin = connect()?;
        let stdout = connect()?;
        let stderr = connect()?;
        let control = connect()?;
        let interop = connect()?;
        let oobe = if allow_oobe { Some(connect()?) } else { None };

        if let Some(oobe_stream) = &oobe {
            self.spawn_oobe_worker(oobe_stream.try_clone()?)?;
        }

        Ok(CreatedProcess::Vm {
            stdin,
            stdout,
            stderr,
            control,
            interop,
            oobe,
        })
    }

    /// Mount host drives for the requested elevation bucket if the
    /// distribution wants them and the bucket is still unmounted.
    fn mount_drives_if_needed(&self, leader: &SocketChannel, elevated: bool) -> LxResult<()> {
        let (wants_drives, default_uid) = {
            let config = self.config.lock();
            (
                config
                    .flags
                    .contains(DistributionFlags::ENABLE_DRIVE_MOUNTING),
                config.default_uid,
            )
        };
        if !wants_drives {
            return Ok(());
        }

        let mut buckets = self.drvfs_mounted.lock();
        let bucket = if elevated {
            &mut buckets.admin
        } else {
            &mut buckets.non_admin
        };
        if *bucket {
            return Ok(());
        }

        let response: ResultMessage = leader.transaction(&RemountDrvfs {
            drive_bitmap: self.environment.drive_bitmap,
            unreadable_drive_bitmap: self.environment.unreadable_drive_bitmap,
            default_uid,
            admin: elevated,
        })?;
        if response.result != 0 {
            return Err(LxError::Internal(format!(
                "drive mount failed: {}",
                response.result
            )));
        }

        *bucket = true;
        Ok(())
    }

    /// Watch the OOBE channel; success clears the first-run flag and adopts
    /// the chosen default uid.
    fn spawn_oobe_worker(&self, stream: std::os::unix::net::UnixStream) -> LxResult<()> {
        let registration = self.registration.clone();
        let channel = SocketChannel::with_cancel(stream, "oobe", Some(self.oobe_cancel.clone()));

        let thread = std::thread::Builder::new().name("oobe".into()).spawn(move || {
            match channel.receive_or_closed::<OobeResult>(None) {
                Ok(Some(result)) if result.result == 0 => {
                    tracing::info!(default_uid = result.default_uid, "first-run setup completed");
                    if let Err(err) = registration.set_run_oobe(false) {
                        tracing::warn!(error = %err, "failed to clear first-run flag");
                    }
                    if let Err(err) = registration.set_default_uid(result.default_uid) {
                        tracing::warn!(error = %err, "failed to persist default uid");
                    }
                }
                Ok(Some(result)) => {
                    tracing::warn!(result = result.result, "first-run setup failed");
                }
                Ok(None) => {}
                Err(err) => tracing::debug!(error = %err, "OOBE channel closed"),
            }
        })?;

        let mut slot = self.oobe_thread.lock();
        if let Some(previous) = slot.replace(thread) {
            let _ = previous.join();
        }
        Ok(())
    }

    pub fn request_stop(&self, force: bool) -> LxResult<bool> {
        match self
            .init_channel
            .transaction::<_, ResultMessage>(&TerminateInstance { force })
        {
            Ok(response) => Ok(response.result == 0),
            Err(err) if err.is_gone() => Ok(true),
            Err(err) => Err(err),
        }
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Dropping the sibling closes its channels too.
        self.system_distro.lock().take();

        self.init_channel.close();
        self.oobe_cancel.set();
        if let Some(thread) = self.oobe_thread.lock().take() {
            let _ = thread.join();
        }
        tracing::info!(instance = %self.instance_id, "instance stopped");
    }

    pub fn update_timezone(&self, timezone: &str) -> LxResult<()> {
        self.init_channel.send(&TimezoneInformation {
            timezone: timezone.to_string(),
        })
    }

    pub fn update_network_information(&self, resolv_conf: &str) -> LxResult<()> {
        self.init_channel.send(&NetworkInformation {
            resolv_conf: resolv_conf.to_string(),
        })
    }

    /// Register the remote-filesystem connection target for the calling
    /// user. Safe to call for already-running instances.
    pub fn register_plan9_connection_target(&self, _user_sid: &str) -> LxResult<()> {
        // The redirector driver connection target is per-user state owned by
        // the platform adapter; nothing to do for the in-tree transports.
        Ok(())
    }
}

impl InitPort for VmInstance {
    fn create_session_leader(
        &self,
        console_id: u32,
        _client: &ProcessHandle,
    ) -> LxResult<Arc<SocketChannel>> {
        let response: ResultMessage = {
            let mut guard = self.init_channel.lock();
            guard.send(&CreateSession { console_id })?;
            guard.receive(Some(INIT_RESPONSE_TIMEOUT))?
        };
        if response.result <= 0 {
            return Err(LxError::Internal(format!(
                "guest refused session leader: {}",
                response.result
            )));
        }

        let stream = self.vm.transport().connect(
            self.vm.id(),
            response.result as u32,
            INIT_RESPONSE_TIMEOUT,
            Some(self.vm.terminating_event().as_ref()),
        )?;
        Ok(Arc::new(SocketChannel::with_cancel(
            stream,
            format!("session-leader-{console_id}"),
            Some(self.vm.terminating_event().clone()),
        )))
    }

    fn disconnect_console(&self, console_id: u32, _first_client: &ProcessHandle) {
        if let Err(err) = self.init_channel.send(&DisconnectConsole { console_id }) {
            if !err.is_gone() {
                tracing::warn!(error = %err, console_id, "console disconnect failed");
            }
        }
    }
}
