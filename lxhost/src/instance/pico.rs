//! Legacy in-kernel instance flavor.
//!
//! The kernel subsystem driver creates the instance and starts init; the
//! init message port becomes the control channel once init connects.
//! Process creation marshals the caller's stdio handles and a primary token
//! through the driver, sends the create message, and unmarshals the reply
//! into a host process handle.

use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use lxhost_shared::channel::SocketChannel;
use lxhost_shared::errors::{LxError, LxResult};
use lxhost_shared::protocol::{
    ConfigurationInformation, ConfigurationInformationResponse, CreateProcessCommon,
    CreateProcessLegacy, CreateSession, NetworkInformation, ResultMessage, TerminateInstance,
    TimezoneInformation,
};

use crate::console::{ConsoleData, ConsoleManager, InitPort};
use crate::lifetime::LifetimeManager;
use crate::netfilter::IpTablesEmulator;
use crate::platform::{
    FirewallRegistry, NatRegistry, PicoInstanceHandle, PicoLaunchConfig, PicoSubsystem,
    ProcessHandle,
};
use crate::plugin::DistributionInfo;
use crate::registry::DistributionRegistration;

use super::{CreateProcessParams, CreatedProcess, DistributionConfig, InstanceEnvironment};

/// Default wait for the init message port connection.
const INIT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait for the kernel instance to finish terminating during stop.
const TERMINATION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PicoInstance {
    instance_id: Uuid,
    config: Mutex<DistributionConfig>,
    registration: DistributionRegistration,
    environment: InstanceEnvironment,
    handle: Box<dyn PicoInstanceHandle>,
    init_channel: Arc<SocketChannel>,
    lifetime_key: u64,
    console_manager: OnceLock<Arc<ConsoleManager>>,
    iptables: Arc<IpTablesEmulator>,
    temp_path: std::path::PathBuf,
    running: AtomicBool,
}

impl PicoInstance {
    pub fn create(
        subsystem: &Arc<dyn PicoSubsystem>,
        registration: DistributionRegistration,
        config: DistributionConfig,
        environment: InstanceEnvironment,
        temp_root: &std::path::Path,
        nat_registry: Arc<dyn NatRegistry>,
        firewall_registry: Arc<dyn FirewallRegistry>,
        lifetime_manager: Arc<LifetimeManager>,
    ) -> LxResult<Arc<Self>> {
        let instance_id = Uuid::new_v4();

        // The per-instance temp directory is wiped and recreated on every
        // launch.
        let temp_path = temp_root.join(format!("instance-{instance_id}"));
        let _ = std::fs::remove_dir_all(&temp_path);
        std::fs::create_dir_all(&temp_path)?;

        let handle = subsystem.create_instance(&PicoLaunchConfig {
            instance_id,
            distribution_id: config.id,
            base_path: config.base_path.clone(),
            temp_path: temp_path.clone(),
            elevated: false,
        })?;

        let init_stream = handle.wait_for_init_connection(INIT_CONNECT_TIMEOUT)?;
        let init_channel = Arc::new(SocketChannel::new(
            init_stream,
            format!("init-{}", config.name),
        ));

        // Guest iptables requests surface through the driver callback pipe.
        let iptables = IpTablesEmulator::new(nat_registry, firewall_registry);
        iptables.enable(handle.callback_source())?;

        let lifetime_key = lifetime_manager.register_id();
        let instance = Arc::new(Self {
            instance_id,
            config: Mutex::new(config),
            registration,
            environment,
            handle,
            init_channel,
            lifetime_key,
            console_manager: OnceLock::new(),
            iptables,
            temp_path,
            running: AtomicBool::new(true),
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
        let message = {
            let config = self.config.lock();
            ConfigurationInformation {
                feature_flags: self.environment.feature_flags,
                default_uid: config.default_uid,
                drive_bitmap: self.environment.drive_bitmap,
                mount_drives: config
                    .flags
                    .contains(crate::registry::DistributionFlags::ENABLE_DRIVE_MOUNTING),
                timezone: self.environment.timezone.clone(),
                hostname: self.environment.hostname.clone(),
                plan9_socket_path: self.environment.plan9_socket_path.clone(),
            }
        };

        let response: ConfigurationInformationResponse = {
            let mut guard = self.init_channel.lock();
            guard.send(&message)?;
            guard.receive(Some(INIT_CONNECT_TIMEOUT))?
        };

        {
            let mut config = self.config.lock();
            if response.default_uid != config.default_uid {
                config.default_uid = response.default_uid;
                self.registration.set_default_uid(response.default_uid)?;
            }
        }

        self.init_channel.send(&NetworkInformation {
            resolv_conf: self.environment.resolv_conf.clone(),
        })?;
        Ok(())
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn distribution_id(&self) -> Uuid {
        self.config.lock().id
    }

    pub fn lifetime_key(&self) -> u64 {
        self.lifetime_key
    }

    pub fn init_channel(&self) -> &Arc<SocketChannel> {
        &self.init_channel
    }

    /// The remote-filesystem redirector only serves VM-hosted instances;
    /// nothing to register for the in-kernel flavor.
    pub fn register_plan9_connection_target(&self, _user_sid: &str) -> LxResult<()> {
        Ok(())
    }

    pub fn distribution_information(&self) -> DistributionInfo {
        let config = self.config.lock();
        DistributionInfo {
            id: config.id,
            name: config.name.clone(),
            package_family_name: config.package_family_name.clone(),
            init_pid: super::CLIENT_ID_INVALID,
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

        let _leader = self
            .console_manager
            .get()
            .expect("console manager wired at construction")
            .get_session_leader(&console, params.elevated)?;

        let stdio = params.stdio.as_ref().ok_or_else(|| {
            LxError::InvalidArgument("legacy create-process requires stdio handles".into())
        })?;

        // Marshal stdio and the primary token; every id must be released if
        // a later step fails.
        let mut marshalled: Vec<u32> = Vec::with_capacity(4);
        let release_all = |handle: &dyn PicoInstanceHandle, ids: &[u32]| {
            for id in ids {
                if let Err(err) = handle.release_handle(*id) {
                    tracing::warn!(error = %err, id, "failed to release marshalled handle");
                }
            }
        };

        let mut stdio_ids = [0u32; 3];
        for (index, fd) in stdio.iter().enumerate() {
            match self.handle.marshal_handle(fd.as_fd()) {
                Ok(id) => {
                    stdio_ids[index] = id;
                    marshalled.push(id);
                }
                Err(err) => {
                    release_all(self.handle.as_ref(), &marshalled);
                    return Err(err);
                }
            }
        }
        let token_id = match self.handle.marshal_fork_token() {
            Ok(id) => {
                marshalled.push(id);
                id
            }
            Err(err) => {
                release_all(self.handle.as_ref(), &marshalled);
                return Err(err);
            }
        };

        let message = CreateProcessLegacy {
            common: CreateProcessCommon {
                default_uid: self.config.lock().default_uid,
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
            stdio_ids,
            token_id,
        };

        let result = (|| -> LxResult<ProcessHandle> {
            let mut guard = self.init_channel.lock();
            guard.send(&message)?;
            let response: ResultMessage = guard.receive(Some(INIT_CONNECT_TIMEOUT))?;
            if response.result <= 0 {
                return Err(LxError::Internal(format!(
                    "guest create-process failed: {}",
                    response.result
                )));
            }

            let process = self.handle.unmarshal_process(response.result as u32)?;
            // Positive acknowledgement releases the kernel-side marshal
            // state for the new process.
            guard.send(&ResultMessage { result: 0 })?;
            Ok(process)
        })();

        match result {
            Ok(process) => Ok(CreatedProcess::Pico { process }),
            Err(err) => {
                // Negative acknowledgement cancels the marshal.
                let _ = self.init_channel.send(&ResultMessage { result: -1 });
                release_all(self.handle.as_ref(), &marshalled);
                Err(err)
            }
        }
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

        if let Err(err) = self.handle.request_stop() {
            tracing::warn!(error = %err, "kernel instance stop request failed");
        }
        if let Err(err) = self.handle.wait_for_termination(TERMINATION_TIMEOUT) {
            tracing::warn!(error = %err, "kernel instance did not terminate in time");
        }

        self.iptables.stop();
        self.init_channel.close();

        if let Err(err) = std::fs::remove_dir_all(&self.temp_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %err, "failed to delete instance temp directory");
            }
        }
        tracing::info!(instance = %self.instance_id, "legacy instance stopped");
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
}

impl InitPort for PicoInstance {
    fn create_session_leader(
        &self,
        _console_id: u32,
        client: &ProcessHandle,
    ) -> LxResult<Arc<SocketChannel>> {
        let marshal_id = self.handle.marshal_console(client.pid())?;

        let result = (|| -> LxResult<Arc<SocketChannel>> {
            self.init_channel.send(&CreateSession {
                console_id: marshal_id,
            })?;
            let stream = self.handle.wait_for_session_connection(INIT_CONNECT_TIMEOUT)?;
            Ok(Arc::new(SocketChannel::new(stream, "session-leader")))
        })();

        if result.is_err() {
            if let Err(err) = self.handle.release_console(marshal_id) {
                tracing::warn!(error = %err, "failed to release marshalled console");
            }
        }
        result
    }

    fn disconnect_console(&self, _console_id: u32, first_client: &ProcessHandle) {
        if let Err(err) = self.handle.disconnect_console(first_client.pid()) {
            // Expected after instance teardown or when the tty already
            // closed its console reference.
            tracing::debug!(error = %err, "console disconnect failed");
        }
    }
}
