//! Per-user session.
//!
//! The session owns the user's utility VM (created lazily), the running
//! instances, the locked-for-conversion set, disk-mount persistence, the
//! idle-termination timer, and the plugin event dispatch. Operations are
//! serialized by a recursive operation lock so plugin hooks may call back
//! into the session; the data tables live behind a separate short-held
//! mutex that is never held across blocking guest traffic.

pub mod factory;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use uuid::Uuid;

use lxhost_shared::errors::{LxError, LxResult};
use lxhost_shared::sync::Event;

use crate::console::ConsoleData;
use crate::instance::{
    CreateProcessParams, CreatedProcess, DistributionConfig, InstanceEnvironment, PicoInstance,
    RunningInstance, VmInstance, CLIENT_ID_INVALID,
};
use crate::lifetime::LifetimeManager;
use crate::platform::{
    ComputeService, FirewallRegistry, NatRegistry, PicoSubsystem, ProcessHandle, ShareProvider,
    TimezoneSource, VmTransport,
};
use crate::plugin::{PluginManager, VmEventContext};
use crate::registry::{
    disk_state, DistributionFlags, DistributionRegistration, DistributionState,
    RegistrationParams, Store, CURRENT_DISTRIBUTION_VERSION, VM_MODE_VHD_NAME,
};
use crate::timer::Timer;
use crate::vm::{VirtualMachine, VmSettings};

/// Terminates every VM-hosted instance and drops the VM when passed to
/// [`UserSession::terminate_by_client_id`].
pub const CLIENT_ID_WILDCARD: u32 = u32::MAX - 1;

#[derive(Clone)]
pub struct SessionPlatform {
    pub compute: Arc<dyn ComputeService>,
    pub transport: Arc<dyn VmTransport>,
    pub shares: Arc<dyn ShareProvider>,
    pub nat: Arc<dyn NatRegistry>,
    pub firewall: Arc<dyn FirewallRegistry>,
    pub store: Arc<dyn Store>,
    pub pico: Option<Arc<dyn PicoSubsystem>>,
    pub timezone: Option<Arc<dyn TimezoneSource>>,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub hostname: String,
    pub timezone: String,
    pub resolv_conf: String,
    pub drive_bitmap: u32,
    pub unreadable_drive_bitmap: u32,
    pub feature_flags: u32,
    pub plan9_socket_path: String,
    pub install_root: PathBuf,
    pub temp_root: PathBuf,
    pub vm: VmSettings,
    /// `None` disables idle VM termination.
    pub vm_idle_timeout: Option<Duration>,
    /// Timeout before an instance with no remaining clients is stopped;
    /// `None` disables instance idle termination.
    pub instance_idle_timeout: Option<Duration>,
    /// How long a forced shutdown waits for the operation lock before
    /// escalating.
    pub shutdown_lock_timeout: Duration,
    pub enable_legacy_instances: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hostname: "host".to_string(),
            timezone: "UTC".to_string(),
            resolv_conf: "nameserver 10.255.255.254\n".to_string(),
            drive_bitmap: 0b100,
            unreadable_drive_bitmap: 0,
            feature_flags: 0,
            plan9_socket_path: String::new(),
            install_root: PathBuf::from("distributions"),
            temp_root: std::env::temp_dir(),
            vm: VmSettings::default(),
            vm_idle_timeout: Some(Duration::from_secs(60)),
            instance_idle_timeout: Some(Duration::from_secs(15)),
            shutdown_lock_timeout: Duration::from_secs(30),
            enable_legacy_instances: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownBehavior {
    /// Take the operation lock, stop all instances, drop the VM.
    Wait,
    /// Terminate the compute system out-of-band first, then proceed as
    /// `Wait`.
    Force,
    /// Try the operation lock for the configured timeout; on timeout,
    /// escalate to `Force`.
    ForceAfter30Seconds,
}

#[derive(Clone, Debug)]
pub struct DistributionSummary {
    pub id: Uuid,
    pub name: String,
    pub version: u32,
    pub state: DistributionState,
    pub flags: DistributionFlags,
    pub default_uid: u32,
    pub is_default: bool,
}

pub struct RegisterDistributionRequest {
    pub name: String,
    pub version: u32,
    pub base_path: Option<PathBuf>,
    pub package_family_name: Option<String>,
    pub enable_oobe: bool,
}

#[derive(Default)]
struct SessionState {
    running_instances: HashMap<Uuid, RunningInstance>,
    locked_distributions: Vec<(Uuid, DistributionState)>,
    vm: Option<Arc<VirtualMachine>>,
    updated_init_distros: HashSet<Uuid>,
}

pub struct UserSession {
    inner: Arc<SessionInner>,
}

impl Clone for UserSession {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct SessionInner {
    self_weak: Weak<SessionInner>,
    user_sid: String,
    session_id: u32,
    cookie: u32,
    config: SessionConfig,
    platform: SessionPlatform,
    plugins: Arc<PluginManager>,
    lifetime_manager: Arc<LifetimeManager>,
    /// Serializes session operations; recursive because plugin hooks may
    /// call back in.
    op_lock: ReentrantMutex<()>,
    state: Mutex<SessionState>,
    /// Stopped instances park here so their destructors run outside the
    /// session locks.
    terminated_instances: Mutex<Vec<RunningInstance>>,
    idle_timer: Timer,
    allow_new_instances: AtomicBool,
    vm_id_hint: Mutex<Option<Uuid>>,
    /// Cached proxy environment pushed into created processes; reset on
    /// shutdown so it is re-detected on the next VM.
    proxy_environment: Mutex<Option<Vec<String>>>,
    timezone_cancel: Arc<Event>,
    timezone_thread: Mutex<Option<JoinHandle<()>>>,
}

impl UserSession {
    pub fn new(
        user_sid: impl Into<String>,
        session_id: u32,
        cookie: u32,
        config: SessionConfig,
        platform: SessionPlatform,
        plugins: Arc<PluginManager>,
    ) -> LxResult<Self> {
        let lifetime_manager = Arc::new(LifetimeManager::new()?);
        let timezone_cancel = Arc::new(Event::new()?);

        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let timer_weak = weak.clone();
            let idle_timer = Timer::new(move || {
                if let Some(inner) = timer_weak.upgrade() {
                    inner.on_idle_timeout();
                }
            });

            SessionInner {
                self_weak: weak.clone(),
                user_sid: user_sid.into(),
                session_id,
                cookie,
                config,
                platform,
                plugins,
                lifetime_manager,
                op_lock: ReentrantMutex::new(()),
                state: Mutex::new(SessionState::default()),
                terminated_instances: Mutex::new(Vec::new()),
                idle_timer,
                allow_new_instances: AtomicBool::new(true),
                vm_id_hint: Mutex::new(None),
                proxy_environment: Mutex::new(None),
                timezone_cancel,
                timezone_thread: Mutex::new(None),
            }
        });

        inner.start_timezone_listener();
        Ok(Self { inner })
    }

    pub fn user_sid(&self) -> &str {
        &self.inner.user_sid
    }

    pub fn session_id(&self) -> u32 {
        self.inner.session_id
    }

    pub fn cookie(&self) -> u32 {
        self.inner.cookie
    }

    /// Start (or find) the instance for a distribution. Registers the
    /// caller's process with the lifetime manager so the instance is
    /// idle-stopped once its last client exits.
    pub fn create_instance(
        &self,
        distribution: Option<Uuid>,
        caller: Option<&ProcessHandle>,
    ) -> LxResult<Uuid> {
        let _op = self.inner.op_lock.lock();
        let instance = self.inner.ensure_instance(distribution, caller)?;
        Ok(instance.distribution_id())
    }

    /// Launch a process inside a distribution, creating the instance if
    /// needed.
    pub fn create_process(
        &self,
        distribution: Option<Uuid>,
        caller: Option<&ProcessHandle>,
        console: ConsoleData,
        mut params: CreateProcessParams,
    ) -> LxResult<CreatedProcess> {
        let _op = self.inner.op_lock.lock();
        let instance = self.inner.ensure_instance(distribution, caller)?;

        if params.environment.is_empty() {
            let registration = DistributionRegistration::open(
                self.inner.platform.store.clone(),
                instance.distribution_id(),
            )?;
            params.environment = registration.default_environment()?;
        }
        if let Some(proxy) = &*self.inner.proxy_environment.lock() {
            params.environment.extend(proxy.iter().cloned());
        }

        instance.create_process(console, params)
    }

    pub fn terminate_distribution(&self, distribution: Option<Uuid>) -> LxResult<()> {
        {
            let _op = self.inner.op_lock.lock();
            let registration = DistributionRegistration::open_or_default(
                self.inner.platform.store.clone(),
                distribution,
            )?;
            self.inner.terminate_instance_internal(registration.id(), false);
        }
        // Stopped-instance destructors run outside the session locks.
        self.inner.drain_terminated_instances();
        Ok(())
    }

    /// Terminate instances by in-guest client id. [`CLIENT_ID_WILDCARD`]
    /// terminates every VM-hosted instance and drops the VM (used when the
    /// utility VM exits unexpectedly).
    pub fn terminate_by_client_id(&self, client_id: u32) {
        if client_id == CLIENT_ID_INVALID {
            return;
        }

        let _op = self.inner.op_lock.lock();
        let matching: Vec<Uuid> = {
            let state = self.inner.state.lock();
            state
                .running_instances
                .values()
                .filter(|instance| {
                    let id = instance.client_id();
                    id == client_id
                        || (client_id == CLIENT_ID_WILDCARD && id != CLIENT_ID_INVALID)
                })
                .map(|instance| instance.distribution_id())
                .collect()
        };

        for distribution_id in matching {
            self.inner.terminate_instance_internal(distribution_id, true);
        }

        if client_id == CLIENT_ID_WILDCARD {
            self.inner.vm_terminate(false);
        }
        self.inner.drain_terminated_instances();
    }

    pub fn shutdown(&self, prevent_new_instances: bool, behavior: ShutdownBehavior) {
        self.inner.shutdown(prevent_new_instances, behavior);
    }

    pub fn register_distribution(
        &self,
        request: RegisterDistributionRequest,
    ) -> LxResult<Uuid> {
        let _op = self.inner.op_lock.lock();
        self.inner.register_distribution(request)
    }

    pub fn unregister_distribution(&self, distribution: Option<Uuid>) -> LxResult<()> {
        let _op = self.inner.op_lock.lock();
        self.inner.unregister_distribution(distribution)
    }

    /// Convert a distribution between the legacy and VM-hosted formats.
    pub fn set_version(&self, distribution: Option<Uuid>, version: u32) -> LxResult<()> {
        let _op = self.inner.op_lock.lock();
        self.inner.set_version(distribution, version)
    }

    /// Export a distribution's filesystem. The content pipeline is owned by
    /// the external filesystem helper; the session contributes locking and
    /// lifecycle.
    pub fn export_distribution(&self, distribution: Option<Uuid>) -> LxResult<()> {
        let _op = self.inner.op_lock.lock();
        let registration = DistributionRegistration::open_or_default(
            self.inner.platform.store.clone(),
            distribution,
        )?;
        self.inner
            .with_locked_distribution(&registration, DistributionState::Exporting, |inner| {
                let _vm = inner.ensure_vm()?;
                Ok(())
            })
    }

    pub fn attach_disk(&self, path: &std::path::Path, read_only: bool) -> LxResult<(u32, String)> {
        let _op = self.inner.op_lock.lock();
        let vm = self.inner.ensure_vm()?;
        let result = vm.attach_disk(path, read_only)?;
        disk_state::save(&self.inner.platform.store, &vm.persisted_disk_state())?;
        Ok(result)
    }

    pub fn detach_disk(&self, path: &std::path::Path) -> LxResult<()> {
        let _op = self.inner.op_lock.lock();
        let vm = {
            let state = self.inner.state.lock();
            state.vm.clone()
        }
        .ok_or(LxError::IllegalStateChange("detach-disk without a running VM"))?;
        vm.detach_disk_by_path(path)?;
        disk_state::save(&self.inner.platform.store, &vm.persisted_disk_state())?;
        Ok(())
    }

    pub fn list_distributions(&self) -> LxResult<Vec<DistributionSummary>> {
        let store = &self.inner.platform.store;
        let default_id = DistributionRegistration::default_id(store)?;
        let mut summaries = Vec::new();
        for registration in DistributionRegistration::list(store)? {
            let flags = registration.flags()?;
            summaries.push(DistributionSummary {
                id: registration.id(),
                name: registration.name()?,
                version: registration.version()?,
                state: registration.state()?,
                flags,
                default_uid: registration.default_uid()?,
                is_default: default_id == Some(registration.id()),
            });
        }
        Ok(summaries)
    }

    pub fn get_distribution_id(&self, name: &str) -> LxResult<Uuid> {
        for registration in DistributionRegistration::list(&self.inner.platform.store)? {
            if registration.name()?.eq_ignore_ascii_case(name) {
                return Ok(registration.id());
            }
        }
        Err(LxError::DistroNotFound)
    }

    pub fn get_default_distribution(&self) -> LxResult<Option<Uuid>> {
        DistributionRegistration::default_id(&self.inner.platform.store)
    }

    pub fn set_default_distribution(&self, distribution: Uuid) -> LxResult<()> {
        let registration =
            DistributionRegistration::open(self.inner.platform.store.clone(), distribution)?;
        DistributionRegistration::set_default(&self.inner.platform.store, Some(&registration))
    }

    /// Update the default uid and mutable flags of a registration. The
    /// VM-mode flag is not mutable through this path.
    pub fn configure_distribution(
        &self,
        distribution: Option<Uuid>,
        default_uid: u32,
        flags: DistributionFlags,
    ) -> LxResult<()> {
        let _op = self.inner.op_lock.lock();
        let registration = DistributionRegistration::open_or_default(
            self.inner.platform.store.clone(),
            distribution,
        )?;

        let current = registration.flags()?;
        if flags.contains(DistributionFlags::VM_MODE)
            != current.contains(DistributionFlags::VM_MODE)
        {
            return Err(LxError::IllegalStateChange("configure-distribution"));
        }

        registration.set_default_uid(default_uid)?;
        registration.set_flags(flags)?;
        Ok(())
    }

    /// Host timezone changed; push the new value to every running instance.
    pub fn on_timezone_change(&self, timezone: &str) {
        self.inner.on_timezone_change(timezone);
    }

    /// Host connectivity changed; push new resolver configuration.
    pub fn on_network_change(&self, resolv_conf: &str) {
        let instances: Vec<RunningInstance> = {
            let state = self.inner.state.lock();
            state.running_instances.values().cloned().collect()
        };
        for instance in instances {
            if let Err(err) = instance.update_network_information(resolv_conf) {
                tracing::warn!(error = %err, "failed to push network information");
            }
        }
    }

    pub fn running_instance_count(&self) -> usize {
        self.inner.state.lock().running_instances.len()
    }

    pub fn has_vm(&self) -> bool {
        self.inner.state.lock().vm.is_some()
    }

    pub fn vm_idle_timer_armed(&self) -> bool {
        self.inner.idle_timer.is_armed()
    }

    pub fn lifetime_manager(&self) -> &Arc<LifetimeManager> {
        &self.inner.lifetime_manager
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.timezone_cancel.set();
        if let Some(thread) = self.timezone_thread.lock().take() {
            let _ = thread.join();
        }
        self.lifetime_manager.clear_all();
    }
}

impl SessionInner {
    fn start_timezone_listener(self: &Arc<Self>) {
        let Some(source) = self.platform.timezone.clone() else {
            return;
        };

        let weak = self.self_weak.clone();
        let cancel = self.timezone_cancel.clone();
        let thread = std::thread::Builder::new()
            .name("timezone".into())
            .spawn(move || loop {
                match source.wait_for_change(&cancel) {
                    Some(timezone) => {
                        if let Some(inner) = weak.upgrade() {
                            inner.on_timezone_change(&timezone);
                        } else {
                            return;
                        }
                    }
                    None => return,
                }
            });

        match thread {
            Ok(thread) => *self.timezone_thread.lock() = Some(thread),
            Err(err) => tracing::warn!(error = %err, "failed to start timezone listener"),
        }
    }

    fn on_timezone_change(&self, timezone: &str) {
        tracing::info!(timezone, "host timezone changed");
        let instances: Vec<RunningInstance> = {
            let state = self.state.lock();
            state.running_instances.values().cloned().collect()
        };
        for instance in instances {
            if let Err(err) = instance.update_timezone(timezone) {
                tracing::warn!(error = %err, "failed to push timezone update");
            }
        }
    }

    fn plugin_context(&self, vm_id: Uuid) -> VmEventContext {
        VmEventContext {
            vm_id,
            user_sid: self.user_sid.clone(),
        }
    }

    fn instance_environment(&self) -> InstanceEnvironment {
        InstanceEnvironment {
            hostname: self.config.hostname.clone(),
            timezone: self.config.timezone.clone(),
            drive_bitmap: self.config.drive_bitmap,
            unreadable_drive_bitmap: self.config.unreadable_drive_bitmap,
            resolv_conf: self.config.resolv_conf.clone(),
            plan9_socket_path: self.config.plan9_socket_path.clone(),
            feature_flags: self.config.feature_flags,
        }
    }

    /// Create the utility VM if it does not exist yet, firing the VM
    /// lifecycle plugin events and replaying persisted disk state.
    fn ensure_vm(&self) -> LxResult<Arc<VirtualMachine>> {
        if let Some(vm) = self.state.lock().vm.clone() {
            return Ok(vm);
        }

        let vm = VirtualMachine::start(
            self.config.vm.clone(),
            &self.user_sid,
            self.platform.compute.clone(),
            self.platform.transport.clone(),
            self.platform.shares.clone(),
        )?;

        if let Err(err) = self.plugins.on_vm_started(&self.plugin_context(vm.id())) {
            // The partially started VM is torn down by dropping it.
            return Err(err);
        }

        {
            let weak = self.self_weak.clone();
            let vm_id = vm.id();
            let terminating = vm.terminating_event().clone();
            vm.register_termination_callback(Box::new(move |reason, details| {
                // Teardown initiated by the session sets the terminating
                // event first; everything else is an unexpected exit.
                if terminating.is_set() {
                    return;
                }
                tracing::warn!(?reason, details, "utility VM exited unexpectedly");
                let weak = weak.clone();
                let spawned = std::thread::Builder::new().name("vm-exit".into()).spawn(
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.on_unexpected_vm_exit(vm_id);
                        }
                    },
                );
                if let Err(err) = spawned {
                    tracing::error!(error = %err, "failed to spawn VM exit handler");
                }
            }))?;
        }

        // Replay disk state left behind by an idle timeout or a crash.
        match disk_state::load(&self.platform.store) {
            Ok(disks) => {
                for disk in disks {
                    if let Err(err) = vm.attach_disk(&disk.path, disk.read_only) {
                        tracing::warn!(
                            error = %err,
                            path = %disk.path.display(),
                            "failed to re-attach persisted disk"
                        );
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to load persisted disk state"),
        }

        {
            let mut state = self.state.lock();
            state.vm = Some(vm.clone());
            // A VM with no instances yet is idle until something starts.
            self.vm_check_idle(&mut state);
        }
        *self.vm_id_hint.lock() = Some(vm.id());
        Ok(vm)
    }

    fn on_unexpected_vm_exit(&self, vm_id: Uuid) {
        let _op = self.op_lock.lock();

        let is_current = {
            let state = self.state.lock();
            state.vm.as_ref().is_some_and(|vm| vm.id() == vm_id)
        };
        if !is_current {
            return;
        }

        let matching: Vec<Uuid> = {
            let state = self.state.lock();
            state
                .running_instances
                .values()
                .filter(|instance| instance.client_id() != CLIENT_ID_INVALID)
                .map(|instance| instance.distribution_id())
                .collect()
        };
        for distribution_id in matching {
            self.terminate_instance_internal(distribution_id, true);
        }
        self.vm_terminate(false);
        self.drain_terminated_instances();
    }

    fn ensure_instance(
        &self,
        distribution: Option<Uuid>,
        caller: Option<&ProcessHandle>,
    ) -> LxResult<RunningInstance> {
        if !self.allow_new_instances.load(Ordering::SeqCst) {
            return Err(LxError::ServerStopping);
        }

        let registration =
            DistributionRegistration::open_or_default(self.platform.store.clone(), distribution)?;
        let distribution_id = registration.id();

        {
            let state = self.state.lock();
            if state
                .locked_distributions
                .iter()
                .any(|(id, _)| *id == distribution_id)
            {
                return Err(LxError::IllegalStateChange("create-instance on a locked distribution"));
            }
            if let Some(instance) = state.running_instances.get(&distribution_id) {
                let instance = instance.clone();
                drop(state);
                // The caller may run under a different authentication
                // context than the one that created the instance.
                instance.register_plan9_connection_target(&self.user_sid)?;
                self.register_instance_client(&instance, caller)?;
                return Ok(instance);
            }
        }

        match registration.state()? {
            DistributionState::Installed => {}
            DistributionState::Invalid => return Err(LxError::DistroNotFound),
            _ => return Err(LxError::IllegalStateChange("create-instance")),
        }

        let instance = self.start_instance(&registration)?;

        {
            let mut state = self.state.lock();
            state
                .running_instances
                .insert(distribution_id, instance.clone());
            self.vm_check_idle(&mut state);
        }

        instance.register_plan9_connection_target(&self.user_sid)?;
        self.register_instance_client(&instance, caller)?;
        Ok(instance)
    }

    fn start_instance(&self, registration: &DistributionRegistration) -> LxResult<RunningInstance> {
        let flags = registration.flags()?;
        let config = DistributionConfig {
            id: registration.id(),
            name: registration.name()?,
            flags,
            default_uid: registration.default_uid()?,
            package_family_name: registration.package_family_name()?,
            run_oobe: registration.run_oobe()?,
            base_path: registration.base_path()?,
        };

        if flags.contains(DistributionFlags::VM_MODE) {
            let vm = self.ensure_vm()?;
            self.update_init_once(registration.id());

            let instance = VmInstance::create(
                vm.clone(),
                registration.clone(),
                config,
                self.instance_environment(),
                self.lifetime_manager.clone(),
            )?;

            let info = instance.distribution_information();
            if let Err(err) = self
                .plugins
                .on_distribution_started(&self.plugin_context(vm.id()), &info)
            {
                instance.stop();
                return Err(err);
            }

            tracing::info!(distribution = %info.name, "distribution started");
            Ok(RunningInstance::Vm(instance))
        } else {
            if !self.config.enable_legacy_instances {
                return Err(LxError::Wsl1Disabled);
            }
            let Some(subsystem) = &self.platform.pico else {
                return Err(LxError::Wsl1NotSupported);
            };

            let instance = PicoInstance::create(
                subsystem,
                registration.clone(),
                config,
                self.instance_environment(),
                &self.config.temp_root,
                self.platform.nat.clone(),
                self.platform.firewall.clone(),
                self.lifetime_manager.clone(),
            )?;
            Ok(RunningInstance::Pico(instance))
        }
    }

    /// Refresh the init binary inside the distribution directory once per
    /// distribution per session. The copy itself is owned by the filesystem
    /// helper; the once-per-session bookkeeping lives here.
    fn update_init_once(&self, distribution_id: Uuid) {
        let mut state = self.state.lock();
        if state.updated_init_distros.insert(distribution_id) {
            tracing::debug!(%distribution_id, "refreshing init for distribution");
        }
    }

    fn register_instance_client(
        &self,
        instance: &RunningInstance,
        caller: Option<&ProcessHandle>,
    ) -> LxResult<()> {
        let Some(timeout) = self.config.instance_idle_timeout else {
            return Ok(());
        };

        let weak = self.self_weak.clone();
        let distribution_id = instance.distribution_id();
        self.lifetime_manager.register_callback(
            instance.lifetime_key(),
            Arc::new(move || match weak.upgrade() {
                Some(inner) => {
                    let _op = inner.op_lock.lock();
                    // Not forced: init refuses while user processes remain,
                    // and the stop is retried later.
                    let stopped = inner.terminate_instance_internal(distribution_id, false);
                    inner.drain_terminated_instances();
                    stopped
                }
                None => true,
            }),
            caller,
            timeout,
        )
    }

    /// Stop an instance. With `check_for_clients`, init may refuse because
    /// user processes are still running; a forced stop always succeeds.
    /// Returns whether the instance was stopped (or already gone).
    fn terminate_instance_internal(&self, distribution_id: Uuid, force: bool) -> bool {
        let Some(instance) = ({
            let state = self.state.lock();
            state.running_instances.get(&distribution_id).cloned()
        }) else {
            return true;
        };

        let mut stopped = match instance.request_stop(force) {
            Ok(stopped) => stopped,
            Err(err) => {
                tracing::warn!(error = %err, "instance stop request failed");
                false
            }
        };
        stopped = stopped || force;
        if !stopped {
            return false;
        }

        if instance.is_vm_hosted() {
            let vm_id = (*self.vm_id_hint.lock()).unwrap_or_else(Uuid::nil);
            self.plugins.on_distribution_stopping(
                &self.plugin_context(vm_id),
                &instance.distribution_information(),
            );
        }

        instance.stop();

        let client_id = instance.client_id();
        let lifetime_key = instance.lifetime_key();
        {
            let mut state = self.state.lock();
            state.running_instances.remove(&distribution_id);
            self.terminated_instances.lock().push(instance);
            self.lifetime_manager.remove_callback(lifetime_key);

            if client_id != CLIENT_ID_INVALID {
                self.vm_check_idle(&mut state);
            }
        }

        tracing::info!(%distribution_id, "instance terminated");
        true
    }

    /// Arm or cancel the idle-VM timer. Idle means: a VM exists, nothing is
    /// locked, and no VM-hosted instance is running.
    fn vm_check_idle(&self, state: &mut SessionState) {
        let has_vm_instances = state
            .running_instances
            .values()
            .any(|instance| instance.client_id() != CLIENT_ID_INVALID);
        let idle =
            state.vm.is_some() && state.locked_distributions.is_empty() && !has_vm_instances;

        if idle {
            if let Some(timeout) = self.config.vm_idle_timeout {
                self.idle_timer.arm(timeout);
            }
        } else {
            self.idle_timer.cancel();
        }
    }

    fn on_idle_timeout(&self) {
        let _op = self.op_lock.lock();

        let idle_vm = {
            let state = self.state.lock();
            let has_vm_instances = state
                .running_instances
                .values()
                .any(|instance| instance.client_id() != CLIENT_ID_INVALID);
            if state.locked_distributions.is_empty() && !has_vm_instances {
                state.vm.clone()
            } else {
                None
            }
        };

        let Some(vm) = idle_vm else {
            return;
        };

        tracing::info!("utility VM is idle, terminating");
        // Persist the attached-disk state so the next VM re-attaches.
        if let Err(err) = disk_state::save(&self.platform.store, &vm.persisted_disk_state()) {
            tracing::warn!(error = %err, "failed to persist disk state");
        }
        drop(vm);
        self.vm_terminate(false);
    }

    /// Drop the VM (if any). `clear_disk_state` wipes the persisted mounts,
    /// used by explicit shutdown.
    fn vm_terminate(&self, clear_disk_state: bool) {
        let vm = {
            let mut state = self.state.lock();
            state.vm.take()
        };

        if let Some(vm) = vm {
            self.plugins.on_vm_stopping(&self.plugin_context(vm.id()));
            // The VM's destructor blocks on guest teardown; run it outside
            // the data lock.
            drop(vm);
        }
        *self.vm_id_hint.lock() = None;

        if clear_disk_state {
            if let Err(err) = disk_state::clear(&self.platform.store) {
                tracing::warn!(error = %err, "failed to clear persisted disk state");
            }
        }
    }

    fn drain_terminated_instances(&self) {
        let drained: Vec<RunningInstance> = std::mem::take(&mut *self.terminated_instances.lock());
        drop(drained);
    }

    fn shutdown(&self, prevent_new_instances: bool, behavior: ShutdownBehavior) {
        let force_terminate = || {
            let vm_id = *self.vm_id_hint.lock();
            if let Some(vm_id) = vm_id {
                match self.platform.compute.open_system(vm_id) {
                    Ok(system) => {
                        if let Err(err) = system.terminate() {
                            if !err.is_gone() {
                                tracing::warn!(error = %err, "out-of-band terminate failed");
                            }
                        }
                    }
                    // Already gone; a concurrent idle shutdown may have won.
                    Err(err) if err.is_gone() => {}
                    Err(err) => tracing::warn!(error = %err, "failed to open compute system"),
                }
            }
        };

        if behavior == ShutdownBehavior::Force {
            force_terminate();
        }

        let _op = match behavior {
            ShutdownBehavior::ForceAfter30Seconds => {
                match self.op_lock.try_lock_for(self.config.shutdown_lock_timeout) {
                    Some(guard) => guard,
                    None => {
                        tracing::warn!("shutdown lock timed out; force-terminating the VM");
                        force_terminate();
                        self.op_lock.lock()
                    }
                }
            }
            _ => self.op_lock.lock(),
        };

        if prevent_new_instances {
            self.allow_new_instances.store(false, Ordering::SeqCst);
        }

        loop {
            let next = {
                let state = self.state.lock();
                state.running_instances.keys().next().copied()
            };
            let Some(distribution_id) = next else {
                break;
            };
            self.terminate_instance_internal(distribution_id, true);
        }

        self.vm_terminate(true);
        *self.proxy_environment.lock() = None;
        self.idle_timer.cancel();

        self.drain_terminated_instances();
        tracing::info!(session = self.session_id, "session shut down");
    }

    fn register_distribution(&self, request: RegisterDistributionRequest) -> LxResult<Uuid> {
        validate_distribution_name(&request.name)?;

        if request.version != 1 && request.version != CURRENT_DISTRIBUTION_VERSION {
            return Err(LxError::InvalidArgument(format!(
                "unsupported distribution version {}",
                request.version
            )));
        }
        if request.version == 1 {
            if !self.config.enable_legacy_instances {
                return Err(LxError::Wsl1Disabled);
            }
            if self.platform.pico.is_none() {
                return Err(LxError::Wsl1NotSupported);
            }
        }

        let base_path = request
            .base_path
            .clone()
            .unwrap_or_else(|| self.config.install_root.join(&request.name));

        // Name and location must both be free.
        for existing in DistributionRegistration::list(&self.platform.store)? {
            if existing.name()?.eq_ignore_ascii_case(&request.name) {
                return Err(LxError::DistroAlreadyExists);
            }
            if paths_equal(&existing.base_path()?, &base_path) {
                return Err(LxError::DistroAlreadyExists);
            }
        }

        let mut flags = DistributionFlags::default_flags();
        if request.version == CURRENT_DISTRIBUTION_VERSION {
            flags |= DistributionFlags::VM_MODE;
        }

        std::fs::create_dir_all(&base_path)?;

        let registration = DistributionRegistration::create(
            self.platform.store.clone(),
            RegistrationParams {
                id: None,
                name: request.name.clone(),
                version: request.version,
                base_path: base_path.clone(),
                flags,
                default_uid: 0,
                package_family_name: request.package_family_name.clone(),
                vhd_filename: VM_MODE_VHD_NAME.to_string(),
                enable_oobe: request.enable_oobe,
            },
        )?;

        // Any failure from here deletes everything written so far.
        let result = (|| -> LxResult<()> {
            if request.version == CURRENT_DISTRIBUTION_VERSION {
                std::fs::File::create(base_path.join(VM_MODE_VHD_NAME))?;
            }
            self.run_distribution_setup(&registration)?;
            registration.set_state(DistributionState::Installed)?;
            Ok(())
        })();

        if let Err(err) = result {
            tracing::error!(error = %err, name = %request.name, "distribution registration failed");
            if let Err(cleanup_err) = std::fs::remove_dir_all(&base_path) {
                if cleanup_err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(error = %cleanup_err, "failed to delete partial registration files");
                }
            }
            if let Err(cleanup_err) = registration.delete() {
                tracing::warn!(error = %cleanup_err, "failed to delete partial registration");
            }
            return Err(err);
        }

        if DistributionRegistration::default_id(&self.platform.store)?.is_none() {
            DistributionRegistration::set_default(&self.platform.store, Some(&registration))?;
        }

        tracing::info!(name = %request.name, id = %registration.id(), "distribution registered");
        Ok(registration.id())
    }

    /// Run the in-guest setup pass for a freshly written distribution: the
    /// image is booted once so init can prepare the filesystem.
    fn run_distribution_setup(&self, registration: &DistributionRegistration) -> LxResult<()> {
        if !registration
            .flags()?
            .contains(DistributionFlags::VM_MODE)
        {
            // Legacy setup runs a standalone extraction pico-process; the
            // kernel subsystem owns the extraction.
            return Ok(());
        }

        let vm = self.ensure_vm()?;
        let config = DistributionConfig {
            id: registration.id(),
            name: registration.name()?,
            flags: registration.flags()?,
            default_uid: registration.default_uid()?,
            package_family_name: registration.package_family_name()?,
            run_oobe: false,
            base_path: registration.base_path()?,
        };

        let instance = VmInstance::create(
            vm,
            registration.clone(),
            config,
            self.instance_environment(),
            self.lifetime_manager.clone(),
        )?;
        let _ = instance.request_stop(true);
        instance.stop();

        let mut state = self.state.lock();
        self.vm_check_idle(&mut state);
        Ok(())
    }

    fn unregister_distribution(&self, distribution: Option<Uuid>) -> LxResult<()> {
        let registration =
            DistributionRegistration::open_or_default(self.platform.store.clone(), distribution)?;
        let distribution_id = registration.id();

        {
            let state = self.state.lock();
            if state
                .locked_distributions
                .iter()
                .any(|(id, _)| *id == distribution_id)
            {
                return Err(LxError::IllegalStateChange("unregister-distribution"));
            }
        }

        self.terminate_instance_internal(distribution_id, true);

        registration.set_state(DistributionState::Uninstalling)?;
        let base_path = registration.base_path()?;
        if let Err(err) = std::fs::remove_dir_all(&base_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %err, "failed to delete distribution files");
            }
        }

        let was_default =
            DistributionRegistration::default_id(&self.platform.store)? == Some(distribution_id);
        registration.delete()?;

        if was_default {
            // Re-select the first remaining installed distribution.
            let replacement = DistributionRegistration::list(&self.platform.store)?
                .into_iter()
                .find(|registration| {
                    matches!(registration.state(), Ok(DistributionState::Installed))
                });
            DistributionRegistration::set_default(&self.platform.store, replacement.as_ref())?;
        }

        self.drain_terminated_instances();
        tracing::info!(%distribution_id, "distribution unregistered");
        Ok(())
    }

    fn set_version(&self, distribution: Option<Uuid>, version: u32) -> LxResult<()> {
        let registration =
            DistributionRegistration::open_or_default(self.platform.store.clone(), distribution)?;

        if version != 1 && version != CURRENT_DISTRIBUTION_VERSION {
            return Err(LxError::InvalidArgument(format!(
                "unsupported distribution version {version}"
            )));
        }

        let flags = registration.flags()?;
        let current_version = if flags.contains(DistributionFlags::VM_MODE) {
            CURRENT_DISTRIBUTION_VERSION
        } else {
            1
        };
        if current_version == version {
            return Err(LxError::InvalidArgument(
                "distribution is already the requested version".into(),
            ));
        }
        if version == 1 {
            if !self.config.enable_legacy_instances {
                return Err(LxError::Wsl1Disabled);
            }
            if self.platform.pico.is_none() {
                return Err(LxError::Wsl1NotSupported);
            }
        }

        self.with_locked_distribution(&registration, DistributionState::Converting, |inner| {
            // The conversion exports from one format and imports into the
            // other through a shared VM; the content transform itself is the
            // filesystem helper's job.
            let _vm = inner.ensure_vm()?;

            let mut new_flags = flags;
            new_flags.toggle(DistributionFlags::VM_MODE);
            registration.set_flags(new_flags)?;
            registration.set_version(version)?;
            Ok(())
        })
    }

    /// Lock a distribution for a conversion-style operation: terminate it,
    /// mark it locked with the given state, run `operation`, then restore.
    /// A locked distribution cannot be started or mutated.
    fn with_locked_distribution<T>(
        &self,
        registration: &DistributionRegistration,
        lock_state: DistributionState,
        operation: impl FnOnce(&Self) -> LxResult<T>,
    ) -> LxResult<T> {
        let distribution_id = registration.id();
        let previous_state = registration.state()?;

        {
            let mut state = self.state.lock();
            if state
                .locked_distributions
                .iter()
                .any(|(id, _)| *id == distribution_id)
            {
                return Err(LxError::IllegalStateChange("distribution is already locked"));
            }
            state.locked_distributions.push((distribution_id, lock_state));
        }

        // From here the lock entry must be removed on every path.
        let result = (|| {
            // Locking terminates the distribution; it cannot run while
            // locked.
            self.terminate_instance_internal(distribution_id, true);
            registration.set_state(lock_state)?;
            operation(self)
        })();

        let restored_state = if result.is_ok() {
            DistributionState::Installed
        } else {
            previous_state
        };
        if let Err(err) = registration.set_state(restored_state) {
            tracing::warn!(error = %err, "failed to restore distribution state");
        }

        {
            let mut state = self.state.lock();
            state
                .locked_distributions
                .retain(|(id, _)| *id != distribution_id);
            self.vm_check_idle(&mut state);
        }

        self.drain_terminated_instances();
        result
    }
}

fn validate_distribution_name(name: &str) -> LxResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(LxError::DistroNameInvalid)
    }
}

fn paths_equal(a: &std::path::Path, b: &std::path::Path) -> bool {
    let canonical_a = std::fs::canonicalize(a).unwrap_or_else(|_| a.to_path_buf());
    let canonical_b = std::fs::canonicalize(b).unwrap_or_else(|_| b.to_path_buf());
    canonical_a == canonical_b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_names_are_validated() {
        assert!(validate_distribution_name("Ubuntu-22.04").is_ok());
        assert!(validate_distribution_name("a_b").is_ok());
        assert!(matches!(
            validate_distribution_name(""),
            Err(LxError::DistroNameInvalid)
        ));
        assert!(matches!(
            validate_distribution_name("bad name"),
            Err(LxError::DistroNameInvalid)
        ));
        assert!(matches!(
            validate_distribution_name("slash/name"),
            Err(LxError::DistroNameInvalid)
        ));
    }
}
