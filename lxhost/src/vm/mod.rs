//! Per-user utility virtual machine.
//!
//! Owns the compute system, the guest init channel, the attached-disk and
//! folder-share tables, and the crash-capture thread. Instances are hosted
//! inside this VM; each gets its own control channel through
//! [`VirtualMachine::connect_instance_channel`].

pub mod crash;
mod disk;
mod schema;
mod share;

pub use disk::{AttachedDisk, DiskTable};
pub use share::{FolderShare, ShareImplementation, ShareTable};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use lxhost_shared::channel::SocketChannel;
use lxhost_shared::errors::{LxError, LxResult};
use lxhost_shared::protocol::{GetDisk, GetDiskResponse, LaunchInit, ResultMessage, Signal};
use lxhost_shared::sync::Event;

use crate::platform::{
    ComputeService, ComputeSystem, ShareProvider, SystemExitEvent, VmTransport,
};
use crate::registry::disk_state::PersistedDisk;

/// Well-known guest ports.
pub const INIT_PORT: u32 = 50000;
pub const CRASH_DUMP_PORT: u32 = 50001;
pub const PLAN9_PORT: u32 = 50002;

/// How long teardown waits for a clean guest exit before force-terminating.
const EXIT_WAIT_ON_DESTROY: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct VmSettings {
    pub display_name: String,
    pub memory_mb: u64,
    pub processor_count: u32,
    pub boot_timeout: Duration,
    pub kernel_path: PathBuf,
    pub initrd_path: PathBuf,
    pub system_vhd_path: PathBuf,
    pub kernel_modules_vhd_path: PathBuf,
    pub crash_dump_dir: PathBuf,
    pub dmesg_pipe: String,
    pub debug_shell_pipe: Option<String>,
    pub enable_gpu: bool,
    pub enable_virtiofs: bool,
    pub use_pmem_boot_devices: bool,
    pub enable_hardware_performance_counters: bool,
    /// Favor density over latency in the memory backing configuration; only
    /// safe on host builds with the partition-teardown fix.
    pub enable_cold_discard_tuning: bool,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            display_name: "lxhost".to_string(),
            memory_mb: 2048,
            processor_count: 4,
            boot_timeout: Duration::from_secs(30),
            kernel_path: PathBuf::from("tools/kernel"),
            initrd_path: PathBuf::from("tools/initrd.img"),
            system_vhd_path: PathBuf::from("tools/system.vhd"),
            kernel_modules_vhd_path: PathBuf::from("tools/modules.vhd"),
            crash_dump_dir: PathBuf::from("crashes"),
            dmesg_pipe: String::new(),
            debug_shell_pipe: None,
            enable_gpu: false,
            enable_virtiofs: false,
            use_pmem_boot_devices: false,
            enable_hardware_performance_counters: false,
            enable_cold_discard_tuning: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    Shutdown,
    Crashed,
    Unknown,
}

pub type TerminationCallback = Box<dyn Fn(TerminationReason, &str) + Send + Sync>;

/// State shared with the compute-system exit callback, which may fire
/// before the [`VirtualMachine`] handle exists.
struct ExitState {
    id_string: String,
    crash_dump_dir: PathBuf,
    exit_event: Arc<Event>,
    termination_callback: Mutex<Option<TerminationCallback>>,
    crash_log_captured: AtomicBool,
}

impl ExitState {
    fn on_exit(&self, event: &SystemExitEvent) {
        tracing::info!(vm = %self.id_string, ?event, "compute system exited");

        let (reason, details) = match event {
            SystemExitEvent::Exited => (TerminationReason::Shutdown, String::new()),
            SystemExitEvent::CrashInitiated { crash_log } => {
                self.capture_crash_log(crash_log);
                (TerminationReason::Crashed, crash_log.clone())
            }
            SystemExitEvent::CrashReport {
                crash_log,
                save_state_file,
            } => {
                self.capture_crash_log(crash_log);
                if save_state_file.is_some() {
                    crash::enforce_saved_state_limit(&self.crash_dump_dir);
                }
                (TerminationReason::Crashed, crash_log.clone())
            }
        };

        self.exit_event.set();

        if let Some(callback) = &*self.termination_callback.lock() {
            callback(reason, &details);
        }
    }

    fn capture_crash_log(&self, crash_log: &str) {
        if crash_log.is_empty() || self.crash_log_captured.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) =
            crash::write_kernel_panic_log(&self.crash_dump_dir, &self.id_string, crash_log)
        {
            tracing::warn!(error = %err, "failed to write kernel panic log");
        }
    }
}

struct VmTables {
    disks: DiskTable,
    shares: ShareTable,
}

pub struct VirtualMachine {
    id: Uuid,
    settings: VmSettings,
    compute_service: Arc<dyn ComputeService>,
    transport: Arc<dyn VmTransport>,
    share_provider: Arc<dyn ShareProvider>,
    system: Arc<dyn ComputeSystem>,
    init_channel: SocketChannel,
    tables: Mutex<VmTables>,
    exit_state: Arc<ExitState>,
    terminating_event: Arc<Event>,
    crash_thread: Mutex<Option<JoinHandle<()>>>,
}

impl VirtualMachine {
    /// Boot a new utility VM: build the compute document, create and start
    /// the system, and wait for the guest init connection.
    pub fn start(
        settings: VmSettings,
        user_sid: &str,
        compute_service: Arc<dyn ComputeService>,
        transport: Arc<dyn VmTransport>,
        share_provider: Arc<dyn ShareProvider>,
    ) -> LxResult<Arc<Self>> {
        let id = Uuid::new_v4();
        let id_string = id.to_string().to_uppercase();

        let document = build_document(&settings, user_sid)?;
        tracing::debug!(vm = %id_string, %document, "creating compute system");

        let exit_event = Arc::new(Event::new()?);
        let terminating_event = Arc::new(Event::new()?);
        let exit_state = Arc::new(ExitState {
            id_string: id_string.clone(),
            crash_dump_dir: settings.crash_dump_dir.clone(),
            exit_event: exit_event.clone(),
            termination_callback: Mutex::new(None),
            crash_log_captured: AtomicBool::new(false),
        });

        // Listeners must exist before the guest boots.
        let init_listener = transport.listen(id, INIT_PORT)?;
        let crash_listener = transport.listen(id, CRASH_DUMP_PORT)?;

        let system = compute_service.create_system(id, &document)?;
        {
            let exit_state = exit_state.clone();
            system.register_exit_callback(Box::new(move |event| exit_state.on_exit(event)))?;
        }

        system.start()?;

        let init_stream = init_listener
            .accept(Some(settings.boot_timeout), Some(terminating_event.as_ref()))
            .map_err(|err| {
                tracing::error!(vm = %id_string, error = %err, "guest init did not connect");
                let _ = system.terminate();
                err
            })?;
        let init_channel = SocketChannel::with_cancel(
            init_stream,
            format!("mini-init-{id_string}"),
            Some(terminating_event.clone()),
        );

        if settings.enable_gpu {
            system.add_gpu()?;
        }

        let crash_thread = {
            let exit_event = exit_event.clone();
            let crash_dir = settings.crash_dump_dir.clone();
            std::thread::Builder::new()
                .name("crash-dump".into())
                .spawn(move || crash::collect_crash_dumps(crash_listener, exit_event, crash_dir))?
        };

        tracing::info!(vm = %id_string, "virtual machine started");

        Ok(Arc::new(Self {
            id,
            settings,
            compute_service,
            transport,
            share_provider,
            system,
            init_channel,
            tables: Mutex::new(VmTables {
                disks: DiskTable::default(),
                shares: ShareTable::default(),
            }),
            exit_state,
            terminating_event,
            crash_thread: Mutex::new(Some(crash_thread)),
        }))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn id_string(&self) -> &str {
        &self.exit_state.id_string
    }

    pub fn settings(&self) -> &VmSettings {
        &self.settings
    }

    pub fn transport(&self) -> &Arc<dyn VmTransport> {
        &self.transport
    }

    pub fn terminating_event(&self) -> &Arc<Event> {
        &self.terminating_event
    }

    pub fn has_exited(&self) -> bool {
        self.exit_state.exit_event.is_set()
    }

    /// Register the external sink notified when the compute system exits.
    /// Only one sink may be registered.
    pub fn register_termination_callback(&self, callback: TerminationCallback) -> LxResult<()> {
        let mut slot = self.exit_state.termination_callback.lock();
        if slot.is_some() {
            return Err(LxError::InvalidArgument(
                "termination callback already registered".into(),
            ));
        }
        *slot = Some(callback);
        Ok(())
    }

    /// Ask the guest supervisor to start an init for a distribution and
    /// connect to its control channel.
    pub fn connect_instance_channel(
        &self,
        distribution_id: Uuid,
        name: &str,
    ) -> LxResult<std::os::unix::net::UnixStream> {
        let response: ResultMessage = self.init_channel.transaction(&LaunchInit {
            distribution_id,
            name: name.to_string(),
        })?;
        if response.result <= 0 {
            return Err(LxError::Internal(format!(
                "guest failed to launch init for {name}: {}",
                response.result
            )));
        }

        self.transport.connect(
            self.id,
            response.result as u32,
            self.settings.boot_timeout,
            Some(self.terminating_event.as_ref()),
        )
    }

    /// Deliver a signal to a guest process.
    pub fn signal(&self, pid: i32, signal: i32) -> LxResult<()> {
        let response: ResultMessage = self.init_channel.transaction(&Signal { pid, signal })?;
        if response.result != 0 {
            return Err(LxError::Internal(format!(
                "guest signal delivery failed: {}",
                response.result
            )));
        }
        Ok(())
    }

    /// Attach a VHD: pick the smallest unused LUN, add it to the compute
    /// system (granting VM access on the first access-denied failure), and
    /// ask init for the device node. Unwinds in reverse on any failure.
    pub fn attach_disk(&self, path: &Path, read_only: bool) -> LxResult<(u32, String)> {
        let mut tables = self.tables.lock();
        let lun = tables.disks.next_lun();

        let mut access_granted = false;
        if let Err(err) = self.system.add_vhd(path, lun, read_only) {
            let LxError::AccessDenied(_) = err else {
                return Err(err);
            };
            self.compute_service.grant_vm_access(self.id, path)?;
            access_granted = true;
            if let Err(err) = self.system.add_vhd(path, lun, read_only) {
                let _ = self.compute_service.revoke_vm_access(self.id, path);
                return Err(err);
            }
        }

        let device = match self.query_disk_device(lun) {
            Ok(device) => device,
            Err(err) => {
                let _ = self.system.remove_vhd(lun);
                if access_granted {
                    let _ = self.compute_service.revoke_vm_access(self.id, path);
                }
                return Err(err);
            }
        };

        tables.disks.insert(AttachedDisk {
            lun,
            path: path.to_path_buf(),
            device_node: Some(device.clone()),
            read_only,
            access_granted,
        });

        tracing::info!(lun, path = %path.display(), %device, "attached disk");
        Ok((lun, device))
    }

    fn query_disk_device(&self, lun: u32) -> LxResult<String> {
        let response: GetDiskResponse = self.init_channel.transaction(&GetDisk { lun })?;
        if response.result != 0 {
            return Err(LxError::DiskCorrupted);
        }
        Ok(response.device)
    }

    pub fn detach_disk(&self, lun: u32) -> LxResult<()> {
        let mut tables = self.tables.lock();
        let disk = tables.disks.remove(lun).ok_or_else(|| {
            LxError::InvalidArgument(format!("lun {lun} is not attached"))
        })?;

        self.system.remove_vhd(lun)?;
        if disk.access_granted {
            let _ = self.compute_service.revoke_vm_access(self.id, &disk.path);
        }
        tracing::info!(lun, path = %disk.path.display(), "detached disk");
        Ok(())
    }

    pub fn detach_disk_by_path(&self, path: &Path) -> LxResult<()> {
        let lun = {
            let tables = self.tables.lock();
            tables
                .disks
                .find_by_path(path)
                .map(|disk| disk.lun)
                .ok_or_else(|| {
                    LxError::InvalidArgument(format!("{} is not attached", path.display()))
                })?
        };
        self.detach_disk(lun)
    }

    pub fn attached_disks(&self) -> Vec<AttachedDisk> {
        self.tables.lock().disks.iter().cloned().collect()
    }

    /// Attached-disk state for persistence across a VM crash.
    pub fn persisted_disk_state(&self) -> Vec<PersistedDisk> {
        self.tables
            .lock()
            .disks
            .iter()
            .map(|disk| PersistedDisk {
                path: disk.path.clone(),
                read_only: disk.read_only,
            })
            .collect()
    }

    /// Share a host folder into the guest. `linux_path` must be unique per
    /// VM.
    pub fn add_share(
        &self,
        host_path: &Path,
        linux_path: &str,
        read_only: bool,
    ) -> LxResult<Uuid> {
        let mut tables = self.tables.lock();
        if tables.shares.contains_linux_path(linux_path) {
            return Err(LxError::InvalidArgument(format!(
                "'{linux_path}' is already shared"
            )));
        }

        let share_id = Uuid::new_v4();
        let implementation = if self.settings.enable_virtiofs {
            let device_instance_id = self.share_provider.add_virtiofs_device(
                self.id,
                &share_id.to_string(),
                host_path,
                read_only,
            )?;
            ShareImplementation::VirtioFs { device_instance_id }
        } else {
            self.share_provider.add_plan9_share(
                self.id,
                &share_id.to_string(),
                host_path,
                PLAN9_PORT,
                read_only,
            )?;
            ShareImplementation::Plan9 { port: PLAN9_PORT }
        };

        tables.shares.insert(FolderShare {
            share_id,
            linux_path: linux_path.to_string(),
            host_path: host_path.to_path_buf(),
            read_only,
            implementation,
        });

        tracing::info!(%share_id, linux_path, host_path = %host_path.display(), "added share");
        Ok(share_id)
    }

    pub fn remove_share(&self, share_id: Uuid) -> LxResult<()> {
        let mut tables = self.tables.lock();
        let share = tables.shares.remove(share_id).ok_or_else(|| {
            LxError::InvalidArgument(format!("share {share_id} does not exist"))
        })?;

        match &share.implementation {
            ShareImplementation::Plan9 { .. } => self
                .share_provider
                .remove_plan9_share(self.id, &share.share_id.to_string())?,
            ShareImplementation::VirtioFs { device_instance_id } => self
                .share_provider
                .remove_virtiofs_device(self.id, *device_instance_id)?,
        }
        Ok(())
    }

    pub fn shares(&self) -> Vec<FolderShare> {
        self.tables.lock().shares.iter().cloned().collect()
    }

    /// Guest init channel for instance-independent operations.
    pub fn init_channel(&self) -> &SocketChannel {
        &self.init_channel
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        tracing::info!(vm = %self.exit_state.id_string, "terminating virtual machine");
        self.terminating_event.set();
        self.init_channel.close();

        let mut forced = false;
        if !self.exit_state.exit_event.wait(Some(EXIT_WAIT_ON_DESTROY)) {
            forced = true;
            if let Err(err) = self.system.terminate() {
                if !err.is_gone() {
                    tracing::warn!(error = %err, "failed to force-terminate compute system");
                }
            }
        }
        tracing::info!(vm = %self.exit_state.id_string, forced, "virtual machine terminated");

        if let Some(thread) = self.crash_thread.lock().take() {
            let _ = thread.join();
        }

        // Revoke the access grants owed by attached disks.
        let tables = self.tables.lock();
        for disk in tables.disks.iter() {
            if disk.access_granted {
                if let Err(err) = self.compute_service.revoke_vm_access(self.id, &disk.path) {
                    tracing::warn!(error = %err, path = %disk.path.display(), "failed to revoke disk access");
                }
            }
        }
    }
}

/// Assemble the compute-system JSON document.
fn build_document(settings: &VmSettings, user_sid: &str) -> LxResult<String> {
    let mut kernel_cmd_line = format!(
        "initrd=\\initrd.img lxhost_root_init=1 panic=-1 nr_cpus={}",
        settings.processor_count
    );
    // Sync the clock on resume from modern standby.
    kernel_cmd_line.push_str(" hv_utils.timesync_implicit=1");
    kernel_cmd_line.push_str(" console=hvc0 debug");

    let mut memory = schema::Memory {
        // The compute service enforces 2MB granularity.
        size_in_mb: settings.memory_mb & !0x1,
        allow_overcommit: true,
        enable_deferred_commit: true,
        enable_cold_discard_hint: true,
        hosting_process_name_suffix: Some(settings.display_name.clone()),
        ..Default::default()
    };
    if settings.enable_cold_discard_tuning {
        memory.backing_page_size = Some("Small".to_string());
        memory.fault_cluster_size_shift = Some(4);
        memory.direct_map_fault_cluster_size_shift = Some(4);
    }

    let processor = schema::Processor {
        count: settings.processor_count,
        enable_perfmon_pmu: settings
            .enable_hardware_performance_counters
            .then_some(true),
        enable_perfmon_lbr: settings
            .enable_hardware_performance_counters
            .then_some(true),
    };

    let mut devices = schema::Devices::default();

    let mut virtio_serial = schema::VirtioSerial::default();
    virtio_serial.ports.insert(
        "0".to_string(),
        schema::VirtioSerialPort {
            name: "hvc0".to_string(),
            named_pipe: settings.dmesg_pipe.clone(),
            console_support: true,
        },
    );
    if let Some(debug_shell_pipe) = &settings.debug_shell_pipe {
        virtio_serial.ports.insert(
            "1".to_string(),
            schema::VirtioSerialPort {
                name: "hvc1".to_string(),
                named_pipe: debug_shell_pipe.clone(),
                console_support: true,
            },
        );
    }
    devices.virtio_serial = Some(virtio_serial);

    if settings.use_pmem_boot_devices {
        devices.pmem.insert(
            "0".to_string(),
            schema::PmemDevice {
                image_path: settings.system_vhd_path.display().to_string(),
                read_only: true,
            },
        );
        devices.pmem.insert(
            "1".to_string(),
            schema::PmemDevice {
                image_path: settings.kernel_modules_vhd_path.display().to_string(),
                read_only: true,
            },
        );
        devices.scsi.insert("0".to_string(), schema::Scsi::default());
    } else {
        let mut scsi = schema::Scsi::default();
        scsi.attachments.insert(
            "0".to_string(),
            schema::ScsiAttachment {
                attachment_type: "VirtualDisk".to_string(),
                path: settings.system_vhd_path.display().to_string(),
                read_only: true,
            },
        );
        scsi.attachments.insert(
            "1".to_string(),
            schema::ScsiAttachment {
                attachment_type: "VirtualDisk".to_string(),
                path: settings.kernel_modules_vhd_path.display().to_string(),
                read_only: true,
            },
        );
        devices.scsi.insert("0".to_string(), scsi);
    }

    let descriptor = schema::hvsocket_security_descriptor(user_sid);
    devices.hv_socket = Some(schema::HvSocket {
        hv_socket_config: schema::HvSocketSystemConfig {
            default_bind_security_descriptor: descriptor.clone(),
            default_connect_security_descriptor: descriptor,
        },
    });

    let document = schema::ComputeSystemDocument {
        owner: "lxhost".to_string(),
        should_terminate_on_last_handle_closed: true,
        schema_version: schema::SchemaVersion { major: 2, minor: 3 },
        virtual_machine: schema::VirtualMachineSettings {
            stop_on_reset: true,
            chipset: schema::Chipset {
                use_utc: true,
                linux_kernel_direct: Some(schema::LinuxKernelDirect {
                    kernel_file_path: settings.kernel_path.display().to_string(),
                    init_rd_path: settings.initrd_path.display().to_string(),
                    kernel_cmd_line,
                }),
                uefi: None,
            },
            compute_topology: schema::ComputeTopology { memory, processor },
            devices,
        },
    };

    serde_json::to_string(&document).map_err(|err| LxError::Internal(err.to_string()))
}
