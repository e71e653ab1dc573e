//! Platform adapter boundary.
//!
//! The core consumes several host services it does not implement: the
//! compute-system API, the host/guest stream-socket transport, the NAT and
//! firewall registries, the legacy in-kernel subsystem driver, and the
//! key/value persistence store. Each is a trait here; production bindings
//! live outside this crate, while the in-tree adapters ([`loopback`],
//! [`memory`]) back local development and the test suite.

pub mod loopback;
pub mod memory;
mod process;

pub use process::ProcessHandle;

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use lxhost_shared::errors::LxResult;
use lxhost_shared::sync::Event;

/// Reason a compute system stopped, derived from the exit event type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SystemExitEvent {
    Exited,
    CrashInitiated {
        crash_log: String,
    },
    CrashReport {
        crash_log: String,
        save_state_file: Option<PathBuf>,
    },
}

pub type SystemExitCallback = Box<dyn Fn(&SystemExitEvent) + Send + Sync>;

/// The hardware-partitioned VM service. Systems are described by a JSON
/// document and identified by uuid.
pub trait ComputeService: Send + Sync {
    fn create_system(&self, id: Uuid, document: &str) -> LxResult<Arc<dyn ComputeSystem>>;

    /// Open an existing system. Fails with [`ComputeSystemGone`] when it no
    /// longer exists.
    ///
    /// [`ComputeSystemGone`]: lxhost_shared::errors::LxError::ComputeSystemGone
    fn open_system(&self, id: Uuid) -> LxResult<Arc<dyn ComputeSystem>>;

    /// Grant the VM access to a host path (disk images, saved-state files).
    fn grant_vm_access(&self, vm_id: Uuid, path: &Path) -> LxResult<()>;

    fn revoke_vm_access(&self, vm_id: Uuid, path: &Path) -> LxResult<()>;
}

pub trait ComputeSystem: Send + Sync {
    fn start(&self) -> LxResult<()>;

    /// Hard-stop the system. Tolerates an already-terminated system.
    fn terminate(&self) -> LxResult<()>;

    fn add_vhd(&self, path: &Path, lun: u32, read_only: bool) -> LxResult<()>;

    fn remove_vhd(&self, lun: u32) -> LxResult<()>;

    /// Hot-add the GPU mirroring device.
    fn add_gpu(&self) -> LxResult<()>;

    fn register_exit_callback(&self, callback: SystemExitCallback) -> LxResult<()>;
}

/// Stream-socket transport between host and guest, keyed by `(vm id, port)`.
pub trait VmTransport: Send + Sync {
    fn listen(&self, vm_id: Uuid, port: u32) -> LxResult<Box<dyn VmListener>>;

    fn connect(
        &self,
        vm_id: Uuid,
        port: u32,
        timeout: Duration,
        cancel: Option<&Event>,
    ) -> LxResult<UnixStream>;
}

pub trait VmListener: Send + Sync {
    fn accept(&self, timeout: Option<Duration>, cancel: Option<&Event>) -> LxResult<UnixStream>;

    fn port(&self) -> u32;
}

/// Named host NAT instances backing masquerade emulation.
pub trait NatRegistry: Send + Sync {
    fn create(&self, name: &str) -> LxResult<()>;

    fn remove(&self, name: &str) -> LxResult<()>;

    fn list_names(&self) -> LxResult<Vec<String>>;
}

/// A host firewall allow rule: inbound TCP to `address:port`, public
/// profile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirewallRule {
    pub name: String,
    pub address: std::net::Ipv4Addr,
    pub port: u16,
}

pub trait FirewallRegistry: Send + Sync {
    fn add_rule(&self, rule: &FirewallRule) -> LxResult<()>;

    fn remove_rule(&self, name: &str) -> LxResult<()>;

    fn list_rules(&self) -> LxResult<Vec<FirewallRule>>;
}

/// The remote-filesystem helper that serves host folders into guests.
pub trait ShareProvider: Send + Sync {
    fn add_plan9_share(
        &self,
        vm_id: Uuid,
        name: &str,
        host_path: &Path,
        port: u32,
        read_only: bool,
    ) -> LxResult<()>;

    fn remove_plan9_share(&self, vm_id: Uuid, name: &str) -> LxResult<()>;

    /// Returns the device instance id of the new virtiofs device.
    fn add_virtiofs_device(
        &self,
        vm_id: Uuid,
        tag: &str,
        host_path: &Path,
        read_only: bool,
    ) -> LxResult<Uuid>;

    fn remove_virtiofs_device(&self, vm_id: Uuid, device_instance_id: Uuid) -> LxResult<()>;
}

/// Host timezone-change notifications.
pub trait TimezoneSource: Send + Sync {
    /// Block until the host timezone changes or `cancel` is set. Returns the
    /// new timezone, or `None` on cancellation.
    fn wait_for_change(&self, cancel: &Event) -> Option<String>;
}

/// Kernel-to-user async callback pipe: requests are posted by the driver and
/// answered with a status code.
pub trait UserCallbackSource: Send + Sync {
    /// Block until the next request. Returns the callback id and payload
    /// length, or `None` once cancelled.
    fn next_request(&self, buffer: &mut [u8]) -> LxResult<Option<(u64, usize)>>;

    fn send_response(&self, callback_id: u64, status: i32) -> LxResult<()>;

    /// Stop the pipe; a blocked [`Self::next_request`] returns `None`.
    fn cancel(&self);
}

/// Launch parameters for a legacy in-kernel instance.
#[derive(Clone, Debug)]
pub struct PicoLaunchConfig {
    pub instance_id: Uuid,
    pub distribution_id: Uuid,
    pub base_path: PathBuf,
    pub temp_path: PathBuf,
    pub elevated: bool,
}

/// The legacy in-kernel subsystem driver surface: instance creation, handle
/// marshalling and the iptables callback pipe.
pub trait PicoSubsystem: Send + Sync {
    fn create_instance(&self, config: &PicoLaunchConfig) -> LxResult<Box<dyn PicoInstanceHandle>>;
}

pub trait PicoInstanceHandle: Send + Sync {
    /// Wait for init to connect its message port.
    fn wait_for_init_connection(&self, timeout: Duration) -> LxResult<UnixStream>;

    /// Wait for the next connection on the instance server port (session
    /// leaders connect here after a create-session request).
    fn wait_for_session_connection(&self, timeout: Duration) -> LxResult<UnixStream>;

    fn marshal_console(&self, client_pid: u32) -> LxResult<u32>;

    fn release_console(&self, console_id: u32) -> LxResult<()>;

    /// Drop the console reference held on behalf of a client process.
    /// Expected to fail quietly once the instance is gone.
    fn disconnect_console(&self, client_pid: u32) -> LxResult<()>;

    fn marshal_handle(&self, fd: std::os::fd::BorrowedFd<'_>) -> LxResult<u32>;

    fn marshal_fork_token(&self) -> LxResult<u32>;

    fn release_handle(&self, handle_id: u32) -> LxResult<()>;

    fn unmarshal_process(&self, process_id: u32) -> LxResult<ProcessHandle>;

    /// The iptables up-call pipe for this instance.
    fn callback_source(&self) -> Arc<dyn UserCallbackSource>;

    fn request_stop(&self) -> LxResult<()>;

    fn wait_for_termination(&self, timeout: Duration) -> LxResult<()>;
}
