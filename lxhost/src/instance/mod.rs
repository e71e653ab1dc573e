//! Running distribution instances.
//!
//! An instance is a running distribution: either a legacy in-kernel
//! pico-process tree ([`PicoInstance`]) or an init-plus-tree inside the
//! utility VM ([`VmInstance`]). Both flavors share one behavior set; the
//! session stores them behind [`RunningInstance`].

mod hosted;
mod pico;

pub use hosted::VmInstance;
pub use pico::PicoInstance;

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use lxhost_shared::errors::LxResult;

use crate::console::ConsoleData;
use crate::platform::ProcessHandle;
use crate::plugin::DistributionInfo;
use crate::registry::DistributionFlags;

/// Client id of instances that do not run inside the utility VM.
pub const CLIENT_ID_INVALID: u32 = u32::MAX;

/// Snapshot of the registration taken when the instance starts.
#[derive(Clone, Debug)]
pub struct DistributionConfig {
    pub id: Uuid,
    pub name: String,
    pub flags: DistributionFlags,
    pub default_uid: u32,
    pub package_family_name: Option<String>,
    pub run_oobe: bool,
    pub base_path: PathBuf,
}

/// Ambient host state pushed to the guest during initialization.
#[derive(Clone, Debug, Default)]
pub struct InstanceEnvironment {
    pub hostname: String,
    pub timezone: String,
    pub drive_bitmap: u32,
    pub unreadable_drive_bitmap: u32,
    pub resolv_conf: String,
    pub plan9_socket_path: String,
    pub feature_flags: u32,
}

/// Launch parameters for a process inside a distribution.
#[derive(Debug, Default)]
pub struct CreateProcessParams {
    pub filename: String,
    pub current_directory: String,
    pub command_line: Vec<String>,
    pub environment: Vec<String>,
    pub nt_environment: Vec<String>,
    pub nt_path: Option<String>,
    pub username: Option<String>,
    pub shell_options: u32,
    pub flags: u32,
    pub columns: u32,
    pub rows: u32,
    pub std_console_flags: u32,
    pub elevated: bool,
    pub interop_enabled: bool,
    pub allow_oobe: bool,
    /// Caller stdio, marshalled into legacy instances. VM-hosted instances
    /// plumb stdio over dedicated socket connections instead.
    pub stdio: Option<[OwnedFd; 3]>,
}

/// The launched process, by flavor.
#[derive(Debug)]
pub enum CreatedProcess {
    /// Legacy flavor: an unmarshalled host handle to the new process.
    Pico { process: ProcessHandle },
    /// VM flavor: the fixed-order fd connections to the in-guest process.
    Vm {
        stdin: UnixStream,
        stdout: UnixStream,
        stderr: UnixStream,
        control: UnixStream,
        interop: UnixStream,
        oobe: Option<UnixStream>,
    },
}

/// A running distribution, tagged by flavor.
#[derive(Clone)]
pub enum RunningInstance {
    Pico(Arc<PicoInstance>),
    Vm(Arc<VmInstance>),
}

impl RunningInstance {
    pub fn instance_id(&self) -> Uuid {
        match self {
            Self::Pico(instance) => instance.instance_id(),
            Self::Vm(instance) => instance.instance_id(),
        }
    }

    pub fn distribution_id(&self) -> Uuid {
        match self {
            Self::Pico(instance) => instance.distribution_id(),
            Self::Vm(instance) => instance.distribution_id(),
        }
    }

    /// In-guest init pid for VM-hosted instances; [`CLIENT_ID_INVALID`] for
    /// legacy instances.
    pub fn client_id(&self) -> u32 {
        match self {
            Self::Pico(_) => CLIENT_ID_INVALID,
            Self::Vm(instance) => instance.client_id(),
        }
    }

    pub fn lifetime_key(&self) -> u64 {
        match self {
            Self::Pico(instance) => instance.lifetime_key(),
            Self::Vm(instance) => instance.lifetime_key(),
        }
    }

    pub fn is_vm_hosted(&self) -> bool {
        matches!(self, Self::Vm(_))
    }

    pub fn create_process(
        &self,
        console: ConsoleData,
        params: CreateProcessParams,
    ) -> LxResult<CreatedProcess> {
        match self {
            Self::Pico(instance) => instance.create_process(console, params),
            Self::Vm(instance) => instance.create_process(console, params),
        }
    }

    /// Ask init to terminate. Returns false when init refused because user
    /// processes are still running (and `force` was not set).
    pub fn request_stop(&self, force: bool) -> LxResult<bool> {
        match self {
            Self::Pico(instance) => instance.request_stop(force),
            Self::Vm(instance) => instance.request_stop(force),
        }
    }

    pub fn stop(&self) {
        match self {
            Self::Pico(instance) => instance.stop(),
            Self::Vm(instance) => instance.stop(),
        }
    }

    pub fn update_timezone(&self, timezone: &str) -> LxResult<()> {
        match self {
            Self::Pico(instance) => instance.update_timezone(timezone),
            Self::Vm(instance) => instance.update_timezone(timezone),
        }
    }

    pub fn update_network_information(&self, resolv_conf: &str) -> LxResult<()> {
        match self {
            Self::Pico(instance) => instance.update_network_information(resolv_conf),
            Self::Vm(instance) => instance.update_network_information(resolv_conf),
        }
    }

    pub fn distribution_information(&self) -> DistributionInfo {
        match self {
            Self::Pico(instance) => instance.distribution_information(),
            Self::Vm(instance) => instance.distribution_information(),
        }
    }

    /// Control channel to the instance's init process.
    pub fn init_port(&self) -> &Arc<lxhost_shared::channel::SocketChannel> {
        match self {
            Self::Pico(instance) => instance.init_channel(),
            Self::Vm(instance) => instance.init_channel(),
        }
    }

    /// Register the remote-filesystem connection target for the calling
    /// user; required even for already-running instances because the caller
    /// may run under a different authentication context.
    pub fn register_plan9_connection_target(&self, user_sid: &str) -> LxResult<()> {
        match self {
            Self::Pico(instance) => instance.register_plan9_connection_target(user_sid),
            Self::Vm(instance) => instance.register_plan9_connection_target(user_sid),
        }
    }
}
