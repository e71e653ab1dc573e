//! Error types shared between the host service and the guest activities.
//!
//! Two layers: [`SyscallError`] wraps a single failed OS call with enough
//! context to diagnose it from a log line alone (call name, stringified
//! arguments, errno, source location), and [`LxError`] is the domain error
//! every public operation returns.

use std::fmt;
use std::panic::Location;
use std::time::Duration;

use thiserror::Error;

pub type LxResult<T> = Result<T, LxError>;

/// A failed syscall, annotated at the call site.
#[derive(Debug)]
pub struct SyscallError {
    call: &'static str,
    args: String,
    errno: i32,
    location: &'static Location<'static>,
}

impl SyscallError {
    #[track_caller]
    pub fn new(call: &'static str, args: impl fmt::Display, errno: i32) -> Self {
        Self {
            call,
            args: args.to_string(),
            errno,
            location: Location::caller(),
        }
    }

    /// Wrap the last OS error reported by the current thread.
    #[track_caller]
    pub fn last(call: &'static str, args: impl fmt::Display) -> Self {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self::new(call, args, errno)
    }

    pub fn call(&self) -> &'static str {
        self.call
    }

    pub fn errno(&self) -> i32 {
        self.errno
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) failed with errno {} ({}) at {}:{}",
            self.call,
            self.args,
            self.errno,
            std::io::Error::from_raw_os_error(self.errno),
            self.location.file(),
            self.location.line()
        )
    }
}

impl std::error::Error for SyscallError {}

/// Extension to lift `nix` results into [`SyscallError`] envelopes.
pub trait SyscallResultExt<T> {
    #[track_caller]
    fn syscall(self, call: &'static str, args: impl fmt::Display) -> Result<T, SyscallError>;
}

impl<T> SyscallResultExt<T> for Result<T, nix::errno::Errno> {
    #[track_caller]
    fn syscall(self, call: &'static str, args: impl fmt::Display) -> Result<T, SyscallError> {
        self.map_err(|errno| SyscallError::new(call, args, errno as i32))
    }
}

/// Domain errors surfaced by session, instance and channel operations.
#[derive(Debug, Error)]
pub enum LxError {
    #[error(transparent)]
    Syscall(#[from] SyscallError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation on channel '{channel}': {reason}")]
    Protocol { channel: String, reason: String },

    #[error("channel closed by peer")]
    ChannelClosed,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("distribution not found")]
    DistroNotFound,

    #[error("distribution is not stopped")]
    DistroNotStopped,

    #[error("no default distribution is configured")]
    DefaultDistroNotFound,

    #[error("distribution name is not valid")]
    DistroNameInvalid,

    #[error("a distribution with the same name or location already exists")]
    DistroAlreadyExists,

    #[error("operation is not valid for a virtual-machine-mode distribution")]
    VmModeInvalidState,

    #[error("legacy distributions are not supported on this host")]
    Wsl1NotSupported,

    #[error("legacy distributions are disabled")]
    Wsl1Disabled,

    #[error("operation requires a virtual-machine-mode distribution")]
    Wsl2Needed,

    #[error("drive mounting is disabled")]
    DiskMountDisabled,

    #[error("attached disk is corrupted")]
    DiskCorrupted,

    #[error("distribution import failed: {0}")]
    ImportFailed(String),

    #[error("distribution export failed: {0}")]
    ExportFailed(String),

    #[error("caller has lower integrity than the running instance")]
    LowerIntegrity,

    #[error("caller has higher integrity than the running instance")]
    HigherIntegrity,

    #[error("the supplied image is not a Linux distribution")]
    NotALinuxDistro,

    #[error("plugin '{0}' requires a newer host")]
    PluginRequiresUpdate(String),

    #[error("plugin '{plugin}' rejected the operation: {message}")]
    PluginError { plugin: String, message: String },

    #[error("server is stopping")]
    ServerStopping,

    #[error("illegal state change in {0}")]
    IllegalStateChange(&'static str),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("compute system no longer exists")]
    ComputeSystemGone,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Internal(String),
}

impl LxError {
    /// True when the failure means the target object already went away and
    /// the caller should treat the operation as complete.
    pub fn is_gone(&self) -> bool {
        matches!(self, LxError::ComputeSystemGone | LxError::ChannelClosed)
    }
}
