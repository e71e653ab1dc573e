//! Waitable process handles.
//!
//! A [`ProcessHandle`] is a pollable fd that becomes readable when the
//! process exits. On Linux this is a pidfd; tests substitute any fd with the
//! same readiness contract (typically the read end of a pipe whose write end
//! the "process" holds).

use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};

use lxhost_shared::errors::{LxResult, SyscallError};
use lxhost_shared::sync::poll_timeout;

#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    fd: OwnedFd,
}

impl ProcessHandle {
    /// Open a handle to a live process by pid.
    pub fn open(pid: u32) -> LxResult<Self> {
        // SAFETY: pidfd_open has no memory arguments; the returned fd is
        // owned exclusively by the new handle.
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0u32) };
        if fd < 0 {
            return Err(SyscallError::last("pidfd_open", pid).into());
        }
        Ok(Self {
            pid,
            // SAFETY: fd is a valid pidfd returned above.
            fd: unsafe { OwnedFd::from_raw_fd(fd as RawFd) },
        })
    }

    pub fn current() -> LxResult<Self> {
        Self::open(std::process::id())
    }

    /// Wrap an arbitrary waitable fd. The fd must become readable when the
    /// process identified by `pid` exits.
    pub fn from_waitable_fd(pid: u32, fd: OwnedFd) -> Self {
        Self { pid, fd }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn try_clone(&self) -> LxResult<Self> {
        Ok(Self {
            pid: self.pid,
            fd: self.fd.try_clone()?,
        })
    }

    pub fn wait_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// True once the process has exited.
    pub fn has_exited(&self) -> bool {
        self.wait(Some(Duration::ZERO))
    }

    /// Wait for the process to exit. `None` waits forever; returns true when
    /// the process is gone.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        loop {
            match poll(&mut fds, poll_timeout(timeout)) {
                Ok(0) => return false,
                Ok(_) => return true,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => return false,
            }
        }
    }
}
