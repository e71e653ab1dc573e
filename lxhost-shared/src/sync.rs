//! Manual-reset event backed by a pipe.
//!
//! The read end is pollable, so an [`Event`] can be combined with socket fds
//! in a single `poll()` call. This is the cancellation primitive used by
//! every blocking loop in the workspace: shutdown sets the event, the loop
//! wakes, the owner joins the thread.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::errors::{LxResult, SyscallResultExt};

#[derive(Debug)]
pub struct Event {
    read: OwnedFd,
    write: OwnedFd,
    set: AtomicBool,
}

impl Event {
    pub fn new() -> LxResult<Self> {
        let (read, write) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).syscall("pipe2", "")?;
        Ok(Self {
            read,
            write,
            set: AtomicBool::new(false),
        })
    }

    /// Signal the event. Idempotent.
    pub fn set(&self) {
        if !self.set.swap(true, Ordering::SeqCst) {
            // A single byte on an empty pipe cannot block.
            let _ = nix::unistd::write(&self.write, &[1u8]);
        }
    }

    /// Return the event to the unsignalled state.
    pub fn reset(&self) {
        if self.set.swap(false, Ordering::SeqCst) {
            let mut drain = [0u8; 16];
            while let Ok(n) = nix::unistd::read(&self.read, &mut drain) {
                if n < drain.len() {
                    break;
                }
            }
        }
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Wait for the event to become signalled. `None` waits forever.
    /// Returns true when signalled, false on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.is_set() {
            return true;
        }

        let mut fds = [PollFd::new(self.read.as_fd(), PollFlags::POLLIN)];
        loop {
            match poll(&mut fds, poll_timeout(timeout)) {
                Ok(0) => return self.is_set(),
                Ok(_) => return true,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => return self.is_set(),
            }
        }
    }

    /// Pollable fd, readable while the event is signalled.
    pub fn pollable_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }
}

/// Clamp an optional duration into a `poll(2)` timeout.
pub fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(d) => PollTimeout::try_from(d).unwrap_or(PollTimeout::MAX),
    }
}
