//! Unix-domain-socket transport mapping `(vm id, port)` pairs to socket
//! files under a runtime directory. Connects retry until the listener
//! appears, bounded by the caller's timeout.

use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};
use uuid::Uuid;

use lxhost_shared::errors::{LxError, LxResult};
use lxhost_shared::sync::{poll_timeout, Event};

use super::{VmListener, VmTransport};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

pub struct LoopbackTransport {
    root: PathBuf,
}

impl LoopbackTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn socket_path(&self, vm_id: Uuid, port: u32) -> PathBuf {
        self.root.join(format!("vm-{vm_id}")).join(format!("{port}.sock"))
    }
}

impl VmTransport for LoopbackTransport {
    fn listen(&self, vm_id: Uuid, port: u32) -> LxResult<Box<dyn VmListener>> {
        let path = self.socket_path(vm_id, port);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // A stale socket file from a previous run refuses binds.
        let _ = std::fs::remove_file(&path);

        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        Ok(Box::new(LoopbackListener {
            listener,
            path,
            port,
        }))
    }

    fn connect(
        &self,
        vm_id: Uuid,
        port: u32,
        timeout: Duration,
        cancel: Option<&Event>,
    ) -> LxResult<UnixStream> {
        let path = self.socket_path(vm_id, port);
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(cancel) = cancel {
                if cancel.is_set() {
                    return Err(LxError::Cancelled);
                }
            }

            match UnixStream::connect(&path) {
                Ok(stream) => return Ok(stream),
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    if Instant::now() >= deadline {
                        return Err(LxError::Timeout(timeout));
                    }
                    // The guest side has not bound the port yet.
                    match cancel {
                        Some(cancel) => {
                            if cancel.wait(Some(CONNECT_RETRY_INTERVAL)) {
                                return Err(LxError::Cancelled);
                            }
                        }
                        None => std::thread::sleep(CONNECT_RETRY_INTERVAL),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

struct LoopbackListener {
    listener: UnixListener,
    path: PathBuf,
    port: u32,
}

impl VmListener for LoopbackListener {
    fn accept(&self, timeout: Option<Duration>, cancel: Option<&Event>) -> LxResult<UnixStream> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    return Ok(stream);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LxError::Timeout(timeout.unwrap_or_default()));
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let mut fds = [
                PollFd::new(self.listener.as_fd(), PollFlags::POLLIN),
                PollFd::new(
                    cancel
                        .map(|c| c.pollable_fd())
                        .unwrap_or_else(|| self.listener.as_fd()),
                    if cancel.is_some() {
                        PollFlags::POLLIN
                    } else {
                        PollFlags::empty()
                    },
                ),
            ];
            match poll(&mut fds, poll_timeout(remaining)) {
                Ok(0) => return Err(LxError::Timeout(timeout.unwrap_or_default())),
                Ok(_) => {
                    if cancel.is_some() && fds[1].any().unwrap_or(false) {
                        return Err(LxError::Cancelled);
                    }
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(lxhost_shared::errors::SyscallError::new(
                        "poll",
                        self.port,
                        errno as i32,
                    )
                    .into())
                }
            }
        }
    }

    fn port(&self) -> u32 {
        self.port
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
