//! Length-prefixed typed message transport over a stream socket.
//!
//! A [`SocketChannel`] owns one stream socket and frames every message with
//! the 8-byte protocol header. Receives are cancellable (an optional
//! [`Event`] wired at construction) and optionally bounded by a timeout. On
//! a single channel, responses are consumed strictly in send order;
//! [`SocketChannel::lock`] hands out a guard so a caller can sequence its own
//! transactions against concurrent users.

use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};
use parking_lot::{Mutex, MutexGuard};

use crate::errors::{LxError, LxResult, SyscallError};
use crate::protocol::{Message, MessageHeader, MessageType, HEADER_SIZE};
use crate::sync::{poll_timeout, Event};

#[derive(Debug)]
pub struct SocketChannel {
    name: String,
    cancel: Option<Arc<Event>>,
    io: Mutex<ChannelIo>,
}

#[derive(Debug)]
struct ChannelIo {
    stream: Option<UnixStream>,
}

/// Exclusive access to the channel for the guard's lifetime. All blocking
/// operations happen with this guard held, so a transaction observes the very
/// next response on the stream.
pub struct ChannelGuard<'a> {
    name: &'a str,
    cancel: Option<&'a Event>,
    io: MutexGuard<'a, ChannelIo>,
}

enum WaitOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

impl SocketChannel {
    pub fn new(stream: UnixStream, name: impl Into<String>) -> Self {
        Self::with_cancel(stream, name, None)
    }

    pub fn with_cancel(
        stream: UnixStream,
        name: impl Into<String>,
        cancel: Option<Arc<Event>>,
    ) -> Self {
        Self {
            name: name.into(),
            cancel,
            io: Mutex::new(ChannelIo {
                stream: Some(stream),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> ChannelGuard<'_> {
        ChannelGuard {
            name: &self.name,
            cancel: self.cancel.as_deref(),
            io: self.io.lock(),
        }
    }

    pub fn send<M: Message>(&self, message: &M) -> LxResult<()> {
        self.lock().send(message)
    }

    pub fn receive<M: Message>(&self, timeout: Option<Duration>) -> LxResult<M> {
        self.lock().receive(timeout)
    }

    pub fn receive_or_closed<M: Message>(
        &self,
        timeout: Option<Duration>,
    ) -> LxResult<Option<M>> {
        self.lock().receive_or_closed(timeout)
    }

    pub fn receive_raw(&self, timeout: Option<Duration>) -> LxResult<(MessageHeader, Vec<u8>)> {
        self.lock().receive_raw(timeout)
    }

    pub fn transaction<M: Message, R: Message>(&self, request: &M) -> LxResult<R> {
        self.lock().transaction(request)
    }

    /// Close the channel. Idempotent; subsequent operations fail with
    /// [`LxError::ChannelClosed`].
    pub fn close(&self) {
        self.lock().close();
    }

    pub fn is_closed(&self) -> bool {
        self.io.lock().stream.is_none()
    }
}

impl ChannelGuard<'_> {
    pub fn send<M: Message>(&mut self, message: &M) -> LxResult<()> {
        self.send_bytes(&message.encode())
    }

    pub fn send_bytes(&mut self, bytes: &[u8]) -> LxResult<()> {
        let stream = self.io.stream.as_mut().ok_or(LxError::ChannelClosed)?;
        match stream.write_all(bytes) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::debug!(channel = self.name, error = %err, "channel send failed");
                self.io.stream = None;
                Err(err.into())
            }
        }
    }

    /// Receive the next message and decode it as `M`. A mismatched message
    /// type or an undersized declared length is fatal to the channel.
    pub fn receive<M: Message>(&mut self, timeout: Option<Duration>) -> LxResult<M> {
        let (header, body) = self.receive_raw(timeout)?;
        self.decode_as::<M>(header, &body)
    }

    /// Like [`Self::receive`] but a clean peer close at a message boundary
    /// yields `None`.
    pub fn receive_or_closed<M: Message>(
        &mut self,
        timeout: Option<Duration>,
    ) -> LxResult<Option<M>> {
        match self.receive_raw_impl(timeout) {
            Ok(Some((header, body))) => self.decode_as::<M>(header, &body).map(Some),
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn receive_raw(&mut self, timeout: Option<Duration>) -> LxResult<(MessageHeader, Vec<u8>)> {
        match self.receive_raw_impl(timeout)? {
            Some(message) => Ok(message),
            None => Err(LxError::ChannelClosed),
        }
    }

    pub fn transaction<M: Message, R: Message>(&mut self, request: &M) -> LxResult<R> {
        self.send(request)?;
        self.receive(None)
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.io.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn decode_as<M: Message>(&mut self, header: MessageHeader, body: &[u8]) -> LxResult<M> {
        if header.message_type != M::TYPE as u32 {
            let reason = format!(
                "expected message type {:?}, received {}",
                M::TYPE,
                header.message_type
            );
            tracing::error!(channel = self.name, %reason, "protocol violation");
            self.close();
            return Err(LxError::Protocol {
                channel: self.name.to_string(),
                reason,
            });
        }
        M::decode(body)
    }

    fn receive_raw_impl(
        &mut self,
        timeout: Option<Duration>,
    ) -> LxResult<Option<(MessageHeader, Vec<u8>)>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let stamp_timeout = |err| match err {
            LxError::Timeout(_) => LxError::Timeout(timeout.unwrap_or_default()),
            other => other,
        };

        let mut header_bytes = [0u8; HEADER_SIZE];
        if !self
            .read_exact_cancellable(&mut header_bytes, deadline, true)
            .map_err(stamp_timeout)?
        {
            return Ok(None);
        }

        let header = MessageHeader::decode(&header_bytes);
        if (header.message_size as usize) < HEADER_SIZE {
            let reason = format!("declared size {} below header size", header.message_size);
            tracing::error!(channel = self.name, %reason, "protocol violation");
            self.close();
            return Err(LxError::Protocol {
                channel: self.name.to_string(),
                reason,
            });
        }

        let mut body = vec![0u8; header.message_size as usize - HEADER_SIZE];
        if !self
            .read_exact_cancellable(&mut body, deadline, false)
            .map_err(stamp_timeout)?
        {
            // Peer closed mid-message.
            self.close();
            return Err(LxError::ChannelClosed);
        }

        if let Some(ty) = MessageType::from_u32(header.message_type) {
            tracing::trace!(channel = self.name, message = ?ty, size = header.message_size, "received");
        }

        Ok(Some((header, body)))
    }

    /// Fill `buf` from the stream. Returns false on a clean close before the
    /// first byte when `allow_closed` is set. A close after partial data, a
    /// timeout, or a cancellation mid-message tears the channel down.
    fn read_exact_cancellable(
        &mut self,
        buf: &mut [u8],
        deadline: Option<Instant>,
        allow_closed: bool,
    ) -> LxResult<bool> {
        let mut filled = 0usize;
        while filled < buf.len() {
            match self.wait_readable(deadline)? {
                WaitOutcome::Ready => {}
                WaitOutcome::TimedOut => {
                    self.close();
                    return Err(LxError::Timeout(Duration::default()));
                }
                WaitOutcome::Cancelled => {
                    if filled > 0 {
                        self.close();
                    }
                    return Err(LxError::Cancelled);
                }
            }

            let stream = self.io.stream.as_mut().ok_or(LxError::ChannelClosed)?;
            match stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.close();
                    if filled == 0 && allow_closed {
                        return Ok(false);
                    }
                    return Err(LxError::ChannelClosed);
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.close();
                    return Err(err.into());
                }
            }
        }
        Ok(true)
    }

    fn wait_readable(&mut self, deadline: Option<Instant>) -> LxResult<WaitOutcome> {
        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(WaitOutcome::TimedOut);
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let outcome = {
                let stream = self.io.stream.as_ref().ok_or(LxError::ChannelClosed)?;
                let mut fds = [
                    PollFd::new(stream.as_fd(), PollFlags::POLLIN),
                    PollFd::new(
                        self.cancel
                            .map(|c| c.pollable_fd())
                            .unwrap_or_else(|| stream.as_fd()),
                        if self.cancel.is_some() {
                            PollFlags::POLLIN
                        } else {
                            PollFlags::empty()
                        },
                    ),
                ];

                match poll(&mut fds, poll_timeout(remaining)) {
                    Ok(0) => Ok(WaitOutcome::TimedOut),
                    Ok(_) => {
                        if self.cancel.is_some() && fds[1].any().unwrap_or(false) {
                            Ok(WaitOutcome::Cancelled)
                        } else {
                            Ok(WaitOutcome::Ready)
                        }
                    }
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(errno) => Err(errno),
                }
            };

            return match outcome {
                Ok(outcome) => Ok(outcome),
                Err(errno) => {
                    self.close();
                    Err(SyscallError::new("poll", self.name, errno as i32).into())
                }
            };
        }
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.close();
    }
}
