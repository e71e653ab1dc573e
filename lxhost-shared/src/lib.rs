//! Shared building blocks for lxhost host/guest communication: the wire
//! protocol, the length-prefixed socket channel, the syscall error envelope
//! and the pipe-backed cancellation event.

pub mod channel;
pub mod errors;
pub mod protocol;
pub mod sync;

pub use channel::{ChannelGuard, SocketChannel};
pub use errors::{LxError, LxResult, SyscallError, SyscallResultExt};
pub use sync::Event;
