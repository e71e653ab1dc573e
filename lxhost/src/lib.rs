//! Session and instance lifecycle core for a hypervisor-backed Linux
//! subsystem host.
//!
//! The host runs Linux distributions inside hardware-partitioned utility
//! VMs (one per user) and, on hosts that support it, inside legacy
//! in-kernel pico-process instances. This crate owns the lifecycle of
//! sessions, VMs and instances, the control-plane protocol with the
//! in-guest init process, and the attached-disk / folder-share / console /
//! netfilter bookkeeping around them.
//!
//! External host services (the compute-system API, the persistence store,
//! NAT and firewall registries, the legacy kernel driver) are consumed
//! through the [`platform`] traits.

pub mod console;
pub mod instance;
pub mod lifetime;
pub mod netfilter;
pub mod platform;
pub mod plugin;
pub mod registry;
pub mod session;
pub mod timer;
pub mod vm;

pub use lxhost_shared::{LxError, LxResult};

pub use session::factory::SessionFactory;
pub use session::{
    SessionConfig, SessionPlatform, ShutdownBehavior, UserSession,
};
