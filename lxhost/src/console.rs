//! Console session-leader management.
//!
//! A session leader is an in-guest process owning the lifecycle association
//! with one host console. Leaders are keyed by `{conhost server pid,
//! elevation}`; all client processes sharing a console share its leader. The
//! conhost process handle is held for the lifetime of the mapping so the pid
//! cannot be recycled underneath it. When the last referencing client exits,
//! the lifetime manager fires a callback that disconnects the console and
//! drops the mapping.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use lxhost_shared::channel::SocketChannel;
use lxhost_shared::errors::LxResult;

use crate::lifetime::LifetimeManager;
use crate::platform::ProcessHandle;

/// Console identity of a create-process caller.
pub struct ConsoleData {
    /// Conhost server pid; zero when the caller has no console.
    pub console_id: u32,
    /// Open handle to the conhost process, pinning `console_id`.
    pub conhost: Option<ProcessHandle>,
    /// The calling client process.
    pub client_process: ProcessHandle,
}

/// The instance-side port session leaders are created through.
pub trait InitPort: Send + Sync {
    fn create_session_leader(
        &self,
        console_id: u32,
        client: &ProcessHandle,
    ) -> LxResult<Arc<SocketChannel>>;

    /// Best-effort console disconnect once the last client is gone.
    fn disconnect_console(&self, console_id: u32, first_client: &ProcessHandle);
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct SessionLeaderKey {
    console_id: u32,
    elevated: bool,
}

struct SessionLeaderMapping {
    /// Keeps the conhost pid pinned while the mapping lives.
    _conhost: Option<ProcessHandle>,
    first_client: ProcessHandle,
    port: Option<Arc<SocketChannel>>,
    client_callback_id: u64,
}

pub struct ConsoleManager {
    self_weak: Weak<ConsoleManager>,
    /// Held weakly: the owning instance holds this manager.
    init_port: Weak<dyn InitPort>,
    lifetime_manager: Arc<LifetimeManager>,
    mappings: Mutex<HashMap<SessionLeaderKey, SessionLeaderMapping>>,
    /// Serializes leader creation so one leader exists per key.
    create_lock: Mutex<()>,
}

impl ConsoleManager {
    pub fn new(
        init_port: Weak<dyn InitPort>,
        lifetime_manager: Arc<LifetimeManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            init_port,
            lifetime_manager,
            mappings: Mutex::new(HashMap::new()),
            create_lock: Mutex::new(()),
        })
    }

    /// Return the session leader for the caller's console, creating one if
    /// none exists yet.
    pub fn get_session_leader(
        &self,
        console: &ConsoleData,
        elevated: bool,
    ) -> LxResult<Arc<SocketChannel>> {
        let _create_guard = self.create_lock.lock();

        let key = SessionLeaderKey {
            console_id: console.console_id,
            elevated,
        };

        let init_port = self
            .init_port
            .upgrade()
            .ok_or(lxhost_shared::errors::LxError::ChannelClosed)?;

        let (existing_port, callback_id) = self.register_client(key, console)?;
        if let Some(port) = existing_port {
            return Ok(port);
        }

        // No leader yet for this console; create one. Roll the registration
        // back on failure.
        match init_port.create_session_leader(key.console_id, &console.client_process) {
            Ok(port) => {
                if let Some(mapping) = self.mappings.lock().get_mut(&key) {
                    mapping.port = Some(port.clone());
                }
                tracing::debug!(
                    console_id = key.console_id,
                    elevated,
                    "created session leader"
                );
                Ok(port)
            }
            Err(err) => {
                let mut mappings = self.mappings.lock();
                if let Some(mapping) = mappings.remove(&key) {
                    self.lifetime_manager
                        .remove_callback(mapping.client_callback_id);
                }
                Err(err)
            }
        }
    }

    /// Track `console.client_process` against the mapping, creating the
    /// mapping if needed. Returns the existing leader port (if any) and the
    /// lifetime registration key.
    fn register_client(
        &self,
        key: SessionLeaderKey,
        console: &ConsoleData,
    ) -> LxResult<(Option<Arc<SocketChannel>>, u64)> {
        let mut mappings = self.mappings.lock();

        let (port, callback_id) = match mappings.get(&key) {
            Some(mapping) => (mapping.port.clone(), mapping.client_callback_id),
            None => {
                let callback_id = self.lifetime_manager.register_id();
                mappings.insert(
                    key,
                    SessionLeaderMapping {
                        _conhost: match &console.conhost {
                            Some(handle) => Some(handle.try_clone()?),
                            None => None,
                        },
                        first_client: console.client_process.try_clone()?,
                        port: None,
                        client_callback_id: callback_id,
                    },
                );
                (None, callback_id)
            }
        };

        let manager = self.self_weak.clone();
        self.lifetime_manager.register_callback(
            callback_id,
            Arc::new(move || {
                if let Some(manager) = manager.upgrade() {
                    manager.on_process_disconnect(key);
                }
                true
            }),
            Some(&console.client_process),
            Duration::ZERO,
        )?;

        Ok((port, callback_id))
    }

    /// Fired by the lifetime manager when the last client process for a
    /// console exits.
    fn on_process_disconnect(&self, key: SessionLeaderKey) {
        let removed = {
            let mut mappings = self.mappings.lock();
            match mappings.get(&key) {
                Some(mapping)
                    if !self
                        .lifetime_manager
                        .is_any_process_registered(mapping.client_callback_id) =>
                {
                    mappings.remove(&key)
                }
                _ => None,
            }
        };

        if let Some(mapping) = removed {
            tracing::debug!(
                console_id = key.console_id,
                elevated = key.elevated,
                "last console client exited, dropping session leader"
            );
            if let Some(init_port) = self.init_port.upgrade() {
                init_port.disconnect_console(key.console_id, &mapping.first_client);
            }
        }
    }

    /// Number of live session leaders; used by instance teardown to decide
    /// whether leaders remain.
    pub fn leader_count(&self) -> usize {
        self.mappings
            .lock()
            .values()
            .filter(|mapping| mapping.port.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubInitPort {
        created: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl StubInitPort {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: AtomicUsize::new(0),
                disconnected: AtomicUsize::new(0),
            })
        }
    }

    impl InitPort for StubInitPort {
        fn create_session_leader(
            &self,
            _console_id: u32,
            _client: &ProcessHandle,
        ) -> LxResult<Arc<SocketChannel>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let (stream, _peer) = UnixStream::pair().unwrap();
            // Leak the peer; the stub leader never speaks.
            std::mem::forget(_peer);
            Ok(Arc::new(SocketChannel::new(stream, "stub-leader")))
        }

        fn disconnect_console(&self, _console_id: u32, _first_client: &ProcessHandle) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fake_process(pid: u32) -> (ProcessHandle, OwnedFd) {
        let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();
        (ProcessHandle::from_waitable_fd(pid, read), write)
    }

    fn console(console_id: u32, client: &ProcessHandle) -> ConsoleData {
        ConsoleData {
            console_id,
            conhost: None,
            client_process: client.try_clone().unwrap(),
        }
    }

    #[test]
    fn one_leader_per_console_and_elevation() {
        let port = StubInitPort::new();
        let lifetime = Arc::new(LifetimeManager::new().unwrap());
        let manager =
            ConsoleManager::new(Arc::downgrade(&port) as Weak<dyn InitPort>, lifetime);

        let (client_a, _alive_a) = fake_process(10);
        let (client_b, _alive_b) = fake_process(11);

        let first = manager
            .get_session_leader(&console(42, &client_a), false)
            .unwrap();
        let second = manager
            .get_session_leader(&console(42, &client_b), false)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(port.created.load(Ordering::SeqCst), 1);

        // Elevation gets its own leader.
        manager
            .get_session_leader(&console(42, &client_a), true)
            .unwrap();
        assert_eq!(port.created.load(Ordering::SeqCst), 2);
        assert_eq!(manager.leader_count(), 2);
    }

    #[test]
    fn leader_destroyed_after_last_client_exits() {
        let port = StubInitPort::new();
        let lifetime = Arc::new(LifetimeManager::new().unwrap());
        let manager =
            ConsoleManager::new(Arc::downgrade(&port) as Weak<dyn InitPort>, lifetime);

        let (client_a, alive_a) = fake_process(20);
        let (client_b, alive_b) = fake_process(21);

        manager
            .get_session_leader(&console(7, &client_a), false)
            .unwrap();
        manager
            .get_session_leader(&console(7, &client_b), false)
            .unwrap();

        drop(alive_a);
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(port.disconnected.load(Ordering::SeqCst), 0);
        assert_eq!(manager.leader_count(), 1);

        drop(alive_b);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(port.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(manager.leader_count(), 0);

        // A new client gets a fresh leader.
        let (client_c, _alive_c) = fake_process(22);
        manager
            .get_session_leader(&console(7, &client_c), false)
            .unwrap();
        assert_eq!(port.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_leader_creation_rolls_back_registration() {
        struct FailingPort;
        impl InitPort for FailingPort {
            fn create_session_leader(
                &self,
                _console_id: u32,
                _client: &ProcessHandle,
            ) -> LxResult<Arc<SocketChannel>> {
                Err(lxhost_shared::errors::LxError::ChannelClosed)
            }
            fn disconnect_console(&self, _console_id: u32, _first_client: &ProcessHandle) {}
        }

        let failing_port = Arc::new(FailingPort);
        let lifetime = Arc::new(LifetimeManager::new().unwrap());
        let manager =
            ConsoleManager::new(Arc::downgrade(&failing_port) as Weak<dyn InitPort>, lifetime);

        let (client, _alive) = fake_process(30);
        let err = manager
            .get_session_leader(&console(9, &client), false)
            .unwrap_err();
        assert!(err.is_gone());
        assert_eq!(manager.leader_count(), 0);
        assert!(manager.mappings.lock().is_empty());
    }
}
