//! Client lifetime tracking.
//!
//! Callers register a callback against a key together with the client
//! processes that keep the registration alive. When the last client process
//! exits the callback fires; a callback registered with no client process is
//! fired after its timeout instead. Failing callbacks (for registrations
//! with a non-zero timeout) are retried on a fixed period with jitter until
//! they succeed or [`LifetimeManager::clear_all`] runs.
//!
//! One monitor thread polls every registered process fd plus a wake event;
//! callbacks execute on that thread with no internal lock held, so they may
//! call back into the manager.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};
use parking_lot::{Condvar, Mutex};
use rand::Rng;

use lxhost_shared::errors::LxResult;
use lxhost_shared::sync::{poll_timeout, Event};

use crate::platform::ProcessHandle;

/// Period between retries of a failing callback.
pub const RETRY_PERIOD: Duration = Duration::from_secs(60);
/// Jitter window added to each retry deadline.
const RETRY_JITTER_MS: u64 = 1000;

/// Returns true on success; a false return schedules a retry (unless the
/// registration used a zero timeout, which is never retried).
pub type LifetimeCallback = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct LifetimeManager {
    inner: Arc<Inner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    state: Mutex<State>,
    drained: Condvar,
    wake: Event,
    retry_period: Duration,
}

#[derive(Default)]
struct State {
    next_key: u64,
    entries: Vec<Entry>,
    callbacks_in_flight: usize,
    exiting: bool,
    shutdown: bool,
}

struct Entry {
    key: u64,
    callback: LifetimeCallback,
    timeout: Duration,
    processes: Vec<ProcessHandle>,
    deadline: Option<Instant>,
}

impl LifetimeManager {
    pub fn new() -> LxResult<Self> {
        Self::with_retry_period(RETRY_PERIOD)
    }

    /// Build a manager with a custom retry period. Production uses
    /// [`RETRY_PERIOD`].
    pub fn with_retry_period(retry_period: Duration) -> LxResult<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            drained: Condvar::new(),
            wake: Event::new()?,
            retry_period,
        });

        let monitor_inner = inner.clone();
        let monitor = std::thread::Builder::new()
            .name("lifetime".into())
            .spawn(move || monitor_loop(monitor_inner))?;

        Ok(Self {
            inner,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    /// Allocate a registration key.
    pub fn register_id(&self) -> u64 {
        let mut state = self.inner.state.lock();
        state.next_key += 1;
        state.next_key
    }

    /// Register (or re-register) a callback. Re-registering replaces the
    /// callback and timeout; supplying a client process cancels any pending
    /// timer. With no client process, a timer is armed for `timeout`.
    pub fn register_callback(
        &self,
        key: u64,
        callback: LifetimeCallback,
        client_process: Option<&ProcessHandle>,
        timeout: Duration,
    ) -> LxResult<()> {
        let mut state = self.inner.state.lock();

        let index = match state.entries.iter().position(|entry| entry.key == key) {
            Some(index) => {
                let entry = &mut state.entries[index];
                entry.callback = callback;
                entry.timeout = timeout;
                if client_process.is_some() {
                    entry.deadline = None;
                }
                index
            }
            None => {
                let deadline = if client_process.is_none() {
                    Some(Instant::now() + timeout)
                } else {
                    None
                };
                state.entries.push(Entry {
                    key,
                    callback,
                    timeout,
                    processes: Vec::new(),
                    deadline,
                });
                state.entries.len() - 1
            }
        };

        let entry = &mut state.entries[index];
        if let Some(process) = client_process {
            if !entry.processes.iter().any(|p| p.pid() == process.pid()) {
                entry.processes.push(process.try_clone()?);
            }
        }

        drop(state);
        self.inner.wake.set();
        Ok(())
    }

    /// Remove a registration. Returns whether it existed.
    pub fn remove_callback(&self, key: u64) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            let index = state.entries.iter().position(|entry| entry.key == key);
            index.map(|index| state.entries.remove(index))
        };
        self.inner.wake.set();
        // Process handles drop outside the lock.
        removed.is_some()
    }

    /// Whether a registration with this key still exists.
    pub fn is_any_process_registered(&self, key: u64) -> bool {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .any(|entry| entry.key == key)
    }

    /// Drop every registration and drain in-flight callbacks before
    /// returning. No further retries are scheduled.
    pub fn clear_all(&self) {
        let moved = {
            let mut state = self.inner.state.lock();
            state.exiting = true;
            std::mem::take(&mut state.entries)
        };
        self.inner.wake.set();

        let mut state = self.inner.state.lock();
        while state.callbacks_in_flight > 0 {
            self.inner.drained.wait(&mut state);
        }
        drop(state);
        drop(moved);
    }
}

impl Drop for LifetimeManager {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.exiting = true;
        }
        self.inner.wake.set();
        if let Some(monitor) = self.monitor.lock().take() {
            let _ = monitor.join();
        }
    }
}

fn retry_deadline(retry_period: Duration) -> Instant {
    let jitter = rand::rng().random_range(0..=RETRY_JITTER_MS);
    Instant::now() + retry_period + Duration::from_millis(jitter)
}

fn monitor_loop(inner: Arc<Inner>) {
    loop {
        // Snapshot the watched processes and the nearest deadline; the lock
        // cannot be held across the poll below.
        let (watched, nearest_deadline) = {
            let state = inner.state.lock();
            if state.shutdown {
                return;
            }

            let mut watched: Vec<(u64, ProcessHandle)> = Vec::new();
            let mut nearest: Option<Instant> = None;
            for entry in &state.entries {
                for process in &entry.processes {
                    if let Ok(clone) = process.try_clone() {
                        watched.push((entry.key, clone));
                    }
                }
                if let Some(deadline) = entry.deadline {
                    nearest = Some(match nearest {
                        Some(current) => current.min(deadline),
                        None => deadline,
                    });
                }
            }
            (watched, nearest)
        };

        let timeout = nearest_deadline.map(|deadline| {
            deadline.saturating_duration_since(Instant::now())
        });

        let mut fds = Vec::with_capacity(watched.len() + 1);
        fds.push(PollFd::new(inner.wake.pollable_fd(), PollFlags::POLLIN));
        for (_, process) in &watched {
            fds.push(PollFd::new(process.wait_fd(), PollFlags::POLLIN));
        }

        match poll(&mut fds, poll_timeout(timeout)) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => {
                tracing::error!(?errno, "lifetime monitor poll failed");
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
        }

        let mut exited: Vec<(u64, u32)> = Vec::new();
        for (index, (key, process)) in watched.iter().enumerate() {
            if fds[index + 1].any().unwrap_or(false) {
                exited.push((*key, process.pid()));
            }
        }
        drop(fds);
        inner.wake.reset();

        // Collect the callbacks to run, then invoke them without the lock.
        let now = Instant::now();
        let mut immediate: Vec<Entry> = Vec::new();
        let mut timed: Vec<Entry> = Vec::new();
        {
            let mut state = inner.state.lock();
            if state.shutdown {
                return;
            }

            for (key, pid) in exited {
                let Some(index) = state.entries.iter().position(|entry| entry.key == key) else {
                    continue;
                };
                let entry = &mut state.entries[index];
                entry.processes.retain(|process| process.pid() != pid);
                if !entry.processes.is_empty() {
                    continue;
                }

                // Last client process gone: run now (zero timeout) or arm
                // the timer.
                if entry.timeout.is_zero() {
                    immediate.push(state.entries.remove(index));
                } else {
                    entry.deadline = Some(now + entry.timeout);
                }
            }

            let mut index = 0;
            while index < state.entries.len() {
                let entry = &state.entries[index];
                let due = entry.processes.is_empty()
                    && entry.deadline.is_some_and(|deadline| deadline <= now);
                if due {
                    timed.push(state.entries.remove(index));
                } else {
                    index += 1;
                }
            }

            state.callbacks_in_flight += immediate.len() + timed.len();
        }

        let finished = immediate.len() + timed.len();

        for entry in immediate {
            // Zero-timeout callbacks are not retried and must succeed.
            if !(entry.callback)() {
                tracing::warn!(key = entry.key, "lifetime callback failed; not retried");
            }
        }

        for mut entry in timed {
            let succeeded = (entry.callback)();
            if !succeeded {
                let mut state = inner.state.lock();
                if !state.exiting {
                    tracing::debug!(key = entry.key, "lifetime callback failed; scheduling retry");
                    entry.deadline = Some(retry_deadline(inner.retry_period));
                    state.entries.push(entry);
                }
            }
        }

        if finished > 0 {
            let mut state = inner.state.lock();
            state.callbacks_in_flight -= finished;
            if state.callbacks_in_flight == 0 {
                inner.drained.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A fake client process: dropping the returned fd "exits" it.
    fn fake_process(pid: u32) -> (ProcessHandle, OwnedFd) {
        let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();
        (ProcessHandle::from_waitable_fd(pid, read), write)
    }

    #[test]
    fn callback_fires_when_last_process_exits() {
        let manager = LifetimeManager::new().unwrap();
        let key = manager.register_id();

        let count = Arc::new(AtomicUsize::new(0));
        let fired = count.clone();
        let (first, first_alive) = fake_process(100);
        let (second, second_alive) = fake_process(200);

        manager
            .register_callback(
                key,
                Arc::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                    true
                }),
                Some(&first),
                Duration::ZERO,
            )
            .unwrap();
        manager
            .register_callback(
                key,
                Arc::new({
                    let fired = count.clone();
                    move || {
                        fired.fetch_add(1, Ordering::SeqCst);
                        true
                    }
                }),
                Some(&second),
                Duration::ZERO,
            )
            .unwrap();

        drop(first_alive);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0, "one client still alive");
        assert!(manager.is_any_process_registered(key));

        drop(second_alive);
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!manager.is_any_process_registered(key));
    }

    #[test]
    fn timer_fires_without_client_process() {
        let manager = LifetimeManager::new().unwrap();
        let key = manager.register_id();

        let count = Arc::new(AtomicUsize::new(0));
        let fired = count.clone();
        manager
            .register_callback(
                key,
                Arc::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                    true
                }),
                None,
                Duration::from_millis(50),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reregistering_with_client_cancels_timer() {
        let manager = LifetimeManager::new().unwrap();
        let key = manager.register_id();

        let count = Arc::new(AtomicUsize::new(0));
        let fired = count.clone();
        let callback: LifetimeCallback = Arc::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
            true
        });

        manager
            .register_callback(key, callback.clone(), None, Duration::from_millis(100))
            .unwrap();

        let (process, _alive) = fake_process(300);
        manager
            .register_callback(key, callback, Some(&process), Duration::from_millis(100))
            .unwrap();

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(count.load(Ordering::SeqCst), 0, "timer should be cancelled");
        assert!(manager.is_any_process_registered(key));
    }

    #[test]
    fn failing_callback_is_retried_until_success() {
        let manager = LifetimeManager::with_retry_period(Duration::from_millis(50)).unwrap();
        let key = manager.register_id();

        let count = Arc::new(AtomicUsize::new(0));
        let fired = count.clone();
        manager
            .register_callback(
                key,
                Arc::new(move || {
                    // Fail twice, then succeed.
                    fired.fetch_add(1, Ordering::SeqCst) >= 2
                }),
                None,
                Duration::from_millis(10),
            )
            .unwrap();

        std::thread::sleep(Duration::from_secs(4));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn clear_all_drains_pending_callbacks() {
        let manager = LifetimeManager::with_retry_period(Duration::from_millis(20)).unwrap();
        let key = manager.register_id();

        let count = Arc::new(AtomicUsize::new(0));
        let fired = count.clone();
        manager
            .register_callback(
                key,
                Arc::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                    false
                }),
                None,
                Duration::from_millis(10),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        manager.clear_all();
        let after_clear = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(200));
        // No retries fire after clear_all returns.
        assert_eq!(count.load(Ordering::SeqCst), after_clear);
    }

    #[test]
    fn remove_callback_reports_existence() {
        let manager = LifetimeManager::new().unwrap();
        let key = manager.register_id();
        assert!(!manager.remove_callback(key));

        let (process, _alive) = fake_process(400);
        manager
            .register_callback(key, Arc::new(|| true), Some(&process), Duration::ZERO)
            .unwrap();
        assert!(manager.remove_callback(key));
        assert!(!manager.remove_callback(key));
    }
}
