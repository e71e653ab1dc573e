//! One-shot rearmable timer on a dedicated thread.
//!
//! Arming replaces any pending deadline; cancelling clears it. The callback
//! runs on the timer thread with no internal lock held, so it may call back
//! into the object that owns the timer.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub struct Timer {
    inner: Arc<TimerInner>,
    thread: Option<JoinHandle<()>>,
}

struct TimerInner {
    state: Mutex<TimerState>,
    cond: Condvar,
}

#[derive(Default)]
struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
}

impl Timer {
    pub fn new(callback: impl Fn() + Send + 'static) -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState::default()),
            cond: Condvar::new(),
        });

        let thread_inner = inner.clone();
        let thread = std::thread::Builder::new()
            .name("timer".into())
            .spawn(move || timer_loop(thread_inner, callback))
            .expect("failed to spawn timer thread");

        Self {
            inner,
            thread: Some(thread),
        }
    }

    /// Arm the timer, replacing any pending deadline.
    pub fn arm(&self, delay: Duration) {
        let mut state = self.inner.state.lock();
        state.deadline = Some(Instant::now() + delay);
        self.inner.cond.notify_all();
    }

    /// Cancel a pending deadline. A callback already past its deadline check
    /// may still run.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.deadline = None;
        self.inner.cond.notify_all();
    }

    pub fn is_armed(&self) -> bool {
        self.inner.state.lock().deadline.is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.deadline = None;
            self.inner.cond.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn timer_loop(inner: Arc<TimerInner>, callback: impl Fn()) {
    let mut state = inner.state.lock();
    loop {
        if state.shutdown {
            return;
        }

        match state.deadline {
            None => {
                inner.cond.wait(&mut state);
            }
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    inner.cond.wait_until(&mut state, deadline);
                    continue;
                }

                // Deadline reached and not superseded while we slept.
                state.deadline = None;
                drop(state);
                callback();
                state = inner.state.lock();
            }
        }
    }
}
