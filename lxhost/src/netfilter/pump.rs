//! Kernel-to-user async callback pump.
//!
//! A fixed-size buffer is posted to the callback source; when a request
//! completes, the handler runs and its status code is written back, then the
//! buffer is re-posted. Cancellation stops the loop without requeueing.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use lxhost_shared::errors::LxResult;

use crate::platform::UserCallbackSource;

pub struct UserCallbackPump {
    source: Arc<dyn UserCallbackSource>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl UserCallbackPump {
    pub fn start(
        source: Arc<dyn UserCallbackSource>,
        buffer_size: usize,
        handler: impl Fn(&[u8]) -> i32 + Send + 'static,
    ) -> LxResult<Self> {
        let loop_source = source.clone();
        let thread = std::thread::Builder::new()
            .name("user-callback".into())
            .spawn(move || {
                let mut buffer = vec![0u8; buffer_size];
                loop {
                    match loop_source.next_request(&mut buffer) {
                        Ok(Some((callback_id, length))) => {
                            let status = handler(&buffer[..length]);
                            if let Err(err) = loop_source.send_response(callback_id, status) {
                                tracing::error!(error = %err, callback_id, "failed to send callback response");
                            }
                        }
                        // Cancelled; do not requeue.
                        Ok(None) => return,
                        Err(err) => {
                            tracing::error!(error = %err, "user callback request failed");
                            return;
                        }
                    }
                }
            })?;

        Ok(Self {
            source,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn stop(&self) {
        self.source.cancel();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for UserCallbackPump {
    fn drop(&mut self) {
        self.stop();
    }
}
