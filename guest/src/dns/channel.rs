//! Guest side of the DNS tunneling channel.
//!
//! Requests flow out through [`DnsTunnelingChannel::send_request`]; responses
//! arrive on a dedicated receive thread and are handed to the callback
//! supplied at start.

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use lxhost_shared::channel::SocketChannel;
use lxhost_shared::errors::{LxError, LxResult};
use lxhost_shared::protocol::{DnsClientId, DnsTunneling};
use lxhost_shared::sync::Event;

/// Receives `(dns response, client identifier)` pairs from the host.
pub type DnsResponseCallback = Box<dyn Fn(&[u8], DnsClientId) + Send + Sync>;

pub struct DnsTunnelingChannel {
    channel: Arc<SocketChannel>,
    cancel: Arc<Event>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DnsTunnelingChannel {
    /// Wrap `stream` and start the receive loop.
    pub fn start(stream: UnixStream, on_response: DnsResponseCallback) -> LxResult<Self> {
        let cancel = Arc::new(Event::new()?);
        let channel = Arc::new(SocketChannel::with_cancel(
            stream,
            "dns-tunneling",
            Some(cancel.clone()),
        ));
        Self::start_on(channel, cancel, on_response)
    }

    /// Start the receive loop on an existing channel. The channel must have
    /// been built with `cancel` as its cancellation event.
    pub fn start_on(
        channel: Arc<SocketChannel>,
        cancel: Arc<Event>,
        on_response: DnsResponseCallback,
    ) -> LxResult<Self> {
        let receive_channel = channel.clone();
        let thread = std::thread::Builder::new()
            .name("dns-tunneling".into())
            .spawn(move || receive_loop(receive_channel, on_response))?;

        Ok(Self {
            channel,
            cancel,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Tunnel a DNS request to the host. Failures are logged; the request is
    /// answered by nobody and the client will retry.
    pub fn send_request(&self, buffer: &[u8], client: DnsClientId) {
        let message = DnsTunneling {
            client,
            buffer: buffer.to_vec(),
        };
        if let Err(err) = self.channel.send(&message) {
            tracing::error!(error = %err, id = client.id, "failed to tunnel DNS request");
        }
    }

    /// Stop the receive loop by signalling the cancellation event and join
    /// the thread.
    pub fn stop(&self) {
        tracing::info!("stopping DNS tunneling channel");
        self.cancel.set();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DnsTunnelingChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(channel: Arc<SocketChannel>, on_response: DnsResponseCallback) {
    loop {
        match channel.receive_or_closed::<DnsTunneling>(None) {
            Ok(Some(message)) => {
                tracing::debug!(
                    size = message.buffer.len(),
                    protocol = ?message.client.protocol,
                    id = message.client.id,
                    "received tunnelled DNS response"
                );
                on_response(&message.buffer, message.client);
            }
            Ok(None) => {
                tracing::info!("DNS tunneling channel closed by host");
                return;
            }
            Err(LxError::Cancelled) => return,
            Err(err) => {
                tracing::error!(error = %err, "failed to read tunnelled DNS message");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lxhost_shared::protocol::DnsProtocol;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn responses_reach_the_callback() {
        let (host_side, guest_side) = UnixStream::pair().unwrap();
        let host = SocketChannel::new(host_side, "host");

        let (sender, receiver) = mpsc::channel();
        let channel = DnsTunnelingChannel::start(
            guest_side,
            Box::new(move |buffer, client| {
                sender.send((buffer.to_vec(), client)).unwrap();
            }),
        )
        .unwrap();

        host.send(&DnsTunneling {
            client: DnsClientId {
                protocol: DnsProtocol::Tcp,
                id: 3,
            },
            buffer: vec![9, 8, 7],
        })
        .unwrap();

        let (buffer, client) = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(buffer, vec![9, 8, 7]);
        assert_eq!(client.id, 3);

        channel.stop();
    }

    #[test]
    fn requests_are_framed_for_the_host() {
        let (host_side, guest_side) = UnixStream::pair().unwrap();
        let host = SocketChannel::new(host_side, "host");

        let channel =
            DnsTunnelingChannel::start(guest_side, Box::new(|_, _| {})).unwrap();

        channel.send_request(
            &[1, 2, 3, 4],
            DnsClientId {
                protocol: DnsProtocol::Udp,
                id: 17,
            },
        );

        let message: DnsTunneling = host.receive(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(message.buffer, vec![1, 2, 3, 4]);
        assert_eq!(message.client.id, 17);
        assert_eq!(message.client.protocol, DnsProtocol::Udp);
    }

    #[test]
    fn stop_joins_the_receive_thread() {
        let (_host_side, guest_side) = UnixStream::pair().unwrap();
        let channel =
            DnsTunnelingChannel::start(guest_side, Box::new(|_, _| {})).unwrap();
        channel.stop();
        assert!(channel.thread.lock().is_none());
    }
}
