//! DNS tunneling: a local DNS server paired with a host message channel.

mod channel;
mod server;

pub use channel::{DnsResponseCallback, DnsTunnelingChannel};
pub use server::{DnsResponder, DnsServer, DnsTunnelingCallback, DNS_PORT};

use std::net::SocketAddrV4;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use lxhost_shared::errors::LxResult;

/// Owns the DNS server and the tunneling channel and wires them together:
/// server requests flow into the channel, channel responses flow back into
/// the server by correlation id.
pub struct DnsTunnelingManager {
    server: Arc<DnsServer>,
    channel: Arc<DnsTunnelingChannel>,
}

impl DnsTunnelingManager {
    pub fn start(channel_stream: UnixStream, listen_address: SocketAddrV4) -> LxResult<Self> {
        // The send half of the channel needs no receive thread, so the
        // server can capture it before the receive loop exists.
        let cancel = Arc::new(lxhost_shared::sync::Event::new()?);
        let socket_channel = Arc::new(lxhost_shared::channel::SocketChannel::with_cancel(
            channel_stream,
            "dns-tunneling",
            Some(cancel.clone()),
        ));

        let send_channel = socket_channel.clone();
        let server = Arc::new(DnsServer::start(
            listen_address,
            Box::new(move |buffer, client| {
                let message = lxhost_shared::protocol::DnsTunneling {
                    client,
                    buffer: buffer.to_vec(),
                };
                if let Err(err) = send_channel.send(&message) {
                    tracing::error!(error = %err, id = client.id, "failed to tunnel DNS request");
                }
            }),
        )?);

        let responder = server.responder();
        let channel = Arc::new(DnsTunnelingChannel::start_on(
            socket_channel,
            cancel,
            Box::new(move |buffer, client| responder.handle_response(buffer, client)),
        )?);

        Ok(Self { server, channel })
    }

    pub fn server(&self) -> &DnsServer {
        &self.server
    }

    pub fn stop(&self) {
        self.channel.stop();
        self.server.stop();
    }
}

impl Drop for DnsTunnelingManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lxhost_shared::channel::SocketChannel;
    use lxhost_shared::protocol::{DnsProtocol, DnsTunneling};
    use std::io::Write;
    use std::net::{Ipv4Addr, TcpStream, UdpSocket};
    use std::time::Duration;

    /// End to end: a UDP query is tunnelled to the "host" side, the host
    /// answers, and the answer reaches the original client socket.
    #[test]
    fn udp_query_round_trip_through_the_tunnel() {
        let (host_side, guest_side) = UnixStream::pair().unwrap();
        let host = SocketChannel::new(host_side, "host");

        let manager = DnsTunnelingManager::start(
            guest_side,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
        )
        .unwrap();
        let addr = manager.server().local_addr().unwrap();

        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        client.send_to(&[0x11; 33], addr).unwrap();

        let request: DnsTunneling = host.receive(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(request.buffer.len(), 33);
        assert_eq!(request.client.protocol, DnsProtocol::Udp);

        host.send(&DnsTunneling {
            client: request.client,
            buffer: vec![0x22; 12],
        })
        .unwrap();

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut answer = [0u8; 64];
        let n = client.recv(&mut answer).unwrap();
        assert_eq!(&answer[..n], &[0x22; 12]);
    }

    #[test]
    fn tcp_query_flows_through_the_tunnel() {
        let (host_side, guest_side) = UnixStream::pair().unwrap();
        let host = SocketChannel::new(host_side, "host");

        let manager = DnsTunnelingManager::start(
            guest_side,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
        )
        .unwrap();
        let addr = manager.server().local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&[0x00, 0x04, b'q', b'u', b'e', b'r']).unwrap();

        let request: DnsTunneling = host.receive(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(request.buffer, b"quer");
        assert_eq!(request.client.protocol, DnsProtocol::Tcp);
    }
}
