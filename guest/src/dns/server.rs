//! In-guest DNS server.
//!
//! Listens on UDP and TCP, tags every request with a monotonically
//! increasing correlation id and hands it to the tunneling callback. One
//! epoll loop on a single thread watches the UDP socket, the TCP listen
//! socket, every accepted TCP connection, and a shutdown pipe.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use parking_lot::Mutex;

use lxhost_shared::errors::{LxResult, SyscallResultExt};
use lxhost_shared::protocol::{DnsClientId, DnsProtocol, DNS_MAX_UDP_MESSAGE_SIZE};

/// Standard DNS port. Tests bind an ephemeral port instead.
pub const DNS_PORT: u16 = 53;

/// Number of bytes in the DNS-over-TCP length prefix.
const TCP_LENGTH_PREFIX_SIZE: usize = 2;

/// Max number of events requested per epoll_wait. If more are ready, epoll
/// round-robins through them on subsequent calls.
const EPOLL_WAIT_MAX_EVENTS: usize = 100;

const TOKEN_UDP: u64 = u64::MAX;
const TOKEN_TCP_LISTEN: u64 = u64::MAX - 1;
const TOKEN_SHUTDOWN: u64 = u64::MAX - 2;

/// Receives `(dns request, client identifier)` pairs for tunneling to the
/// host.
pub type DnsTunnelingCallback = Box<dyn Fn(&[u8], DnsClientId) + Send + Sync>;

pub struct DnsServer {
    inner: Arc<ServerInner>,
    shutdown_write: Mutex<Option<OwnedFd>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle for delivering host responses back to the server; cheap to clone.
#[derive(Clone)]
pub struct DnsResponder {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    epoll: Epoll,
    udp_socket: UdpSocket,
    tcp_listen_socket: TcpListener,
    udp_state: Mutex<UdpState>,
    tcp_state: Mutex<TcpState>,
    tunnel: DnsTunnelingCallback,
}

#[derive(Default)]
struct UdpState {
    next_request_id: u32,
    inflight: HashMap<u32, SocketAddr>,
}

#[derive(Default)]
struct TcpState {
    next_connection_id: u32,
    connections: HashMap<u32, TcpConnection>,
}

struct TcpConnection {
    socket: TcpStream,
    current_offset: usize,
    current_buffer: Vec<u8>,
}

impl TcpConnection {
    fn new(socket: TcpStream) -> Self {
        Self {
            socket,
            current_offset: 0,
            current_buffer: vec![0; TCP_LENGTH_PREFIX_SIZE],
        }
    }

    fn reset(&mut self) -> Vec<u8> {
        self.current_offset = 0;
        std::mem::replace(&mut self.current_buffer, vec![0; TCP_LENGTH_PREFIX_SIZE])
    }
}

impl DnsServer {
    /// Bind both sockets, register them with epoll and start the server
    /// loop.
    pub fn start(address: SocketAddrV4, tunnel: DnsTunnelingCallback) -> LxResult<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .syscall("epoll_create1", "EPOLL_CLOEXEC")?;

        let udp_socket = UdpSocket::bind(address)?;
        udp_socket.set_nonblocking(true)?;
        epoll
            .add(&udp_socket, EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_UDP))
            .syscall("epoll_ctl", "udp")?;

        let tcp_listen_socket = TcpListener::bind(address)?;
        tcp_listen_socket.set_nonblocking(true)?;
        epoll
            .add(
                &tcp_listen_socket,
                EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_TCP_LISTEN),
            )
            .syscall("epoll_ctl", "tcp-listen")?;

        let (shutdown_read, shutdown_write) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).syscall("pipe2", "")?;
        epoll
            .add(
                &shutdown_read,
                EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_SHUTDOWN),
            )
            .syscall("epoll_ctl", "shutdown")?;

        tracing::info!(%address, "DNS server started");

        let inner = Arc::new(ServerInner {
            epoll,
            udp_socket,
            tcp_listen_socket,
            udp_state: Mutex::new(UdpState::default()),
            tcp_state: Mutex::new(TcpState::default()),
            tunnel,
        });

        let loop_inner = inner.clone();
        let thread = std::thread::Builder::new()
            .name("dns-server".into())
            .spawn(move || {
                // The shutdown pipe read end must outlive the loop.
                let _shutdown_read = shutdown_read;
                loop_inner.server_loop();
            })?;

        Ok(Self {
            inner,
            shutdown_write: Mutex::new(Some(shutdown_write)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Address the UDP socket is bound to.
    pub fn local_addr(&self) -> LxResult<SocketAddr> {
        Ok(self.inner.udp_socket.local_addr()?)
    }

    pub fn responder(&self) -> DnsResponder {
        DnsResponder {
            inner: self.inner.clone(),
        }
    }

    /// Signal the loop to exit and join it.
    pub fn stop(&self) {
        tracing::info!("stopping DNS server");
        // Closing the write end wakes the epoll loop.
        self.shutdown_write.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }

    #[cfg(test)]
    fn set_next_udp_request_id(&self, id: u32) {
        self.inner.udp_state.lock().next_request_id = id;
    }

    #[cfg(test)]
    fn udp_inflight_count(&self) -> usize {
        self.inner.udp_state.lock().inflight.len()
    }
}

impl Drop for DnsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl DnsResponder {
    /// Deliver a host response to the client identified by `client`. An
    /// unknown identifier is logged and dropped.
    pub fn handle_response(&self, buffer: &[u8], client: DnsClientId) {
        match client.protocol {
            DnsProtocol::Udp => self.inner.handle_udp_response(buffer, client.id),
            DnsProtocol::Tcp => self.inner.handle_tcp_response(buffer, client.id),
        }
    }
}

impl ServerInner {
    fn server_loop(&self) {
        let mut events = [EpollEvent::empty(); EPOLL_WAIT_MAX_EVENTS];
        loop {
            let ready = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => {
                    tracing::error!(?errno, "epoll_wait failed, DNS server loop exiting");
                    return;
                }
            };

            for event in &events[..ready] {
                match event.data() {
                    TOKEN_SHUTDOWN => return,
                    TOKEN_TCP_LISTEN => self.handle_new_tcp_connection(),
                    TOKEN_UDP => self.handle_udp_request(),
                    connection_id => self.handle_tcp_data(connection_id as u32),
                }
            }
        }
    }

    fn handle_udp_request(&self) {
        let mut buffer = [0u8; DNS_MAX_UDP_MESSAGE_SIZE];
        let request;
        let request_id;
        {
            let mut state = self.udp_state.lock();

            let (received, remote_addr) = match self.udp_socket.recv_from(&mut buffer) {
                Ok(result) => result,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    tracing::error!(error = %err, "recvfrom failed");
                    return;
                }
            };

            if received == 0 {
                tracing::error!("recvfrom returned 0 bytes");
                return;
            }

            // Allocate the next id; wraps to 0 past u32::MAX. A wrapped id
            // that is somehow still in flight is rejected rather than
            // silently reused.
            let id = state.next_request_id;
            state.next_request_id = state.next_request_id.wrapping_add(1);
            if state.inflight.contains_key(&id) {
                tracing::error!(request_id = id, "correlation id still in flight, dropping request");
                return;
            }

            tracing::debug!(
                client = %remote_addr,
                size = received,
                request_id = id,
                "new UDP DNS request"
            );

            state.inflight.insert(id, remote_addr);
            request = buffer[..received].to_vec();
            request_id = id;
        }

        (self.tunnel)(
            &request,
            DnsClientId {
                protocol: DnsProtocol::Udp,
                id: request_id,
            },
        );
    }

    fn handle_udp_response(&self, buffer: &[u8], request_id: u32) {
        tracing::debug!(size = buffer.len(), request_id, "new UDP DNS response");

        let mut state = self.udp_state.lock();

        let Some(remote_addr) = state.inflight.get(&request_id).copied() else {
            tracing::error!(request_id, "response for an untracked UDP request");
            return;
        };

        // Stop tracking the request whether or not the send succeeds.
        state.inflight.remove(&request_id);

        // The socket is non-blocking because epoll owns it; wait for
        // writability instead of spinning.
        loop {
            match self.udp_socket.send_to(buffer, remote_addr) {
                Ok(_) => break,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if !wait_writable(&self.udp_socket) {
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, request_id, "failed to send UDP DNS response");
                    break;
                }
            }
        }
    }

    fn handle_new_tcp_connection(&self) {
        let mut state = self.tcp_state.lock();

        let socket = match self.tcp_listen_socket.accept() {
            Ok((socket, _)) => socket,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(err) => {
                tracing::error!(error = %err, "accept failed");
                return;
            }
        };
        if let Err(err) = socket.set_nonblocking(true) {
            tracing::error!(error = %err, "failed to mark connection non-blocking");
            return;
        }

        let connection_id = state.next_connection_id;
        state.next_connection_id = state.next_connection_id.wrapping_add(1);
        if state.connections.contains_key(&connection_id) {
            tracing::error!(connection_id, "connection id still in use, dropping connection");
            return;
        }

        let connection = TcpConnection::new(socket);
        if let Err(errno) = self.epoll.add(
            &connection.socket,
            EpollEvent::new(EpollFlags::EPOLLIN, connection_id as u64),
        ) {
            tracing::error!(?errno, connection_id, "failed to register connection with epoll");
            return;
        }

        tracing::debug!(connection_id, "new TCP DNS connection");
        state.connections.insert(connection_id, connection);
    }

    /// One read per readiness notification; epoll is level-triggered so
    /// remaining data re-fires immediately.
    fn handle_tcp_data(&self, connection_id: u32) {
        let mut request: Option<Vec<u8>> = None;

        {
            let mut state = self.tcp_state.lock();
            let Some(connection) = state.connections.get_mut(&connection_id) else {
                return;
            };

            let offset = connection.current_offset;
            let received = match connection.socket.read(&mut connection.current_buffer[offset..]) {
                Ok(0) => {
                    // Peer closed. Dropping the socket unregisters it from
                    // epoll.
                    state.connections.remove(&connection_id);
                    return;
                }
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    tracing::error!(error = %err, connection_id, "TCP read failed, dropping connection");
                    state.connections.remove(&connection_id);
                    return;
                }
            };

            connection.current_offset += received;

            if connection.current_offset == connection.current_buffer.len() {
                if connection.current_buffer.len() == TCP_LENGTH_PREFIX_SIZE {
                    // The length prefix is network byte order.
                    let request_length = u16::from_be_bytes([
                        connection.current_buffer[0],
                        connection.current_buffer[1],
                    ]) as usize;

                    if request_length == 0 {
                        tracing::warn!(connection_id, "zero-length TCP DNS request");
                        connection.reset();
                        request = Some(Vec::new());
                    } else {
                        connection
                            .current_buffer
                            .resize(TCP_LENGTH_PREFIX_SIZE + request_length, 0);
                    }
                } else {
                    // Full request read; hand off the payload and prepare
                    // for the next request on this connection.
                    let full = connection.reset();
                    request = Some(full[TCP_LENGTH_PREFIX_SIZE..].to_vec());
                }
            }
        }

        if let Some(request) = request {
            tracing::debug!(
                size = request.len(),
                connection_id,
                "new TCP DNS request"
            );
            (self.tunnel)(
                &request,
                DnsClientId {
                    protocol: DnsProtocol::Tcp,
                    id: connection_id,
                },
            );
        }
    }

    fn handle_tcp_response(&self, buffer: &[u8], connection_id: u32) {
        tracing::debug!(size = buffer.len(), connection_id, "new TCP DNS response");

        let mut state = self.tcp_state.lock();

        let mut failed = false;
        {
            let Some(connection) = state.connections.get_mut(&connection_id) else {
                tracing::error!(connection_id, "response for an untracked TCP connection");
                return;
            };

            // Multiple requests may be in flight on one connection; DNS over
            // TCP permits out-of-order responses.
            let mut written = 0;
            while written < buffer.len() {
                match connection.socket.write(&buffer[written..]) {
                    Ok(n) => written += n,
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        if !wait_writable(&connection.socket) {
                            failed = true;
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, connection_id, "failed to send TCP DNS response");
                        failed = true;
                        break;
                    }
                }
            }
        }

        if failed {
            state.connections.remove(&connection_id);
        }
    }
}

/// Block until the fd is writable. Returns false on poll failure.
fn wait_writable<F: AsFd>(fd: &F) -> bool {
    let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLOUT)];
    loop {
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => return true,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => {
                tracing::error!(?errno, "poll for writability failed");
                return false;
            }
        }
    }
}
