// src/relay/connection.rs - Per-socket receive state machine
//
// Core features:
// - One type for every transport: UDP datagrams, TCP listener, accepted
//   TCP client, HTTP/RTMP pull client
// - States: Unregistered -> Registered -> {Receiving | Listening} -> Closing -> Closed
// - EINTR retries, EAGAIN/EWOULDBLOCK ends the callback successfully,
//   anything else is recorded and reported as fatal
// - Zero-byte stream reads report an orderly peer close, never an error
// - Closing never happens inside `receive`; the caller decides what to tear down

use crate::config::ChannelConfig;
use crate::error::{Error, Result};
use crate::relay::channel::{ChannelContext, ChannelId};
use crate::relay::endpoint::Protocol;
use crate::relay::net;
use crate::relay::reactor::{Reactor, Token};
use crate::relay::write_queue::{FlushResult, WriteQueue};
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

// ============================================================================
// Constants
// ============================================================================

const STREAM_READ_SIZE: usize = 64 * 1024;
const MAX_RESPONSE_HEADER: usize = 8 * 1024;
const HEADER_END: &[u8] = b"\r\n\r\n";

// ============================================================================
// State
// ============================================================================

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, not known to a reactor
    Unregistered,
    /// Registered, no readiness handled yet
    Registered,
    /// Carrying stream payload
    Receiving,
    /// Accepting clients
    Listening,
    /// Finished (peer close or fatal error), socket still open
    Closing,
    /// Socket released
    Closed,
}

impl ConnectionState {
    pub fn can_receive(&self) -> bool {
        matches!(
            self,
            ConnectionState::Registered | ConnectionState::Receiving | ConnectionState::Listening
        )
    }

    pub fn is_registered(&self) -> bool {
        !matches!(self, ConnectionState::Unregistered | ConnectionState::Closed)
    }
}

/// Transport variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Bound datagram socket
    Udp,
    /// Listening TCP socket; only spawns clients
    Listener,
    /// Client accepted by a listener
    Client,
    /// Outbound HTTP or RTMP pull
    Pull(Protocol),
}

impl ConnectionKind {
    /// Channel-owned connections live as long as their channel; accepted
    /// clients belong to the reactor's active set.
    pub fn is_channel_owned(&self) -> bool {
        !matches!(self, ConnectionKind::Client)
    }
}

/// Result of a successful callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Nothing more to do until the next readiness event
    Continue,
    /// The peer closed the stream in an orderly way
    PeerClosed,
}

enum Transport {
    Udp(UdpSocket),
    Listener(TcpListener),
    Stream(TcpStream),
}

impl Transport {
    fn raw_fd(&self) -> RawFd {
        match self {
            Transport::Udp(socket) => socket.as_raw_fd(),
            Transport::Listener(listener) => listener.as_raw_fd(),
            Transport::Stream(stream) => stream.as_raw_fd(),
        }
    }
}

/// Request/response bookkeeping for pull clients.
struct PullState {
    request: WriteQueue,
    awaiting_header: bool,
    header: Vec<u8>,
}

impl PullState {
    /// Strips the response header off the front of the stream.
    ///
    /// Returns the payload part of `data` (empty while the header is still
    /// arriving).
    fn consume_header<'a>(&mut self, data: &'a [u8]) -> Result<&'a [u8]> {
        if !self.awaiting_header {
            return Ok(data);
        }

        let before = self.header.len();
        self.header.extend_from_slice(data);

        match find(&self.header, HEADER_END) {
            Some(pos) => {
                let end = pos + HEADER_END.len();
                check_status(&self.header[..end])?;
                self.awaiting_header = false;
                self.header = Vec::new();
                Ok(&data[end - before..])
            }
            None if self.header.len() > MAX_RESPONSE_HEADER => Err(Error::PullResponse(format!(
                "response header exceeds {} bytes",
                MAX_RESPONSE_HEADER
            ))),
            None => Ok(&[]),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Accepts `HTTP/1.x 2xx` status lines only.
fn check_status(header: &[u8]) -> Result<()> {
    let status_line = header.split(|&b| b == b'\n').next().unwrap_or_default();
    let status_line = String::from_utf8_lossy(status_line).trim().to_string();

    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();

    if version.starts_with("HTTP/") && code.len() == 3 && code.starts_with('2') {
        Ok(())
    } else {
        Err(Error::PullResponse(status_line))
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One socket's non-blocking I/O state machine.
pub struct Connection {
    kind: ConnectionKind,
    transport: Option<Transport>,
    channel: Option<ChannelId>,
    token: Option<Token>,
    state: ConnectionState,
    done: bool,
    last_error: Option<i32>,
    read_buffer: Vec<u8>,
    pull: Option<PullState>,
    peer: Option<SocketAddr>,
    limits: Limits,
}

/// Per-callback budgets, inherited by accepted clients.
#[derive(Debug, Clone, Copy)]
struct Limits {
    client_send_buffer: usize,
    datagram_budget: usize,
    stream_read_budget: usize,
}

impl Limits {
    fn from_config(config: &ChannelConfig) -> Self {
        Self {
            client_send_buffer: config.client_send_buffer,
            datagram_budget: config.datagram_budget.max(1),
            stream_read_budget: config.stream_read_budget.max(1),
        }
    }
}

impl Connection {
    fn with_transport(kind: ConnectionKind, transport: Transport, read_size: usize, limits: Limits) -> Self {
        Self {
            kind,
            transport: Some(transport),
            channel: None,
            token: None,
            state: ConnectionState::Unregistered,
            done: false,
            last_error: None,
            read_buffer: vec![0u8; read_size.max(1)],
            pull: None,
            peer: None,
            limits,
        }
    }

    pub fn udp(socket: UdpSocket, config: &ChannelConfig) -> Self {
        Self::with_transport(
            ConnectionKind::Udp,
            Transport::Udp(socket),
            config.datagram_size,
            Limits::from_config(config),
        )
    }

    pub fn listener(listener: TcpListener, config: &ChannelConfig) -> Self {
        // A listener never reads payload
        Self::with_transport(
            ConnectionKind::Listener,
            Transport::Listener(listener),
            1,
            Limits::from_config(config),
        )
    }

    pub fn client(
        stream: TcpStream,
        peer: SocketAddr,
        channel: Option<ChannelId>,
        config: &ChannelConfig,
    ) -> Self {
        let mut conn = Self::with_transport(
            ConnectionKind::Client,
            Transport::Stream(stream),
            STREAM_READ_SIZE,
            Limits::from_config(config),
        );
        conn.channel = channel;
        conn.peer = Some(peer);
        conn
    }

    /// Outbound pull connection; `request` is written on the first writable event.
    pub fn pull(
        stream: TcpStream,
        protocol: Protocol,
        request: Option<Bytes>,
        peer: SocketAddr,
        config: &ChannelConfig,
    ) -> Self {
        let mut conn = Self::with_transport(
            ConnectionKind::Pull(protocol),
            Transport::Stream(stream),
            STREAM_READ_SIZE,
            Limits::from_config(config),
        );
        let mut queue = WriteQueue::new();
        let awaiting_header = request.is_some();
        if let Some(request) = request {
            queue.enqueue(request);
        }
        conn.pull = Some(PullState {
            request: queue,
            awaiting_header,
            header: Vec::new(),
        });
        conn.peer = Some(peer);
        conn
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// OS error code of the last fatal socket error
    pub fn last_error(&self) -> Option<i32> {
        self.last_error
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.transport.as_ref().map(Transport::raw_fd)
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.transport {
            Some(Transport::Udp(socket)) => socket.local_addr(),
            Some(Transport::Listener(listener)) => listener.local_addr(),
            Some(Transport::Stream(stream)) => stream.local_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed")),
        }
    }

    pub(crate) fn describe_peer(&self) -> String {
        match (self.peer, self.raw_fd()) {
            (Some(peer), _) => peer.to_string(),
            (None, Some(fd)) => format!("fd {}", fd),
            (None, None) => "closed socket".to_string(),
        }
    }

    pub(crate) fn set_channel(&mut self, channel: ChannelId) {
        self.channel = Some(channel);
    }

    pub(crate) fn set_token(&mut self, token: Token) {
        self.token = Some(token);
    }

    pub(crate) fn mark_registered(&mut self, token: Token) {
        self.token = Some(token);
        if !self.done {
            self.state = ConnectionState::Registered;
        }
    }

    pub(crate) fn mark_unregistered(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Unregistered;
        }
    }

    fn fail(&mut self, fd: RawFd, e: &io::Error) {
        self.last_error = e.raw_os_error();
        self.done = true;
        self.state = ConnectionState::Closing;
        error!("Socket fd {} failed: {}", fd, e);
    }

    /// Handles read readiness.
    pub fn receive(&mut self, ctx: &mut ChannelContext, reactor: &mut dyn Reactor) -> Result<Progress> {
        if self.done || !self.state.can_receive() {
            return Ok(Progress::Continue);
        }

        let progress = match self.kind {
            ConnectionKind::Udp => {
                self.state = ConnectionState::Receiving;
                self.receive_datagrams(ctx)
            }
            ConnectionKind::Listener => {
                self.state = ConnectionState::Listening;
                self.accept_client(ctx, reactor)
            }
            ConnectionKind::Client | ConnectionKind::Pull(_) => {
                self.state = ConnectionState::Receiving;
                self.receive_stream(ctx)
            }
        }?;

        if progress == Progress::PeerClosed {
            self.done = true;
            self.state = ConnectionState::Closing;
        }
        Ok(progress)
    }

    fn receive_datagrams(&mut self, ctx: &mut ChannelContext) -> Result<Progress> {
        let Some(Transport::Udp(socket)) = &self.transport else {
            return Ok(Progress::Continue);
        };
        let fd = socket.as_raw_fd();

        let mut datagrams = 0;
        while datagrams < self.limits.datagram_budget {
            match socket.recv(&mut self.read_buffer) {
                Ok(0) => datagrams += 1,
                Ok(n) => {
                    datagrams += 1;
                    ctx.ingest(&self.read_buffer[..n])?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.fail(fd, &e);
                    return Err(Error::Receive { fd, source: e });
                }
            }
        }
        Ok(Progress::Continue)
    }

    /// Accepts at most one pending client per call.
    fn accept_client(&mut self, ctx: &mut ChannelContext, reactor: &mut dyn Reactor) -> Result<Progress> {
        let Some(Transport::Listener(listener)) = &self.transport else {
            return Ok(Progress::Continue);
        };

        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    debug!("Channel {} accept failed: {}", ctx.name(), e);
                }
                return Ok(Progress::Continue);
            }
        };

        if let Err(e) = net::configure_client(&stream, self.limits.client_send_buffer) {
            debug!("Channel {} could not configure client {}: {}", ctx.name(), peer, e);
            return Ok(Progress::Continue);
        }

        let mut client = Connection::with_transport(
            ConnectionKind::Client,
            Transport::Stream(stream),
            STREAM_READ_SIZE,
            self.limits,
        );
        client.channel = self.channel;
        client.peer = Some(peer);
        client.state = ConnectionState::Registered;

        let Some(fd) = client.raw_fd() else {
            return Ok(Progress::Continue);
        };
        let token = match reactor.adopt(client) {
            Ok(token) => token,
            Err(e) => {
                warn!("Channel {} rejected client {}: {}", ctx.name(), peer, e);
                return Ok(Progress::Continue);
            }
        };

        if let Err(e) = reactor
            .register(fd, token)
            .and_then(|_| reactor.disable_write(fd, token))
        {
            warn!("Channel {} could not register client {}: {}", ctx.name(), peer, e);
            if let Some(mut client) = reactor.release(token) {
                client.close();
            }
            return Ok(Progress::Continue);
        }

        ctx.stats.clients_accepted += 1;
        info!("Channel {} accepted client {}", ctx.name(), peer);
        Ok(Progress::Continue)
    }

    fn receive_stream(&mut self, ctx: &mut ChannelContext) -> Result<Progress> {
        let Some(Transport::Stream(stream)) = &mut self.transport else {
            return Ok(Progress::Continue);
        };
        let fd = stream.as_raw_fd();

        let mut total = 0;
        while total < self.limits.stream_read_budget {
            match stream.read(&mut self.read_buffer) {
                Ok(0) => {
                    debug!("Channel {} stream fd {} reached end of stream", ctx.name(), fd);
                    return Ok(Progress::PeerClosed);
                }
                Ok(n) => {
                    total += n;
                    let data = &self.read_buffer[..n];
                    let payload = match &mut self.pull {
                        Some(pull) => pull.consume_header(data)?,
                        None => data,
                    };
                    if !payload.is_empty() {
                        ctx.ingest(payload)?;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.fail(fd, &e);
                    return Err(Error::Receive { fd, source: e });
                }
            }
        }
        Ok(Progress::Continue)
    }

    /// Handles write readiness: flushes a pending pull request, then drops
    /// write interest.
    pub fn send(&mut self, reactor: &mut dyn Reactor) -> Result<Progress> {
        if self.done {
            return Ok(Progress::Continue);
        }
        let (Some(fd), Some(token)) = (self.raw_fd(), self.token) else {
            return Ok(Progress::Continue);
        };

        let flushed = match (&mut self.pull, &mut self.transport) {
            (Some(pull), Some(Transport::Stream(stream))) if !pull.request.is_empty() => {
                Some(pull.request.try_flush(stream))
            }
            _ => None,
        };

        match flushed {
            Some(Ok(FlushResult::Complete { bytes_written })) => {
                debug!("Pull request sent on fd {} ({} bytes)", fd, bytes_written);
            }
            Some(Ok(FlushResult::WouldBlock { .. })) => return Ok(Progress::Continue),
            Some(Ok(FlushResult::Closed)) => {
                self.done = true;
                self.state = ConnectionState::Closing;
                return Ok(Progress::PeerClosed);
            }
            Some(Err(e)) => {
                self.fail(fd, &e);
                return Err(Error::Send { fd, source: e });
            }
            None => {}
        }

        reactor.disable_write(fd, token).map_err(Error::Reactor)?;
        Ok(Progress::Continue)
    }

    /// Releases the socket. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if let Some(transport) = self.transport.take() {
            debug!("Closing {:?} connection fd {}", self.kind, transport.raw_fd());
        }
        self.done = true;
        self.state = ConnectionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Conversion, Media, MediaType};
    use crate::relay::reactor::testing::MockReactor;
    use std::io::Write;
        use std::time::Duration;

    fn config() -> ChannelConfig {
        ChannelConfig::default()
    }

    fn context() -> ChannelContext {
        ChannelContext::new("test", &config().set_ring_capacity(4096))
    }

    fn udp_pair() -> (UdpSocket, Connection) {
        let socket = net::udp_bind(
            "127.0.0.1:0".parse().unwrap(),
            &net::SocketOptions {
                send_buffer: 0,
                recv_buffer: 0,
                nodelay: false,
            },
        )
        .expect("Failed to bind");
        let sender = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind sender");
        sender
            .connect(socket.local_addr().unwrap())
            .expect("Failed to connect sender");
        let mut conn = Connection::udp(socket, &config());
        conn.mark_registered(Token::Channel(ChannelId(0)));
        (sender, conn)
    }

    /// Sends datagrams and waits until they are readable.
    fn send_datagrams(sender: &UdpSocket, conn: &Connection, datagrams: &[&[u8]]) {
        for datagram in datagrams {
            sender.send(datagram).expect("Failed to send");
        }
        let fd = conn.raw_fd().unwrap();
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd for the duration of the call
        unsafe { libc::poll(&mut pfd, 1, 1000) };
        std::thread::sleep(Duration::from_millis(10));
    }

    #[test]
    fn test_state_transitions() {
        assert!(!ConnectionState::Unregistered.can_receive());
        assert!(ConnectionState::Registered.can_receive());
        assert!(ConnectionState::Listening.can_receive());
        assert!(!ConnectionState::Closing.can_receive());
        assert!(!ConnectionState::Closed.is_registered());
        assert!(ConnectionKind::Udp.is_channel_owned());
        assert!(!ConnectionKind::Client.is_channel_owned());
    }

    #[test]
    fn test_udp_flv_first_byte() {
        let (sender, mut conn) = udp_pair();
        let mut ctx = context();
        let mut reactor = MockReactor::default();

        send_datagrams(&sender, &conn, &[b"FLV\x01payload"]);
        let progress = conn.receive(&mut ctx, &mut reactor).expect("receive failed");

        assert_eq!(progress, Progress::Continue);
        assert_eq!(conn.state(), ConnectionState::Receiving);
        assert_eq!(ctx.media_type(), MediaType::Flv);
        assert_eq!(ctx.buffered(), 11);
    }

    #[test]
    fn test_udp_type_never_changes() {
        let (sender, mut conn) = udp_pair();
        let mut ctx = context();
        let mut reactor = MockReactor::default();
        ctx.add_output(Media::for_output("http://127.0.0.1/cam_flv", 16).unwrap())
            .expect("Failed to add output");

        send_datagrams(&sender, &conn, &[b"\x47first", b"Fsecond"]);
        conn.receive(&mut ctx, &mut reactor).expect("receive failed");

        assert_eq!(ctx.media_type(), MediaType::Ts);
        assert_eq!(ctx.attachments(), 1);
        assert_eq!(ctx.stats().bytes_received, 13);
        assert_eq!(ctx.outputs()[0].conversion(), Some(Conversion::TsToFlv));
    }

    #[test]
    fn test_udp_unknown_marker_stays_unknown() {
        let (sender, mut conn) = udp_pair();
        let mut ctx = context();
        let mut reactor = MockReactor::default();

        send_datagrams(&sender, &conn, &[b"\x00garbage"]);
        conn.receive(&mut ctx, &mut reactor).expect("receive failed");
        assert_eq!(ctx.media_type(), MediaType::Unknown);

        // Later datagrams are still read without classification
        send_datagrams(&sender, &conn, &[b"\x47late"]);
        conn.receive(&mut ctx, &mut reactor).expect("receive failed");
        assert_eq!(ctx.media_type(), MediaType::Unknown);
        assert_eq!(ctx.attachments(), 0);
        assert_eq!(ctx.buffered(), 0);
        assert_eq!(ctx.stats().bytes_discarded, 13);
    }

    #[test]
    fn test_receive_without_data_is_success() {
        let (_sender, mut conn) = udp_pair();
        let mut ctx = context();
        let mut reactor = MockReactor::default();

        assert_eq!(conn.receive(&mut ctx, &mut reactor).unwrap(), Progress::Continue);
        assert_eq!(ctx.media_type(), MediaType::Unknown);
    }

    #[test]
    fn test_listener_accepts_one_client() {
        let listener = net::tcp_listen(
            "127.0.0.1:0".parse().unwrap(),
            &net::SocketOptions {
                send_buffer: 64 * 1024,
                recv_buffer: 64 * 1024,
                nodelay: true,
            },
            3,
        )
        .expect("Failed to listen");
        let addr = listener.local_addr().unwrap();
        let mut conn = Connection::listener(listener, &config());
        conn.set_channel(ChannelId(4));
        conn.mark_registered(Token::Channel(ChannelId(4)));

        let mut ctx = context();
        let mut reactor = MockReactor::default();

        let _client = std::net::TcpStream::connect(addr).expect("Failed to connect");
        std::thread::sleep(Duration::from_millis(50));

        conn.receive(&mut ctx, &mut reactor).expect("receive failed");
        assert_eq!(conn.state(), ConnectionState::Listening);
        assert_eq!(reactor.client_count(), 1);
        assert_eq!(reactor.registered.len(), 1);
        assert_eq!(reactor.write_disabled.len(), 1);
        assert_eq!(reactor.registered[0], reactor.write_disabled[0]);
        assert_eq!(ctx.stats().clients_accepted, 1);

        let child = reactor.clients[0].as_ref().unwrap();
        assert_eq!(child.kind(), ConnectionKind::Client);
        assert_eq!(child.channel(), Some(ChannelId(4)));

        // No pending client: nothing happens, still success
        assert_eq!(conn.receive(&mut ctx, &mut reactor).unwrap(), Progress::Continue);
        assert_eq!(reactor.client_count(), 1);
        assert_eq!(reactor.registered.len(), 1);
    }

    #[test]
    fn test_stream_peer_close() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let mut peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, remote) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let mut conn = Connection::client(server, remote, Some(ChannelId(0)), &config());
        conn.mark_registered(Token::Client { slot: 0, generation: 1 });
        let mut ctx = context();
        let mut reactor = MockReactor::default();

        peer.write_all(b"\x47ts-bytes").unwrap();
        drop(peer);
        std::thread::sleep(Duration::from_millis(50));

        let progress = conn.receive(&mut ctx, &mut reactor).expect("receive failed");
        assert_eq!(progress, Progress::PeerClosed);
        assert!(conn.is_done());
        assert_eq!(ctx.media_type(), MediaType::Ts);
        assert_eq!(ctx.buffered(), 9);

        // Done connections ignore further callbacks
        assert_eq!(conn.receive(&mut ctx, &mut reactor).unwrap(), Progress::Continue);

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.raw_fd().is_none());
        conn.close();
    }

    #[test]
    fn test_stream_reset_is_fatal() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).expect("Failed to connect");
        let (server, remote) = listener.accept().expect("Failed to accept");
        server.set_nonblocking(true).unwrap();

        let mut conn = Connection::client(server, remote, Some(ChannelId(0)), &config());
        conn.mark_registered(Token::Client { slot: 0, generation: 1 });
        let mut ctx = context();
        let mut reactor = MockReactor::default();

        net::set_linger_zero(peer.as_raw_fd()).expect("Failed to set SO_LINGER");
        drop(peer);
        std::thread::sleep(Duration::from_millis(50));

        let err = conn.receive(&mut ctx, &mut reactor).unwrap_err();
        assert!(matches!(err, Error::Receive { .. }));
        assert_eq!(conn.last_error(), Some(libc::ECONNRESET));
        assert!(conn.is_done());
        assert_eq!(conn.state(), ConnectionState::Closing);

        // Recorded only: the socket stays open until the owner closes it
        assert!(conn.raw_fd().is_some());
        assert_eq!(ctx.media_type(), MediaType::Unknown);
        conn.close();
        assert_eq!(conn.last_error(), Some(libc::ECONNRESET));
    }

    #[test]
    fn test_pull_header_split_across_reads() {
        let mut pull = PullState {
            request: WriteQueue::new(),
            awaiting_header: true,
            header: Vec::new(),
        };

        assert_eq!(pull.consume_header(b"HTTP/1.1 200 OK\r\nContent-Type: video/mp2t\r").unwrap(), b"");
        let payload = pull.consume_header(b"\n\r\n\x47\x40\x00").unwrap();
        assert_eq!(payload, b"\x47\x40\x00");

        // Header done: everything is payload now
        assert_eq!(pull.consume_header(b"\r\n\r\n").unwrap(), b"\r\n\r\n");
    }

    #[test]
    fn test_pull_rejects_bad_status_and_huge_header() {
        let mut pull = PullState {
            request: WriteQueue::new(),
            awaiting_header: true,
            header: Vec::new(),
        };
        let err = pull.consume_header(b"HTTP/1.1 404 Not Found\r\n\r\n").unwrap_err();
        assert!(matches!(err, Error::PullResponse(line) if line == "HTTP/1.1 404 Not Found"));

        let mut pull = PullState {
            request: WriteQueue::new(),
            awaiting_header: true,
            header: Vec::new(),
        };
        let filler = vec![b'x'; MAX_RESPONSE_HEADER + 1];
        assert!(pull.consume_header(&filler).is_err());
    }

    #[test]
    fn test_pull_sends_request_then_disables_write() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let addr = listener.local_addr().unwrap();
        let stream = std::net::TcpStream::connect(addr).expect("Failed to connect");
        stream.set_nonblocking(true).unwrap();
        let (mut origin, _) = listener.accept().unwrap();

        let request = Bytes::from_static(b"GET /cam HTTP/1.1\r\n\r\n");
        let mut conn = Connection::pull(stream, Protocol::Http, Some(request.clone()), addr, &config());
        conn.mark_registered(Token::Channel(ChannelId(2)));

        let mut reactor = MockReactor::default();
        assert_eq!(conn.send(&mut reactor).unwrap(), Progress::Continue);
        assert_eq!(reactor.write_disabled.len(), 1);

        let mut received = vec![0u8; request.len()];
        origin.read_exact(&mut received).expect("Origin got no request");
        assert_eq!(&received[..], &request[..]);

        // Response header is stripped before the payload is sniffed
        origin.write_all(b"HTTP/1.1 200 OK\r\n\r\nFLV\x01").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let mut ctx = context();
        conn.receive(&mut ctx, &mut reactor).expect("receive failed");
        assert_eq!(ctx.media_type(), MediaType::Flv);
        assert_eq!(ctx.buffered(), 4);
    }
}
