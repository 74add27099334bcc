// src/relay/channel.rs - Channel: one input stream and its output bindings
//
// Core features:
// - Factory: URL scheme -> configured socket -> input Connection
// - start/stop toggle reactor registration only; closing is separate
// - ChannelContext is the state connections reach through their channel id:
//   detected media type, ring buffer, outputs, statistics
// - First payload fixes the media type once; outputs attach to the buffer then

use crate::config::ChannelConfig;
use crate::error::{Error, Result};
use crate::media::{byte_ring, Binding, Media, MediaType, RingConsumer, RingProducer};
use crate::relay::connection::{Connection, Progress};
use crate::relay::endpoint::{Endpoint, Protocol};
use crate::relay::net::{self, SocketOptions};
use crate::relay::reactor::{Reactor, Token};
use crate::relay::sniff;
use log::{debug, error, info, warn};
use ringbuf::traits::Observer;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Index of a channel in its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub usize);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-channel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Payload bytes placed in the ring buffer
    pub bytes_received: u64,
    /// Bytes lost to ring buffer overflow
    pub bytes_dropped: u64,
    /// Bytes thrown away because the format was never recognized
    pub bytes_discarded: u64,
    /// Clients accepted by a `tcp://` listener
    pub clients_accepted: u64,
}

// ============================================================================
// Channel context
// ============================================================================

/// Shared state of a channel, reached by its input and by accepted clients.
pub struct ChannelContext {
    name: String,
    media_type: MediaType,
    sniffed: bool,
    producer: RingProducer,
    /// Handed to the binder on attach
    consumer: Option<RingConsumer>,
    outputs: Vec<Media>,
    binding: Option<Binding>,
    attachments: usize,
    pub(crate) stats: ChannelStats,
    binder_idle: Duration,
}

impl ChannelContext {
    /// Allocates the channel's ring buffer (`config.ring_capacity` bytes).
    pub fn new(name: &str, config: &ChannelConfig) -> Self {
        let (producer, consumer) = byte_ring(config.ring_capacity);
        Self {
            name: name.to_string(),
            media_type: MediaType::Unknown,
            sniffed: false,
            producer,
            consumer: Some(consumer),
            outputs: Vec::new(),
            binding: None,
            attachments: 0,
            stats: ChannelStats::default(),
            binder_idle: config.binder_idle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn buffer_capacity(&self) -> usize {
        self.producer.capacity().get()
    }

    /// Bytes waiting in the ring buffer
    pub fn buffered(&self) -> usize {
        self.producer.occupied_len()
    }

    pub fn outputs(&self) -> &[Media] {
        &self.outputs
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    /// Times the outputs were attached to the buffer (0 or 1)
    pub fn attachments(&self) -> usize {
        self.attachments
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Declares an output. Once the input format is known it is typed and
    /// joins the live binding straight away.
    pub fn add_output(&mut self, mut media: Media) -> Result<()> {
        if self.media_type != MediaType::Unknown {
            media.bind_source(self.media_type);
        }
        let sender = media.sender();
        self.outputs.push(media);

        if let Some(binding) = &self.binding {
            binding.add_target(sender);
        } else if self.media_type != MediaType::Unknown {
            self.attach()?;
        }
        Ok(())
    }

    /// Entry point for every received payload.
    pub(crate) fn ingest(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        if !self.sniffed {
            self.sniffed = true;
            match sniff::detect(data) {
                MediaType::Unknown => error!(
                    "Channel {}: unsupported stream format (first byte {:#04x})",
                    self.name, data[0]
                ),
                detected => self.classify(detected)?,
            }
        }

        if self.media_type == MediaType::Unknown {
            self.stats.bytes_discarded += data.len() as u64;
            return Ok(());
        }

        let pushed = sniff::push_all(&mut self.producer, data);
        self.stats.bytes_received += pushed.written as u64;
        if pushed.written > 0 {
            if let Some(binding) = &self.binding {
                binding.notify();
            }
        }
        if pushed.dropped > 0 {
            self.stats.bytes_dropped += pushed.dropped as u64;
            warn!(
                "Channel {}: ring buffer full, dropped {} of {} bytes",
                self.name,
                pushed.dropped,
                data.len()
            );
        }
        Ok(())
    }

    fn classify(&mut self, detected: MediaType) -> Result<()> {
        info!("Channel {}: stream format detected: {}", self.name, detected);
        self.media_type = detected;
        for output in &mut self.outputs {
            output.bind_source(detected);
        }
        if !self.outputs.is_empty() {
            self.attach()?;
        }
        Ok(())
    }

    fn attach(&mut self) -> Result<()> {
        let Some(consumer) = self.consumer.take() else {
            debug!("Channel {} ring buffer already attached", self.name);
            return Ok(());
        };
        let targets = self.outputs.iter().map(Media::sender).collect();
        let binding = Binding::attach(&self.name, consumer, targets, self.binder_idle)?;
        self.binding = Some(binding);
        self.attachments += 1;
        Ok(())
    }
}

// ============================================================================
// Channel
// ============================================================================

/// A managed live input stream plus its output bindings.
pub struct Channel {
    id: Option<ChannelId>,
    endpoint: Endpoint,
    connection: Connection,
    context: ChannelContext,
    media_queue_depth: usize,
}

impl Channel {
    /// Opens the socket `url` asks for. The channel is not started.
    pub fn new(url: &str, name: &str, config: &ChannelConfig) -> Result<Channel> {
        let endpoint = Endpoint::parse(url)?;
        let setup_error = |source: io::Error| Error::SocketSetup {
            addr: format!("{}:{}", endpoint.host, endpoint.port),
            source,
        };

        let addr = endpoint.socket_addr().map_err(setup_error)?;
        let options = SocketOptions {
            send_buffer: config.send_buffer,
            recv_buffer: config.recv_buffer,
            nodelay: endpoint.protocol != Protocol::Udp,
        };

        let connection = match endpoint.protocol {
            Protocol::Udp => {
                let socket = net::udp_bind(addr, &options).map_err(setup_error)?;
                Connection::udp(socket, config)
            }
            Protocol::Tcp => {
                let listener = net::tcp_listen(addr, &options, config.listen_backlog).map_err(setup_error)?;
                Connection::listener(listener, config)
            }
            Protocol::Http => {
                let stream = net::tcp_connect(addr, &options).map_err(setup_error)?;
                Connection::pull(stream, Protocol::Http, Some(endpoint.http_request()), addr, config)
            }
            Protocol::Rtmp => {
                let stream = net::tcp_connect(addr, &options).map_err(setup_error)?;
                Connection::pull(stream, Protocol::Rtmp, None, addr, config)
            }
        };

        let context = ChannelContext::new(name, config);
        info!(
            "Channel {} created for {} ({} byte buffer)",
            name,
            endpoint,
            context.buffer_capacity()
        );

        Ok(Channel {
            id: None,
            endpoint,
            connection,
            context,
            media_queue_depth: config.media_queue_depth,
        })
    }

    pub(crate) fn assign_id(&mut self, id: ChannelId) {
        self.id = Some(id);
        self.connection.set_channel(id);
    }

    /// Registers the input with `reactor`. Push inputs are read-only.
    pub fn start(&mut self, reactor: &mut dyn Reactor) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::ChannelNotRegistered(self.name().to_string()))?;
        if self.connection.state().is_registered() {
            return Ok(());
        }
        let fd = self
            .connection
            .raw_fd()
            .ok_or_else(|| Error::ConnectionClosed(self.name().to_string()))?;

        let token = Token::Channel(id);
        reactor.register(fd, token).map_err(Error::Reactor)?;
        if self.endpoint.protocol.is_push() {
            if let Err(e) = reactor.disable_write(fd, token) {
                let _ = reactor.deregister(fd);
                return Err(Error::Reactor(e));
            }
        }

        self.connection.mark_registered(token);
        info!("Channel {} started on fd {}", self.name(), fd);
        Ok(())
    }

    /// Removes the input from `reactor`. The socket stays open.
    pub fn stop(&mut self, reactor: &mut dyn Reactor) -> Result<()> {
        if !self.connection.state().is_registered() {
            return Ok(());
        }
        self.connection.mark_unregistered();
        if let Some(fd) = self.connection.raw_fd() {
            reactor.deregister(fd).map_err(Error::Reactor)?;
            info!("Channel {} stopped", self.name());
        }
        Ok(())
    }

    /// Declares an output rendition by URL.
    pub fn add_output(&mut self, url: &str) -> Result<()> {
        let media = Media::for_output(url, self.media_queue_depth)?;
        debug!("Channel {} output {} ({:?})", self.name(), url, media.family());
        self.context.add_output(media)
    }

    pub fn receive(&mut self, reactor: &mut dyn Reactor) -> Result<Progress> {
        self.connection.receive(&mut self.context, reactor)
    }

    pub fn send(&mut self, reactor: &mut dyn Reactor) -> Result<Progress> {
        self.connection.send(reactor)
    }

    /// Closes the input socket. Outputs keep draining what is buffered.
    pub fn close(&mut self) {
        self.connection.close();
    }

    /// Registered with a reactor and still able to receive.
    pub fn is_running(&self) -> bool {
        self.connection.state().is_registered() && !self.connection.is_done()
    }

    pub fn id(&self) -> Option<ChannelId> {
        self.id
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn protocol(&self) -> Protocol {
        self.endpoint.protocol
    }

    pub fn media_type(&self) -> MediaType {
        self.context.media_type()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn context(&self) -> &ChannelContext {
        &self.context
    }

    pub(crate) fn context_mut(&mut self) -> &mut ChannelContext {
        &mut self.context
    }

    pub fn outputs(&self) -> &[Media] {
        self.context.outputs()
    }

    pub fn stats(&self) -> &ChannelStats {
        self.context.stats()
    }

    /// Bound address of a push input (useful with port 0)
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.connection.local_addr()
    }
}
