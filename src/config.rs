//! Library-level tuning for channels and the relay server.
//!
//! Both structs follow the builder pattern: start from `Default` and chain
//! `set_*` calls.

use std::time::Duration;

const DEFAULT_RING_CAPACITY: usize = 4 * 1024 * 1024; // 4MB
const DEFAULT_SOCKET_BUFFER: usize = 64 * 1024;
const DEFAULT_LISTEN_BACKLOG: i32 = 3;
const DEFAULT_DATAGRAM_SIZE: usize = 64 * 1024;
const DEFAULT_DATAGRAM_BUDGET: usize = 64;
const DEFAULT_STREAM_READ_BUDGET: usize = 512 * 1024; // 512KB per readiness callback
const DEFAULT_MEDIA_QUEUE_DEPTH: usize = 1024;
const DEFAULT_BINDER_IDLE_MS: u64 = 50;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

pub const DEFAULT_STREAM_PORT: u16 = 9090;
pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_RTMP_PORT: u16 = 1935;

/// Per-channel socket and buffering parameters.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Ring buffer capacity in bytes
    pub ring_capacity: usize,
    /// SO_SNDBUF applied to input sockets
    pub send_buffer: usize,
    /// SO_RCVBUF applied to input sockets
    pub recv_buffer: usize,
    /// Backlog for `tcp://` listeners
    pub listen_backlog: i32,
    /// SO_SNDBUF applied to accepted client sockets
    pub client_send_buffer: usize,
    /// Largest datagram read in one call
    pub datagram_size: usize,
    /// Datagrams read per readiness callback before yielding to the reactor
    pub datagram_budget: usize,
    /// Bytes read from a stream socket per readiness callback
    pub stream_read_budget: usize,
    /// Chunks queued per output before the binder starts dropping
    pub media_queue_depth: usize,
    /// Longest binder park on an empty ring buffer; a put wakes it sooner
    pub binder_idle: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            send_buffer: DEFAULT_SOCKET_BUFFER,
            recv_buffer: DEFAULT_SOCKET_BUFFER,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            client_send_buffer: DEFAULT_SOCKET_BUFFER,
            datagram_size: DEFAULT_DATAGRAM_SIZE,
            datagram_budget: DEFAULT_DATAGRAM_BUDGET,
            stream_read_budget: DEFAULT_STREAM_READ_BUDGET,
            media_queue_depth: DEFAULT_MEDIA_QUEUE_DEPTH,
            binder_idle: Duration::from_millis(DEFAULT_BINDER_IDLE_MS),
        }
    }
}

impl ChannelConfig {
    pub fn set_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity.max(1);
        self
    }

    /// Sets both SO_SNDBUF and SO_RCVBUF for input sockets.
    pub fn set_socket_buffers(mut self, size: usize) -> Self {
        self.send_buffer = size;
        self.recv_buffer = size;
        self
    }

    pub fn set_listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog.max(1);
        self
    }

    pub fn set_client_send_buffer(mut self, size: usize) -> Self {
        self.client_send_buffer = size;
        self
    }

    pub fn set_datagram_budget(mut self, budget: usize) -> Self {
        self.datagram_budget = budget.max(1);
        self
    }

    pub fn set_media_queue_depth(mut self, depth: usize) -> Self {
        self.media_queue_depth = depth.max(1);
        self
    }
}

/// Relay server parameters.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound for one poller wait
    pub poll_timeout: Duration,
    /// Maximum accepted clients (None = auto-detect from the FD limit)
    pub max_clients: Option<usize>,
    /// Applied to every channel the server creates
    pub channel: ChannelConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            max_clients: None,
            channel: ChannelConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn set_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn set_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = Some(max_clients);
        self
    }

    pub fn set_channel_config(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_defaults() {
        let config = ChannelConfig::default();

        assert_eq!(config.ring_capacity, 4 * 1024 * 1024);
        assert_eq!(config.send_buffer, 64 * 1024);
        assert_eq!(config.recv_buffer, 64 * 1024);
        assert_eq!(config.listen_backlog, 3);
        assert_eq!(config.client_send_buffer, 64 * 1024);
    }

    #[test]
    fn test_builder_clamps_zero_values() {
        let config = ChannelConfig::default()
            .set_ring_capacity(0)
            .set_listen_backlog(0)
            .set_datagram_budget(0)
            .set_media_queue_depth(0);

        assert_eq!(config.ring_capacity, 1);
        assert_eq!(config.listen_backlog, 1);
        assert_eq!(config.datagram_budget, 1);
        assert_eq!(config.media_queue_depth, 1);
    }

    #[test]
    fn test_server_builder_chaining() {
        let config = ServerConfig::default()
            .set_poll_timeout(Duration::from_millis(10))
            .set_max_clients(16)
            .set_channel_config(ChannelConfig::default().set_socket_buffers(8192));

        assert_eq!(config.poll_timeout, Duration::from_millis(10));
        assert_eq!(config.max_clients, Some(16));
        assert_eq!(config.channel.send_buffer, 8192);
        assert_eq!(config.channel.recv_buffer, 8192);
    }
}
