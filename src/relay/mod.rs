//! The **relay** module is the ingest side of the relay: channels that accept a
//! live stream over UDP, TCP, HTTP pull or RTMP pull, detect its container from
//! the first byte, and stage it in a bounded ring buffer for the output
//! renditions declared on the channel.
//!
//! # Architecture
//!
//! Everything socket-facing runs on one thread driven by a level-triggered
//! **event loop**:
//! - **Linux**: epoll
//! - **macOS/BSD**: kqueue
//!
//! ## Key Components
//!
//! - `RelayServer`: owns the registry and the event loop; init / run / shutdown
//! - `ChannelRegistry`: ordered channel list with prefix name lookup
//! - `Channel`: one input connection, one ring buffer, zero or more outputs
//! - `Connection`: per-socket receive state machine
//! - `EventLoop`: `Reactor` implementation plus the accepted-client active set
//! - `Poller`: readiness multiplexer over libc
//!
//! ## Input URLs
//!
//! | Scheme | Socket | Default port | Write interest |
//! |--------|--------|--------------|----------------|
//! | `udp://host[:port]` | bound datagram socket | 9090 | disabled at start |
//! | `tcp://host[:port]` | listener, one client per accept | 9090 | disabled at start |
//! | `http://host[:port][/path]` | outbound connect + GET | 80 | until the request is sent |
//! | `rtmp://host[:port]/app/stream` | outbound connect | 1935 | until first writable event |
//!
//! ## Format Detection
//!
//! | First byte | Container |
//! |------------|-----------|
//! | `'F'` (0x46) | FLV |
//! | `0x47` | MPEG-TS |
//! | anything else | unknown: logged, payload discarded, never retried |
//!
//! ## Error Model
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | `EINTR` | retried in place |
//! | `EAGAIN` / `EWOULDBLOCK` | callback ends successfully |
//! | zero-byte stream read | peer close, connection retired |
//! | other socket error | recorded, logged, connection retired |
//! | ring buffer full | excess bytes dropped and counted |
//!
//! # Example
//!
//! ```rust,ignore
//! let mut server = RelayServer::new(ServerConfig::default())?;
//! server.create_channel("udp://0.0.0.0:9090", "news")?;
//! server.add_output("news", "http://127.0.0.1:80/news_flv")?;
//! server.add_output("news", "http://127.0.0.1:80/news.m3u8")?;
//! server.start_all()?;
//!
//! let flv = server.channel("news").unwrap().outputs()[0].subscribe();
//! let handle = server.spawn()?;
//!
//! while let Ok(chunk) = flv.recv() {
//!     // feed the FLV transcoder
//! }
//! handle.stop()?;
//! ```

pub mod channel;
pub mod connection;
pub mod endpoint;
pub mod net;
pub mod poller;
pub mod reactor;
pub mod registry;
pub mod server;
pub mod sniff;
pub mod write_queue;

pub use channel::{Channel, ChannelContext, ChannelId, ChannelStats};
pub use connection::{Connection, ConnectionKind, ConnectionState, Progress};
pub use endpoint::{Endpoint, Protocol};
pub use reactor::{EventLoop, Reactor, Token};
pub use registry::ChannelRegistry;
pub use server::{RelayHandle, RelayServer, StopHandle};
