//! **ez-relay** is the ingest and egress core of a live-media relay.
//!
//! A [`RelayServer`] owns a set of channels. Each channel receives one live
//! stream (raw UDP, raw TCP, HTTP pull or RTMP pull), detects whether it carries
//! FLV or MPEG-TS from the first byte, and stages the bytes in a bounded ring
//! buffer. A binder thread per channel fans the buffered bytes out to every
//! declared output rendition (HTTP-FLV, HTTP-TS, HLS, RTMP push), each of which
//! exposes a bounded queue of [`bytes::Bytes`] chunks for the transcoder that
//! consumes it.
//!
//! Socket I/O runs on a single thread: a level-triggered epoll/kqueue event
//! loop calls each connection's receive callback on readiness. Nothing on that
//! thread blocks; a full ring buffer or a full output queue drops data instead.
//!
//! # Example
//!
//! ```rust,ignore
//! use ez_relay::{RelayServer, ServerConfig};
//!
//! let mut server = RelayServer::new(ServerConfig::default())?;
//! server.create_channel("udp://0.0.0.0:9090", "tvb")?;
//! server.add_output("tvb", "http://127.0.0.1:80/tvb_flv")?;
//! server.add_output("tvb", "http://127.0.0.1:80/tvb_ts")?;
//! server.start_channel("tvb")?;
//! server.run()?;
//! ```
//!
//! Unix only (epoll on Linux, kqueue on macOS and the BSDs).

#[cfg(not(unix))]
compile_error!("ez-relay drives sockets through epoll/kqueue and only builds on unix targets");

pub mod config;
pub mod error;
pub mod media;
pub mod relay;

pub use config::{ChannelConfig, ServerConfig};
pub use error::{Error, Result};
pub use media::{Binding, Conversion, Media, MediaType, OutputFamily};
pub use relay::{Channel, ChannelId, ChannelRegistry, RelayHandle, RelayServer, StopHandle};
