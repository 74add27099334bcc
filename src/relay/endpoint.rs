//! Input URL parsing.
//!
//! Accepted forms:
//! - `udp://host[:port]` and `tcp://host[:port]` (relay binds and receives, default port 9090)
//! - `http://host[:port][/path]` (relay pulls, default port 80)
//! - `rtmp://host[:port]/app/stream` (relay pulls, default port 1935)

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use bytes::Bytes;

use crate::config::{DEFAULT_HTTP_PORT, DEFAULT_RTMP_PORT, DEFAULT_STREAM_PORT};
use crate::error::{Error, Result};

const SCHEMES: [(&str, Protocol); 4] = [
    ("udp://", Protocol::Udp),
    ("tcp://", Protocol::Tcp),
    ("http://", Protocol::Http),
    ("rtmp://", Protocol::Rtmp),
];

/// Input transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
    Http,
    Rtmp,
}

impl Protocol {
    /// Push transports: the relay binds and the source sends to it.
    pub fn is_push(&self) -> bool {
        matches!(self, Protocol::Udp | Protocol::Tcp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Http => write!(f, "http"),
            Protocol::Rtmp => write!(f, "rtmp"),
        }
    }
}

/// Parsed input URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    /// Request path for pull transports (`/` when absent)
    pub location: Option<String>,
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Endpoint> {
        let (rest, protocol) = SCHEMES
            .iter()
            .find_map(|(scheme, protocol)| url.strip_prefix(scheme).map(|rest| (rest, *protocol)))
            .ok_or_else(|| Error::UnsupportedInput(url.to_string()))?;

        match protocol {
            Protocol::Udp | Protocol::Tcp => {
                let (host, port) = match rest.split_once(':') {
                    Some((host, port)) => (host, leading_port(url, port)?),
                    None => (rest, DEFAULT_STREAM_PORT),
                };
                Ok(Endpoint {
                    protocol,
                    host: non_empty_host(url, host)?,
                    port,
                    location: None,
                })
            }
            Protocol::Http | Protocol::Rtmp => {
                let default_port = if protocol == Protocol::Http {
                    DEFAULT_HTTP_PORT
                } else {
                    DEFAULT_RTMP_PORT
                };
                let (authority, location) = match rest.find('/') {
                    Some(pos) => (&rest[..pos], &rest[pos..]),
                    None => (rest, "/"),
                };
                let (host, port) = match authority.split_once(':') {
                    Some((host, port)) => (host, leading_port(url, port)?),
                    None => (authority, default_port),
                };
                Ok(Endpoint {
                    protocol,
                    host: non_empty_host(url, host)?,
                    port,
                    location: Some(location.to_string()),
                })
            }
        }
    }

    /// Resolves host and port to the first matching socket address.
    pub fn socket_addr(&self) -> io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{} did not resolve", self.host),
                )
            })
    }

    /// Request an HTTP pull sends once connected.
    pub fn http_request(&self) -> Bytes {
        let location = self.location.as_deref().unwrap_or("/");
        Bytes::from(format!(
            "GET {} HTTP/1.1\r\nHost: {}:{}\r\nUser-Agent: ez-relay\r\nAccept: */*\r\nConnection: keep-alive\r\n\r\n",
            location, self.host, self.port
        ))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)?;
        if let Some(location) = &self.location {
            write!(f, "{}", location)?;
        }
        Ok(())
    }
}

/// Port from the digits at the start of `text` (at most 5).
fn leading_port(url: &str, text: &str) -> Result<u16> {
    let digits: String = text.chars().take_while(|c| c.is_ascii_digit()).take(5).collect();
    digits.parse::<u16>().map_err(|_| Error::InvalidUrl {
        url: url.to_string(),
        reason: "port is not a number in 0..=65535",
    })
}

fn non_empty_host(url: &str, host: &str) -> Result<String> {
    if host.is_empty() {
        return Err(Error::InvalidUrl {
            url: url.to_string(),
            reason: "missing host",
        });
    }
    Ok(host.to_string())
}
