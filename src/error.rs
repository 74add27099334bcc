use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsupported input url: {0}")]
    UnsupportedInput(String),

    #[error("Invalid input url '{url}': {reason}")]
    InvalidUrl { url: String, reason: &'static str },

    #[error("Unsupported output protocol: {0}")]
    UnsupportedOutput(String),

    #[error("Socket setup failed for {addr}: {source}")]
    SocketSetup {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Reactor error: {0}")]
    Reactor(#[source] io::Error),

    #[error("recv on {fd} failed: {source}")]
    Receive {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("send on {fd} failed: {source}")]
    Send {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("Pull response rejected: {0}")]
    PullResponse(String),

    #[error("Channel '{0}' has not been added to a registry")]
    ChannelNotRegistered(String),

    #[error("Channel '{0}' input connection is closed")]
    ConnectionClosed(String),

    #[error("Channel '{0}' already exists")]
    ChannelExists(String),

    #[error("Channel '{0}' not found")]
    ChannelNotFound(String),

    #[error("Failed to spawn media binder: {0}")]
    BinderSpawn(#[source] io::Error),

    #[error("Failed to spawn relay server thread: {0}")]
    ServerSpawn(#[source] io::Error),

    #[error("Relay server thread panicked")]
    ServerPanicked,

    #[error(transparent)]
    Io(#[from] io::Error),
}
