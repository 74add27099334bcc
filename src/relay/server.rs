// src/relay/server.rs - Relay server: owns the channel registry and event loop
//
// Core features:
// - Explicit init (`new`) and teardown (`shutdown`); no process-wide state
// - Channel names are unique as far as `ChannelRegistry::exists` can tell
// - `run` blocks until a StopHandle fires; `spawn` runs it on a named thread
// - Status flag shared through Arc<AtomicUsize> (INIT -> RUN -> END)

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::relay::channel::{Channel, ChannelId};
use crate::relay::reactor::EventLoop;
use crate::relay::registry::ChannelRegistry;
use log::{debug, error, info};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

const STATUS_INIT: usize = 0;
const STATUS_RUN: usize = 1;
const STATUS_END: usize = 2;

/// Signals a running server to leave its loop.
#[derive(Clone)]
pub struct StopHandle {
    status: Arc<AtomicUsize>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.status.store(STATUS_END, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_END
    }
}

pub struct RelayServer {
    config: ServerConfig,
    registry: ChannelRegistry,
    event_loop: EventLoop,
    status: Arc<AtomicUsize>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let event_loop = EventLoop::new(config.max_clients).map_err(Error::Reactor)?;
        info!(
            "Relay server created (max_clients: {})",
            event_loop.max_clients()
        );
        Ok(Self {
            config,
            registry: ChannelRegistry::new(),
            event_loop,
            status: Arc::new(AtomicUsize::new(STATUS_INIT)),
        })
    }

    /// Opens the input `url` asks for and registers it as `name`.
    pub fn create_channel(&mut self, url: &str, name: &str) -> Result<ChannelId> {
        if self.registry.exists(name) {
            return Err(Error::ChannelExists(name.to_string()));
        }
        let channel = Channel::new(url, name, &self.config.channel)?;
        Ok(self.registry.add(channel))
    }

    pub fn add_output(&mut self, name: &str, url: &str) -> Result<()> {
        self.registry
            .find_mut(name)
            .ok_or_else(|| Error::ChannelNotFound(name.to_string()))?
            .add_output(url)
    }

    pub fn start_channel(&mut self, name: &str) -> Result<()> {
        let channel = self
            .registry
            .find_mut(name)
            .ok_or_else(|| Error::ChannelNotFound(name.to_string()))?;
        channel.start(&mut self.event_loop)
    }

    pub fn stop_channel(&mut self, name: &str) -> Result<()> {
        let channel = self
            .registry
            .find_mut(name)
            .ok_or_else(|| Error::ChannelNotFound(name.to_string()))?;
        channel.stop(&mut self.event_loop)
    }

    /// Starts every channel that is not running yet.
    pub fn start_all(&mut self) -> Result<()> {
        for channel in self.registry.iter_mut() {
            channel.start(&mut self.event_loop)?;
        }
        Ok(())
    }

    /// One poller wait plus dispatch. Returns the number of events handled.
    pub fn poll_once(&mut self) -> Result<usize> {
        self.event_loop
            .poll_once(&mut self.registry, self.config.poll_timeout)
            .map_err(Error::Reactor)
    }

    /// Runs the event loop until [`StopHandle::stop`] is called, then tears
    /// everything down.
    pub fn run(&mut self) -> Result<()> {
        if self
            .status
            .compare_exchange(STATUS_INIT, STATUS_RUN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Relay server already running or stopped");
            return Ok(());
        }

        info!("Relay server running with {} channels", self.registry.len());
        while self.status.load(Ordering::Acquire) == STATUS_RUN {
            if let Err(e) = self.poll_once() {
                error!("Relay server event loop failed: {}", e);
                self.shutdown();
                return Err(e);
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Moves the server onto a `relay-server-io` thread running [`run`](Self::run).
    pub fn spawn(mut self) -> Result<RelayHandle> {
        let stop = self.stop_handle();
        let handle = std::thread::Builder::new()
            .name("relay-server-io".to_string())
            .spawn(move || self.run())
            .map_err(Error::ServerSpawn)?;
        Ok(RelayHandle {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops and closes every channel and every accepted client.
    pub fn shutdown(&mut self) {
        for channel in self.registry.iter_mut() {
            if let Err(e) = channel.stop(&mut self.event_loop) {
                debug!("Channel {} deregistration failed: {}", channel.name(), e);
            }
            channel.close();
        }
        self.event_loop.shutdown();
        self.status.store(STATUS_END, Ordering::Release);
        info!("Relay server stopped");
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            status: Arc::clone(&self.status),
        }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.registry.find(name)
    }

    pub fn client_count(&self) -> usize {
        self.event_loop.client_count()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Server running on its own thread.
pub struct RelayHandle {
    stop: StopHandle,
    handle: Option<JoinHandle<Result<()>>>,
}

impl RelayHandle {
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stops the server and waits for its thread.
    pub fn stop(mut self) -> Result<()> {
        self.stop.stop();
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| Error::ServerPanicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.stop.stop();
        if let Err(e) = self.join() {
            error!("Relay server exited with error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaType;
    use std::io::Write;
    use std::net::{TcpStream, UdpSocket};
    use std::time::{Duration, Instant};

    fn server() -> RelayServer {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = ServerConfig::default().set_poll_timeout(Duration::from_millis(10));
        RelayServer::new(config).expect("Failed to create server")
    }

    fn poll_until(server: &mut RelayServer, mut done: impl FnMut(&RelayServer) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            server.poll_once().expect("poll failed");
            if done(server) {
                return true;
            }
        }
        false
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let mut server = server();
        server.create_channel("udp://127.0.0.1:0", "news").unwrap();

        let err = server.create_channel("udp://127.0.0.1:0", "news").unwrap_err();
        assert!(matches!(err, Error::ChannelExists(_)));

        // Prefix lookup treats "news2" as taken as well
        assert!(server.create_channel("udp://127.0.0.1:0", "news2").is_err());
        assert_eq!(server.registry().len(), 1);
    }

    #[test]
    fn test_unknown_channel_operations() {
        let mut server = server();
        assert!(matches!(
            server.start_channel("ghost"),
            Err(Error::ChannelNotFound(_))
        ));
        assert!(matches!(
            server.add_output("ghost", "http://127.0.0.1/g_ts"),
            Err(Error::ChannelNotFound(_))
        ));
    }

    #[test]
    fn test_udp_ingest_through_event_loop() {
        let mut server = server();
        server.create_channel("udp://127.0.0.1:0", "udp-in").unwrap();
        server.add_output("udp-in", "http://127.0.0.1/udp_ts").unwrap();
        server.start_channel("udp-in").unwrap();

        let addr = server.channel("udp-in").unwrap().local_addr().unwrap();
        let output = server.channel("udp-in").unwrap().outputs()[0].subscribe();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[0x47, 0x40, 0x11, 0x10], addr).unwrap();

        assert!(poll_until(&mut server, |s| {
            s.channel("udp-in").map(|c| c.media_type()) == Some(MediaType::Ts)
        }));
        let chunk = output.recv_timeout(Duration::from_secs(2)).expect("Output got nothing");
        assert_eq!(&chunk[..], &[0x47, 0x40, 0x11, 0x10]);
    }

    #[test]
    fn test_tcp_clients_feed_channel_and_close() {
        let mut server = server();
        server.create_channel("tcp://127.0.0.1:0", "tcp-in").unwrap();
        server.start_channel("tcp-in").unwrap();
        let addr = server.channel("tcp-in").unwrap().local_addr().unwrap();

        let mut client = TcpStream::connect(addr).expect("Failed to connect");
        assert!(poll_until(&mut server, |s| s.client_count() == 1));

        client.write_all(b"FLV\x01\x05").unwrap();
        assert!(poll_until(&mut server, |s| {
            s.channel("tcp-in").map(|c| c.media_type()) == Some(MediaType::Flv)
        }));
        assert_eq!(server.channel("tcp-in").unwrap().stats().clients_accepted, 1);

        drop(client);
        assert!(poll_until(&mut server, |s| s.client_count() == 0));
    }

    #[test]
    fn test_stop_channel_silences_input() {
        let mut server = server();
        server.create_channel("udp://127.0.0.1:0", "quiet").unwrap();
        server.start_channel("quiet").unwrap();
        server.stop_channel("quiet").unwrap();

        let addr = server.channel("quiet").unwrap().local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"\x47data", addr).unwrap();

        for _ in 0..5 {
            server.poll_once().unwrap();
        }
        assert_eq!(server.channel("quiet").unwrap().media_type(), MediaType::Unknown);

        // Restart picks up the datagram that was waiting in the socket
        server.start_channel("quiet").unwrap();
        assert!(poll_until(&mut server, |s| {
            s.channel("quiet").map(|c| c.media_type()) == Some(MediaType::Ts)
        }));
    }

    #[test]
    fn test_run_returns_after_stop() {
        let mut server = server();
        let stop = server.stop_handle();
        stop.stop();

        // Stopped before running: returns immediately
        server.run().expect("run failed");
        assert!(stop.is_stopped());
    }

    #[test]
    fn test_spawned_server_stops() {
        let mut server = server();
        server.create_channel("udp://127.0.0.1:0", "bg").unwrap();
        server.start_all().unwrap();

        let handle = server.spawn().expect("Failed to spawn");
        let stop = handle.stop_handle();
        std::thread::sleep(Duration::from_millis(30));
        handle.stop().expect("Server thread failed");
        assert!(stop.is_stopped());
    }
}
