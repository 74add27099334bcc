// src/relay/reactor.rs - Single-threaded event loop driving channel connections
//
// Core features:
// - `Reactor` trait: the registration surface connections and channels use
// - `EventLoop`: level-triggered Poller + the active set of accepted clients
// - Tokens carry (kind, slot, generation) so stale client events are dropped
// - Accepted clients are taken out of their slot while a callback runs, so the
//   loop never touches a connection that the callback closed
// - Client limit auto-adjusted to the system FD limit

use crate::error::Error;
use crate::relay::channel::{Channel, ChannelId};
use crate::relay::connection::{Connection, Progress};
use crate::relay::poller::{Event, Interest, Poller};
use crate::relay::registry::ChannelRegistry;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_MAX_CLIENTS: usize = 10000; // auto-adjusted by system FD limit
const SLOT_MASK: u64 = 0x7FFF_FFFF;

// ============================================================================
// System Helpers
// ============================================================================

/// Soft limit of open files, if the platform reports one.
fn get_fd_limit() -> Option<usize> {
    use std::mem::MaybeUninit;
    let mut rlim = MaybeUninit::<libc::rlimit>::uninit();
    // SAFETY: rlim is a valid pointer to uninitialized memory,
    // getrlimit will initialize it if successful
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, rlim.as_mut_ptr()) } == 0 {
        // SAFETY: getrlimit returned 0, so rlim is now initialized
        let rlim = unsafe { rlim.assume_init() };
        return Some(rlim.rlim_cur as usize);
    }
    None
}

/// Maximum accepted clients: the configured value (default 10000) capped at
/// 80% of the FD limit, never below 1.
pub fn effective_max_clients(config_max: Option<usize>) -> usize {
    let config_value = config_max.unwrap_or(DEFAULT_MAX_CLIENTS);
    let result = match get_fd_limit() {
        Some(fd_limit) => config_value.min((fd_limit as f64 * 0.8) as usize),
        None => config_value,
    };
    result.max(1)
}

// ============================================================================
// Token
// ============================================================================

/// Identity of a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    /// A channel's own input connection
    Channel(ChannelId),
    /// An accepted client living in the event loop's active set
    Client { slot: usize, generation: u32 },
}

impl Token {
    /// Layout: bit 0 = kind; channels keep the index above it, clients pack
    /// [generation: 32 bits][slot: 31 bits][1].
    pub fn to_poller_token(&self) -> u64 {
        match *self {
            Token::Channel(id) => (id.0 as u64) << 1,
            Token::Client { slot, generation } => {
                ((generation as u64) << 32) | (((slot as u64) & SLOT_MASK) << 1) | 1
            }
        }
    }

    pub fn from_poller_token(token: u64) -> Token {
        if token & 1 == 0 {
            Token::Channel(ChannelId((token >> 1) as usize))
        } else {
            Token::Client {
                slot: ((token >> 1) & SLOT_MASK) as usize,
                generation: (token >> 32) as u32,
            }
        }
    }
}

// ============================================================================
// Reactor trait
// ============================================================================

/// Registration surface handed to connection callbacks.
pub trait Reactor {
    /// Registers `fd` for read and write readiness.
    fn register(&mut self, fd: RawFd, token: Token) -> io::Result<()>;

    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Keeps read interest, drops write interest.
    fn disable_write(&mut self, fd: RawFd, token: Token) -> io::Result<()>;

    /// Moves an accepted client into the active set and returns its token.
    /// Fails with `ConnectionRefused` once the client limit is reached.
    fn adopt(&mut self, client: Connection) -> io::Result<Token>;

    /// Takes a client back out of the active set.
    fn release(&mut self, token: Token) -> Option<Connection>;
}

// ============================================================================
// Event loop
// ============================================================================

struct ClientSlot {
    generation: u32,
    /// Empty while the client's own callback is running
    conn: Option<Connection>,
}

/// Poller plus the accepted clients it owns.
pub struct EventLoop {
    poller: Poller,
    clients: slab::Slab<ClientSlot>,
    generations: HashMap<usize, u32>,
    max_clients: usize,
}

impl EventLoop {
    pub fn new(max_clients: Option<usize>) -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            clients: slab::Slab::with_capacity(64),
            generations: HashMap::new(),
            max_clients: effective_max_clients(max_clients),
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Waits up to `timeout` and dispatches every ready descriptor once.
    /// Returns the number of events handled.
    pub fn poll_once(&mut self, registry: &mut ChannelRegistry, timeout: Duration) -> io::Result<usize> {
        let events = self.poller.poll(Some(timeout))?;
        for event in &events {
            match Token::from_poller_token(event.token) {
                Token::Channel(id) => self.dispatch_channel(registry, id, event),
                Token::Client { slot, generation } => {
                    self.dispatch_client(registry, slot, generation, event)
                }
            }
        }
        Ok(events.len())
    }

    fn dispatch_channel(&mut self, registry: &mut ChannelRegistry, id: ChannelId, event: &Event) {
        let Some(channel) = registry.get_mut(id) else {
            debug!("Event for unknown channel {}", id);
            return;
        };
        if !channel.is_running() {
            return;
        }

        let mut outcome = Ok(Progress::Continue);
        if event.is_readable() || event.is_error() || event.is_hangup() {
            outcome = channel.receive(self);
        }
        if event.is_writable() && matches!(outcome, Ok(Progress::Continue)) && channel.is_running() {
            outcome = channel.send(self);
        }

        match outcome {
            Ok(Progress::Continue) => {}
            Ok(Progress::PeerClosed) => {
                info!("Channel {} input closed by peer", channel.name());
                self.retire_channel(channel);
            }
            Err(e) => {
                error!("Channel {} input failed: {}", channel.name(), e);
                self.retire_channel(channel);
            }
        }
    }

    /// Tears down a channel's input and every client accepted through it.
    fn retire_channel(&mut self, channel: &mut Channel) {
        if let Err(e) = channel.stop(self) {
            debug!("Channel {} deregistration failed: {}", channel.name(), e);
        }
        channel.close();
        if let Some(id) = channel.id() {
            self.close_clients_of(id);
        }
    }

    fn dispatch_client(
        &mut self,
        registry: &mut ChannelRegistry,
        slot: usize,
        generation: u32,
        event: &Event,
    ) {
        if !self.validate_client(slot, generation) {
            debug!("Stale event for client slot {} (generation {})", slot, generation);
            return;
        }
        let Some(mut conn) = self.clients.get_mut(slot).and_then(|entry| entry.conn.take()) else {
            return;
        };

        let outcome = match conn.channel().and_then(|id| registry.get_mut(id)) {
            Some(channel) => {
                let ctx = channel.context_mut();
                let mut outcome = Ok(Progress::Continue);
                if event.is_readable() || event.is_error() || event.is_hangup() {
                    outcome = conn.receive(ctx, self);
                }
                if event.is_writable() && matches!(outcome, Ok(Progress::Continue)) {
                    outcome = conn.send(self);
                }
                outcome
            }
            None => Err(Error::ChannelNotFound(format!("{:?}", conn.channel()))),
        };

        match outcome {
            Ok(Progress::Continue) => {
                if let Some(entry) = self.clients.get_mut(slot) {
                    entry.conn = Some(conn);
                }
            }
            Ok(Progress::PeerClosed) => {
                debug!("Client {} closed by peer", conn.describe_peer());
                self.discard_client(slot, conn);
            }
            Err(e) => {
                debug!("Dropping client {}: {}", conn.describe_peer(), e);
                self.discard_client(slot, conn);
            }
        }
    }

    /// Slot exists and its generation matches (prevents ABA on slot reuse).
    fn validate_client(&self, slot: usize, generation: u32) -> bool {
        self.clients
            .get(slot)
            .map(|entry| entry.generation == generation)
            .unwrap_or(false)
    }

    fn discard_client(&mut self, slot: usize, mut conn: Connection) {
        if let Some(fd) = conn.raw_fd() {
            if let Err(e) = self.poller.deregister(fd) {
                debug!("Failed to deregister client fd {}: {}", fd, e);
            }
        }
        conn.close();
        self.clients.try_remove(slot);
    }

    /// Closes every client that was accepted by channel `id`.
    pub fn close_clients_of(&mut self, id: ChannelId) {
        let slots: Vec<usize> = self
            .clients
            .iter()
            .filter(|(_, entry)| {
                entry
                    .conn
                    .as_ref()
                    .map(|conn| conn.channel() == Some(id))
                    .unwrap_or(false)
            })
            .map(|(slot, _)| slot)
            .collect();

        for slot in slots {
            if let Some(conn) = self.clients.get_mut(slot).and_then(|entry| entry.conn.take()) {
                self.discard_client(slot, conn);
            }
        }
    }

    /// Closes every accepted client.
    pub fn shutdown(&mut self) {
        let slots: Vec<usize> = self.clients.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            match self.clients.get_mut(slot).and_then(|entry| entry.conn.take()) {
                Some(conn) => self.discard_client(slot, conn),
                None => {
                    self.clients.try_remove(slot);
                }
            }
        }
    }
}

impl Reactor for EventLoop {
    fn register(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        self.poller
            .register(fd, token.to_poller_token(), Interest::READABLE.add_writable())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.poller.deregister(fd)
    }

    fn disable_write(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        self.poller
            .modify(fd, token.to_poller_token(), Interest::READABLE)
    }

    fn adopt(&mut self, mut client: Connection) -> io::Result<Token> {
        if self.clients.len() >= self.max_clients {
            warn!(
                "Client limit reached ({}/{}), rejecting {}",
                self.clients.len(),
                self.max_clients,
                client.describe_peer()
            );
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("max clients limit reached ({})", self.max_clients),
            ));
        }

        let entry = self.clients.vacant_entry();
        let slot = entry.key();

        let generation = self.generations.entry(slot).or_insert(0);
        *generation = generation.wrapping_add(1);
        let token = Token::Client {
            slot,
            generation: *generation,
        };

        client.set_token(token);
        entry.insert(ClientSlot {
            generation: *generation,
            conn: Some(client),
        });

        debug!("Client {} adopted (generation {})", slot, generation);
        Ok(token)
    }

    fn release(&mut self, token: Token) -> Option<Connection> {
        let Token::Client { slot, generation } = token else {
            return None;
        };
        if !self.validate_client(slot, generation) {
            return None;
        }
        self.clients.try_remove(slot).and_then(|entry| entry.conn)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Test support
// ============================================================================


// ============================================================================
// Tests
// ============================================================================
