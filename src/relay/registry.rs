//! Ordered collection of every channel a server owns.
//!
//! Lookups by name compare only as many bytes as the stored name has, so a
//! registered `"foo"` also answers for `"foobar"`. Callers that need exact
//! matches should compare [`Channel::name`] themselves.

use crate::relay::channel::{Channel, ChannelId};

#[derive(Default)]
pub struct ChannelRegistry {
    channels: Vec<Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `channel` and assigns its id (its position, stable for the
    /// registry's lifetime).
    pub fn add(&mut self, mut channel: Channel) -> ChannelId {
        let id = ChannelId(self.channels.len());
        channel.assign_id(id);
        self.channels.push(channel);
        id
    }

    /// First channel whose stored name is a prefix of `name`.
    pub fn position(&self, name: &str) -> Option<ChannelId> {
        self.channels
            .iter()
            .position(|channel| name.as_bytes().starts_with(channel.name().as_bytes()))
            .map(ChannelId)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn find(&self, name: &str) -> Option<&Channel> {
        self.position(name).and_then(|id| self.get(id))
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.position(name).and_then(move |id| self.get_mut(id))
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id.0)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.channels.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
