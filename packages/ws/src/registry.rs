//! Connection registry: the one place connection state lives.

use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use proximity_config::{Position, RoomConfig};

use crate::models::{ConnId, PlayerSnapshot, SceneObject};

/// What the room knows about a connection once it has sent `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub name: String,
    pub pos: Position,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub broadcast: bool,
    pub objects: BTreeMap<String, SceneObject>,
    pub drink: Option<String>,
}

impl Presence {
    #[must_use]
    pub const fn new(name: String, pos: Position) -> Self {
        Self {
            name,
            pos,
            audio_enabled: true,
            video_enabled: true,
            broadcast: false,
            objects: BTreeMap::new(),
            drink: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnId,
    pub room: Arc<RoomConfig>,
    /// `None` until the connection has joined its room.
    pub presence: Option<Presence>,
}

impl Connection {
    #[must_use]
    pub const fn is_joined(&self) -> bool {
        self.presence.is_some()
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<PlayerSnapshot> {
        self.presence.as_ref().map(|presence| PlayerSnapshot {
            id: self.id.clone(),
            name: presence.name.clone(),
            audio_enabled: presence.audio_enabled,
            video_enabled: presence.video_enabled,
            pos: presence.pos,
            broadcast: presence.broadcast,
            objects: presence.objects.clone(),
            drink: presence.drink.clone(),
        })
    }
}

/// Every live connection, keyed by id.
///
/// Each connection's fields are only written from its own message stream or
/// its close path; everybody else reads cloned snapshots.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<BTreeMap<ConnId, Connection>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<ConnId, Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<ConnId, Connection>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `id` in `room`. Registering an id twice returns the
    /// existing connection untouched.
    pub fn register(&self, id: &str, room: Arc<RoomConfig>) -> Connection {
        self.write()
            .entry(id.to_string())
            .or_insert_with(|| Connection {
                id: id.to_string(),
                room,
                presence: None,
            })
            .clone()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Connection> {
        self.read().get(id).cloned()
    }

    /// Removes `id`. Removing an unknown id is a no-op returning `None`.
    pub fn remove(&self, id: &str) -> Option<Connection> {
        self.write().remove(id)
    }

    /// Applies `f` to the connection's presence, if it has joined.
    pub fn update_presence<T>(&self, id: &str, f: impl FnOnce(&mut Presence) -> T) -> Option<T> {
        self.write()
            .get_mut(id)
            .and_then(|connection| connection.presence.as_mut())
            .map(f)
    }

    /// Sets the presence of a registered connection. Returns `false` if `id`
    /// is unknown.
    pub fn set_presence(&self, id: &str, presence: Presence) -> bool {
        self.write()
            .get_mut(id)
            .map(|connection| connection.presence = Some(presence))
            .is_some()
    }

    /// Joined connections of `room`, other than `except`.
    #[must_use]
    pub fn snapshots(&self, room: &str, except: &str) -> Vec<PlayerSnapshot> {
        self.read()
            .values()
            .filter(|connection| connection.room.id == room && connection.id != except)
            .filter_map(Connection::snapshot)
            .collect()
    }

    #[must_use]
    pub fn joined_count(&self, room: &str) -> usize {
        self.read()
            .values()
            .filter(|connection| connection.room.id == room && connection.is_joined())
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
