//! In-process registry of live connections.
//!
//! Every connection belongs to one user for its whole lifetime and sits in
//! at most one conversation room at a time. Nothing here is persisted: after
//! a reconnect the client joins its room again.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::{
    model::{ConversationId, UserId},
    protocol::ServerEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why an event did not reach a connection. Never surfaced to senders;
/// the connection is evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMiss {
    Closed,
    Full,
}

struct Entry {
    user: UserId,
    room: Option<ConversationId>,
    outbox: mpsc::Sender<ServerEvent>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Entry>,
    rooms: HashMap<ConversationId, HashSet<ConnectionId>>,
    users: HashMap<UserId, HashSet<ConnectionId>>,
}

impl Registry {
    fn remove(&mut self, connection: ConnectionId) {
        let Some(entry) = self.connections.remove(&connection) else {
            return;
        };

        if let Some(room) = &entry.room {
            self.detach_room(connection, room);
        }
        if let Some(sessions) = self.users.get_mut(&entry.user) {
            sessions.remove(&connection);
            if sessions.is_empty() {
                self.users.remove(&entry.user);
            }
        }
    }

    fn detach_room(&mut self, connection: ConnectionId, room: &ConversationId) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(&connection);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }
}

#[derive(Clone)]
pub struct Presence {
    registry: Arc<Mutex<Registry>>,
    buffer: usize,
}

impl Presence {
    /// `buffer` bounds each connection's queue of undelivered events.
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::default(),
            buffer: buffer.max(1),
        }
    }

    // Critical sections never await, so a poisoned lock still holds consistent maps.
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a new connection to `user`'s personal channel.
    pub fn register(&self, user: &UserId) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let connection = ConnectionId(Uuid::now_v7());
        let (outbox, inbox) = mpsc::channel(self.buffer);

        let mut registry = self.lock();
        registry.connections.insert(
            connection,
            Entry {
                user: user.clone(),
                room: None,
                outbox,
            },
        );
        registry.users.entry(user.clone()).or_default().insert(connection);

        (connection, inbox)
    }

    /// Puts `connection` in `room`, leaving whatever room it was in before.
    /// Unknown connections are ignored.
    pub fn join(&self, connection: ConnectionId, room: &ConversationId) {
        let mut registry = self.lock();
        let Some(entry) = registry.connections.get_mut(&connection) else {
            return;
        };
        let previous = entry.room.replace(room.clone());

        if let Some(previous) = previous.filter(|previous| previous != room) {
            registry.detach_room(connection, &previous);
        }
        registry.rooms.entry(room.clone()).or_default().insert(connection);
    }

    pub fn leave(&self, connection: ConnectionId, room: &ConversationId) {
        let mut registry = self.lock();
        let Some(entry) = registry.connections.get_mut(&connection) else {
            return;
        };
        if entry.room.as_ref() != Some(room) {
            return;
        }
        entry.room = None;
        registry.detach_room(connection, room);
    }

    pub fn on_connection_closed(&self, connection: ConnectionId) {
        self.lock().remove(connection);
    }

    pub fn members_of(&self, room: &ConversationId) -> HashSet<ConnectionId> {
        self.lock().rooms.get(room).cloned().unwrap_or_default()
    }

    pub fn connections_of(&self, user: &UserId) -> HashSet<ConnectionId> {
        self.lock().users.get(user).cloned().unwrap_or_default()
    }

    pub fn user_of(&self, connection: ConnectionId) -> Option<UserId> {
        self.lock().connections.get(&connection).map(|entry| entry.user.clone())
    }

    pub fn room_of(&self, connection: ConnectionId) -> Option<ConversationId> {
        self.lock()
            .connections
            .get(&connection)
            .and_then(|entry| entry.room.clone())
    }

    /// Queues `event` for `connection` without waiting.
    ///
    /// A connection that misses an event is evicted: its queue closes after
    /// what is already in it, and the client has to reconnect and reload
    /// history.
    pub fn deliver(&self, connection: ConnectionId, event: ServerEvent) -> Result<(), DeliveryMiss> {
        let mut registry = self.lock();
        let outbox = registry
            .connections
            .get(&connection)
            .map(|entry| &entry.outbox)
            .ok_or(DeliveryMiss::Closed)?;

        let miss = match outbox.try_send(event) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(_)) => DeliveryMiss::Full,
            Err(TrySendError::Closed(_)) => DeliveryMiss::Closed,
        };
        registry.remove(connection);
        Err(miss)
    }
}
