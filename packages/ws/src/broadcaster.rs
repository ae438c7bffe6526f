//! Turns presence changes into room-scoped topic publications.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use proximity_config::{Position, RoomConfig, RoomId};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};

use crate::{
    models::{
        AddPayload, DrinkPayload, IdentityPayload, JoinPayload, LeavePayload, OutboundPayload,
        PositionEvent, RemovePayload, UpdatePayload,
    },
    registry::{Connection, ConnectionRegistry, Presence},
    topics::{Topic, TopicKind, WebsocketSendError, WebsocketSender},
};

/// Roughly the diameter of an avatar bubble plus some room to breathe.
pub const SPREAD_OUT_DISTANCE: i32 = 150;

/// Where the `ordinal`th joiner of `room` (0 based) appears.
///
/// The 2nd and 4th of every four joiners are offset right, the 3rd and 4th
/// are offset down.
#[must_use]
pub const fn start_position(room: &RoomConfig, ordinal: usize) -> Position {
    let offset_x = ordinal % 2 == 1;
    let offset_y = ordinal % 4 >= 2;

    Position::new(
        room.starting_position.x.saturating_add(if offset_x { SPREAD_OUT_DISTANCE } else { 0 }),
        room.starting_position.y.saturating_add(if offset_y { SPREAD_OUT_DISTANCE } else { 0 }),
    )
}

/// Joins and leaves hold their room exclusively. Presence changes of joined
/// connections hold it shared, so a joiner's snapshot and subscription are
/// never split by anything another connection does in the room.
#[derive(Debug, Default)]
pub struct PresenceBroadcaster {
    room_locks: Mutex<BTreeMap<RoomId, Arc<RwLock<()>>>>,
}

impl PresenceBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn room_lock(&self, room: &str) -> Arc<RwLock<()>> {
        self.room_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(room.to_string())
            .or_default()
            .clone()
    }

    /// Held while a joined connection changes its presence and publishes the
    /// change. Waits for any join or leave in progress in `room`.
    pub async fn share_room(&self, room: &str) -> OwnedRwLockReadGuard<()> {
        self.room_lock(room).read_owned().await
    }

    /// Brings a registered connection into its room.
    ///
    /// The connection gets its id and start position, then a snapshot of
    /// everybody already there. The room hears about the joiner before the
    /// joiner subscribes, so it never sees its own join nor a join for a
    /// peer already in its snapshot.
    ///
    /// Returns `None` if the connection is unknown or has already joined.
    ///
    /// # Errors
    ///
    /// * If a message to the joiner or the room fails to send
    pub async fn join(
        &self,
        registry: &ConnectionRegistry,
        sender: &dyn WebsocketSender,
        connection_id: &str,
        name: String,
    ) -> Result<Option<Position>, WebsocketSendError> {
        let Some(connection) = registry.get(connection_id) else {
            return Ok(None);
        };
        if connection.is_joined() {
            return Ok(None);
        }
        let room = connection.room;

        let lock = self.room_lock(&room.id);
        let _guard = lock.write().await;

        let pos = start_position(&room, registry.joined_count(&room.id));
        let players = registry.snapshots(&room.id, connection_id);
        registry.set_presence(connection_id, Presence::new(name.clone(), pos));

        let identity = IdentityPayload {
            id: connection_id.to_string(),
            pos,
        };
        sender
            .send(connection_id, &serde_json::to_string(&identity)?)
            .await?;
        sender
            .send(
                connection_id,
                &OutboundPayload::Players(players).to_json()?,
            )
            .await?;

        self.announce_join(sender, &room.id, connection_id, name, pos)
            .await?;

        for topic in Topic::all(&room.id) {
            sender.subscribe(connection_id, &topic).await?;
        }

        log::info!("join: {connection_id} joined '{}' at {pos:?}", room.id);

        Ok(Some(pos))
    }

    /// Takes a connection out of the registry and tells its room.
    ///
    /// Returns the removed connection, or `None` if it was already gone.
    ///
    /// # Errors
    ///
    /// * If the leave event fails to publish
    pub async fn leave(
        &self,
        registry: &ConnectionRegistry,
        sender: &dyn WebsocketSender,
        connection_id: &str,
    ) -> Result<Option<Connection>, WebsocketSendError> {
        sender.unsubscribe_all(connection_id).await?;

        let Some(room) = registry.get(connection_id).map(|c| c.room) else {
            return Ok(None);
        };

        let lock = self.room_lock(&room.id);
        let _guard = lock.write().await;

        let connection = registry.remove(connection_id);
        if connection.as_ref().is_some_and(Connection::is_joined) {
            self.announce_leave(sender, &room.id, connection_id).await?;
            log::info!("leave: {connection_id} left '{}'", room.id);
        }

        Ok(connection)
    }

    async fn publish(
        sender: &dyn WebsocketSender,
        room: &str,
        kind: TopicKind,
        payload: &OutboundPayload,
    ) -> Result<(), WebsocketSendError> {
        sender
            .publish(&Topic::new(room, kind), &payload.to_json()?)
            .await
    }

    /// # Errors
    ///
    /// * If the event fails to publish
    pub async fn announce_join(
        &self,
        sender: &dyn WebsocketSender,
        room: &str,
        connection_id: &str,
        name: String,
        pos: Position,
    ) -> Result<(), WebsocketSendError> {
        let payload = OutboundPayload::Join(JoinPayload {
            id: connection_id.to_string(),
            name,
            pos,
        });
        Self::publish(sender, room, TopicKind::Join, &payload).await
    }

    /// # Errors
    ///
    /// * If the event fails to publish
    pub async fn announce_leave(
        &self,
        sender: &dyn WebsocketSender,
        room: &str,
        connection_id: &str,
    ) -> Result<(), WebsocketSendError> {
        let payload = OutboundPayload::Leave(LeavePayload {
            id: connection_id.to_string(),
        });
        Self::publish(sender, room, TopicKind::Leave, &payload).await
    }

    /// Publishes the presentation fields of `connection` and nothing else.
    ///
    /// # Errors
    ///
    /// * If the event fails to publish
    pub async fn announce_update(
        &self,
        sender: &dyn WebsocketSender,
        connection: &Connection,
    ) -> Result<(), WebsocketSendError> {
        let Some(presence) = &connection.presence else {
            return Ok(());
        };
        let payload = OutboundPayload::Update(UpdatePayload {
            id: connection.id.clone(),
            name: presence.name.clone(),
            audio_enabled: presence.audio_enabled,
            video_enabled: presence.video_enabled,
            broadcast: presence.broadcast,
        });
        Self::publish(sender, &connection.room.id, TopicKind::Update, &payload).await
    }

    /// Position updates are the hot path and go out as plain text.
    ///
    /// # Errors
    ///
    /// * If the event fails to publish
    pub async fn announce_position(
        &self,
        sender: &dyn WebsocketSender,
        room: &str,
        connection_id: &str,
        object_id: Option<String>,
        pos: Position,
    ) -> Result<(), WebsocketSendError> {
        let event = PositionEvent {
            id: connection_id.to_string(),
            object_id,
            pos,
        };
        sender
            .publish(&Topic::new(room, TopicKind::Position), &event.to_string())
            .await
    }

    /// # Errors
    ///
    /// * If the event fails to publish
    pub async fn announce_add(
        &self,
        sender: &dyn WebsocketSender,
        room: &str,
        connection_id: &str,
        object_id: String,
        pos: Position,
    ) -> Result<(), WebsocketSendError> {
        let payload = OutboundPayload::Add(AddPayload {
            id: connection_id.to_string(),
            object_id,
            pos,
        });
        Self::publish(sender, room, TopicKind::Add, &payload).await
    }

    /// # Errors
    ///
    /// * If the event fails to publish
    pub async fn announce_remove(
        &self,
        sender: &dyn WebsocketSender,
        room: &str,
        connection_id: &str,
        object_id: String,
    ) -> Result<(), WebsocketSendError> {
        let payload = OutboundPayload::Remove(RemovePayload {
            id: connection_id.to_string(),
            object_id,
        });
        Self::publish(sender, room, TopicKind::Remove, &payload).await
    }

    /// # Errors
    ///
    /// * If the event fails to publish
    pub async fn announce_drink(
        &self,
        sender: &dyn WebsocketSender,
        room: &str,
        connection_id: &str,
        drink_id: String,
    ) -> Result<(), WebsocketSendError> {
        let payload = OutboundPayload::Drink(DrinkPayload {
            id: connection_id.to_string(),
            drink_id,
        });
        Self::publish(sender, room, TopicKind::Drink, &payload).await
    }
}
