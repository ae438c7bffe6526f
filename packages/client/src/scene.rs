//! The room as one client sees it, kept current from server events.

use std::collections::BTreeMap;

use proximity_ws::models::{
    ConnId, InboundParseError, OutboundPayload, PlayerSnapshot, ServerEvent,
};

use crate::player::{Player, PlayerDelegate, PlayerKind};

#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    #[error(transparent)]
    InvalidEvent(#[from] InboundParseError),
}

#[derive(Debug)]
pub struct Scene {
    name: String,
    local: Option<Player>,
    players: BTreeMap<ConnId, Player>,
    screens: BTreeMap<(ConnId, String), Player>,
}

impl Scene {
    /// `name` is what the local player joined with.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local: None,
            players: BTreeMap::new(),
            screens: BTreeMap::new(),
        }
    }

    /// `None` until the server has assigned an id.
    #[must_use]
    pub const fn local(&self) -> Option<&Player> {
        self.local.as_ref()
    }

    pub const fn local_mut(&mut self) -> Option<&mut Player> {
        self.local.as_mut()
    }

    #[must_use]
    pub fn player(&self, id: &str) -> Option<&Player> {
        self.players.get(id)
    }

    pub fn player_mut(&mut self, id: &str) -> Option<&mut Player> {
        self.players.get_mut(id)
    }

    #[must_use]
    pub fn screen(&self, id: &str, object_id: &str) -> Option<&Player> {
        self.screens.get(&(id.to_string(), object_id.to_string()))
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    fn is_local(&self, id: &str) -> bool {
        self.local.as_ref().is_some_and(|local| local.id == id)
    }

    /// Applies one non-ACK line from the server.
    ///
    /// # Errors
    ///
    /// * If the line isn't a known server event
    pub fn apply(&mut self, message: &str, delegate: &dyn PlayerDelegate) -> Result<(), SceneError> {
        match ServerEvent::parse(message)? {
            ServerEvent::Pong => {}
            ServerEvent::Identity(identity) => {
                self.local = Some(Player::new(
                    identity.id,
                    self.name.clone(),
                    PlayerKind::Local,
                    identity.pos,
                    delegate,
                ));
            }
            ServerEvent::Position(event) => {
                let (x, y) = (f64::from(event.pos.x), f64::from(event.pos.y));
                let player = match event.object_id {
                    Some(object_id) => self.screens.get_mut(&(event.id, object_id)),
                    None if self.is_local(&event.id) => None,
                    None => self.players.get_mut(&event.id),
                };
                if let Some(player) = player {
                    player.set_position(x, y, delegate);
                }
            }
            ServerEvent::Payload(payload) => self.apply_payload(payload, delegate),
        }

        Ok(())
    }

    fn apply_payload(&mut self, payload: OutboundPayload, delegate: &dyn PlayerDelegate) {
        match payload {
            OutboundPayload::Players(players) => {
                for snapshot in players {
                    self.add_snapshot(snapshot, delegate);
                }
            }
            OutboundPayload::Join(join) => {
                let player = Player::new(
                    join.id.clone(),
                    join.name,
                    PlayerKind::Remote,
                    join.pos,
                    delegate,
                );
                self.players.insert(join.id, player);
            }
            OutboundPayload::Leave(leave) => {
                self.players.remove(&leave.id);
                self.screens.retain(|(owner, _), _| *owner != leave.id);
            }
            OutboundPayload::Update(update) => {
                if self.is_local(&update.id) {
                    return;
                }
                if let Some(player) = self.players.get_mut(&update.id) {
                    player.name = update.name;
                    player.audio_enabled = update.audio_enabled;
                    player.video_enabled = update.video_enabled;
                    if player.broadcast != update.broadcast {
                        player.set_broadcast(update.broadcast, delegate);
                    }
                }
            }
            OutboundPayload::Add(add) => {
                if self.is_local(&add.id) {
                    return;
                }
                let name = self
                    .players
                    .get(&add.id)
                    .map(|p| p.name.clone())
                    .unwrap_or_default();
                let screen = Player::new(
                    add.id.clone(),
                    name,
                    PlayerKind::ScreenShare,
                    add.pos,
                    delegate,
                );
                self.screens.insert((add.id, add.object_id), screen);
            }
            OutboundPayload::Remove(remove) => {
                self.screens.remove(&(remove.id, remove.object_id));
            }
            OutboundPayload::Drink(drink) => {
                if let Some(local) = self.local.as_mut().filter(|l| l.id == drink.id) {
                    local.drink = Some(drink.drink_id);
                } else if let Some(player) = self.players.get_mut(&drink.id) {
                    player.drink = Some(drink.drink_id);
                }
            }
        }
    }

    fn add_snapshot(&mut self, snapshot: PlayerSnapshot, delegate: &dyn PlayerDelegate) {
        let mut player = Player::new(
            snapshot.id.clone(),
            snapshot.name.clone(),
            PlayerKind::Remote,
            snapshot.pos,
            delegate,
        );
        player.audio_enabled = snapshot.audio_enabled;
        player.video_enabled = snapshot.video_enabled;
        player.drink = snapshot.drink;
        if snapshot.broadcast {
            player.set_broadcast(true, delegate);
        }

        for (object_id, object) in snapshot.objects {
            let screen = Player::new(
                snapshot.id.clone(),
                snapshot.name.clone(),
                PlayerKind::ScreenShare,
                object.pos,
                delegate,
            );
            self.screens.insert((snapshot.id.clone(), object_id), screen);
        }

        self.players.insert(snapshot.id, player);
    }

    /// Re-evaluates volume and range of every remote player and screen share,
    /// e.g. after the local player moved.
    pub fn refresh(&mut self, delegate: &dyn PlayerDelegate) {
        for player in self.players.values_mut().chain(self.screens.values_mut()) {
            player.set_position(player.x, player.y, delegate);
        }
    }
}
