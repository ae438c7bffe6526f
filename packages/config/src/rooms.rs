//! Static room definitions.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};

/// Room identifier.
pub type RoomId = String;

/// Name of the room sockets join when they don't ask for one.
pub const DEFAULT_ROOM_ID: &str = "main";

/// A point in room coordinates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn distance_to(&self, other: &Self) -> f64 {
        (f64::from(self.x) - f64::from(other.x)).hypot(f64::from(self.y) - f64::from(other.y))
    }
}

/// A circular zone of a room, e.g. the bar where avatars can grab a drink.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointOfInterest {
    pub pos: Position,
    pub radius: u32,
}

impl PointOfInterest {
    #[must_use]
    pub fn contains(&self, pos: &Position) -> bool {
        self.pos.distance_to(pos) <= f64::from(self.radius)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomConfig {
    pub id: RoomId,
    /// World bounds. These match the dimensions of the room background.
    pub width: u32,
    pub height: u32,
    /// Where new avatars enter. Joiners are spread out around it.
    pub starting_position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drink: Option<PointOfInterest>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            id: DEFAULT_ROOM_ID.to_string(),
            width: 3200,
            height: 1800,
            starting_position: Position::new(100, 100),
            drink: None,
        }
    }
}

/// Read-only set of rooms, built once at startup.
#[derive(Debug, Clone)]
pub struct RoomRegistry {
    rooms: BTreeMap<RoomId, Arc<RoomConfig>>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(vec![RoomConfig::default()])
    }
}

impl RoomRegistry {
    /// Builds the registry. An empty list yields the default room alone.
    #[must_use]
    pub fn new(rooms: Vec<RoomConfig>) -> Self {
        if rooms.is_empty() {
            return Self::default();
        }

        let rooms = rooms
            .into_iter()
            .map(|room| {
                if !room.starting_position_in_bounds() {
                    log::warn!(
                        "Room '{}' starts avatars outside of its {}x{} bounds",
                        room.id,
                        room.width,
                        room.height
                    );
                }
                (room.id.clone(), Arc::new(room))
            })
            .collect();

        Self { rooms }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<RoomConfig>> {
        self.rooms.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &RoomId> {
        self.rooms.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

impl RoomConfig {
    fn starting_position_in_bounds(&self) -> bool {
        let Position { x, y } = self.starting_position;
        x >= 0 && y >= 0 && x.unsigned_abs() <= self.width && y.unsigned_abs() <= self.height
    }
}
