//! Peers as the local client sees them.

use proximity_config::Position;
use proximity_ws::models::ConnId;

/// Full volume up to this distance.
pub const SOUND_NEAR_RANGE: f64 = 200.0;
/// Silent beyond this distance.
pub const SOUND_CUTOFF_RANGE: f64 = 350.0;

/// Volume of something at `(x, y)` heard from `listener`, in `0.0..=1.0`.
#[must_use]
pub fn calc_volume(x: f64, y: f64, broadcast: bool, listener: (f64, f64)) -> f64 {
    if broadcast {
        return 1.0;
    }

    let dist = (y - listener.1).hypot(x - listener.0);
    if dist > SOUND_CUTOFF_RANGE {
        return 0.0;
    }
    if dist < SOUND_NEAR_RANGE {
        return 1.0;
    }

    1.0 - (dist - SOUND_NEAR_RANGE) / (SOUND_CUTOFF_RANGE - SOUND_NEAR_RANGE)
}

/// What the local client does in response to peers moving and to its own
/// avatar changing.
pub trait PlayerDelegate {
    fn calc_volume(&self, player: &Player) -> f64;

    /// Stop receiving media from `id`.
    fn pause(&self, id: &str);

    /// Start receiving media from `id` again.
    fn resume(&self, id: &str);

    /// Publish the local presentation fields.
    fn update(&self, name: &str, audio_enabled: bool, video_enabled: bool, broadcast: bool);

    /// Publish the local avatar position.
    fn position(&self, x: i32, y: i32);

    /// Re-evaluate every remote player against the new local position.
    fn update_players(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerKind {
    /// The avatar this client controls.
    Local,
    /// Somebody else's avatar.
    Remote,
    /// A screen share placed in the room by its owner.
    ScreenShare,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub id: ConnId,
    pub name: String,
    pub kind: PlayerKind,
    pub x: f64,
    pub y: f64,
    pub broadcast: bool,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub drink: Option<String>,
    /// Whether the player is currently audible.
    pub in_range: bool,
    /// Last volume computed for the player.
    pub volume: f64,
    /// Whether a media stream is attached. Pause and resume are only sent
    /// for attached streams.
    pub has_media: bool,
}

impl Player {
    #[must_use]
    pub fn new(
        id: impl Into<ConnId>,
        name: impl Into<String>,
        kind: PlayerKind,
        pos: Position,
        delegate: &dyn PlayerDelegate,
    ) -> Self {
        let mut player = Self {
            id: id.into(),
            name: name.into(),
            kind,
            x: f64::from(pos.x),
            y: f64::from(pos.y),
            broadcast: false,
            audio_enabled: true,
            video_enabled: false,
            drink: None,
            in_range: true,
            volume: 1.0,
            has_media: false,
        };

        if kind != PlayerKind::Local {
            player.volume = delegate.calc_volume(&player);
            player.in_range = player.volume != 0.0;
        }

        player
    }

    /// Shown next to a screen share.
    #[must_use]
    pub fn display_name(&self) -> String {
        match self.kind {
            PlayerKind::ScreenShare if self.name.ends_with('s') => format!("{}' screen", self.name),
            PlayerKind::ScreenShare => format!("{}'s screen", self.name),
            PlayerKind::Local | PlayerKind::Remote => self.name.clone(),
        }
    }

    pub const fn attach_media(&mut self) {
        self.has_media = true;
    }

    /// Moves the player and reacts according to its kind.
    ///
    /// The local player reports its rounded position and refreshes everybody
    /// else. Remote players recompute their volume, and pause or resume
    /// their media exactly once when they cross the audible boundary.
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_position(&mut self, x: f64, y: f64, delegate: &dyn PlayerDelegate) {
        self.x = x;
        self.y = y;

        if self.kind == PlayerKind::Local {
            delegate.position(x.round() as i32, y.round() as i32);
            delegate.update_players();
            return;
        }

        self.volume = delegate.calc_volume(self);
        let enabled = self.volume != 0.0;

        if self.kind == PlayerKind::Remote && self.has_media && enabled != self.in_range {
            if enabled {
                delegate.resume(&self.id);
            } else {
                delegate.pause(&self.id);
            }
        }

        self.in_range = enabled;
    }

    /// Re-runs the position logic so volume follows the broadcast flag.
    pub fn set_broadcast(&mut self, enabled: bool, delegate: &dyn PlayerDelegate) {
        self.broadcast = enabled;
        self.set_position(self.x, self.y, delegate);
        self.sync(delegate);
    }

    pub fn set_mic(&mut self, enabled: bool, delegate: &dyn PlayerDelegate) {
        self.audio_enabled = enabled;
        self.sync(delegate);
    }

    pub fn set_cam(&mut self, enabled: bool, delegate: &dyn PlayerDelegate) {
        self.video_enabled = enabled;
        self.sync(delegate);
    }

    fn sync(&self, delegate: &dyn PlayerDelegate) {
        if self.kind == PlayerKind::Local {
            delegate.update(
                &self.name,
                self.audio_enabled,
                self.video_enabled,
                self.broadcast,
            );
        }
    }
}
