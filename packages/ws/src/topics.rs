//! Room-scoped publish/subscribe.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use proximity_config::RoomId;
use strum_macros::{AsRefStr, EnumIter};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::ConnId;

/// Presence topics every room has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, AsRefStr, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum TopicKind {
    Join,
    Leave,
    Update,
    Position,
    Add,
    Remove,
    Drink,
}

/// A fan-out address. Topics hold no state of their own.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Topic {
    pub room: RoomId,
    pub kind: TopicKind,
}

impl Topic {
    #[must_use]
    pub fn new(room: impl Into<RoomId>, kind: TopicKind) -> Self {
        Self {
            room: room.into(),
            kind,
        }
    }

    /// Every topic of `room`.
    pub fn all(room: &str) -> impl Iterator<Item = Self> + '_ {
        use strum::IntoEnumIterator as _;

        TopicKind::iter().map(move |kind| Self::new(room, kind))
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.room, self.kind.as_ref())
    }
}

#[derive(Debug, Error)]
pub enum WebsocketSendError {
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnId),
    #[error("Connection {0} is closed")]
    Closed(ConnId),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("Unknown: {0}")]
    Unknown(String),
}

/// Transport seam: direct sends plus topic publish/subscribe.
#[async_trait]
pub trait WebsocketSender: Send + Sync {
    /// Sends a message to a single connection.
    ///
    /// # Errors
    ///
    /// * If the websocket message fails to send
    async fn send(&self, connection_id: &str, data: &str) -> Result<(), WebsocketSendError>;

    /// Sends a message to every current subscriber of `topic`.
    ///
    /// # Errors
    ///
    /// * If the websocket message fails to send
    async fn publish(&self, topic: &Topic, data: &str) -> Result<(), WebsocketSendError>;

    /// # Errors
    ///
    /// * If the connection is unknown
    async fn subscribe(&self, connection_id: &str, topic: &Topic)
    -> Result<(), WebsocketSendError>;

    /// # Errors
    ///
    /// * If the subscriptions fail to be removed
    async fn unsubscribe_all(&self, connection_id: &str) -> Result<(), WebsocketSendError>;
}

impl std::fmt::Debug for dyn WebsocketSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{WebsocketSender}}")
    }
}

/// In-process topic hub over per-connection channels.
#[derive(Debug, Default)]
pub struct TopicHub {
    connections: RwLock<BTreeMap<ConnId, mpsc::UnboundedSender<String>>>,
    subscriptions: RwLock<BTreeMap<Topic, BTreeSet<ConnId>>>,
}

impl TopicHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes messages for `connection_id` into `sender`.
    pub fn attach(&self, connection_id: &str, sender: mpsc::UnboundedSender<String>) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection_id.to_string(), sender);
    }

    /// Forgets the connection and all of its subscriptions.
    pub fn detach(&self, connection_id: &str) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection_id);
        self.remove_subscriptions(connection_id);
    }

    fn remove_subscriptions(&self, connection_id: &str) {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for subscribers in subscriptions.values_mut() {
            subscribers.remove(connection_id);
        }
        subscriptions.retain(|_, subscribers| !subscribers.is_empty());
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn subscribers(&self, topic: &Topic) -> BTreeSet<ConnId> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    fn send_to(&self, connection_id: &str, data: &str) -> Result<(), WebsocketSendError> {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let sender = connections
            .get(connection_id)
            .ok_or_else(|| WebsocketSendError::UnknownConnection(connection_id.to_string()))?;

        sender
            .send(data.to_string())
            .map_err(|_| WebsocketSendError::Closed(connection_id.to_string()))
    }
}

#[async_trait]
impl WebsocketSender for TopicHub {
    async fn send(&self, connection_id: &str, data: &str) -> Result<(), WebsocketSendError> {
        self.send_to(connection_id, data)
    }

    async fn publish(&self, topic: &Topic, data: &str) -> Result<(), WebsocketSendError> {
        let subscribers = self.subscribers(topic);
        log::trace!("publish: {topic} to {} subscriber(s)", subscribers.len());

        for connection_id in subscribers {
            // A subscriber can be gone before its close path unsubscribes it.
            if let Err(e) = self.send_to(&connection_id, data) {
                log::debug!("publish: skipped {connection_id} on {topic}: {e}");
            }
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        connection_id: &str,
        topic: &Topic,
    ) -> Result<(), WebsocketSendError> {
        if !self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(connection_id)
        {
            return Err(WebsocketSendError::UnknownConnection(
                connection_id.to_string(),
            ));
        }

        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.clone())
            .or_default()
            .insert(connection_id.to_string());

        Ok(())
    }

    async fn unsubscribe_all(&self, connection_id: &str) -> Result<(), WebsocketSendError> {
        self.remove_subscriptions(connection_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn attached(hub: &TopicHub, id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.attach(id, tx);
        rx
    }

    #[test_log::test(tokio::test)]
    async fn publish_reaches_only_subscribers_of_that_room() {
        let hub = TopicHub::new();
        let mut a = attached(&hub, "a1");
        let mut b = attached(&hub, "b1");
        let mut g = attached(&hub, "g1");
        for topic in Topic::all("main") {
            hub.subscribe("a1", &topic).await.unwrap();
        }
        hub.subscribe("g1", &Topic::new("garden", TopicKind::Join))
            .await
            .unwrap();

        hub.publish(&Topic::new("main", TopicKind::Join), "hello")
            .await
            .unwrap();

        assert_eq!(a.try_recv().unwrap(), "hello");
        assert!(b.try_recv().is_err());
        assert!(g.try_recv().is_err());
    }

    #[test_log::test(tokio::test)]
    async fn unsubscribe_all_stops_delivery() {
        let hub = TopicHub::new();
        let mut a = attached(&hub, "a1");
        let topic = Topic::new("main", TopicKind::Leave);
        hub.subscribe("a1", &topic).await.unwrap();

        hub.unsubscribe_all("a1").await.unwrap();
        hub.publish(&topic, "bye").await.unwrap();

        assert!(a.try_recv().is_err());
        assert!(hub.subscribers(&topic).is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn publish_skips_closed_receivers() {
        let hub = TopicHub::new();
        let gone = attached(&hub, "a1");
        let mut b = attached(&hub, "b1");
        let topic = Topic::new("main", TopicKind::Update);
        hub.subscribe("a1", &topic).await.unwrap();
        hub.subscribe("b1", &topic).await.unwrap();
        drop(gone);

        hub.publish(&topic, "still delivered").await.unwrap();

        assert_eq!(b.try_recv().unwrap(), "still delivered");
    }

    #[test_log::test(tokio::test)]
    async fn unknown_connections_cannot_subscribe_or_receive() {
        let hub = TopicHub::new();

        assert!(matches!(
            hub.subscribe("ghost", &Topic::new("main", TopicKind::Join)).await,
            Err(WebsocketSendError::UnknownConnection(_))
        ));
        assert!(matches!(
            hub.send("ghost", "hi").await,
            Err(WebsocketSendError::UnknownConnection(_))
        ));
    }

    #[test]
    fn topics_display_as_room_and_kind() {
        assert_eq!(Topic::new("main", TopicKind::Position).to_string(), "main/position");
        assert_eq!(Topic::all("main").count(), 7);
    }
}
