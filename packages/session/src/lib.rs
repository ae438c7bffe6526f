#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Drives the media engine on behalf of each connection.
//!
//! Every connection owns one media session made of two lanes: a producer
//! lane (one send transport plus a producer per [`MediaKind`]) and a
//! consumer lane (one receive transport plus, per peer, a consumer per kind).
//!
//! The coordinator never holds its lock across an engine call. Callers are
//! expected to serialize the calls made for any one connection; calls for
//! different connections may run concurrently.

use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use proximity_media::{
    Consumer, DtlsParameters, MediaEngine, MediaError, MediaKind, Producer, RtpCapabilities,
    RtpParameters, Transport, TransportOptions, TransportParams,
};
use thiserror::Error;

pub mod models;

pub use models::{ConsumerParams, Lane, LaneState};

pub type ConnId = String;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No media session for connection {0}")]
    UnknownSession(ConnId),
    #[error("Connection {id} has no {lane} transport")]
    NoTransport { id: ConnId, lane: Lane },
    #[error(transparent)]
    Media(#[from] MediaError),
}

#[derive(Debug, Default)]
struct TransportSlot {
    transport: Option<Arc<dyn Transport>>,
    connected: bool,
}

impl TransportSlot {
    fn state(&self, active: bool) -> LaneState {
        match (&self.transport, self.connected) {
            (None, _) => LaneState::Uninitialized,
            (Some(_), false) => LaneState::TransportCreated,
            (Some(_), true) if active => LaneState::Active,
            (Some(_), true) => LaneState::TransportConnected,
        }
    }
}

#[derive(Debug, Default)]
struct MediaSession {
    producer: TransportSlot,
    producers: BTreeMap<MediaKind, Arc<dyn Producer>>,
    consumer: TransportSlot,
    consumers: BTreeMap<ConnId, BTreeMap<MediaKind, Arc<dyn Consumer>>>,
}

impl MediaSession {
    const fn slot(&self, lane: Lane) -> &TransportSlot {
        match lane {
            Lane::Producer => &self.producer,
            Lane::Consumer => &self.consumer,
        }
    }

    const fn slot_mut(&mut self, lane: Lane) -> &mut TransportSlot {
        match lane {
            Lane::Producer => &mut self.producer,
            Lane::Consumer => &mut self.consumer,
        }
    }
}

/// Everything a session owned at the time it was closed.
#[derive(Default)]
struct Teardown {
    producers: Vec<Arc<dyn Producer>>,
    consumers: Vec<Arc<dyn Consumer>>,
    transports: Vec<Arc<dyn Transport>>,
}

impl Teardown {
    async fn run(self, id: &str) {
        for producer in self.producers {
            close_quietly(id, "producer", producer.id(), producer.close().await);
        }
        for consumer in self.consumers {
            close_quietly(id, "consumer", consumer.id(), consumer.close().await);
        }
        for transport in self.transports {
            close_quietly(id, "transport", transport.id(), transport.close().await);
        }
    }
}

fn close_quietly(id: &str, what: &str, resource_id: &str, result: Result<(), MediaError>) {
    match result {
        Ok(()) => log::trace!("close: {id} closed {what} {resource_id}"),
        Err(e) if e.is_already_closed() => {
            log::trace!("close: {id} {what} {resource_id} was already closed");
        }
        Err(e) => log::warn!("close: {id} failed to close {what} {resource_id}: {e:?}"),
    }
}

pub struct SessionCoordinator {
    engine: Arc<dyn MediaEngine>,
    sessions: RwLock<BTreeMap<ConnId, MediaSession>>,
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("sessions", &self.read().len())
            .finish_non_exhaustive()
    }
}

impl SessionCoordinator {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine,
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<ConnId, MediaSession>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<ConnId, MediaSession>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the router capabilities and makes sure `id` has a session.
    ///
    /// Calling it again for a connection that already has a session keeps
    /// the existing session as is.
    pub fn get_router_capabilities(&self, id: &str) -> RtpCapabilities {
        let mut sessions = self.write();
        if !sessions.contains_key(id) {
            log::debug!("get_router_capabilities: new media session for {id}");
            sessions.insert(id.to_string(), MediaSession::default());
        }
        drop(sessions);

        self.engine.rtp_capabilities()
    }

    #[must_use]
    pub fn has_session(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.read().len()
    }

    /// [`LaneState::Closed`] once the session has been torn down (or never existed).
    #[must_use]
    pub fn lane_state(&self, id: &str, lane: Lane) -> LaneState {
        self.read().get(id).map_or(LaneState::Closed, |session| {
            let active = match lane {
                Lane::Producer => !session.producers.is_empty(),
                Lane::Consumer => session.consumers.values().any(|kinds| !kinds.is_empty()),
            };
            session.slot(lane).state(active)
        })
    }

    #[must_use]
    pub fn producer_id(&self, id: &str, kind: MediaKind) -> Option<String> {
        self.read()
            .get(id)
            .and_then(|session| session.producers.get(&kind))
            .map(|producer| producer.id().to_string())
    }

    /// Kinds `id` currently consumes from `peer_id`.
    #[must_use]
    pub fn consumed_kinds(&self, id: &str, peer_id: &str) -> Vec<MediaKind> {
        self.read()
            .get(id)
            .and_then(|session| session.consumers.get(peer_id))
            .map(|kinds| kinds.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Creates the transport of `lane` for `id`.
    ///
    /// A second call replaces the stored transport. The previous transport
    /// is left open.
    ///
    /// # Errors
    ///
    /// * If `id` has no session
    /// * If the engine fails to create the transport
    pub async fn create_transport(
        &self,
        id: &str,
        lane: Lane,
        options: &TransportOptions,
    ) -> Result<TransportParams, SessionError> {
        if !self.has_session(id) {
            return Err(SessionError::UnknownSession(id.to_string()));
        }

        let (transport, params) = self.engine.create_transport(options).await?;

        let replaced = {
            let mut sessions = self.write();
            sessions.get_mut(id).map(|session| {
                let slot = session.slot_mut(lane);
                slot.connected = false;
                slot.transport.replace(transport.clone())
            })
        };

        match replaced {
            None => {
                close_quietly(id, "transport", transport.id(), transport.close().await);
                return Err(SessionError::UnknownSession(id.to_string()));
            }
            Some(Some(previous)) => log::warn!(
                "create_transport: {id} replaced {lane} transport {} with {} without closing it",
                previous.id(),
                transport.id()
            ),
            Some(None) => {}
        }

        log::debug!("create_transport: {id} {lane} transport {}", params.id);

        Ok(params)
    }

    fn transport(&self, id: &str, lane: Lane) -> Result<Arc<dyn Transport>, SessionError> {
        self.read()
            .get(id)
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))?
            .slot(lane)
            .transport
            .clone()
            .ok_or_else(|| SessionError::NoTransport {
                id: id.to_string(),
                lane,
            })
    }

    /// # Errors
    ///
    /// * If `id` has no transport on `lane`
    /// * If the DTLS handshake fails
    pub async fn connect_transport(
        &self,
        id: &str,
        lane: Lane,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SessionError> {
        let transport = self.transport(id, lane)?;
        transport.connect(dtls_parameters).await?;

        if let Some(session) = self.write().get_mut(id) {
            let slot = session.slot_mut(lane);
            if slot
                .transport
                .as_ref()
                .is_some_and(|current| current.id() == transport.id())
            {
                slot.connected = true;
            }
        }

        log::debug!("connect_transport: {id} connected {lane} transport {}", transport.id());

        Ok(())
    }

    /// Produces `kind` on the producer transport of `id` and returns the
    /// producer id.
    ///
    /// # Errors
    ///
    /// * If `id` has no producer transport
    /// * If the engine rejects the RTP parameters
    pub async fn produce(
        &self,
        id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, SessionError> {
        let transport = self.transport(id, Lane::Producer)?;
        let producer = transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id().to_string();

        let replaced = {
            let mut sessions = self.write();
            sessions
                .get_mut(id)
                .map(|session| session.producers.insert(kind, producer.clone()))
        };

        match replaced {
            None => {
                close_quietly(id, "producer", &producer_id, producer.close().await);
                return Err(SessionError::UnknownSession(id.to_string()));
            }
            Some(Some(previous)) => log::warn!(
                "produce: {id} replaced {kind} producer {} with {producer_id}",
                previous.id()
            ),
            Some(None) => {}
        }

        log::debug!("produce: {id} {kind} producer {producer_id}");

        Ok(producer_id)
    }

    /// Consumes `kind` from `peer_id` on the consumer transport of `id`.
    ///
    /// Returns `None` when the peer isn't producing `kind`, when the
    /// capabilities are incompatible, or when anything along the way fails.
    /// Audio starts flowing right away; video starts paused.
    pub async fn consume(
        &self,
        id: &str,
        peer_id: &str,
        kind: MediaKind,
        rtp_capabilities: &RtpCapabilities,
    ) -> Option<ConsumerParams> {
        match self.try_consume(id, peer_id, kind, rtp_capabilities).await {
            Ok(params) => params,
            Err(e) => {
                log::debug!("consume: {id} failed to consume {kind} from {peer_id}: {e}");
                None
            }
        }
    }

    async fn try_consume(
        &self,
        id: &str,
        peer_id: &str,
        kind: MediaKind,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Option<ConsumerParams>, SessionError> {
        let Some(producer_id) = self.producer_id(peer_id, kind) else {
            log::debug!("consume: {peer_id} is not producing {kind}");
            return Ok(None);
        };

        if !self.engine.can_consume(&producer_id, rtp_capabilities) {
            log::debug!("consume: {id} cannot consume {kind} producer {producer_id}");
            return Ok(None);
        }

        let transport = self.transport(id, Lane::Consumer)?;
        let consumer = transport
            .consume(&producer_id, rtp_capabilities, kind.starts_paused())
            .await?;

        let stored = {
            let mut sessions = self.write();
            let producer_alive = sessions
                .get(peer_id)
                .and_then(|peer| peer.producers.get(&kind))
                .is_some_and(|producer| producer.id() == producer_id);

            match sessions.get_mut(id) {
                Some(session) if producer_alive => {
                    session
                        .consumers
                        .entry(peer_id.to_string())
                        .or_default()
                        .insert(kind, consumer.clone());
                    true
                }
                _ => false,
            }
        };

        if !stored {
            log::debug!("consume: {peer_id} or {id} went away while creating the consumer");
            close_quietly(id, "consumer", consumer.id(), consumer.close().await);
            return Ok(None);
        }

        if !kind.starts_paused()
            && let Err(e) = consumer.resume().await
        {
            log::debug!("consume: {id} failed to resume consumer {}: {e}", consumer.id());
        }

        log::debug!(
            "consume: {id} consuming {kind} from {peer_id} (consumer {})",
            consumer.id()
        );

        Ok(Some(ConsumerParams::from(consumer.as_ref())))
    }

    fn peer_consumers(&self, id: &str, peer_id: &str) -> Vec<Arc<dyn Consumer>> {
        self.read()
            .get(id)
            .and_then(|session| session.consumers.get(peer_id))
            .map(|kinds| kinds.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Pauses every consumer `id` holds for `peer_id`. Best-effort: returns
    /// how many consumers were actually paused.
    pub async fn pause(&self, id: &str, peer_id: &str) -> usize {
        let mut paused = 0;
        for consumer in self.peer_consumers(id, peer_id) {
            match consumer.pause().await {
                Ok(()) => paused += 1,
                Err(e) => log::debug!("pause: {id} consumer {}: {e}", consumer.id()),
            }
        }
        paused
    }

    /// Resumes every consumer `id` holds for `peer_id`. Best-effort: returns
    /// how many consumers were actually resumed.
    pub async fn resume(&self, id: &str, peer_id: &str) -> usize {
        let mut resumed = 0;
        for consumer in self.peer_consumers(id, peer_id) {
            match consumer.resume().await {
                Ok(()) => resumed += 1,
                Err(e) => log::debug!("resume: {id} consumer {}: {e}", consumer.id()),
            }
        }
        resumed
    }

    /// Tears down the media session of `id`.
    ///
    /// Every producer, consumer and transport of the session is closed, and
    /// every other session forgets (and closes) the consumers it held for
    /// `id`. Closing something that is already closed is not an error.
    /// Returns `false` if `id` had no session.
    pub async fn close(&self, id: &str) -> bool {
        let (teardown, had_session) = {
            let mut sessions = self.write();
            let mut teardown = Teardown::default();

            let session = sessions.remove(id);
            let had_session = session.is_some();

            if let Some(session) = session {
                teardown.producers.extend(session.producers.into_values());
                teardown.consumers.extend(
                    session
                        .consumers
                        .into_values()
                        .flat_map(BTreeMap::into_values),
                );
                teardown.transports.extend(session.producer.transport);
                teardown.transports.extend(session.consumer.transport);
            }

            for other in sessions.values_mut() {
                if let Some(kinds) = other.consumers.remove(id) {
                    teardown.consumers.extend(kinds.into_values());
                }
            }

            drop(sessions);
            (teardown, had_session)
        };

        teardown.run(id).await;

        if had_session {
            log::debug!("close: closed media session of {id}");
        }

        had_session
    }
}
