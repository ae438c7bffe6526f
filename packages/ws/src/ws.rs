//! Message dispatch and connection lifecycle.
//!
//! Everything here runs on a connection's own serial queue, so handlers for
//! one connection never interleave. State shared between connections lives in
//! [`ProximityState`].

use std::{str::FromStr as _, sync::Arc};

use proximity_config::{Position, RoomConfig, RoomRegistry};
use proximity_media::{MediaEngine, TransportOptions};
use proximity_session::{Lane, SessionCoordinator, SessionError};
use thiserror::Error;

use crate::{
    broadcaster::PresenceBroadcaster,
    models::{
        Ack, ConnId, ConnectTransportArgs, ConsumeArgs, InboundMessage, InboundParseError,
        ProduceArgs, Request, RequestCommand, SceneObject, parse_peer_id,
    },
    registry::{Connection, ConnectionRegistry},
    topics::{WebsocketSendError, WebsocketSender},
};

/// Payload acknowledging a request that has no result of its own.
pub const EMPTY_RESULT: &str = "{}";

/// Context for a websocket connection.
#[derive(Debug, Clone)]
pub struct WebsocketContext {
    pub connection_id: ConnId,
    /// The room picked when the socket was opened.
    pub room: Arc<RoomConfig>,
}

/// Server-wide state shared by every connection.
#[derive(Debug)]
pub struct ProximityState {
    pub rooms: RoomRegistry,
    pub registry: ConnectionRegistry,
    pub sessions: SessionCoordinator,
    pub broadcaster: PresenceBroadcaster,
}

impl ProximityState {
    #[must_use]
    pub fn new(rooms: RoomRegistry, engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            rooms,
            registry: ConnectionRegistry::new(),
            sessions: SessionCoordinator::new(engine),
            broadcaster: PresenceBroadcaster::new(),
        }
    }
}

/// Registers a freshly opened socket. It stays invisible to its room until
/// it sends `connect`.
pub fn connect(state: &ProximityState, context: &WebsocketContext) -> Connection {
    log::debug!(
        "Connected {} to '{}'",
        context.connection_id,
        context.room.id
    );
    state
        .registry
        .register(&context.connection_id, context.room.clone())
}

#[derive(Debug, Error)]
pub enum WebsocketDisconnectError {
    #[error(transparent)]
    WebsocketSend(#[from] WebsocketSendError),
}

/// Tears down everything the connection owned.
///
/// Media goes first so peers' consumers of this connection are closed before
/// the room hears it left. Disconnecting twice is harmless.
///
/// # Errors
///
/// * If the leave event fails to publish
pub async fn disconnect(
    state: &ProximityState,
    sender: &dyn WebsocketSender,
    context: &WebsocketContext,
) -> Result<(), WebsocketDisconnectError> {
    let id = &context.connection_id;

    let had_session = state.sessions.close(id).await;
    let connection = state.broadcaster.leave(&state.registry, sender, id).await?;

    log::debug!(
        "Disconnected {id} (media session: {had_session}, registered: {})",
        connection.is_some()
    );

    Ok(())
}

#[derive(Debug, Error)]
pub enum WebsocketMessageError {
    #[error(transparent)]
    InvalidMessage(#[from] InboundParseError),
    #[error("Invalid payload: '{0}' ({1})")]
    InvalidPayload(String, String),
    #[error("Missing argument for '{0}'")]
    MissingArgument(RequestCommand),
    #[error("Connection {0} has not joined its room")]
    NotJoined(ConnId),
    #[error("Unknown object '{0}'")]
    UnknownObject(String),
    #[error("Room '{0}' has no drinks")]
    DrinkUnavailable(String),
    #[error("Connection {0} is out of range of the drink")]
    OutOfRange(ConnId),
    #[error(transparent)]
    WebsocketSend(#[from] WebsocketSendError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Parses and handles one text frame from `context`'s socket.
///
/// # Errors
///
/// * If the message can't be parsed
/// * If a simple command fails; requests never fail here, they ACK empty
pub async fn process_message(
    state: &ProximityState,
    sender: &dyn WebsocketSender,
    context: &WebsocketContext,
    message: &str,
) -> Result<(), WebsocketMessageError> {
    let message = InboundMessage::from_str(message)?;

    message_received(state, sender, context, message).await
}

/// Routes a parsed message to its handler.
///
/// # Errors
///
/// * If the message fails to process
pub async fn message_received(
    state: &ProximityState,
    sender: &dyn WebsocketSender,
    context: &WebsocketContext,
    message: InboundMessage,
) -> Result<(), WebsocketMessageError> {
    let id = &context.connection_id;
    let message_type = message.as_ref().to_string();

    match &message {
        InboundMessage::Ping | InboundMessage::Position { .. } => {
            log::trace!("Received {message:?} from {id}");
        }
        _ => {
            proximity_logging::debug_or_trace!(
                ("Received message type {message_type} from {id}"),
                ("Received message type {message_type} from {id}: {message:?}")
            );
        }
    }

    let _room = match &message {
        InboundMessage::Update { .. }
        | InboundMessage::Position { .. }
        | InboundMessage::Add { .. }
        | InboundMessage::Remove { .. }
        | InboundMessage::Drink { .. } => {
            Some(state.broadcaster.share_room(&context.room.id).await)
        }
        InboundMessage::Ping | InboundMessage::Connect { .. } | InboundMessage::Request(_) => None,
    };

    match message {
        InboundMessage::Ping => sender.send(id, "pong").await?,
        InboundMessage::Connect { name } => {
            if state
                .broadcaster
                .join(&state.registry, sender, id, name)
                .await?
                .is_none()
            {
                log::debug!("Ignoring connect from {id}: already joined");
            }
        }
        InboundMessage::Update {
            name,
            audio_enabled,
            video_enabled,
            broadcast,
        } => {
            state
                .registry
                .update_presence(id, |presence| {
                    presence.name = name;
                    presence.audio_enabled = audio_enabled;
                    presence.video_enabled = video_enabled;
                    presence.broadcast = broadcast;
                })
                .ok_or_else(|| WebsocketMessageError::NotJoined(id.clone()))?;
            let connection = state
                .registry
                .get(id)
                .ok_or_else(|| WebsocketMessageError::NotJoined(id.clone()))?;
            state.broadcaster.announce_update(sender, &connection).await?;
        }
        InboundMessage::Position { object_id, x, y } => {
            let pos = Position::new(x, y);
            let moved = state
                .registry
                .update_presence(id, |presence| match &object_id {
                    None => {
                        presence.pos = pos;
                        true
                    }
                    Some(object_id) => presence
                        .objects
                        .get_mut(object_id)
                        .map(|object| object.pos = pos)
                        .is_some(),
                })
                .ok_or_else(|| WebsocketMessageError::NotJoined(id.clone()))?;
            if !moved {
                return Err(WebsocketMessageError::UnknownObject(
                    object_id.unwrap_or_default(),
                ));
            }
            state
                .broadcaster
                .announce_position(sender, &context.room.id, id, object_id, pos)
                .await?;
        }
        InboundMessage::Add { object_id } => {
            let pos = state
                .registry
                .update_presence(id, |presence| {
                    let pos = presence.pos;
                    presence
                        .objects
                        .insert(object_id.clone(), SceneObject { pos });
                    pos
                })
                .ok_or_else(|| WebsocketMessageError::NotJoined(id.clone()))?;
            state
                .broadcaster
                .announce_add(sender, &context.room.id, id, object_id, pos)
                .await?;
        }
        InboundMessage::Remove { object_id } => {
            state
                .registry
                .update_presence(id, |presence| presence.objects.remove(&object_id))
                .ok_or_else(|| WebsocketMessageError::NotJoined(id.clone()))?
                .ok_or_else(|| WebsocketMessageError::UnknownObject(object_id.clone()))?;
            state
                .broadcaster
                .announce_remove(sender, &context.room.id, id, object_id)
                .await?;
        }
        InboundMessage::Drink { drink_id } => {
            let Some(drink) = context.room.drink else {
                return Err(WebsocketMessageError::DrinkUnavailable(
                    context.room.id.clone(),
                ));
            };
            let in_range = state
                .registry
                .update_presence(id, |presence| {
                    let in_range = drink.contains(&presence.pos);
                    if in_range {
                        presence.drink = Some(drink_id.clone());
                    }
                    in_range
                })
                .ok_or_else(|| WebsocketMessageError::NotJoined(id.clone()))?;
            if !in_range {
                return Err(WebsocketMessageError::OutOfRange(id.clone()));
            }
            state
                .broadcaster
                .announce_drink(sender, &context.room.id, id, drink_id)
                .await?;
        }
        InboundMessage::Request(request) => {
            let ack = handle_request(state, context, &request).await;
            sender.send(id, &ack.to_string()).await?;
        }
    }

    log::trace!("Successfully processed message type {message_type} from {id}");

    Ok(())
}

/// Always produces an [`Ack`]; failures are logged and answered with an
/// empty payload.
pub async fn handle_request(
    state: &ProximityState,
    context: &WebsocketContext,
    request: &Request,
) -> Ack {
    let id = &context.connection_id;

    let payload = match request_result(state, id, request).await {
        Ok(payload) => payload,
        Err(e) => {
            log::warn!(
                "Request {} '{}' from {id} failed: {e}",
                request.request_id,
                request.command
            );
            None
        }
    };

    if payload.is_none() {
        log::debug!(
            "Request {} '{}' from {id} has no result",
            request.request_id,
            request.command
        );
    }

    Ack::new(request.request_id, payload)
}

fn argument(request: &Request) -> Result<&str, WebsocketMessageError> {
    request
        .argument
        .as_deref()
        .filter(|argument| !argument.trim().is_empty())
        .ok_or(WebsocketMessageError::MissingArgument(request.command))
}

fn parse_argument<T: serde::de::DeserializeOwned>(
    request: &Request,
) -> Result<T, WebsocketMessageError> {
    let argument = argument(request)?;
    serde_json::from_str(argument)
        .map_err(|e| WebsocketMessageError::InvalidPayload(argument.to_string(), e.to_string()))
}

async fn request_result(
    state: &ProximityState,
    id: &str,
    request: &Request,
) -> Result<Option<String>, WebsocketMessageError> {
    let sessions = &state.sessions;

    Ok(match request.command {
        RequestCommand::GetRouterRtpCapabilities => {
            Some(serde_json::to_string(&sessions.get_router_capabilities(id))?)
        }
        RequestCommand::CreateProducerTransport | RequestCommand::CreateConsumerTransport => {
            let lane = if request.command == RequestCommand::CreateProducerTransport {
                Lane::Producer
            } else {
                Lane::Consumer
            };
            let options = match request.argument.as_deref().map(str::trim) {
                None | Some("") => TransportOptions::default(),
                Some(_) => parse_argument(request)?,
            };
            let params = sessions.create_transport(id, lane, &options).await?;
            Some(serde_json::to_string(&params)?)
        }
        RequestCommand::ConnectProducerTransport | RequestCommand::ConnectConsumerTransport => {
            let lane = if request.command == RequestCommand::ConnectProducerTransport {
                Lane::Producer
            } else {
                Lane::Consumer
            };
            let argument = argument(request)?;
            let args = ConnectTransportArgs::parse(argument).map_err(|e| {
                WebsocketMessageError::InvalidPayload(argument.to_string(), e.to_string())
            })?;
            sessions
                .connect_transport(id, lane, args.into_dtls())
                .await?;
            Some(EMPTY_RESULT.to_string())
        }
        RequestCommand::Produce => {
            let args: ProduceArgs = parse_argument(request)?;
            Some(sessions.produce(id, args.kind, args.rtp_parameters).await?)
        }
        RequestCommand::Consume => {
            let args: ConsumeArgs = parse_argument(request)?;
            sessions
                .consume(id, &args.user_id, args.producer_kind, &args.rtp_capabilities)
                .await
                .map(|params| serde_json::to_string(&params))
                .transpose()?
        }
        RequestCommand::Pause => {
            let peer_id = parse_peer_id(argument(request)?);
            let paused = sessions.pause(id, &peer_id).await;
            log::debug!("{id} paused {paused} consumer(s) of {peer_id}");
            Some(EMPTY_RESULT.to_string())
        }
        RequestCommand::Resume => {
            let peer_id = parse_peer_id(argument(request)?);
            let resumed = sessions.resume(id, &peer_id).await;
            log::debug!("{id} resumed {resumed} consumer(s) of {peer_id}");
            Some(EMPTY_RESULT.to_string())
        }
    })
}
