//! Wire format of the proximity socket.
//!
//! Client to server messages are comma delimited text. Simple commands carry
//! their arguments inline (`pos,,120,130`); correlated requests are framed as
//! `<command>,<requestId>[,<jsonArgument>]` and answered with
//! `ACK,<requestId>,<result>`, where an empty result signals failure.
//!
//! Server to client events are JSON objects keyed by event name, except for
//! position updates which stay plain text (`<id>,<objectId>,<x>,<y>`).

use std::{collections::BTreeMap, str::FromStr};

use proximity_config::Position;
use proximity_media::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, EnumIter, EnumString, IntoStaticStr};
use thiserror::Error;

pub type ConnId = String;
pub type RequestId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InboundParseError {
    #[error("Empty message")]
    Empty,
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),
    #[error("Missing {argument} for '{command}'")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("Invalid {argument} for '{command}': '{value}'")]
    InvalidArgument {
        command: &'static str,
        argument: &'static str,
        value: String,
    },
}

/// Commands that are answered with an [`Ack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, IntoStaticStr, EnumIter)]
#[strum(serialize_all = "camelCase")]
pub enum RequestCommand {
    GetRouterRtpCapabilities,
    CreateProducerTransport,
    CreateConsumerTransport,
    ConnectProducerTransport,
    ConnectConsumerTransport,
    Produce,
    Consume,
    Pause,
    Resume,
}

impl std::fmt::Display for RequestCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// A correlated request: `<command>,<requestId>[,<argument>]`.
///
/// The argument is everything after the second comma, so it may itself
/// contain commas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: RequestCommand,
    pub request_id: RequestId,
    pub argument: Option<String>,
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.command, self.request_id)?;
        if let Some(argument) = &self.argument {
            write!(f, ",{argument}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "camelCase")]
pub enum InboundMessage {
    Ping,
    Connect {
        name: String,
    },
    Update {
        name: String,
        audio_enabled: bool,
        video_enabled: bool,
        broadcast: bool,
    },
    /// `object_id` is `None` when the avatar itself moved.
    Position {
        object_id: Option<String>,
        x: i32,
        y: i32,
    },
    Add {
        object_id: String,
    },
    Remove {
        object_id: String,
    },
    Drink {
        drink_id: String,
    },
    Request(Request),
}

fn required<'a>(
    command: &'static str,
    argument: &'static str,
    value: Option<&'a str>,
) -> Result<&'a str, InboundParseError> {
    value
        .filter(|value| !value.is_empty())
        .ok_or(InboundParseError::MissingArgument { command, argument })
}

fn parse_arg<T: FromStr>(
    command: &'static str,
    argument: &'static str,
    value: Option<&str>,
) -> Result<T, InboundParseError> {
    let value = required(command, argument, value)?;
    value
        .trim()
        .parse::<T>()
        .map_err(|_| InboundParseError::InvalidArgument {
            command,
            argument,
            value: value.to_string(),
        })
}

impl FromStr for InboundMessage {
    type Err = InboundParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(InboundParseError::Empty);
        }

        let (command, rest) = match s.split_once(',') {
            Some((command, rest)) => (command, Some(rest)),
            None => (s, None),
        };

        Ok(match command {
            "ping" => Self::Ping,
            "connect" => Self::Connect {
                name: rest.unwrap_or_default().to_string(),
            },
            "update" => {
                // The name is the only free-form field, so peel the flags off the end.
                let mut parts = rest.unwrap_or_default().rsplitn(4, ',');
                let broadcast = parts.next();
                let video_enabled = parts.next();
                let audio_enabled = parts.next();
                let name = parts.next().ok_or(InboundParseError::MissingArgument {
                    command: "update",
                    argument: "broadcast",
                })?;

                Self::Update {
                    name: name.to_string(),
                    audio_enabled: audio_enabled == Some("true"),
                    video_enabled: video_enabled == Some("true"),
                    broadcast: broadcast == Some("true"),
                }
            }
            "pos" => {
                let mut parts = rest.unwrap_or_default().rsplitn(3, ',');
                let y = parse_arg("pos", "y", parts.next())?;
                let x = parse_arg("pos", "x", parts.next())?;
                let object_id = parts
                    .next()
                    .ok_or(InboundParseError::MissingArgument {
                        command: "pos",
                        argument: "objectId",
                    })?;

                Self::Position {
                    object_id: Some(object_id)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string),
                    x,
                    y,
                }
            }
            "add" => Self::Add {
                object_id: required("add", "objectId", rest)?.to_string(),
            },
            "remove" => Self::Remove {
                object_id: required("remove", "objectId", rest)?.to_string(),
            },
            "drink" => Self::Drink {
                drink_id: required("drink", "drinkId", rest)?.to_string(),
            },
            other => {
                let command = RequestCommand::from_str(other)
                    .map_err(|_| InboundParseError::UnknownCommand(other.to_string()))?;
                let (request_id, argument) = match rest {
                    Some(rest) => match rest.split_once(',') {
                        Some((id, argument)) => (Some(id), Some(argument)),
                        None => (Some(rest), None),
                    },
                    None => (None, None),
                };

                Self::Request(Request {
                    command,
                    request_id: parse_arg(command.into(), "requestId", request_id)?,
                    argument: argument.filter(|a| !a.is_empty()).map(str::to_string),
                })
            }
        })
    }
}

impl std::fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ping => f.write_str("ping"),
            Self::Connect { name } => write!(f, "connect,{name}"),
            Self::Update {
                name,
                audio_enabled,
                video_enabled,
                broadcast,
            } => write!(
                f,
                "update,{name},{audio_enabled},{video_enabled},{broadcast}"
            ),
            Self::Position { object_id, x, y } => write!(
                f,
                "pos,{},{x},{y}",
                object_id.as_deref().unwrap_or_default()
            ),
            Self::Add { object_id } => write!(f, "add,{object_id}"),
            Self::Remove { object_id } => write!(f, "remove,{object_id}"),
            Self::Drink { drink_id } => write!(f, "drink,{drink_id}"),
            Self::Request(request) => request.fmt(f),
        }
    }
}

/// Correlated reply. A `None` payload is the failure signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub request_id: RequestId,
    pub payload: Option<String>,
}

impl Ack {
    pub const PREFIX: &'static str = "ACK";

    #[must_use]
    pub const fn new(request_id: RequestId, payload: Option<String>) -> Self {
        Self {
            request_id,
            payload,
        }
    }

    /// Parses an `ACK,<id>,<payload>` line. Returns `None` for anything else.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ',');
        if parts.next()? != Self::PREFIX {
            return None;
        }
        let request_id = parts.next()?.parse().ok()?;
        let payload = parts.next().filter(|p| !p.is_empty()).map(str::to_string);

        Some(Self {
            request_id,
            payload,
        })
    }
}

impl std::fmt::Display for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{}",
            Self::PREFIX,
            self.request_id,
            self.payload.as_deref().unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<String>,
    pub dtls_parameters: Value,
}

impl ConnectTransportArgs {
    /// Accepts either `{transportId, dtlsParameters}` or the bare DTLS
    /// parameters.
    ///
    /// # Errors
    ///
    /// * If `argument` is not valid JSON
    pub fn parse(argument: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(argument)?;
        if value.get("dtlsParameters").is_some() {
            return serde_json::from_value(value);
        }
        Ok(Self {
            transport_id: None,
            dtls_parameters: value,
        })
    }

    #[must_use]
    pub fn into_dtls(self) -> DtlsParameters {
        DtlsParameters(self.dtls_parameters)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceArgs {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeArgs {
    pub user_id: ConnId,
    pub producer_kind: MediaKind,
    pub rtp_capabilities: RtpCapabilities,
}

/// `pause`/`resume` name the peer either bare or as a JSON string.
#[must_use]
pub fn parse_peer_id(argument: &str) -> String {
    let argument = argument.trim();
    if argument.starts_with('"')
        && let Ok(id) = serde_json::from_str::<String>(argument)
    {
        return id;
    }
    argument.to_string()
}

/// Sub-entity owned by a connection, e.g. a screen share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneObject {
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub id: ConnId,
    pub name: String,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub pos: Position,
    pub broadcast: bool,
    pub objects: BTreeMap<String, SceneObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drink: Option<String>,
}

/// First message a connection receives after `connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPayload {
    pub id: ConnId,
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub id: ConnId,
    pub name: String,
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeavePayload {
    pub id: ConnId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    pub id: ConnId,
    pub name: String,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub broadcast: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPayload {
    pub id: ConnId,
    pub object_id: String,
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovePayload {
    pub id: ConnId,
    pub object_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrinkPayload {
    pub id: ConnId,
    pub drink_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum OutboundPayload {
    Players(Vec<PlayerSnapshot>),
    Join(JoinPayload),
    Leave(LeavePayload),
    Update(UpdatePayload),
    Add(AddPayload),
    Remove(RemovePayload),
    Drink(DrinkPayload),
}

impl OutboundPayload {
    /// # Errors
    ///
    /// * If the payload fails to serialize
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// `<id>,<objectId>,<x>,<y>`, with an empty object id for the avatar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionEvent {
    pub id: ConnId,
    pub object_id: Option<String>,
    pub pos: Position,
}

impl std::fmt::Display for PositionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.id,
            self.object_id.as_deref().unwrap_or_default(),
            self.pos.x,
            self.pos.y
        )
    }
}

impl FromStr for PositionEvent {
    type Err = InboundParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(4, ',');
        let y = parse_arg("position", "y", parts.next())?;
        let x = parse_arg("position", "x", parts.next())?;
        let object_id = parts.next().ok_or(InboundParseError::MissingArgument {
            command: "position",
            argument: "objectId",
        })?;
        let id = required("position", "id", parts.next())?;

        Ok(Self {
            id: id.to_string(),
            object_id: Some(object_id)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            pos: Position::new(x, y),
        })
    }
}

/// Anything the server pushes to a client outside of an [`Ack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Pong,
    Identity(IdentityPayload),
    Payload(OutboundPayload),
    Position(PositionEvent),
}

impl ServerEvent {
    /// Classifies a non-ACK line sent by the server.
    ///
    /// # Errors
    ///
    /// * If the line is neither JSON nor a position event
    pub fn parse(s: &str) -> Result<Self, InboundParseError> {
        if s == "pong" {
            return Ok(Self::Pong);
        }
        if s.starts_with('{') {
            if let Ok(payload) = serde_json::from_str::<OutboundPayload>(s) {
                return Ok(Self::Payload(payload));
            }
            return serde_json::from_str::<IdentityPayload>(s)
                .map(Self::Identity)
                .map_err(|e| InboundParseError::InvalidArgument {
                    command: "event",
                    argument: "json",
                    value: e.to_string(),
                });
        }
        s.parse().map(Self::Position)
    }
}
