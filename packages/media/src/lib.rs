#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Interface to the media engine (the SFU that owns routers, transports,
//! producers and consumers).
//!
//! The coordination layer only ever talks to the engine through the
//! [`MediaEngine`], [`Transport`], [`Producer`] and [`Consumer`] traits. RTP,
//! ICE and DTLS payloads are carried around as opaque JSON.
//!
//! With the `simulator` feature (on by default) the crate also provides an
//! in-memory engine, see [`simulator::SimulatedMediaEngine`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, EnumString};
use thiserror::Error;

#[cfg(feature = "simulator")]
pub mod simulator;

/// Kind of a produced track.
///
/// Screen sharing produces on the same transport as the camera and
/// microphone, under its own kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, EnumString, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum MediaKind {
    Audio,
    Video,
    ScreenAudio,
    ScreenVideo,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// What the engine itself sees: every track is either audio or video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EngineKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn engine_kind(self) -> EngineKind {
        match self {
            Self::Audio | Self::ScreenAudio => EngineKind::Audio,
            Self::Video | Self::ScreenVideo => EngineKind::Video,
        }
    }

    /// Video consumers start paused until the receiving client asks for them.
    #[must_use]
    pub const fn starts_paused(self) -> bool {
        matches!(self.engine_kind(), EngineKind::Video)
    }
}

/// Router or client RTP capabilities.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpCapabilities(pub Value);

impl RtpCapabilities {
    /// Whether the capability set lists at least one codec of `kind`.
    #[must_use]
    pub fn supports(&self, kind: EngineKind) -> bool {
        self.0
            .get("codecs")
            .and_then(Value::as_array)
            .is_some_and(|codecs| {
                codecs
                    .iter()
                    .any(|codec| codec.get("kind").and_then(Value::as_str) == Some(kind.as_ref()))
            })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub Value);

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub Value);

/// Options sent by the client when it asks for a transport.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportOptions {
    pub force_tcp: bool,
    pub rtp_capabilities: Option<RtpCapabilities>,
}

/// What a client needs to build its side of a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{0} is already closed")]
    AlreadyClosed(String),
    #[error("Transport {0} is already connected")]
    AlreadyConnected(String),
    #[error("Producer {0} not found")]
    ProducerNotFound(String),
    #[error("Cannot consume producer {0} with the given RTP capabilities")]
    CannotConsume(String),
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("Media engine failure: {0}")]
    Engine(String),
}

impl MediaError {
    /// Failures that are expected when several teardown paths race.
    #[must_use]
    pub const fn is_already_closed(&self) -> bool {
        matches!(self, Self::AlreadyClosed(_))
    }
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// # Errors
    ///
    /// * If the engine fails to allocate the transport
    async fn create_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<(Arc<dyn Transport>, TransportParams), MediaError>;

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool;

    /// Resolves when the engine can no longer serve any session.
    async fn died(&self);
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> &str;

    /// # Errors
    ///
    /// * If the transport is closed or already connected
    /// * If the DTLS handshake fails
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), MediaError>;

    /// # Errors
    ///
    /// * If the transport is closed
    /// * If the engine rejects the RTP parameters
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, MediaError>;

    /// # Errors
    ///
    /// * If the transport is closed
    /// * If the producer is gone or cannot be consumed with `rtp_capabilities`
    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>, MediaError>;

    /// Closes the transport along with every producer and consumer on it.
    ///
    /// # Errors
    ///
    /// * If the transport is already closed
    async fn close(&self) -> Result<(), MediaError>;
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;

    /// # Errors
    ///
    /// * If the producer is already closed
    async fn close(&self) -> Result<(), MediaError>;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn producer_id(&self) -> &str;
    fn rtp_parameters(&self) -> &RtpParameters;
    /// `simple`, `simulcast` or `svc`.
    fn consumer_type(&self) -> &str;
    fn producer_paused(&self) -> bool;
    fn paused(&self) -> bool;

    /// # Errors
    ///
    /// * If the consumer is closed
    async fn pause(&self) -> Result<(), MediaError>;

    /// # Errors
    ///
    /// * If the consumer is closed
    async fn resume(&self) -> Result<(), MediaError>;

    /// # Errors
    ///
    /// * If the consumer is already closed
    async fn close(&self) -> Result<(), MediaError>;
}

macro_rules! impl_debug {
    ($($name:ident),+ $(,)?) => {
        $(
            impl std::fmt::Debug for dyn $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{{{}}}", stringify!($name))
                }
            }
        )+
    };
}

impl_debug!(MediaEngine, Transport, Producer, Consumer);

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use std::str::FromStr as _;

    use super::*;

    #[test]
    fn media_kind_uses_kebab_case_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&MediaKind::ScreenVideo).unwrap(),
            "\"screen-video\""
        );
        assert_eq!(MediaKind::from_str("screen-audio").unwrap(), MediaKind::ScreenAudio);
        assert!(MediaKind::from_str("data").is_err());
    }

    #[test]
    fn screen_kinds_map_to_their_engine_kind() {
        assert_eq!(MediaKind::ScreenAudio.engine_kind(), EngineKind::Audio);
        assert_eq!(MediaKind::ScreenVideo.engine_kind(), EngineKind::Video);
        assert!(MediaKind::ScreenVideo.starts_paused());
        assert!(!MediaKind::Audio.starts_paused());
    }

    #[test]
    fn rtp_capabilities_support_checks_codec_kinds() {
        let caps = RtpCapabilities(serde_json::json!({
            "codecs": [{"kind": "audio", "mimeType": "audio/opus"}],
        }));

        assert!(caps.supports(EngineKind::Audio));
        assert!(!caps.supports(EngineKind::Video));
        assert!(!RtpCapabilities::default().supports(EngineKind::Audio));
    }

    #[test]
    fn transport_options_default_when_fields_are_missing() {
        let options: TransportOptions = serde_json::from_str(r#"{"forceTcp":true}"#).unwrap();

        assert!(options.force_tcp);
        assert_eq!(options.rtp_capabilities, None);
    }
}
