use proximity_media::{Consumer, MediaKind, RtpParameters};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumString};

/// The two independent halves of a connection's media session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Lane {
    /// Outbound: the connection's own microphone, camera and screen.
    Producer,
    /// Inbound: media received from peers.
    Consumer,
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LaneState {
    Uninitialized,
    TransportCreated,
    TransportConnected,
    /// Connected and holding at least one producer or consumer.
    Active,
    Closed,
}

/// What the consuming client needs to build its side of a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub producer_id: String,
    pub id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(rename = "type")]
    pub consumer_type: String,
    pub producer_paused: bool,
}

impl From<&dyn Consumer> for ConsumerParams {
    fn from(consumer: &dyn Consumer) -> Self {
        Self {
            producer_id: consumer.producer_id().to_string(),
            id: consumer.id().to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
            consumer_type: consumer.consumer_type().to_string(),
            producer_paused: consumer.producer_paused(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn consumer_params_serialize_with_client_field_names() {
        let params = ConsumerParams {
            producer_id: "p1".to_string(),
            id: "c1".to_string(),
            kind: MediaKind::ScreenAudio,
            rtp_parameters: RtpParameters(serde_json::json!({ "codecs": [] })),
            consumer_type: "simple".to_string(),
            producer_paused: false,
        };

        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            serde_json::json!({
                "producerId": "p1",
                "id": "c1",
                "kind": "screen-audio",
                "rtpParameters": { "codecs": [] },
                "type": "simple",
                "producerPaused": false,
            })
        );
    }
}
