//! Media engine settings.
//!
//! The defaults are the values the router has always been run with: one
//! worker per CPU, opus + VP8, and a single listen IP announced as loopback.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaConfig {
    /// Worker processes a production engine binding spawns. The simulated
    /// engine only logs it.
    pub num_workers: usize,
    pub worker: WorkerConfig,
    pub router: RouterConfig,
    pub web_rtc_transport: WebRtcTransportConfig,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism().map_or(1, std::num::NonZero::get),
            worker: WorkerConfig::default(),
            router: RouterConfig::default(),
            web_rtc_transport: WebRtcTransportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Worker logging, passed through to a production engine binding.
    pub log_level: String,
    pub log_tags: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            rtc_min_port: 10000,
            rtc_max_port: 11000,
            log_level: "debug".to_string(),
            log_tags: ["info", "ice", "dtls", "rtp", "srtp", "rtcp"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCodec {
    pub kind: String,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    pub media_codecs: Vec<MediaCodec>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: vec![
                MediaCodec {
                    kind: "audio".to_string(),
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: Some(2),
                    parameters: None,
                },
                MediaCodec {
                    kind: "video".to_string(),
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    channels: None,
                    parameters: Some(serde_json::json!({ "x-google-start-bitrate": 1000 })),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenIp {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announced_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebRtcTransportConfig {
    pub listen_ips: Vec<ListenIp>,
    /// Bitrate limits applied by a production engine binding. The simulated
    /// engine moves no packets and only logs them.
    pub max_incoming_bitrate: Option<u32>,
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenIp {
                ip: "0.0.0.0".to_string(),
                announced_ip: Some("127.0.0.1".to_string()),
            }],
            max_incoming_bitrate: Some(1_500_000),
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }
}
