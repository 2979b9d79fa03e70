use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error returned when parsing an identifier from a string
#[derive(Debug, Error)]
#[error("Invalid identifier: {0}")]
pub struct InvalidId(#[from] uuid::Error);

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = InvalidId;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Identifier of a connected peer (one per signaling channel)
    PeerId
);
uuid_id!(
    /// Identifier of a transport, assigned by the media engine
    TransportId
);
uuid_id!(
    /// Identifier of a media producer
    ProducerId
);
uuid_id!(
    /// Identifier of a media consumer
    ConsumerId
);

/// Kind of media carried by a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// MIME type prefix for codecs of this kind ("audio" or "video")
    pub fn mime_prefix(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime_prefix())
    }
}

/// Direction of a transport as seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => f.write_str("send"),
            TransportDirection::Recv => f.write_str("recv"),
        }
    }
}

/// ICE parameters of a server-side transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

/// A local ICE candidate offered by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    #[serde(alias = "address")]
    pub ip: String,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters exchanged when connecting a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<DtlsRole>,
    #[serde(default)]
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub feedback_type: String,
    #[serde(default)]
    pub parameter: String,
}

/// A codec the router (or a client device) is able to handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// Codec capabilities of the router, sent to clients to load their device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

/// A negotiated codec inside RTP parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecParameters {
    /// Whether this entry describes a retransmission (RTX) codec rather than media
    pub fn is_rtx(&self) -> bool {
        self.mime_type
            .rsplit('/')
            .next()
            .is_some_and(|subtype| subtype.eq_ignore_ascii_case("rtx"))
    }
}

/// RTP send/receive parameters of a producer or consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
    #[serde(default)]
    pub encodings: Vec<Value>,
    #[serde(default)]
    pub rtcp: Map<String, Value>,
}

/// Entry of the producer catalog and payload of `newProducer` pushes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub producer_socket_id: PeerId,
    pub kind: MediaKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ProducerId::new();
        let value = serde_json::to_value(id).unwrap();
        assert_eq!(value, json!(id.to_string()));
        assert_eq!(id.to_string().parse::<ProducerId>().unwrap(), id);
        assert!("not-a-uuid".parse::<PeerId>().is_err());
    }

    #[test]
    fn rtp_parameters_keep_unknown_codec_parameters() {
        let params: RtpParameters = serde_json::from_value(json!({
            "mid": "0",
            "codecs": [{
                "mimeType": "video/VP8",
                "payloadType": 101,
                "clockRate": 90000,
                "parameters": { "x-google-start-bitrate": 1000 },
                "rtcpFeedback": [{ "type": "nack" }, { "type": "nack", "parameter": "pli" }]
            }],
            "encodings": [{ "ssrc": 1111 }]
        }))
        .unwrap();

        assert_eq!(params.codecs[0].parameters["x-google-start-bitrate"], json!(1000));
        assert_eq!(params.codecs[0].rtcp_feedback[1].parameter, "pli");
        assert_eq!(params.encodings, vec![json!({ "ssrc": 1111 })]);
    }

    #[test]
    fn ice_candidates_accept_address_field() {
        let candidate: IceCandidate = serde_json::from_value(json!({
            "foundation": "udpcandidate",
            "priority": 1076302079,
            "address": "198.51.100.4",
            "protocol": "udp",
            "port": 10000,
            "type": "host"
        }))
        .unwrap();

        assert_eq!(candidate.ip, "198.51.100.4");
        assert_eq!(candidate.protocol, Protocol::Udp);
        assert!(candidate.tcp_type.is_none());
    }

    #[test]
    fn rtx_codecs_are_detected() {
        let codec = |mime: &str| RtpCodecParameters {
            mime_type: mime.to_string(),
            payload_type: 96,
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
            rtcp_feedback: vec![],
        };
        assert!(codec("video/rtx").is_rtx());
        assert!(codec("video/RTX").is_rtx());
        assert!(!codec("video/VP8").is_rtx());
    }
}
