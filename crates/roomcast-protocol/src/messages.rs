use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    ConsumerId, DtlsParameters, IceCandidate, IceParameters, MediaKind, PeerId, ProducerId,
    ProducerInfo, RtpCapabilities, RtpParameters, TransportDirection, TransportId,
};

/// A request sent from client to server via WebSocket
///
/// The `request_id` is echoed back in the matching [`ServerMessage::Response`],
/// since requests from one peer are answered in completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    pub request_id: u64,
    #[serde(flatten)]
    pub request: Request,
}

/// Signaling requests a peer may issue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    /// Fetch the router's codec capabilities to load the client device
    GetRouterRtpCapabilities,

    /// Create a send or recv transport for this peer
    CreateTransport { direction: TransportDirection },

    /// Complete the DTLS handshake of one of this peer's transports
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },

    /// Start sending a media track over the send transport
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_data: Option<Value>,
    },

    /// Subscribe to a remote producer over the recv transport
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },

    /// List producers of every other peer (late join)
    GetProducers,
}

impl Request {
    /// Wire name of the request, used for logging
    pub fn name(&self) -> &'static str {
        match self {
            Request::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            Request::CreateTransport { .. } => "createTransport",
            Request::ConnectTransport { .. } => "connectTransport",
            Request::Produce { .. } => "produce",
            Request::Consume { .. } => "consume",
            Request::GetProducers => "getProducers",
        }
    }
}

/// Payload of a response to a [`Request`]
///
/// Serialized without a tag; variant order matters when decoding because
/// serde picks the first variant whose fields are all present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    /// Request failed
    Error { error: String },

    #[serde(rename_all = "camelCase")]
    Consumed {
        id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    #[serde(rename_all = "camelCase")]
    TransportCreated {
        id: TransportId,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
    },

    TransportConnected { connected: bool },

    Produced { id: ProducerId },

    Producers(Vec<ProducerInfo>),

    RouterRtpCapabilities(RtpCapabilities),
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Channel opened; tells the client its peer id
    Welcome { peer_id: PeerId },

    /// Answer to the request carrying the same id
    Response { request_id: u64, data: Response },

    /// Another peer started producing
    NewProducer {
        producer_id: ProducerId,
        producer_socket_id: PeerId,
        kind: MediaKind,
    },

    /// Another peer disconnected
    PeerLeft { peer_id: PeerId },

    /// A consumer held by this peer was closed because its producer closed
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },

    /// A frame could not be understood
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_requests_in_client_shape() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "requestId": 7,
            "type": "createTransport",
            "direction": "recv"
        }))
        .unwrap();
        assert_eq!(msg.request_id, 7);
        assert!(matches!(
            msg.request,
            Request::CreateTransport {
                direction: TransportDirection::Recv
            }
        ));

        let msg: ClientMessage = serde_json::from_value(json!({
            "requestId": 8,
            "type": "getProducers"
        }))
        .unwrap();
        assert_eq!(msg.request.name(), "getProducers");
    }

    #[test]
    fn produce_app_data_is_optional() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "requestId": 1,
            "type": "produce",
            "kind": "audio",
            "rtpParameters": { "codecs": [] }
        }))
        .unwrap();
        match msg.request {
            Request::Produce { kind, app_data, .. } => {
                assert_eq!(kind, MediaKind::Audio);
                assert!(app_data.is_none());
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn unknown_request_type_is_rejected() {
        let result = serde_json::from_value::<ClientMessage>(json!({
            "requestId": 1,
            "type": "restartIce"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn error_response_has_plain_error_shape() {
        let msg = ServerMessage::Response {
            request_id: 3,
            data: Response::error("Cannot consume"),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "type": "response", "requestId": 3, "data": { "error": "Cannot consume" } })
        );
    }

    #[test]
    fn responses_decode_to_the_right_variant() {
        let produced: Response = serde_json::from_value(json!({
            "id": ProducerId::new()
        }))
        .unwrap();
        assert!(matches!(produced, Response::Produced { .. }));

        let connected: Response = serde_json::from_value(json!({ "connected": true })).unwrap();
        assert_eq!(connected, Response::TransportConnected { connected: true });

        let empty: Response = serde_json::from_value(json!([])).unwrap();
        assert_eq!(empty, Response::Producers(vec![]));

        let consumed: Response = serde_json::from_value(json!({
            "id": ConsumerId::new(),
            "producerId": ProducerId::new(),
            "kind": "video",
            "rtpParameters": { "codecs": [] }
        }))
        .unwrap();
        assert!(matches!(consumed, Response::Consumed { kind: MediaKind::Video, .. }));
    }

    #[test]
    fn pushes_use_camel_case_fields() {
        let peer_id = PeerId::new();
        let producer_id = ProducerId::new();
        let msg = ServerMessage::NewProducer {
            producer_id,
            producer_socket_id: peer_id,
            kind: MediaKind::Video,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "newProducer",
                "producerId": producer_id.to_string(),
                "producerSocketId": peer_id.to_string(),
                "kind": "video"
            })
        );
    }
}
