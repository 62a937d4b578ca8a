//! SFU Signaling Protocol
//!
//! JSON frames tagged by `action`. Client requests carry their payload
//! inline (`{action, ...payload}`); server replies carry it under `data`,
//! except `error` which carries `message` and an optional `kind`.

use super::SessionError;
use crate::engine::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role requested for a new WebRTC transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportRole {
    Producer,
    Consumer,
}

/// Messages sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Ask the router for its RTP capabilities
    #[serde(rename_all = "camelCase")]
    GetRouterRtpCapabilities { regime_id: String },

    /// Ask for a transport of the given role
    CreateWebRtcTransport { role: TransportRole },

    /// Hand the send transport's DTLS parameters to the server
    #[serde(rename_all = "camelCase")]
    ConnectProducerTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },

    /// Hand the receive transport's DTLS parameters to the server
    #[serde(rename_all = "camelCase")]
    ConnectConsumerTransport { dtls_parameters: DtlsParameters },

    /// Produce one track; `producer_id` is the stream identifier
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        producer_id: String,
    },

    /// Consume the stream's track of one kind
    #[serde(rename_all = "camelCase")]
    Consume {
        rtp_capabilities: RtpCapabilities,
        producer_id: String,
        kind: MediaKind,
    },
}

impl ClientMessage {
    /// Action name as it appears on the wire
    pub fn action(&self) -> &'static str {
        match self {
            ClientMessage::GetRouterRtpCapabilities { .. } => "getRouterRtpCapabilities",
            ClientMessage::CreateWebRtcTransport { .. } => "createWebRtcTransport",
            ClientMessage::ConnectProducerTransport { .. } => "connectProducerTransport",
            ClientMessage::ConnectConsumerTransport { .. } => "connectConsumerTransport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::Consume { .. } => "consume",
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string(self)
            .map_err(|e| SessionError::Protocol(format!("Failed to serialize message: {}", e)))
    }
}

/// `produceResult` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProduceResult {
    pub id: String,
}

/// `consumeResult` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResult {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regime_id: Option<String>,
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ServerMessage {
    RouterRtpCapabilities { data: RtpCapabilities },

    CreateWebRtcTransportResult { data: TransportOptions },

    /// Informational ack for the send transport connect
    ProducerTransportConnected {
        #[serde(default)]
        data: Option<Value>,
    },

    /// Ack completing the receive transport connect
    ConsumerTransportConnected {
        #[serde(default)]
        data: Option<Value>,
    },

    ProduceResult { data: ProduceResult },

    ConsumeResult { data: ConsumeResult },

    Error {
        message: String,
        #[serde(default)]
        kind: Option<MediaKind>,
    },

    /// Any action this client does not handle
    #[serde(other)]
    Unknown,
}

/// Whether a server error message means "nothing is being produced yet"
pub fn is_no_producer_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("no producer")
        || (message.contains("producer") && message.contains("not found"))
}

/// Parser for signaling text frames
pub struct SignalingParser;

impl SignalingParser {
    /// Parse a text frame into a server message.
    ///
    /// Returns the raw action name alongside so unknown actions can be logged.
    pub fn parse(text: &str) -> Result<(String, ServerMessage), SessionError> {
        let value: Value = serde_json::from_str(text.trim())
            .map_err(|e| SessionError::Protocol(format!("Invalid signaling frame: {}", e)))?;

        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Protocol("Signaling frame without action".to_string()))?
            .to_string();

        let message = serde_json::from_value(value).map_err(|e| {
            SessionError::Protocol(format!("Malformed '{}' message: {}", action, e))
        })?;

        Ok((action, message))
    }

    /// Format a client message for WebSocket transmission
    pub fn format(message: &ClientMessage) -> Result<String, SessionError> {
        message.to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_produce_is_flattened_with_action() {
        let msg = ClientMessage::Produce {
            transport_id: "t1".to_string(),
            kind: MediaKind::Video,
            rtp_parameters: json!({ "mid": "0" }),
            producer_id: "stream-42".to_string(),
        };
        let value: Value = serde_json::from_str(&SignalingParser::format(&msg).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "action": "produce",
                "transportId": "t1",
                "kind": "video",
                "rtpParameters": { "mid": "0" },
                "producerId": "stream-42",
            })
        );
        assert_eq!(msg.action(), "produce");
    }

    #[test]
    fn test_capabilities_request_carries_regime_id() {
        let msg = ClientMessage::GetRouterRtpCapabilities { regime_id: "r1".to_string() };
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""action":"getRouterRtpCapabilities""#));
        assert!(json.contains(r#""regimeId":"r1""#));
    }

    #[test]
    fn test_parse_consume_result() {
        let text = r#"{"action":"consumeResult","data":{"id":"c1","producerId":"p1","kind":"audio","rtpParameters":{},"regimeId":"stream-42"}}"#;
        let (action, msg) = SignalingParser::parse(text).unwrap();
        assert_eq!(action, "consumeResult");
        match msg {
            ServerMessage::ConsumeResult { data } => {
                assert_eq!(data.id, "c1");
                assert_eq!(data.kind, MediaKind::Audio);
                assert_eq!(data.regime_id.as_deref(), Some("stream-42"));
            }
            other => panic!("Expected ConsumeResult, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_transport_result() {
        let text = r#"{"action":"createWebRtcTransportResult","data":{"id":"t9","iceParameters":{},"iceCandidates":[{}],"dtlsParameters":{}}}"#;
        let (_, msg) = SignalingParser::parse(text).unwrap();
        match msg {
            ServerMessage::CreateWebRtcTransportResult { data } => {
                assert_eq!(data.id, "t9");
                assert_eq!(data.ice_candidates.len(), 1);
            }
            other => panic!("Expected transport result, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ack_without_data() {
        let (_, msg) = SignalingParser::parse(r#"{"action":"producerTransportConnected"}"#).unwrap();
        assert_eq!(msg, ServerMessage::ProducerTransportConnected { data: None });
    }

    #[test]
    fn test_unknown_action_is_tolerated() {
        let (action, msg) = SignalingParser::parse(r#"{"action":"chatMessage","data":"hi"}"#).unwrap();
        assert_eq!(action, "chatMessage");
        assert_eq!(msg, ServerMessage::Unknown);
    }

    #[test]
    fn test_no_producer_error_detection() {
        let (_, msg) = SignalingParser::parse(
            r#"{"action":"error","message":"No producer found for kind video","kind":"video"}"#,
        )
        .unwrap();
        let ServerMessage::Error { message, kind } = msg else {
            panic!("expected an error frame");
        };
        assert_eq!(kind, Some(MediaKind::Video));
        assert!(is_no_producer_message(&message));
        assert!(is_no_producer_message("producer not found"));
        assert!(!is_no_producer_message("transport closed"));
    }

    #[test]
    fn test_frame_without_action_is_rejected() {
        assert!(SignalingParser::parse(r#"{"data":{}}"#).is_err());
        assert!(SignalingParser::parse("not json").is_err());
    }
}
