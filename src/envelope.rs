//! Canonical wire shape exchanged between an Edge and the Hub (§4.A).
//!
//! `MessageType` is a closed set: an envelope whose `type` field does not match
//! one of these variants fails to deserialize and is dropped at the transport
//! boundary (logged, never surfaced to a requester) rather than accepted as an
//! unknown-but-tolerated variant.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, SipRelayError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // admission
    ClientConnected,
    ClientDisconnected,
    StateUpdate,

    // RPC
    Request,
    Response,
    RequestResult,
    Error,

    // SIP lifecycle
    RequestSipInit,
    SipInitResult,
    RequestConnect,
    SipConnectionUpdate,
    RequestRegister,
    RequestUnregister,
    SipRegistrationUpdate,

    // calls
    RequestMakeCall,
    RequestAnswerCall,
    RequestEndCall,
    IncomingCall,
    CallUpdate,
    CallError,
    CallClaimed,

    // RSDB
    SdpRequest,
    SdpResponse,
    IceCandidate,
    ConnectionStateChange,
    MediaControl,
}

/// Milliseconds since the Unix epoch, matching the source system's integer timestamp.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub r#type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "clientId")]
    pub client_id: Option<String>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "requestId")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl Envelope {
    pub fn new(r#type: MessageType) -> Self {
        Envelope {
            r#type,
            payload: None,
            client_id: None,
            timestamp: now_ms(),
            request_id: None,
            action: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Serialize) -> Self {
        self.payload = serde_json::to_value(payload).ok();
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Deserialize the payload into `T`, surfacing malformed payloads as a
    /// `Protocol` error rather than panicking.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        let value = self
            .payload
            .clone()
            .ok_or_else(|| SipRelayError::Protocol("envelope has no payload".into()))?;
        serde_json::from_value(value)
            .map_err(|e| SipRelayError::Protocol(format!("malformed payload: {e}")))
    }

    /// Parse a raw JSON-encoded envelope. Malformed JSON or an unknown `type`
    /// discriminant both surface as `SipRelayError::Protocol`; callers at the
    /// transport boundary log and drop rather than propagate.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| SipRelayError::Protocol(format!("malformed envelope: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| SipRelayError::Protocol(format!("failed to encode envelope: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_json() {
        let env = Envelope::new(MessageType::Request)
            .with_client_id("c1")
            .with_request_id("r1")
            .with_action("echo")
            .with_payload(serde_json::json!({"message": "hi"}));

        let json = env.to_json().unwrap();
        let parsed = Envelope::from_json(&json).unwrap();

        assert_eq!(parsed.r#type, MessageType::Request);
        assert_eq!(parsed.client_id.as_deref(), Some("c1"));
        assert_eq!(parsed.request_id.as_deref(), Some("r1"));
        assert_eq!(parsed.action.as_deref(), Some("echo"));
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"type":"NOT_A_REAL_TYPE","timestamp":1}"#;
        assert!(Envelope::from_json(raw).is_err());
    }

    #[test]
    fn malformed_json_is_protocol_error() {
        let err = Envelope::from_json("{not json").unwrap_err();
        assert!(matches!(err, SipRelayError::Protocol(_)));
    }

    #[test]
    fn missing_payload_is_protocol_error() {
        let env = Envelope::new(MessageType::StateUpdate);
        let err = env.payload_as::<serde_json::Value>().unwrap_err();
        assert!(matches!(err, SipRelayError::Protocol(_)));
    }

    #[test]
    fn type_field_uses_screaming_snake_case() {
        let env = Envelope::new(MessageType::SipConnectionUpdate);
        let json = env.to_json().unwrap();
        assert!(json.contains("\"SIP_CONNECTION_UPDATE\""));
    }
}
