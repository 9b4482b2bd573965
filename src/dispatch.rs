//! Hub message loop (§4.E): admission handling, `REQUEST`/action dispatch,
//! and fixed routing for the dedicated SIP-lifecycle/call/RSDB envelope
//! types.
//!
//! Generalizes the teacher's `sip/mod.rs::SipClient::connect` task-spawn
//! structure (one task per responsibility, driven off channel receivers)
//! into a single dispatch loop keyed on `MessageType` instead of fixed
//! Tauri command handlers.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::envelope::{Envelope, MessageType};
use crate::error::{Result, SipRelayError};
use crate::hub::Hub;

/// Services one `REQUEST.action`. Registered by name under `Hub::action_handlers`.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, hub: &Hub, client_id: &str, envelope: &Envelope) -> Result<Value>;
}

/// Built-in `echo` action (§8 scenario 2): returns the request payload unchanged.
pub struct EchoHandler;

#[async_trait]
impl ActionHandler for EchoHandler {
    async fn handle(&self, _hub: &Hub, _client_id: &str, envelope: &Envelope) -> Result<Value> {
        Ok(envelope.payload.clone().unwrap_or(Value::Null))
    }
}

/// `sendDtmf` (§4.C): fire-and-forget toward the active call's RSDB session.
pub struct SendDtmfHandler;

#[async_trait]
impl ActionHandler for SendDtmfHandler {
    async fn handle(&self, hub: &Hub, _client_id: &str, envelope: &Envelope) -> Result<Value> {
        let payload = envelope
            .payload
            .clone()
            .ok_or_else(|| SipRelayError::Protocol("sendDtmf requires a payload".into()))?;
        let call_id = payload
            .get("callId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SipRelayError::Protocol("sendDtmf requires callId".into()))?;
        let tones = payload.get("tones").and_then(|v| v.as_str()).unwrap_or("");

        match hub.sip_manager.rsdb().get(call_id) {
            Some(session) => {
                session.send_dtmf(tones, None).await;
                Ok(json!({ "success": true }))
            }
            None => Err(SipRelayError::bad_state("active call", "no such call")),
        }
    }
}

/// Dispatches one inbound envelope from `client_id`. Never propagates a
/// panic-worthy error out of the loop: everything recoverable is logged and
/// dropped, consistent with "exceptions are caught, logged, and converted to
/// a `sendErrorResponse`" (§4.E).
pub async fn dispatch(hub: &Hub, client_id: &str, envelope: Envelope) {
    match envelope.r#type {
        MessageType::ClientConnected => hub.admit(client_id).await,
        MessageType::ClientDisconnected => hub.dismiss(client_id).await,

        MessageType::Request => dispatch_request(hub, client_id, envelope).await,

        MessageType::RequestSipInit => dispatch_sip_init(hub, client_id, envelope).await,
        MessageType::RequestConnect => dispatch_sip_connect(hub, client_id, envelope).await,
        MessageType::RequestRegister => dispatch_sip_register(hub, client_id, envelope).await,
        MessageType::RequestUnregister => dispatch_sip_unregister(hub, client_id, envelope).await,

        MessageType::RequestMakeCall => dispatch_make_call(hub, client_id, envelope).await,
        MessageType::RequestAnswerCall => dispatch_answer_call(hub, client_id, envelope).await,
        MessageType::RequestEndCall => dispatch_end_call(hub, client_id, envelope).await,

        MessageType::SdpResponse => {
            if let Some(payload) = &envelope.payload {
                hub.sip_manager.rsdb().route_sdp_response(payload).await;
            }
        }
        MessageType::IceCandidate => {
            if let Some(payload) = &envelope.payload {
                hub.sip_manager.rsdb().route_ice_candidate(payload).await;
            }
        }
        MessageType::ConnectionStateChange => {
            if let Some(payload) = &envelope.payload {
                hub.sip_manager.rsdb().route_connection_state_change(payload).await;
            }
        }

        MessageType::MediaControl => {
            debug!(client_id, "MEDIA_CONTROL is Edge-local, nothing to route at the Hub");
        }

        other => {
            warn!(client_id, envelope_type = ?other, "envelope type not valid from an Edge, dropping");
        }
    }
}

async fn dispatch_request(hub: &Hub, client_id: &str, envelope: Envelope) {
    let Some(request_id) = envelope.request_id.clone() else {
        warn!(client_id, "REQUEST with no requestId, dropping");
        return;
    };
    let Some(action) = envelope.action.clone() else {
        hub.registry.send_error_response(client_id, &request_id, "Unknown request action: <none>");
        return;
    };

    let Some(handler) = hub.action_handlers.get(&action) else {
        let err = SipRelayError::UnknownAction { action: action.clone() };
        hub.registry.send_error_response(client_id, &request_id, &err.to_string());
        return;
    };

    match handler.handle(hub, client_id, &envelope).await {
        Ok(data) => {
            hub.registry.send_response(client_id, &request_id, Some(data), true);
        }
        Err(e) => {
            hub.registry.send_error_response(client_id, &request_id, &e.to_string());
        }
    }
}

async fn dispatch_sip_init(hub: &Hub, client_id: &str, envelope: Envelope) {
    let Some(request_id) = envelope.request_id.clone() else { return };
    let Some(payload) = envelope.payload.clone() else {
        hub.registry.send_error_response(client_id, &request_id, "initializeSip requires a config payload");
        return;
    };
    let cfg = match serde_json::from_value(payload) {
        Ok(cfg) => cfg,
        Err(e) => {
            hub.registry.send_error_response(client_id, &request_id, &format!("malformed SipConfig: {e}"));
            return;
        }
    };

    match hub.sip_manager.initialize(cfg).await {
        Ok(()) => {
            hub.registry.send_response(client_id, &request_id, None, true);
        }
        Err(e) => {
            hub.registry.send_error_response(client_id, &request_id, &e.to_string());
            hub.registry.send_to_client(
                client_id,
                Envelope::new(MessageType::SipInitResult)
                    .with_client_id(client_id)
                    .with_payload(json!({ "success": false, "state": "failed", "error": e.to_string() })),
            );
        }
    }
}

async fn dispatch_sip_connect(hub: &Hub, client_id: &str, envelope: Envelope) {
    let Some(request_id) = envelope.request_id.clone() else { return };
    let sip_manager = hub.sip_manager.clone();
    match sip_manager.connect().await {
        Ok(success) => hub.registry.send_response(client_id, &request_id, Some(json!({ "success": success })), true),
        Err(e) => hub.registry.send_error_response(client_id, &request_id, &e.to_string()),
    };
}

async fn dispatch_sip_register(hub: &Hub, client_id: &str, envelope: Envelope) {
    let Some(request_id) = envelope.request_id.clone() else { return };
    match hub.sip_manager.register().await {
        Ok(()) => hub.registry.send_response(client_id, &request_id, None, true),
        Err(e) => hub.registry.send_error_response(client_id, &request_id, &e.to_string()),
    };
}

async fn dispatch_sip_unregister(hub: &Hub, client_id: &str, envelope: Envelope) {
    let Some(request_id) = envelope.request_id.clone() else { return };
    match hub.sip_manager.unregister().await {
        Ok(()) => hub.registry.send_response(client_id, &request_id, None, true),
        Err(e) => hub.registry.send_error_response(client_id, &request_id, &e.to_string()),
    };
}

async fn dispatch_make_call(hub: &Hub, client_id: &str, envelope: Envelope) {
    let Some(request_id) = envelope.request_id.clone() else { return };
    let target = envelope
        .payload
        .as_ref()
        .and_then(|p| p.get("target"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let Some(target) = target else {
        hub.registry.send_error_response(client_id, &request_id, "makeCall requires a target");
        return;
    };

    match hub.sip_manager.make_call(client_id, &target).await {
        Ok(call_id) => {
            hub.registry.send_response(client_id, &request_id, Some(json!({ "callId": call_id })), true);
        }
        Err(e) => hub.registry.send_error_response(client_id, &request_id, &e.to_string()),
    }
}

async fn dispatch_answer_call(hub: &Hub, client_id: &str, envelope: Envelope) {
    let Some(request_id) = envelope.request_id.clone() else { return };
    let call_id = envelope.payload.as_ref().and_then(|p| p.get("callId")).and_then(|v| v.as_str()).map(str::to_string);
    let Some(call_id) = call_id else {
        hub.registry.send_error_response(client_id, &request_id, "answerCall requires callId");
        return;
    };

    match hub.sip_manager.answer_call(client_id, &call_id).await {
        Ok(()) => hub.registry.send_response(client_id, &request_id, Some(json!({ "callId": call_id })), true),
        Err(e) => hub.registry.send_error_response(client_id, &request_id, &e.to_string()),
    };
}

async fn dispatch_end_call(hub: &Hub, client_id: &str, envelope: Envelope) {
    let Some(request_id) = envelope.request_id.clone() else { return };
    let call_id = envelope.payload.as_ref().and_then(|p| p.get("callId")).and_then(|v| v.as_str()).map(str::to_string);
    let Some(call_id) = call_id else {
        hub.registry.send_error_response(client_id, &request_id, "hangupCall requires callId");
        return;
    };

    match hub.sip_manager.end_call(&call_id).await {
        Ok(()) => hub.registry.send_response(client_id, &request_id, None, true),
        Err(e) => hub.registry.send_error_response(client_id, &request_id, &e.to_string()),
    };
}
