//! Edge-side client (§4.C): the tab-resident half of the Hub/Edge split.
//! Owns the Channel's send side, a background pump that turns inbound
//! envelopes into resolved requests or broadcast events, and the
//! [`crate::peer_worker::PeerWorker`] instances that service `SDP_REQUEST`.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::Channel;
use crate::config::SipConfig;
use crate::envelope::{Envelope, MessageType};
use crate::error::{Result, SipRelayError};
use crate::peer_worker::PeerWorker;

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone)]
pub struct EdgeClientConfig {
    pub request_timeout: Duration,
    pub init_timeout: Duration,
    pub sip_init_timeout: Duration,
    pub sip_connect_timeout: Duration,
    pub sip_register_timeout: Duration,
}

impl Default for EdgeClientConfig {
    fn default() -> Self {
        EdgeClientConfig {
            request_timeout: default_request_timeout(),
            init_timeout: default_request_timeout(),
            sip_init_timeout: Duration::from_secs(30),
            sip_connect_timeout: Duration::from_secs(20),
            sip_register_timeout: Duration::from_secs(20),
        }
    }
}

/// Catch-all fan-out for everything `on`/`off` subscribers in the source
/// system would register a closure for.
#[derive(Debug, Clone)]
pub enum EdgeEvent {
    StateUpdate(Value),
    SipInitResult(Value),
    SipConnectionUpdate(Value),
    SipRegistrationUpdate(Value),
    Message(Envelope),
}

pub struct EdgeClient {
    client_id: String,
    to_hub: Arc<dyn Channel>,
    config: EdgeClientConfig,
    pending: DashMap<String, oneshot::Sender<Result<Value>>>,
    events: broadcast::Sender<EdgeEvent>,
    sessions: DashMap<String, Arc<PeerWorker>>,
    closed: AtomicBool,
}

impl EdgeClient {
    pub fn new(
        client_id: impl Into<String>,
        to_hub: Arc<dyn Channel>,
        from_hub: mpsc::UnboundedReceiver<Envelope>,
        config: EdgeClientConfig,
    ) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(256);
        let this = Arc::new(EdgeClient {
            client_id: client_id.into(),
            to_hub,
            config,
            pending: DashMap::new(),
            events,
            sessions: DashMap::new(),
            closed: AtomicBool::new(false),
        });
        this.clone().spawn_pump(from_hub);
        this
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EdgeEvent> {
        self.events.subscribe()
    }

    fn post(&self, envelope: Envelope) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SipRelayError::ConnectionClosed);
        }
        if !self.to_hub.post(envelope) {
            return Err(SipRelayError::TransportFailure { cause: "channel post failed".into() });
        }
        Ok(())
    }

    /// Opens the channel (already open at construction) and waits for the
    /// Hub's admission `STATE_UPDATE`.
    pub async fn initialize(self: &Arc<Self>) -> Result<Value> {
        let mut rx = self.events.subscribe();
        self.post(Envelope::new(MessageType::ClientConnected).with_client_id(self.client_id.clone()))?;

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(EdgeEvent::StateUpdate(v)) => return Ok(v),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(SipRelayError::ConnectionClosed),
                }
            }
        };
        tokio::time::timeout(self.config.init_timeout, wait)
            .await
            .map_err(|_| SipRelayError::timeout("initialize", self.config.init_timeout.as_millis() as u64))?
    }

    /// Wraps a `REQUEST`; resolves on the matching `RESPONSE`, a timeout, or
    /// `close()`.
    pub async fn request(&self, action: impl Into<String>, payload: Option<Value>) -> Result<Value> {
        self.request_with_timeout(action, payload, self.config.request_timeout).await
    }

    pub async fn request_with_timeout(
        &self,
        action: impl Into<String>,
        payload: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let action = action.into();
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let mut envelope = Envelope::new(MessageType::Request)
            .with_client_id(self.client_id.clone())
            .with_request_id(request_id.clone())
            .with_action(action.clone());
        if let Some(p) = payload {
            envelope = envelope.with_payload(p);
        }
        if let Err(e) = self.post(envelope) {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SipRelayError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(SipRelayError::timeout(action, timeout.as_millis() as u64))
            }
        }
    }

    // SIP lifecycle requests use the dedicated `MessageType` variants (the
    // "richer" closed set — see the source ambiguity note in the design
    // ledger) and resolve on the matching broadcast update, not on the
    // immediate `RESPONSE` ack.

    pub async fn initialize_sip(&self, cfg: SipConfig) -> Result<bool> {
        self.lifecycle_request(MessageType::RequestSipInit, json!(cfg), self.config.sip_init_timeout, |event| {
            match event {
                EdgeEvent::SipInitResult(v) => Some(v.get("success").and_then(|s| s.as_bool()).unwrap_or(false)),
                _ => None,
            }
        })
        .await
    }

    pub async fn connect_sip(&self) -> Result<bool> {
        self.lifecycle_request(MessageType::RequestConnect, Value::Null, self.config.sip_connect_timeout, |event| {
            match event {
                EdgeEvent::SipConnectionUpdate(v) => match v.get("state").and_then(|s| s.as_str()) {
                    Some("connected") => Some(true),
                    Some("failed") => Some(false),
                    _ => None,
                },
                _ => None,
            }
        })
        .await
    }

    pub async fn register_sip(&self) -> Result<bool> {
        self.lifecycle_request(MessageType::RequestRegister, Value::Null, self.config.sip_register_timeout, |event| {
            match event {
                EdgeEvent::SipRegistrationUpdate(v) => match v.get("state").and_then(|s| s.as_str()) {
                    Some("registered") => Some(true),
                    Some("failed") => Some(false),
                    _ => None,
                },
                _ => None,
            }
        })
        .await
    }

    pub async fn unregister_sip(&self) -> Result<bool> {
        self.lifecycle_request(MessageType::RequestUnregister, Value::Null, self.config.sip_register_timeout, |event| {
            match event {
                EdgeEvent::SipRegistrationUpdate(v) => match v.get("state").and_then(|s| s.as_str()) {
                    Some("unregistered") | Some("failed") => Some(true),
                    _ => None,
                },
                _ => None,
            }
        })
        .await
    }

    async fn lifecycle_request(
        &self,
        msg_type: MessageType,
        payload: Value,
        timeout: Duration,
        terminal: impl Fn(&EdgeEvent) -> Option<bool>,
    ) -> Result<bool> {
        let mut rx = self.events.subscribe();
        let envelope = Envelope::new(msg_type)
            .with_client_id(self.client_id.clone())
            .with_request_id(Uuid::new_v4().to_string())
            .with_payload(payload);
        self.post(envelope)?;

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(result) = terminal(&event) {
                            return Ok(result);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(SipRelayError::ConnectionClosed),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SipRelayError::timeout(format!("{msg_type:?}"), timeout.as_millis() as u64))?
    }

    // Call API requests resolve via a direct `RESPONSE` (they need a return
    // value — e.g. the generated `callId` — not just a state transition).

    pub async fn make_call(&self, target: &str, options: Option<Value>) -> Result<Value> {
        self.typed_request(MessageType::RequestMakeCall, Some(json!({ "target": target, "options": options })))
            .await
    }

    pub async fn hangup_call(&self, call_id: &str) -> Result<Value> {
        self.typed_request(MessageType::RequestEndCall, Some(json!({ "callId": call_id }))).await
    }

    pub async fn answer_call(&self, call_id: &str, options: Option<Value>) -> Result<Value> {
        self.typed_request(MessageType::RequestAnswerCall, Some(json!({ "callId": call_id, "options": options })))
            .await
    }

    pub async fn send_dtmf(&self, call_id: &str, tones: &str) -> Result<Value> {
        self.request("sendDtmf", Some(json!({ "callId": call_id, "tones": tones }))).await
    }

    async fn typed_request(&self, msg_type: MessageType, payload: Option<Value>) -> Result<Value> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let mut envelope = Envelope::new(msg_type).with_client_id(self.client_id.clone()).with_request_id(request_id.clone());
        if let Some(p) = payload {
            envelope = envelope.with_payload(p);
        }
        if let Err(e) = self.post(envelope) {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SipRelayError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(SipRelayError::timeout(format!("{msg_type:?}"), self.config.request_timeout.as_millis() as u64))
            }
        }
    }

    /// Purely-local audio-track mutation; never reaches the SIP stack.
    pub fn set_muted(&self, call_id: &str, muted: bool) -> Result<()> {
        self.post(
            Envelope::new(MessageType::MediaControl)
                .with_client_id(self.client_id.clone())
                .with_payload(json!({ "callId": call_id, "muted": muted })),
        )
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.to_hub.post(Envelope::new(MessageType::ClientDisconnected).with_client_id(self.client_id.clone()));
        self.to_hub.close();

        let pending_ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for request_id in pending_ids {
            if let Some((_, tx)) = self.pending.remove(&request_id) {
                debug!(client_id = %self.client_id, request_id, "rejecting pending request on close");
                let _ = tx.send(Err(SipRelayError::ConnectionClosed));
            }
        }

        let session_ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for session_id in session_ids {
            if let Some((_, worker)) = self.sessions.remove(&session_id) {
                worker.close().await;
            }
        }
    }

    fn spawn_pump(self: Arc<Self>, mut from_hub: mpsc::UnboundedReceiver<Envelope>) {
        tokio::spawn(async move {
            while let Some(envelope) = from_hub.recv().await {
                self.handle_inbound(envelope).await;
            }
            debug!(client_id = %self.client_id, "edge client pump stopped: hub channel closed");
        });
    }

    async fn handle_inbound(self: &Arc<Self>, envelope: Envelope) {
        match envelope.r#type {
            MessageType::Response => self.handle_response(envelope),
            MessageType::StateUpdate => {
                let payload = envelope.payload.clone().unwrap_or(Value::Null);
                let _ = self.events.send(EdgeEvent::StateUpdate(payload));
            }
            MessageType::SipInitResult => {
                let payload = envelope.payload.clone().unwrap_or(Value::Null);
                let _ = self.events.send(EdgeEvent::SipInitResult(payload));
            }
            MessageType::SipConnectionUpdate => {
                let payload = envelope.payload.clone().unwrap_or(Value::Null);
                let _ = self.events.send(EdgeEvent::SipConnectionUpdate(payload));
            }
            MessageType::SipRegistrationUpdate => {
                let payload = envelope.payload.clone().unwrap_or(Value::Null);
                let _ = self.events.send(EdgeEvent::SipRegistrationUpdate(payload));
            }
            MessageType::SdpRequest => self.handle_sdp_request(envelope).await,
            _ => {
                let _ = self.events.send(EdgeEvent::Message(envelope));
            }
        }
    }

    fn handle_response(&self, envelope: Envelope) {
        let Some(payload) = envelope.payload.clone() else {
            warn!(client_id = %self.client_id, "RESPONSE with no payload, dropping");
            return;
        };
        let Some(request_id) = payload.get("requestId").and_then(|v| v.as_str()) else {
            warn!(client_id = %self.client_id, "RESPONSE with no requestId, dropping");
            return;
        };
        let Some((_, tx)) = self.pending.remove(request_id) else {
            debug!(client_id = %self.client_id, request_id, "RESPONSE for unknown/late request, dropping");
            return;
        };
        let success = payload.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
        let result = if success {
            Ok(payload.get("data").cloned().unwrap_or(Value::Null))
        } else {
            let error = payload.get("error").and_then(|v| v.as_str()).unwrap_or("unknown error").to_string();
            Err(SipRelayError::Protocol(error))
        };
        let _ = tx.send(result);
    }

    async fn handle_sdp_request(self: &Arc<Self>, envelope: Envelope) {
        let Some(payload) = envelope.payload.clone() else {
            warn!(client_id = %self.client_id, "SDP_REQUEST with no payload, dropping");
            return;
        };
        let Some(session_id) = payload.get("sessionId").and_then(|v| v.as_str()).map(str::to_string) else {
            warn!(client_id = %self.client_id, "SDP_REQUEST with no sessionId, dropping");
            return;
        };
        let Some(request) = payload.get("request").cloned() else {
            warn!(client_id = %self.client_id, session_id, "SDP_REQUEST with no request, dropping");
            return;
        };

        let worker = match self.sessions.get(&session_id) {
            Some(w) => w.clone(),
            None => match PeerWorker::new(self.client_id.clone(), session_id.clone(), self.to_hub.clone()) {
                Ok(w) => {
                    self.sessions.insert(session_id.clone(), w.clone());
                    w
                }
                Err(e) => {
                    warn!(client_id = %self.client_id, session_id, error = ?e, "failed to create peer worker");
                    return;
                }
            },
        };

        let is_close = request.get("operation").and_then(|v| v.as_str()) == Some("close");
        let response = worker.handle_request(&request).await;

        if is_close {
            self.sessions.remove(&session_id);
        }

        let envelope = Envelope::new(MessageType::SdpResponse)
            .with_client_id(self.client_id.clone())
            .with_payload(json!({ "sessionId": session_id, "response": response }));
        if !self.to_hub.post(envelope) {
            warn!(client_id = %self.client_id, session_id, "failed to post SDP_RESPONSE");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MpscChannel;

    fn setup() -> (Arc<EdgeClient>, mpsc::UnboundedReceiver<Envelope>) {
        let (to_hub, hub_rx) = MpscChannel::pair("edge->hub");
        let (_from_hub_tx, from_hub_rx) = mpsc::unbounded_channel();
        let edge = EdgeClient::new("c1", Arc::new(to_hub), from_hub_rx, EdgeClientConfig::default());
        (edge, hub_rx)
    }

    #[tokio::test]
    async fn request_times_out_with_no_reply() {
        let (edge, mut hub_rx) = setup();
        let start = std::time::Instant::now();
        let err = edge
            .request_with_timeout("noop", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(err.to_string().to_lowercase().contains("timed out"));

        // the request did go out, just never answered
        let envelope = hub_rx.recv().await.unwrap();
        assert_eq!(envelope.r#type, MessageType::Request);
    }

    #[tokio::test]
    async fn close_rejects_all_pending_requests() {
        let (edge, mut hub_rx) = setup();
        let pending = edge.clone();
        let handle = tokio::spawn(async move { pending.request("slow", None).await });

        // let the request land before closing
        let _ = hub_rx.recv().await.unwrap();
        edge.close().await;

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SipRelayError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (edge, _hub_rx) = setup();
        edge.close().await;
        edge.close().await;
    }
}
