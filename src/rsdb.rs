//! Remote-SDP bridge (§4.G): the session-description handler the Hub-hosted
//! SIP stack drives as if it were local, but that actually round-trips every
//! WebRTC primitive to exactly one Edge over the channel.
//!
//! Generalizes the teacher's `sip/make_call.rs`, which calls
//! `WebRtcSession::new_outbound`/`apply_answer` directly because the UA and
//! the media live in the same process. Here they don't, so every direct call
//! becomes an `SDP_REQUEST` / `SDP_RESPONSE` round trip correlated by
//! `requestId`, with the pending-request bookkeeping grounded in the same
//! `tokio::select!`/timeout idiom the teacher uses in
//! `registration_refresh_loop`.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::{Envelope, MessageType};
use crate::error::{Result, SipRelayError};
use crate::registry::{ClientId, ClientRegistry};

pub type SessionId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u32>,
    #[serde(default, rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone)]
pub struct SdpDescription {
    pub sdp: String,
    pub kind: &'static str, // "offer" | "answer"
}

/// Callbacks the owning SIP session wires into the bridge, mirroring the
/// source session delegate's `onTrack`/`onIceCandidate`/
/// `onIceConnectionStateChange` (§4.G factory responsibilities). Default
/// no-ops: most sessions only care about a subset.
pub trait SessionDelegate: Send + Sync {
    fn on_ice_candidate(&self, _candidate: Option<&IceCandidate>) {}
    fn on_connection_state_change(&self, _state: &str) {}
}

struct HandlerState {
    client_id: Option<ClientId>,
    local_description: Option<SdpDescription>,
    remote_description: Option<SdpDescription>,
    ice_candidates: Vec<IceCandidate>,
    ice_gathering_state: IceGatheringState,
    connection_state: String,
    closed: bool,
}

/// One RSDB instance per SIP media session (H-inst, §4.G).
pub struct RemoteSdpHandler {
    pub session_id: SessionId,
    trickle_candidates: bool,
    ice_gathering_timeout: Duration,
    request_timeout: Duration,
    registry: Arc<ClientRegistry>,
    delegate: Option<Arc<dyn SessionDelegate>>,
    state: Mutex<HandlerState>,
    pending_requests: DashMap<String, oneshot::Sender<Result<Value>>>,
    gathering_tx: watch::Sender<IceGatheringState>,
    gathering_rx: watch::Receiver<IceGatheringState>,
}

impl RemoteSdpHandler {
    fn new(
        session_id: SessionId,
        client_id: Option<ClientId>,
        delegate: Option<Arc<dyn SessionDelegate>>,
        trickle_candidates: bool,
        ice_gathering_timeout: Duration,
        request_timeout: Duration,
        registry: Arc<ClientRegistry>,
    ) -> Arc<Self> {
        let (gathering_tx, gathering_rx) = watch::channel(IceGatheringState::New);
        Arc::new(RemoteSdpHandler {
            session_id,
            trickle_candidates,
            ice_gathering_timeout,
            request_timeout,
            registry,
            delegate,
            state: Mutex::new(HandlerState {
                client_id,
                local_description: None,
                remote_description: None,
                ice_candidates: Vec::new(),
                ice_gathering_state: IceGatheringState::New,
                connection_state: "new".to_string(),
                closed: false,
            }),
            pending_requests: DashMap::new(),
            gathering_tx,
            gathering_rx,
        })
    }

    async fn bound_client(&self) -> Result<ClientId> {
        let mut state = self.state.lock().await;
        if let Some(cid) = &state.client_id {
            return Ok(cid.clone());
        }
        // Auto-select fallback (§9): pin the first registered client once a
        // call is in flight, used only until an explicit binding exists.
        let candidates = self.registry.get_all_client_ids();
        let chosen = candidates
            .into_iter()
            .next()
            .ok_or_else(|| SipRelayError::Protocol("no Edge registered to service SDP".into()))?;
        state.client_id = Some(chosen.clone());
        Ok(chosen)
    }

    /// Send one `SDP_REQUEST` and await its correlated `SDP_RESPONSE`,
    /// subject to `request_timeout`. Exactly one outcome per dispatch (§3
    /// invariant): a response, a timeout, or rejection on `close()`.
    async fn send_request(
        &self,
        operation: &str,
        data: Option<Value>,
        options: Option<Value>,
    ) -> Result<Value> {
        if self.state.lock().await.closed {
            return Err(SipRelayError::ConnectionClosed);
        }

        let client_id = self.bound_client().await?;
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_requests.insert(request_id.clone(), tx);

        let request_payload = json!({
            "sessionId": self.session_id,
            "request": {
                "operation": operation,
                "requestId": request_id,
                "data": data,
                "options": options,
            }
        });
        let envelope = Envelope::new(MessageType::SdpRequest)
            .with_client_id(client_id.clone())
            .with_payload(request_payload);

        if !self.registry.send_to_client(&client_id, envelope) {
            self.pending_requests.remove(&request_id);
            return Err(SipRelayError::MediaFailure {
                cause: format!("failed to post SDP_REQUEST '{operation}' to {client_id}"),
            });
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_canceled)) => {
                // sender dropped without a send — only happens via close()'s drain.
                self.pending_requests.remove(&request_id);
                Err(SipRelayError::ConnectionClosed)
            }
            Err(_elapsed) => {
                self.pending_requests.remove(&request_id);
                Err(SipRelayError::sdp_timeout(operation, self.request_timeout.as_millis() as u64))
            }
        }
    }

    /// Route an inbound `SDP_RESPONSE` to the pending request it completes.
    /// A reply with no matching pending entry is logged and dropped (§8).
    pub fn handle_response(&self, response: &Value) {
        let Some(request_id) = response.get("requestId").and_then(|v| v.as_str()) else {
            warn!(session_id = %self.session_id, "SDP_RESPONSE missing requestId, dropping");
            return;
        };
        let Some((_, tx)) = self.pending_requests.remove(request_id) else {
            debug!(session_id = %self.session_id, request_id, "SDP_RESPONSE for unknown/settled request, dropping");
            return;
        };
        let outcome = if let Some(error) = response.get("error").and_then(|v| v.as_str()) {
            Err(SipRelayError::MediaFailure { cause: error.to_string() })
        } else {
            Ok(response.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = tx.send(outcome);
    }

    /// Route an inbound `ICE_CANDIDATE` envelope. `None` marks end-of-gathering.
    pub async fn handle_ice_candidate(&self, candidate: Option<IceCandidate>) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        match &candidate {
            Some(c) => state.ice_candidates.push(c.clone()),
            None => {
                state.ice_gathering_state = IceGatheringState::Complete;
                let _ = self.gathering_tx.send(IceGatheringState::Complete);
            }
        }
        if state.ice_gathering_state == IceGatheringState::New && candidate.is_some() {
            state.ice_gathering_state = IceGatheringState::Gathering;
        }
        if let Some(delegate) = &self.delegate {
            delegate.on_ice_candidate(candidate.as_ref());
        }
    }

    pub async fn handle_connection_state_change(&self, new_state: String) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.connection_state = new_state.clone();
        drop(state);
        if let Some(delegate) = &self.delegate {
            delegate.on_connection_state_change(&new_state);
        }
    }

    /// `getDescription(options) -> {body, contentType}` (§4.G). Chooses
    /// `createOffer` if no remote description has been set, else `createAnswer`.
    pub async fn get_description(&self, options: Option<Value>) -> Result<String> {
        let has_remote = self.state.lock().await.remote_description.is_some();
        let operation = if has_remote { "createAnswer" } else { "createOffer" };

        let result = self.send_request(operation, None, options.clone()).await?;
        let sdp = result
            .get("sdp")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SipRelayError::MediaFailure {
                cause: format!("{operation} reply missing sdp"),
            })?
            .to_string();
        let kind = if has_remote { "answer" } else { "offer" };

        {
            let mut state = self.state.lock().await;
            state.local_description = Some(SdpDescription { sdp: sdp.clone(), kind });
        }

        self.send_request(
            "setLocalDescription",
            Some(json!({ "type": kind, "sdp": sdp })),
            None,
        )
        .await?;

        if !self.trickle_candidates {
            self.wait_for_gathering_complete().await;
            if let Ok(result) = self.send_request("getCompleteSdp", None, None).await {
                if let Some(complete_sdp) = result.get("sdp").and_then(|v| v.as_str()) {
                    let mut state = self.state.lock().await;
                    state.local_description = Some(SdpDescription {
                        sdp: complete_sdp.to_string(),
                        kind,
                    });
                    return Ok(complete_sdp.to_string());
                }
            }
        }

        Ok(sdp)
    }

    async fn wait_for_gathering_complete(&self) {
        let mut rx = self.gathering_rx.clone();
        let wait = async {
            while *rx.borrow() != IceGatheringState::Complete {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(self.ice_gathering_timeout, wait).await;
    }

    /// `setDescription(sdpText, options) -> void` (§4.G). Classifies as
    /// `offer` iff no remote description exists yet.
    pub async fn set_description(&self, sdp_text: &str, options: Option<Value>) -> Result<()> {
        let is_offer = {
            let mut state = self.state.lock().await;
            let is_offer = state.remote_description.is_none();
            if is_offer {
                state.ice_candidates.clear();
                state.ice_gathering_state = IceGatheringState::New;
                let _ = self.gathering_tx.send(IceGatheringState::New);
            }
            let kind = if is_offer { "offer" } else { "answer" };
            state.remote_description = Some(SdpDescription {
                sdp: sdp_text.to_string(),
                kind,
            });
            is_offer
        };
        let kind = if is_offer { "offer" } else { "answer" };

        self.send_request(
            "setRemoteDescription",
            Some(json!({ "type": kind, "sdp": sdp_text })),
            options,
        )
        .await?;
        Ok(())
    }

    /// `sendDtmf(tones, options) -> boolean`. Fire-and-forget: only the post
    /// to the channel is awaited, not an RPC round trip; failures are logged,
    /// not propagated.
    pub async fn send_dtmf(&self, tones: &str, options: Option<Value>) -> bool {
        if self.state.lock().await.closed {
            return false;
        }
        let Ok(client_id) = self.bound_client().await else {
            warn!(session_id = %self.session_id, "send_dtmf: no Edge bound");
            return false;
        };
        let payload = json!({
            "sessionId": self.session_id,
            "request": {
                "operation": "sendDtmf",
                "requestId": Uuid::new_v4().to_string(),
                "data": { "tones": tones },
                "options": options,
            }
        });
        let envelope = Envelope::new(MessageType::SdpRequest)
            .with_client_id(client_id.clone())
            .with_payload(payload);
        let ok = self.registry.send_to_client(&client_id, envelope);
        if !ok {
            warn!(session_id = %self.session_id, "send_dtmf: post failed");
        }
        true
    }

    pub async fn has_description(&self) -> bool {
        self.state.lock().await.local_description.is_some()
    }

    pub async fn connection_state(&self) -> String {
        self.state.lock().await.connection_state.clone()
    }

    /// Marks closed, rejects all pending requests with a terminal error, and
    /// sends a best-effort `close` to the bound Edge.
    pub async fn close(&self) {
        let client_id = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.client_id.clone()
        };

        // Drain and reject every still-pending request.
        let keys: Vec<String> = self.pending_requests.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending_requests.remove(&key) {
                debug!(session_id = %self.session_id, request_id = %key, "rejecting pending SDP request on close");
                let _ = tx.send(Err(SipRelayError::ConnectionClosed));
            }
        }

        if let Some(client_id) = client_id {
            let envelope = Envelope::new(MessageType::SdpRequest)
                .with_client_id(client_id.clone())
                .with_payload(json!({
                    "sessionId": self.session_id,
                    "request": { "operation": "close", "requestId": Uuid::new_v4().to_string() }
                }));
            let _ = self.registry.send_to_client(&client_id, envelope);
        }
    }
}

/// Factory (F-inst, §4.G): owns every live `RemoteSdpHandler`, keyed by
/// session id, and routes inbound `SDP_RESPONSE`/`ICE_CANDIDATE`/
/// `CONNECTION_STATE_CHANGE` envelopes to the owning handler.
pub struct RemoteSdpHandlerFactory {
    registry: Arc<ClientRegistry>,
    sessions: DashMap<SessionId, Arc<RemoteSdpHandler>>,
}

impl RemoteSdpHandlerFactory {
    pub fn new(registry: Arc<ClientRegistry>) -> Arc<Self> {
        Arc::new(RemoteSdpHandlerFactory {
            registry,
            sessions: DashMap::new(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        session_id: impl Into<SessionId>,
        client_id: Option<ClientId>,
        delegate: Option<Arc<dyn SessionDelegate>>,
        trickle_candidates: bool,
        ice_gathering_timeout: Duration,
        request_timeout: Duration,
    ) -> Arc<RemoteSdpHandler> {
        let session_id = session_id.into();
        let handler = RemoteSdpHandler::new(
            session_id.clone(),
            client_id,
            delegate,
            trickle_candidates,
            ice_gathering_timeout,
            request_timeout,
            self.registry.clone(),
        );
        self.sessions.insert(session_id, handler.clone());
        handler
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<RemoteSdpHandler>> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    /// `removeSession(sessionId, clientId?)` (§4.G). `clientId` is accepted
    /// for parity with the source contract but is not required for lookup —
    /// sessions are uniquely keyed regardless of which Edge services them.
    pub async fn remove_session(&self, session_id: &str, _client_id: Option<&str>) {
        if let Some((_, handler)) = self.sessions.remove(session_id) {
            handler.close().await;
        }
    }

    pub async fn route_sdp_response(&self, payload: &Value) {
        let Some(session_id) = payload.get("sessionId").and_then(|v| v.as_str()) else {
            warn!("SDP_RESPONSE missing sessionId, dropping");
            return;
        };
        let Some(response) = payload.get("response") else {
            warn!(session_id, "SDP_RESPONSE missing response body, dropping");
            return;
        };
        match self.sessions.get(session_id) {
            Some(handler) => handler.handle_response(response),
            None => debug!(session_id, "SDP_RESPONSE for unknown session, dropping"),
        }
    }

    pub async fn route_ice_candidate(&self, payload: &Value) {
        let Some(session_id) = payload.get("sessionId").and_then(|v| v.as_str()) else {
            warn!("ICE_CANDIDATE missing sessionId, dropping");
            return;
        };
        let candidate: Option<IceCandidate> = payload
            .get("candidate")
            .cloned()
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value(v).ok());
        match self.sessions.get(session_id).map(|e| e.value().clone()) {
            Some(handler) => handler.handle_ice_candidate(candidate).await,
            None => debug!(session_id, "ICE_CANDIDATE for unknown session, dropping"),
        }
    }

    pub async fn route_connection_state_change(&self, payload: &Value) {
        let Some(session_id) = payload.get("sessionId").and_then(|v| v.as_str()) else {
            warn!("CONNECTION_STATE_CHANGE missing sessionId, dropping");
            return;
        };
        let Some(state) = payload.get("state").and_then(|v| v.as_str()) else {
            return;
        };
        match self.sessions.get(session_id).map(|e| e.value().clone()) {
            Some(handler) => handler.handle_connection_state_change(state.to_string()).await,
            None => debug!(session_id, "CONNECTION_STATE_CHANGE for unknown session, dropping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MpscChannel;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn setup() -> (Arc<ClientRegistry>, UnboundedReceiver<Envelope>) {
        let registry = Arc::new(ClientRegistry::new());
        let (chan, rx) = MpscChannel::pair("edge-1");
        registry.register("edge-1".to_string(), Arc::new(chan));
        (registry, rx)
    }

    #[tokio::test]
    async fn get_description_sends_create_offer_then_set_local(
    ) {
        let (registry, mut rx) = setup();
        let factory = RemoteSdpHandlerFactory::new(registry.clone());
        let handler = factory.create(
            "sess-1",
            Some("edge-1".to_string()),
            None,
            true,
            Duration::from_millis(500),
            Duration::from_millis(500),
        );

        let handler_task = handler.clone();
        let get_desc = tokio::spawn(async move { handler_task.get_description(None).await });

        // First envelope: createOffer
        let req1 = rx.recv().await.unwrap();
        assert_eq!(req1.r#type, MessageType::SdpRequest);
        let payload1 = req1.payload.unwrap();
        let request_id1 = payload1["request"]["requestId"].as_str().unwrap().to_string();
        assert_eq!(payload1["request"]["operation"], "createOffer");

        factory
            .route_sdp_response(&json!({
                "sessionId": "sess-1",
                "response": { "requestId": request_id1, "result": { "type": "offer", "sdp": "v=0\r\n..." } }
            }))
            .await;

        // Second envelope: setLocalDescription
        let req2 = rx.recv().await.unwrap();
        let payload2 = req2.payload.unwrap();
        assert_eq!(payload2["request"]["operation"], "setLocalDescription");
        let request_id2 = payload2["request"]["requestId"].as_str().unwrap().to_string();

        factory
            .route_sdp_response(&json!({
                "sessionId": "sess-1",
                "response": { "requestId": request_id2, "result": { "success": true } }
            }))
            .await;

        let sdp = get_desc.await.unwrap().unwrap();
        assert_eq!(sdp, "v=0\r\n...");
        assert!(handler.has_description().await);
    }

    #[tokio::test]
    async fn set_description_after_offer_is_classified_as_answer() {
        let (registry, mut rx) = setup();
        let factory = RemoteSdpHandlerFactory::new(registry.clone());
        let handler = factory.create(
            "sess-2",
            Some("edge-1".to_string()),
            None,
            true,
            Duration::from_millis(500),
            Duration::from_millis(500),
        );

        // Pretend we already have a remote offer (as an incoming call would).
        handler.set_description("v=0\r\noffer-sdp", None).await.unwrap();
        let req = rx.recv().await.unwrap();
        assert_eq!(req.payload.as_ref().unwrap()["request"]["operation"], "setRemoteDescription");
        assert_eq!(req.payload.as_ref().unwrap()["request"]["data"]["type"], "offer");
        let request_id = req.payload.unwrap()["request"]["requestId"].as_str().unwrap().to_string();
        factory
            .route_sdp_response(&json!({"sessionId": "sess-2", "response": {"requestId": request_id, "result": {"success": true}}}))
            .await;

        let handler2 = handler.clone();
        let task = tokio::spawn(async move { handler2.set_description("v=0\r\nanswer-sdp", None).await });
        let req2 = rx.recv().await.unwrap();
        assert_eq!(req2.payload.as_ref().unwrap()["request"]["data"]["type"], "answer");
        let request_id2 = req2.payload.unwrap()["request"]["requestId"].as_str().unwrap().to_string();
        factory
            .route_sdp_response(&json!({"sessionId": "sess-2", "response": {"requestId": request_id2, "result": {"success": true}}}))
            .await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn timeout_rejects_and_late_reply_is_dropped() {
        let (registry, mut rx) = setup();
        let factory = RemoteSdpHandlerFactory::new(registry.clone());
        let handler = factory.create(
            "sess-3",
            Some("edge-1".to_string()),
            None,
            true,
            Duration::from_millis(500),
            Duration::from_millis(50),
        );

        let result = handler.get_description(None).await;
        let err = result.unwrap_err();
        assert!(matches!(err, SipRelayError::SdpTimeout { .. }));
        assert!(err.to_string().contains("timeout after 50ms"));

        // A late reply for the now-settled request id is dropped without panicking.
        let req = rx.recv().await.unwrap();
        let request_id = req.payload.unwrap()["request"]["requestId"].as_str().unwrap().to_string();
        factory
            .route_sdp_response(&json!({"sessionId": "sess-3", "response": {"requestId": request_id, "result": {"sdp":"late"}}}))
            .await;
    }

    #[tokio::test]
    async fn close_rejects_all_pending_requests() {
        let (registry, _rx) = setup();
        let factory = RemoteSdpHandlerFactory::new(registry.clone());
        let handler = factory.create(
            "sess-4",
            Some("edge-1".to_string()),
            None,
            true,
            Duration::from_secs(5),
            Duration::from_secs(5),
        );

        let handler2 = handler.clone();
        let task = tokio::spawn(async move { handler2.get_description(None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handler.close().await;

        let result = task.await.unwrap();
        assert!(matches!(result, Err(SipRelayError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn null_candidate_marks_gathering_complete() {
        let (registry, _rx) = setup();
        let factory = RemoteSdpHandlerFactory::new(registry.clone());
        let handler = factory.create(
            "sess-5",
            Some("edge-1".to_string()),
            None,
            true,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );

        factory
            .route_ice_candidate(&json!({
                "sessionId": "sess-5",
                "candidate": { "candidate": "candidate:1 1 UDP 1 1.2.3.4 5 typ host", "sdpMid": "0", "sdpMLineIndex": 0 }
            }))
            .await;
        factory
            .route_ice_candidate(&json!({ "sessionId": "sess-5", "candidate": null }))
            .await;

        assert_eq!(*handler.gathering_rx.borrow(), IceGatheringState::Complete);
    }

    #[tokio::test]
    async fn unknown_session_routing_does_not_panic() {
        let (registry, _rx) = setup();
        let factory = RemoteSdpHandlerFactory::new(registry);
        factory
            .route_sdp_response(&json!({"sessionId": "ghost", "response": {"requestId": "x", "result": {}}}))
            .await;
        factory
            .route_ice_candidate(&json!({"sessionId": "ghost", "candidate": null}))
            .await;
    }
}
