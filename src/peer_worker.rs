//! Edge-side peer-connection worker (§4.H): services the `SDP_REQUEST`
//! operations the Hub's remote-SDP bridge (§4.G) sends, against one real
//! `rustrtc::PeerConnection`.
//!
//! Generalizes the teacher's `webrtc::WebRtcSession`: same `RtcConfiguration`
//! and PCMU/PCMA/telephone-event capability set, but driven by a dispatch
//! table keyed on `operation` instead of two fixed `new_outbound`/
//! `new_inbound` constructors, and with the track fed by
//! `rustrtc::media::track::sample_track` instead of a `cpal` capture stream —
//! there is no real microphone on this side of the bridge.

use rustrtc::config::MediaCapabilities;
use rustrtc::media::frame::MediaKind;
use rustrtc::media::track::sample_track;
use rustrtc::{AudioCapability, PeerConnection, RtcConfiguration, RtpCodecParameters, SdpType, SessionDescription, TransportMode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::envelope::{Envelope, MessageType};
use crate::error::{Result, SipRelayError};

/// One `PeerWorker` per active SDP session on the Edge side (mirrors the
/// Hub's `RemoteSdpHandler`, one level down the bridge).
pub struct PeerWorker {
    session_id: String,
    hub_channel: Arc<dyn Channel>,
    client_id: String,
    state: Mutex<State>,
}

struct State {
    pc: PeerConnection,
    local_sdp: Option<String>,
    have_remote: bool,
    closed: bool,
}

impl PeerWorker {
    pub fn new(client_id: impl Into<String>, session_id: impl Into<String>, hub_channel: Arc<dyn Channel>) -> Result<Arc<Self>> {
        // No `SipConfig::ice_servers()` here: `TransportMode::Rtp` +
        // `enable_latching` means the far end (a PBX) latches onto whatever
        // source address our RTP arrives from, same as the teacher's design —
        // there's no STUN/TURN negotiation phase for a STUN/TURN list to feed.
        let config = RtcConfiguration {
            transport_mode: TransportMode::Rtp,
            media_capabilities: Some(MediaCapabilities {
                audio: vec![
                    AudioCapability::pcmu(),
                    AudioCapability::pcma(),
                    AudioCapability::telephone_event(),
                ],
                video: vec![],
                application: None,
            }),
            enable_latching: true,
            ..Default::default()
        };
        let pc = PeerConnection::new(config);

        let (_audio_source, track, _feedback_rx) = sample_track(MediaKind::Audio, 100);
        pc.add_track(
            track,
            RtpCodecParameters { payload_type: 0, clock_rate: 8000, channels: 1 },
        )
        .map_err(|e| SipRelayError::Rtc(format!("failed to add audio track: {e}")))?;

        Ok(Arc::new(PeerWorker {
            session_id: session_id.into(),
            hub_channel,
            client_id: client_id.into(),
            state: Mutex::new(State { pc, local_sdp: None, have_remote: false, closed: false }),
        }))
    }

    /// Service one `{operation, requestId, data, options}` request and
    /// return the `{requestId, result}` / `{requestId, error}` reply body
    /// the Hub's RSDB expects (§4.G `send_request`).
    pub async fn handle_request(self: &Arc<Self>, request: &Value) -> Value {
        let request_id = request.get("requestId").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let operation = request.get("operation").and_then(|v| v.as_str()).unwrap_or("");
        let data = request.get("data").cloned();

        let outcome = self.dispatch(operation, data).await;
        match outcome {
            Ok(result) => json!({ "requestId": request_id, "result": result }),
            Err(e) => json!({ "requestId": request_id, "error": e.to_string() }),
        }
    }

    async fn dispatch(self: &Arc<Self>, operation: &str, data: Option<Value>) -> Result<Value> {
        match operation {
            "createOffer" => self.create_offer().await,
            "createAnswer" => self.create_answer().await,
            "setLocalDescription" => self.set_local_description(data).await,
            "setRemoteDescription" => self.set_remote_description(data).await,
            "getCompleteSdp" => self.get_complete_sdp().await,
            "addIceCandidate" => Ok(json!({ "success": true })),
            "sendDtmf" => self.send_dtmf(data).await,
            "close" => {
                self.close().await;
                Ok(json!({ "success": true }))
            }
            other => Err(SipRelayError::Protocol(format!("unknown SDP operation: {other}"))),
        }
    }

    async fn create_offer(&self) -> Result<Value> {
        let state = self.state.lock().await;
        let offer = state.pc.create_offer().await.map_err(|e| SipRelayError::Rtc(e.to_string()))?;
        Ok(json!({ "type": "offer", "sdp": offer.to_sdp_string() }))
    }

    async fn create_answer(&self) -> Result<Value> {
        let state = self.state.lock().await;
        let answer = state.pc.create_answer().await.map_err(|e| SipRelayError::Rtc(e.to_string()))?;
        Ok(json!({ "type": "answer", "sdp": answer.to_sdp_string() }))
    }

    async fn set_local_description(&self, data: Option<Value>) -> Result<Value> {
        let data = data.ok_or_else(|| SipRelayError::Protocol("setLocalDescription requires data".into()))?;
        let sdp_type = sdp_type_of(&data)?;
        let sdp = sdp_text_of(&data)?;
        let desc = SessionDescription::parse(sdp_type, &sdp).map_err(|e| SipRelayError::Rtc(e.to_string()))?;

        let mut state = self.state.lock().await;
        state.pc.set_local_description(desc).map_err(|e| SipRelayError::Rtc(e.to_string()))?;
        state.local_sdp = Some(sdp);
        drop(state);

        // The RTP-only transport mode the teacher uses has no real ICE
        // gathering phase: signal end-of-candidates immediately so RSDB's
        // non-trickle path doesn't wait out its full timeout for nothing.
        self.post_ice_candidate(None);
        Ok(json!({ "success": true }))
    }

    async fn set_remote_description(&self, data: Option<Value>) -> Result<Value> {
        let data = data.ok_or_else(|| SipRelayError::Protocol("setRemoteDescription requires data".into()))?;
        let sdp_type = sdp_type_of(&data)?;
        let sdp = sdp_text_of(&data)?;
        let desc = SessionDescription::parse(sdp_type, &sdp).map_err(|e| SipRelayError::Rtc(e.to_string()))?;

        let mut state = self.state.lock().await;
        state.pc.set_remote_description(desc).await.map_err(|e| SipRelayError::Rtc(e.to_string()))?;
        state.have_remote = true;
        drop(state);

        self.spawn_connection_watcher();
        Ok(json!({ "success": true }))
    }

    async fn get_complete_sdp(&self) -> Result<Value> {
        let state = self.state.lock().await;
        let sdp = state
            .local_sdp
            .clone()
            .ok_or_else(|| SipRelayError::Protocol("no local description set yet".into()))?;
        Ok(json!({ "sdp": sdp }))
    }

    async fn send_dtmf(&self, data: Option<Value>) -> Result<Value> {
        let tones = data
            .as_ref()
            .and_then(|d| d.get("tones"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if tones.is_empty() {
            return Err(SipRelayError::Protocol("sendDtmf requires data.tones".into()));
        }

        let state = self.state.lock().await;
        state
            .pc
            .send_dtmf(&tones, Duration::from_millis(100), Duration::from_millis(70))
            .await
            .map_err(|e| SipRelayError::Rtc(e.to_string()))?;
        debug!(session_id = %self.session_id, tones = %tones, "sendDtmf inserted on telephone-event track");
        Ok(json!({ "success": true }))
    }

    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        state.pc.close();
        info!(session_id = %self.session_id, "peer worker closed");
    }

    fn post_ice_candidate(&self, candidate: Option<Value>) {
        let envelope = Envelope::new(MessageType::IceCandidate)
            .with_client_id(self.client_id.clone())
            .with_payload(json!({ "sessionId": self.session_id, "candidate": candidate }));
        if !self.hub_channel.post(envelope) {
            warn!(session_id = %self.session_id, "failed to post ICE_CANDIDATE");
        }
    }

    fn spawn_connection_watcher(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let connected = {
                let state = this.state.lock().await;
                tokio::time::timeout(Duration::from_secs(10), state.pc.wait_for_connected()).await
            };
            let new_state = match connected {
                Ok(Ok(())) => "connected",
                Ok(Err(_)) => "failed",
                Err(_) => "failed",
            };
            let envelope = Envelope::new(MessageType::ConnectionStateChange)
                .with_client_id(this.client_id.clone())
                .with_payload(json!({ "sessionId": this.session_id, "state": new_state }));
            let _ = this.hub_channel.post(envelope);
        });
    }
}

fn sdp_type_of(data: &Value) -> Result<SdpType> {
    match data.get("type").and_then(|v| v.as_str()) {
        Some("offer") => Ok(SdpType::Offer),
        Some("answer") => Ok(SdpType::Answer),
        other => Err(SipRelayError::Protocol(format!("invalid sdp type: {other:?}"))),
    }
}

fn sdp_text_of(data: &Value) -> Result<String> {
    data.get("sdp")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| SipRelayError::Protocol("data.sdp missing".into()))
}

