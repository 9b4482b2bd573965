//! The Hub-resident SIP state machine (§4.F): owns exactly one `rsipstack`
//! UA, drives it through
//! `uninitialized -> initialized -> connecting -> connected -> registering ->
//! registered -> (unregistering -> connected) | disconnected | error`,
//! and republishes every transition as a `SIP_CONNECTION_UPDATE` /
//! `SIP_REGISTRATION_UPDATE` envelope broadcast to all Edges.
//!
//! Generalizes the teacher's `SipClient::connect` (`sip/mod.rs`): the same
//! transport-layer construction and task layout, but the UA's media side is
//! now the remote-SDP bridge (§4.G) instead of a local `WebRtcSession`, and
//! state changes go out over the channel instead of `AppHandle::emit`.

use dashmap::DashMap;
use rsip::Uri;
use rsipstack::dialog::authenticate::Credential;
use rsipstack::dialog::dialog_layer::DialogLayer;
use rsipstack::dialog::invitation::InviteOption;
use rsipstack::transport::TransportLayer;
use rsipstack::EndpointBuilder;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SipConfig;
use crate::envelope::{Envelope, MessageType};
use crate::error::{Result, SipRelayError};
use crate::registry::ClientRegistry;
use crate::rsdb::RemoteSdpHandlerFactory;
use crate::sip::helpers::{create_transport_connection, extract_protocol_from_uri, get_local_outbound_ip, Protocol};
use crate::sip::message_inspector::SipFlow;
use crate::sip::state::PendingCall;
use crate::sip::{coming_request, dialog, registration};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipManagerState {
    Uninitialized,
    Initialized,
    Connecting,
    Connected,
    Registering,
    Registered,
    Unregistering,
    Disconnected,
    Error(String),
}

impl SipManagerState {
    fn label(&self) -> &'static str {
        match self {
            SipManagerState::Uninitialized => "uninitialized",
            SipManagerState::Initialized => "initialized",
            SipManagerState::Connecting => "connecting",
            SipManagerState::Connected => "connected",
            SipManagerState::Registering => "registering",
            SipManagerState::Registered => "registered",
            SipManagerState::Unregistering => "unregistering",
            SipManagerState::Disconnected => "disconnected",
            SipManagerState::Error(_) => "error",
        }
    }
}

/// Everything torn down together by `disconnect()`.
struct Connection {
    dialog_layer: Arc<DialogLayer>,
    contact: Uri,
    credential: Credential,
    server: Uri,
    endpoint: rsipstack::transaction::endpoint::EndpointInnerRef,
    state_sender: rsipstack::dialog::dialog::DialogStateSender,
    cancel_token: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    registration_task: Option<tokio::task::JoinHandle<()>>,
}

pub struct SipManager {
    config: Mutex<SipConfig>,
    registry: Arc<ClientRegistry>,
    rsdb: Arc<RemoteSdpHandlerFactory>,
    state: Mutex<SipManagerState>,
    connection: Mutex<Option<Connection>>,
    pending_incoming: Arc<Mutex<HashMap<String, PendingCall>>>,
    active_call_tokens: Arc<DashMap<String, CancellationToken>>,
    sip_flow: Arc<SipFlow>,
}

impl SipManager {
    pub fn new(registry: Arc<ClientRegistry>) -> Arc<Self> {
        Arc::new(SipManager {
            config: Mutex::new(SipConfig::default()),
            registry: registry.clone(),
            rsdb: RemoteSdpHandlerFactory::new(registry),
            state: Mutex::new(SipManagerState::Uninitialized),
            connection: Mutex::new(None),
            pending_incoming: Arc::new(Mutex::new(HashMap::new())),
            active_call_tokens: Arc::new(DashMap::new()),
            sip_flow: Arc::new(SipFlow::new(None, false)),
        })
    }

    pub async fn state(&self) -> SipManagerState {
        self.state.lock().await.clone()
    }

    /// The bound remote-SDP bridge factory (§4.G), for the dispatch loop to
    /// route inbound `SDP_RESPONSE`/`ICE_CANDIDATE`/`CONNECTION_STATE_CHANGE`
    /// envelopes into.
    pub fn rsdb(&self) -> Arc<RemoteSdpHandlerFactory> {
        self.rsdb.clone()
    }

    async fn set_state(&self, next: SipManagerState) {
        self.set_state_as(next, None).await
    }

    /// `override_type` picks the envelope type for an `Error` transition,
    /// since which phase failed (connect vs. register) isn't recoverable
    /// from the state alone once it has been overwritten.
    async fn set_state_as(&self, next: SipManagerState, override_type: Option<MessageType>) {
        *self.state.lock().await = next.clone();
        let (message_type, payload) = match &next {
            SipManagerState::Initialized => (
                MessageType::SipInitResult,
                json!({ "success": true, "state": next.label() }),
            ),
            SipManagerState::Registering | SipManagerState::Registered | SipManagerState::Unregistering => (
                MessageType::SipRegistrationUpdate,
                json!({ "state": next.label() }),
            ),
            SipManagerState::Error(cause) => (
                override_type.unwrap_or(MessageType::SipConnectionUpdate),
                json!({ "state": "failed", "error": cause }),
            ),
            _ => (
                MessageType::SipConnectionUpdate,
                json!({ "state": next.label() }),
            ),
        };
        self.registry
            .broadcast_to_all_clients(Envelope::new(message_type).with_payload(payload));
    }

    async fn require_state(&self, expected: &[SipManagerState]) -> Result<()> {
        let current = self.state().await;
        if expected.iter().any(|s| s == &current) {
            Ok(())
        } else {
            Err(SipRelayError::bad_state(expected[0].label(), current.label()))
        }
    }

    /// `initializeSip(config)` (§4.F): validates and stores configuration.
    /// Does not touch the network.
    pub async fn initialize(&self, config: SipConfig) -> Result<()> {
        if config.uri.is_empty() || config.ws_servers.is_empty() {
            return Err(SipRelayError::Protocol("sip config requires uri and at least one ws server".into()));
        }
        if config.logs_enabled {
            self.sip_flow.enable();
        }
        *self.config.lock().await = config;
        self.set_state(SipManagerState::Initialized).await;
        Ok(())
    }

    /// `connect()` (§4.F): establishes the transport connection and starts
    /// the background tasks (`endpoint.serve`, incoming-request loop, dialog
    /// loop). Does not register.
    ///
    /// Resolves `Ok(false)` (never `Err`) on transport failure or on the
    /// configured `connectionTimeout` expiring — `Err` here means the caller
    /// asked for connect from a state that doesn't permit it, not that the
    /// network misbehaved.
    pub async fn connect(self: &Arc<Self>) -> Result<bool> {
        self.require_state(&[SipManagerState::Initialized, SipManagerState::Disconnected]).await?;
        self.set_state(SipManagerState::Connecting).await;

        let timeout_ms = self.config.lock().await.connection_timeout_ms;
        let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), self.connect_inner()).await;

        let err = match outcome {
            Ok(Ok(connection)) => {
                *self.connection.lock().await = Some(connection);
                self.set_state(SipManagerState::Connected).await;
                return Ok(true);
            }
            Ok(Err(e)) => e,
            Err(_) => SipRelayError::timeout("connect", timeout_ms),
        };

        self.set_state_as(SipManagerState::Error(err.to_string()), Some(MessageType::SipConnectionUpdate)).await;
        self.maybe_schedule_reconnect().await;
        Ok(false)
    }

    async fn connect_inner(&self) -> Result<Connection> {
        let config = self.config.lock().await.clone();
        let username = uri_user(&config.uri);

        let mut last_err = None;
        for candidate in &config.ws_servers {
            match self.try_connect_one(&config, candidate, &username).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!(server = %candidate, error = %e, "connect attempt failed, trying next server");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SipRelayError::TransportFailure {
            cause: "no ws servers configured".into(),
        }))
    }

    async fn try_connect_one(&self, config: &SipConfig, server: &str, username: &str) -> Result<Connection> {
        let server_uri_str = if server.starts_with("sip:") || server.starts_with("sips:") {
            server.to_string()
        } else {
            format!("sip:{server}")
        };
        let server_uri = Uri::try_from(server_uri_str)
            .map_err(|e| SipRelayError::TransportFailure { cause: format!("invalid server uri: {e:?}") })?;

        let cancel_token = CancellationToken::new();
        let protocol = extract_protocol_from_uri(&server_uri);
        let target_sip_addr = rsipstack::transport::SipAddr {
            r#type: Some(protocol.into()),
            addr: server_uri.host_with_port.clone(),
        };

        let local_ip = get_local_outbound_ip(&server_uri.host_with_port.to_string())
            .map_err(|e| SipRelayError::TransportFailure { cause: e.to_string() })?;
        let local_addr: SocketAddr = format!("{local_ip}:0")
            .parse()
            .map_err(|e| SipRelayError::TransportFailure { cause: format!("invalid local addr: {e}") })?;

        let connection = create_transport_connection(local_addr, target_sip_addr, cancel_token.clone(), None)
            .await
            .map_err(|e| SipRelayError::TransportFailure { cause: e.to_string() })?;

        let mut transport_layer = TransportLayer::new(cancel_token.clone());
        match protocol {
            Protocol::Udp => transport_layer.add_transport(connection),
            _ => transport_layer.add_connection(connection),
        }

        let sip_flow = self.sip_flow.clone();
        let endpoint = EndpointBuilder::new()
            .with_cancel_token(cancel_token.clone())
            .with_transport_layer(transport_layer)
            .with_user_agent("siprelay/0.1.0")
            .with_inspector(Box::new((*sip_flow).clone()))
            .build();

        let credential = Credential {
            username: username.to_string(),
            password: config.password.clone(),
            realm: None,
        };

        let incoming = endpoint
            .incoming_transactions()
            .map_err(|e| SipRelayError::TransportFailure { cause: e.to_string() })?;
        let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));
        let (state_sender, state_receiver) = dialog_layer.new_dialog_state_channel();

        let first_addr = endpoint
            .get_addrs()
            .first()
            .cloned()
            .ok_or_else(|| SipRelayError::TransportFailure { cause: "no local address bound".into() })?;

        let contact = rsip::Uri {
            scheme: Some(rsip::Scheme::Sip),
            auth: Some(rsip::Auth { user: username.to_string(), password: None }),
            host_with_port: first_addr.addr.into(),
            ..Default::default()
        };

        let endpoint_inner = endpoint.inner.clone();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(async move {
            let _ = endpoint.serve().await;
            info!("endpoint service stopped");
        }));

        let dl = dialog_layer.clone();
        let registry = self.registry.clone();
        let pending = self.pending_incoming.clone();
        let ct = contact.clone();
        let incoming_state_sender = state_sender.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = coming_request::process_incoming_request(dl, incoming, incoming_state_sender, ct, registry, pending).await
            {
                error!(error = ?e, "incoming request loop error");
            }
        }));

        let dl = dialog_layer.clone();
        let registry = self.registry.clone();
        let rsdb = self.rsdb.clone();
        let tokens = self.active_call_tokens.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = dialog::process_dialog(dl, state_receiver, registry, rsdb, tokens).await {
                error!(error = ?e, "dialog loop error");
            }
        }));

        Ok(Connection {
            dialog_layer,
            contact,
            credential,
            server: server_uri,
            endpoint: endpoint_inner,
            state_sender,
            cancel_token,
            tasks,
            registration_task: None,
        })
    }

    async fn maybe_schedule_reconnect(self: &Arc<Self>) {
        let auto_reconnect = self.config.lock().await.auto_reconnect;
        if !auto_reconnect {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            if this.state().await == SipManagerState::Disconnected || matches!(this.state().await, SipManagerState::Error(_)) {
                debug!("auto-reconnect: retrying connect()");
                let _ = this.connect().await;
            }
        });
    }

    /// `register()` (§4.F): sends the initial REGISTER and starts the
    /// refresh loop. Requires an established transport connection.
    pub async fn register(&self) -> Result<()> {
        self.require_state(&[SipManagerState::Connected]).await?;
        self.set_state(SipManagerState::Registering).await;

        let config = self.config.lock().await.clone();
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(SipRelayError::bad_state("connected", "disconnected"))?;

        let credential = connection.credential.clone();
        let server = connection.server.clone();
        let mut registration = registration::create_registration(connection.endpoint.clone(), Some(credential.clone()));

        let expires = match registration::register_once(&mut registration, server.clone(), Some(config.register_expires))
            .await
            .map_err(|e| SipRelayError::TransportFailure { cause: e.to_string() })
        {
            Ok(e) => e,
            Err(e) => {
                drop(guard);
                self.set_state_as(SipManagerState::Error(e.to_string()), Some(MessageType::SipRegistrationUpdate)).await;
                return Err(e);
            }
        };

        let endpoint = connection.endpoint.clone();
        let cancel_token = connection.cancel_token.child_token();
        connection.registration_task = Some(tokio::spawn(async move {
            if let Err(e) = registration::registration_refresh_loop(endpoint, server, credential, expires, cancel_token).await {
                error!(error = ?e, "registration refresh loop error");
            }
        }));
        drop(guard);

        self.set_state(SipManagerState::Registered).await;
        Ok(())
    }

    /// `unregister()` (§4.F): sends REGISTER with expires=0, then falls back
    /// to `connected` (the transport stays up).
    pub async fn unregister(&self) -> Result<()> {
        self.require_state(&[SipManagerState::Registered]).await?;
        self.set_state(SipManagerState::Unregistering).await;

        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(SipRelayError::bad_state("registered", "disconnected"))?;
        if let Some(task) = connection.registration_task.take() {
            task.abort();
        }
        let mut registration = registration::create_registration(connection.endpoint.clone(), Some(connection.credential.clone()));
        let server = connection.server.clone();
        let _ = registration::unregister(&mut registration, server).await;
        drop(guard);

        self.set_state(SipManagerState::Connected).await;
        Ok(())
    }

    /// `disconnect()` (§4.F): tears down transport + registration + every
    /// in-flight call and RSDB session.
    pub async fn disconnect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.take() {
            connection.cancel_token.cancel();
            if let Some(task) = connection.registration_task {
                task.abort();
            }
            for task in connection.tasks {
                task.abort();
            }
        }
        drop(guard);
        self.pending_incoming.lock().await.clear();
        self.set_state(SipManagerState::Disconnected).await;
        Ok(())
    }

    /// `makeCall(clientId, target)` (§4.F): negotiates SDP through the Edge
    /// bound to `clientId` and sends the INVITE. Returns the new call id.
    pub async fn make_call(&self, client_id: &str, target: &str) -> Result<String> {
        self.require_state(&[SipManagerState::Registered]).await?;
        let config = self.config.lock().await.clone();
        let call_id = Uuid::new_v4().to_string();

        let guard = self.connection.lock().await;
        let connection = guard.as_ref().ok_or(SipRelayError::bad_state("registered", "disconnected"))?;

        let callee_uri = Uri {
            scheme: Some(rsip::Scheme::Sip),
            auth: Some(rsip::Auth { user: target.to_string(), password: None }),
            host_with_port: connection.server.host_with_port.clone(),
            params: connection.server.params.clone(),
            ..Default::default()
        };
        let invite_option = InviteOption {
            callee: callee_uri,
            caller: connection.contact.clone(),
            contact: connection.contact.clone(),
            credential: Some(connection.credential.clone()),
            call_id: Some(call_id.clone()),
            ..Default::default()
        };
        let dialog_layer = connection.dialog_layer.clone();
        let state_sender = connection.state_sender.clone();
        drop(guard);

        let rsdb_session = self.rsdb.create(
            call_id.clone(),
            Some(client_id.to_string()),
            None,
            true,
            Duration::from_millis(config.ice_gathering_timeout_ms),
            Duration::from_millis(config.request_timeout_ms),
        );

        let dialog = crate::sip::make_call::make_call(dialog_layer, invite_option, state_sender, rsdb_session)
            .await
            .map_err(|e| SipRelayError::TransportFailure { cause: e.to_string() })?;

        let dialog_id = match &dialog {
            rsipstack::dialog::dialog::Dialog::ClientInvite(d) => d.id().to_string(),
            _ => call_id.clone(),
        };
        self.active_call_tokens.insert(dialog_id, CancellationToken::new());

        Ok(call_id)
    }

    /// `requestAnswerCall(callId)` (§4.F, §9): first Edge to answer wins.
    /// Late answers for an already-claimed call are rejected with
    /// `BadState` and the losers receive `CALL_CLAIMED`.
    pub async fn answer_call(&self, client_id: &str, call_id: &str) -> Result<()> {
        let pending = {
            let mut pending = self.pending_incoming.lock().await;
            pending.remove(call_id)
        };
        let pending = pending.ok_or_else(|| SipRelayError::bad_state("incoming", "claimed-or-unknown"))?;

        self.registry.broadcast_except(
            client_id,
            Envelope::new(MessageType::CallClaimed).with_payload(json!({ "callId": call_id })),
        );

        let config = self.config.lock().await.clone();
        let rsdb_session = self.rsdb.create(
            call_id.to_string(),
            Some(client_id.to_string()),
            None,
            true,
            Duration::from_millis(config.ice_gathering_timeout_ms),
            Duration::from_millis(config.request_timeout_ms),
        );

        rsdb_session
            .set_description(&pending.sdp_offer, None)
            .await
            .map_err(|e| SipRelayError::MediaFailure { cause: e.to_string() })?;
        let answer_sdp = rsdb_session
            .get_description(None)
            .await
            .map_err(|e| SipRelayError::MediaFailure { cause: e.to_string() })?;

        match pending.dialog {
            rsipstack::dialog::dialog::Dialog::ServerInvite(d) => {
                let headers = vec![rsip::typed::ContentType(rsip::typed::MediaType::Sdp(vec![])).into()];
                d.accept(Some(headers), Some(answer_sdp.into_bytes()))
                    .map_err(|e| SipRelayError::TransportFailure { cause: format!("{e:?}") })?;
                self.active_call_tokens.insert(d.id().to_string(), CancellationToken::new());
                Ok(())
            }
            _ => Err(SipRelayError::Protocol("pending call had non-ServerInvite dialog".into())),
        }
    }

    /// `endCall(callId)` / BYE for an active dialog, or reject a still-pending
    /// inbound call.
    pub async fn end_call(&self, call_id: &str) -> Result<()> {
        if let Some(pending) = self.pending_incoming.lock().await.remove(call_id) {
            if let rsipstack::dialog::dialog::Dialog::ServerInvite(d) = pending.dialog {
                d.reject(Some(rsip::StatusCode::BusyHere), Some("call ended".into()))
                    .map_err(|e| SipRelayError::TransportFailure { cause: format!("{e:?}") })?;
            }
            return Ok(());
        }
        self.rsdb.remove_session(call_id, None).await;
        if let Some((_, token)) = self.active_call_tokens.remove(call_id) {
            token.cancel();
        }
        Ok(())
    }
}

fn uri_user(uri: &str) -> String {
    uri.trim_start_matches("sip:")
        .trim_start_matches("sips:")
        .split('@')
        .next()
        .unwrap_or_default()
        .to_string()
}
