//! The Hub (§4.D): owns the `ClientRegistry`, the action-handler table, and
//! the single [`SipManager`], and runs one receive loop per admitted Edge.
//!
//! Generalizes the teacher's single-desktop-window `AppHandle`/Tauri-command
//! surface into a process that can host many concurrent Edge connections.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::call::CallState;
use crate::channel::{Channel, MpscChannel};
use crate::dispatch::{self, ActionHandler, EchoHandler, SendDtmfHandler};
use crate::envelope::{Envelope, MessageType};
use crate::registry::ClientRegistry;
use crate::sip_manager::SipManager;

pub struct Hub {
    pub registry: Arc<ClientRegistry>,
    pub sip_manager: Arc<SipManager>,
    pub action_handlers: HashMap<String, Box<dyn ActionHandler>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(ClientRegistry::new());
        let sip_manager = SipManager::new(registry.clone());

        let mut action_handlers: HashMap<String, Box<dyn ActionHandler>> = HashMap::new();
        action_handlers.insert("echo".to_string(), Box::new(EchoHandler));
        action_handlers.insert("sendDtmf".to_string(), Box::new(SendDtmfHandler));

        Arc::new(Hub { registry, sip_manager, action_handlers })
    }

    /// Accept a new Edge: register its channel, spawn its receive loop, and
    /// return the paired `Channel` the caller hands to its `EdgeClient`.
    ///
    /// The admission envelope itself (`CLIENT_CONNECTED`) is sent by the
    /// caller over the returned receiver end, same as any other envelope —
    /// the Hub does not synthesize it.
    pub fn accept(self: &Arc<Self>, client_id: impl Into<String>) -> (Arc<dyn Channel>, mpsc::UnboundedReceiver<Envelope>) {
        let client_id = client_id.into();
        let (to_client, from_hub_rx) = MpscChannel::pair(format!("hub->{client_id}"));
        let (from_client, mut from_client_rx) = MpscChannel::pair(format!("{client_id}->hub"));
        let to_client: Arc<dyn Channel> = Arc::new(to_client);

        self.registry.register(client_id.clone(), to_client.clone());

        let hub = self.clone();
        let loop_client_id = client_id.clone();
        tokio::spawn(async move {
            while let Some(envelope) = from_client_rx.recv().await {
                dispatch::dispatch(&hub, &loop_client_id, envelope).await;
            }
            debug!(client_id = %loop_client_id, "edge receive loop ended");
        });

        (Arc::new(from_client) as Arc<dyn Channel>, from_hub_rx)
    }

    pub async fn admit(&self, client_id: &str) {
        let state = CallState::default();
        self.registry.send_to_client(client_id, Envelope::new(MessageType::StateUpdate).with_client_id(client_id).with_payload(state));

        let total_clients = self.registry.get_client_count();
        info!(client_id, total_clients, "client admitted");
        self.registry.broadcast_to_all_clients(
            Envelope::new(MessageType::ClientConnected).with_payload(serde_json::json!({ "clientId": client_id, "totalClients": total_clients })),
        );
    }

    pub async fn dismiss(&self, client_id: &str) {
        self.registry.unregister(client_id);
        let total_clients = self.registry.get_client_count();
        info!(client_id, total_clients, "client dismissed");

        self.registry.broadcast_to_all_clients(
            Envelope::new(MessageType::ClientDisconnected).with_payload(serde_json::json!({ "clientId": client_id, "totalClients": total_clients })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge_client::{EdgeClient, EdgeClientConfig, EdgeEvent};
    use serde_json::json;

    #[tokio::test]
    async fn admission_emits_state_update_then_broadcasts_client_connected() {
        let hub = Hub::new();
        let (channel, from_hub) = hub.accept("c1");
        let edge = EdgeClient::new("c1", channel, from_hub, EdgeClientConfig::default());

        let state = edge.initialize().await.unwrap();
        assert_eq!(state["hasActiveCall"], false);
        assert_eq!(state["registration"]["state"], "none");

        assert_eq!(hub.registry.get_client_count(), 1);
    }

    #[tokio::test]
    async fn second_admission_reports_incremented_total_clients() {
        let hub = Hub::new();
        let (channel_a, from_hub_a) = hub.accept("c1");
        let edge_a = EdgeClient::new("c1", channel_a, from_hub_a, EdgeClientConfig::default());
        edge_a.initialize().await.unwrap();
        let mut events_a = edge_a.subscribe();

        let (channel_b, from_hub_b) = hub.accept("c2");
        let edge_b = EdgeClient::new("c2", channel_b, from_hub_b, EdgeClientConfig::default());
        edge_b.initialize().await.unwrap();

        let mut saw_total_two = false;
        for _ in 0..4 {
            if let Ok(Ok(EdgeEvent::Message(envelope))) =
                tokio::time::timeout(std::time::Duration::from_millis(200), events_a.recv()).await
            {
                if envelope.r#type == MessageType::ClientConnected {
                    if envelope.payload.unwrap()["totalClients"] == json!(2) {
                        saw_total_two = true;
                        break;
                    }
                }
            } else {
                break;
            }
        }
        assert!(saw_total_two, "edge-a should observe totalClients:2 broadcast for edge-b's admission");
    }

    #[tokio::test]
    async fn echo_action_returns_payload_unchanged() {
        let hub = Hub::new();
        let (channel, from_hub) = hub.accept("c1");
        let edge = EdgeClient::new("c1", channel, from_hub, EdgeClientConfig::default());
        edge.initialize().await.unwrap();

        let reply = edge.request("echo", Some(json!({ "message": "hi" }))).await.unwrap();
        assert_eq!(reply, json!({ "message": "hi" }));
    }

    #[tokio::test]
    async fn unknown_action_yields_descriptive_error() {
        let hub = Hub::new();
        let (channel, from_hub) = hub.accept("c1");
        let edge = EdgeClient::new("c1", channel, from_hub, EdgeClientConfig::default());
        edge.initialize().await.unwrap();

        let err = edge.request("frobnicate", None).await.unwrap_err();
        assert_eq!(err.to_string(), "protocol error: Unknown request action: frobnicate");
    }

    #[tokio::test]
    async fn dismiss_decrements_count_and_broadcasts_disconnect() {
        let hub = Hub::new();
        let (channel_a, from_hub_a) = hub.accept("c1");
        let edge_a = EdgeClient::new("c1", channel_a, from_hub_a, EdgeClientConfig::default());
        edge_a.initialize().await.unwrap();

        let (channel_b, from_hub_b) = hub.accept("c2");
        let edge_b = EdgeClient::new("c2", channel_b, from_hub_b, EdgeClientConfig::default());
        edge_b.initialize().await.unwrap();

        edge_b.close().await;
        // give the hub's receive loop a beat to process CLIENT_DISCONNECTED
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(hub.registry.get_client_count(), 1);
    }
}
