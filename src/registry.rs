//! Client registry (§4.D): tracks Edge channels by id, fans out broadcasts,
//! and wraps the `RESPONSE`/error-response envelope shapes.
//!
//! Mirrors the teacher's `active_call_tokens: Arc<DashMap<String, CancellationToken>>`
//! — a concurrent map touched from more than one task, so `DashMap` rather than
//! a single-owner `HashMap` behind a `Mutex`.

use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::channel::Channel;
use crate::envelope::{Envelope, MessageType};

pub type ClientId = String;

#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<dyn Channel>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        ClientRegistry {
            clients: DashMap::new(),
        }
    }

    pub fn register(&self, client_id: ClientId, channel: Arc<dyn Channel>) {
        self.clients.insert(client_id, channel);
    }

    /// Removes and closes the channel, if present.
    pub fn unregister(&self, client_id: &str) {
        if let Some((_, channel)) = self.clients.remove(client_id) {
            channel.close();
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<dyn Channel>> {
        self.clients.get(client_id).map(|entry| entry.value().clone())
    }

    pub fn get_all_client_ids(&self) -> Vec<ClientId> {
        self.clients.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn get_client_count(&self) -> usize {
        self.clients.len()
    }

    /// Returns `false` (logged, never raised) if the client is unknown or the
    /// underlying post fails.
    pub fn send_to_client(&self, client_id: &str, envelope: Envelope) -> bool {
        match self.clients.get(client_id) {
            Some(channel) => {
                let ok = channel.post(envelope);
                if !ok {
                    warn!(client_id, "post failed in send_to_client");
                }
                ok
            }
            None => {
                warn!(client_id, "send_to_client: unknown client id");
                false
            }
        }
    }

    /// Best-effort: per-recipient failures are logged, the loop continues.
    pub fn broadcast_to_all_clients(&self, envelope: Envelope) {
        for entry in self.clients.iter() {
            let client_id = entry.key();
            if !entry.value().post(envelope.clone()) {
                warn!(client_id = %client_id, "broadcast post failed, continuing");
            }
        }
    }

    /// Best-effort broadcast that skips one client id (e.g. the originator).
    pub fn broadcast_except(&self, except: &str, envelope: Envelope) {
        for entry in self.clients.iter() {
            let client_id = entry.key();
            if client_id == except {
                continue;
            }
            if !entry.value().post(envelope.clone()) {
                warn!(client_id = %client_id, "broadcast post failed, continuing");
            }
        }
    }

    pub fn send_response(
        &self,
        client_id: &str,
        request_id: &str,
        data: Option<serde_json::Value>,
        success: bool,
    ) -> bool {
        let payload = json!({
            "requestId": request_id,
            "success": success,
            "data": data,
        });
        let envelope = Envelope::new(MessageType::Response)
            .with_client_id(client_id)
            .with_payload(payload);
        self.send_to_client(client_id, envelope)
    }

    pub fn send_error_response(&self, client_id: &str, request_id: &str, error_text: &str) -> bool {
        let payload = json!({
            "requestId": request_id,
            "success": false,
            "error": error_text,
        });
        let envelope = Envelope::new(MessageType::Response)
            .with_client_id(client_id)
            .with_payload(payload);
        self.send_to_client(client_id, envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MpscChannel;

    fn registered_client(registry: &ClientRegistry, id: &str) -> tokio::sync::mpsc::UnboundedReceiver<Envelope> {
        let (chan, rx) = MpscChannel::pair(id);
        registry.register(id.to_string(), Arc::new(chan));
        rx
    }

    #[test]
    fn register_and_count() {
        let registry = ClientRegistry::new();
        let _rx = registered_client(&registry, "c1");
        assert_eq!(registry.get_client_count(), 1);
        assert_eq!(registry.get_all_client_ids(), vec!["c1".to_string()]);
    }

    #[test]
    fn unregister_removes_and_closes() {
        let registry = ClientRegistry::new();
        let _rx = registered_client(&registry, "c1");
        registry.unregister("c1");
        assert_eq!(registry.get_client_count(), 0);
        assert!(registry.get("c1").is_none());
    }

    #[test]
    fn send_to_unknown_client_returns_false_without_panicking() {
        let registry = ClientRegistry::new();
        assert!(!registry.send_to_client("ghost", Envelope::new(MessageType::StateUpdate)));
    }

    #[tokio::test]
    async fn broadcast_reaches_all_registered_clients() {
        let registry = ClientRegistry::new();
        let mut rx1 = registered_client(&registry, "c1");
        let mut rx2 = registered_client(&registry, "c2");

        registry.broadcast_to_all_clients(Envelope::new(MessageType::ClientConnected));

        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn broadcast_except_skips_originator() {
        let registry = ClientRegistry::new();
        let mut rx1 = registered_client(&registry, "c1");
        let mut rx2 = registered_client(&registry, "c2");

        registry.broadcast_except("c1", Envelope::new(MessageType::ClientDisconnected));

        assert!(rx2.recv().await.is_some());
        // c1 should not have received anything; dropping the registry's sender
        // side would hang recv() forever, so just check try_recv is empty.
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_response_shapes_payload() {
        let registry = ClientRegistry::new();
        let mut rx = registered_client(&registry, "c1");
        registry.send_response("c1", "r1", Some(json!({"message":"hi"})), true);
        let env = rx.recv().await.unwrap();
        assert_eq!(env.r#type, MessageType::Response);
        let payload = env.payload.unwrap();
        assert_eq!(payload["requestId"], "r1");
        assert_eq!(payload["success"], true);
    }
}
