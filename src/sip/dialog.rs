//! Drains `DialogState` transitions from `rsipstack` and republishes them as
//! `CALL_UPDATE` envelopes (§4.F), cleaning up the matching RSDB session and
//! call-cancellation token once a dialog terminates.

use dashmap::DashMap;
use rsipstack::dialog::dialog::{Dialog, DialogState, DialogStateReceiver};
use rsipstack::dialog::dialog_layer::DialogLayer;
use rsipstack::Error;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, MessageType};
use crate::registry::ClientRegistry;
use crate::rsdb::RemoteSdpHandlerFactory;

pub async fn process_dialog(
    dialog_layer: Arc<DialogLayer>,
    mut state_receiver: DialogStateReceiver,
    registry: Arc<ClientRegistry>,
    rsdb: Arc<RemoteSdpHandlerFactory>,
    active_call_tokens: Arc<DashMap<String, CancellationToken>>,
) -> Result<(), Error> {
    while let Some(state) = state_receiver.recv().await {
        match state {
            DialogState::Calling(id) => {
                let dialog = match dialog_layer.get_dialog(&id) {
                    Some(d) => d,
                    None => {
                        warn!(dialog_id = %id, "Dialog not found for Calling state");
                        continue;
                    }
                };
                match dialog {
                    Dialog::ServerInvite(_) => {
                        debug!(dialog_id = %id, "server invite dialog created, awaiting Edge answer/reject");
                    }
                    Dialog::ClientInvite(_) => {
                        debug!(dialog_id = %id, "client invite dialog calling");
                        publish_call_update(&registry, &id.to_string(), "calling", None);
                    }
                    _ => debug!(dialog_id = %id, "other dialog type calling"),
                }
            }
            DialogState::Early(id, _resp) => {
                debug!(dialog_id = %id, "dialog entered Early state (ringing)");
                if let Some(Dialog::ClientInvite(_)) = dialog_layer.get_dialog(&id) {
                    publish_call_update(&registry, &id.to_string(), "calling", None);
                }
            }
            DialogState::Confirmed(id) => {
                info!(dialog_id = %id, "dialog confirmed");
                publish_call_update(&registry, &id.to_string(), "connected", None);
            }
            DialogState::Terminated(id, reason) => {
                info!(dialog_id = %id, reason = ?reason, "dialog terminated");
                dialog_layer.remove_dialog(&id);

                if let Some((_, token)) = active_call_tokens.remove(&id.to_string()) {
                    debug!(dialog_id = %id, "cancelling call token for cleanup");
                    token.cancel();
                }
                rsdb.remove_session(&id.to_string(), None).await;

                publish_call_update(&registry, &id.to_string(), "ended", Some(format!("{reason:?}")));
            }
            _ => debug!(state = %state, "dialog state changed"),
        }
    }
    Ok(())
}

fn publish_call_update(registry: &ClientRegistry, call_id: &str, state: &str, reason: Option<String>) {
    let envelope = Envelope::new(MessageType::CallUpdate).with_payload(json!({
        "callId": call_id,
        "state": state,
        "reason": reason,
    }));
    registry.broadcast_to_all_clients(envelope);
}
