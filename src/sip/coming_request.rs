//! Accepts inbound SIP transactions: routes in-dialog requests to their
//! matching `Dialog`, and turns a fresh out-of-dialog INVITE into a
//! `PendingCall` plus an `INCOMING_CALL` envelope (§4.F, §8 scenario — an
//! inbound call surfaces to every connected Edge so any one of them can claim
//! it via `REQUEST_ANSWER_CALL`).

use rsip::headers::UntypedHeader;
use rsip::prelude::HeadersExt;
use rsipstack::dialog::dialog::DialogStateSender;
use rsipstack::dialog::dialog_layer::DialogLayer;
use rsipstack::transaction::TransactionReceiver;
use rsipstack::{Error, Result};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, MessageType};
use crate::registry::ClientRegistry;
use crate::sip::state::PendingCall;

pub async fn process_incoming_request(
    dialog_layer: Arc<DialogLayer>,
    mut incoming: TransactionReceiver,
    state_sender: DialogStateSender,
    contact: rsip::Uri,
    registry: Arc<ClientRegistry>,
    pending_incoming: Arc<Mutex<HashMap<String, PendingCall>>>,
) -> Result<()> {
    while let Some(mut tx) = incoming.recv().await {
        let method = tx.original.method.to_string();
        let call_id = tx
            .original
            .call_id_header()
            .map(|h| h.value().to_string())
            .unwrap_or_else(|_| "no_call_id".to_string());

        debug!(method = %method, call_id = %call_id, "received incoming request");

        if tx.original.to_header()?.tag()?.is_some() {
            match dialog_layer.match_dialog(&tx) {
                Some(mut d) => {
                    debug!(method = %method, call_id = %call_id, "matched existing dialog");
                    tokio::spawn(async move {
                        d.handle(&mut tx).await?;
                        Ok::<_, Error>(())
                    });
                    continue;
                }
                None => {
                    warn!(method = %method, call_id = %call_id, "dialog not found, replying 481");
                    tx.reply(rsip::StatusCode::CallTransactionDoesNotExist).await?;
                    continue;
                }
            }
        }

        match tx.original.method {
            rsip::Method::Invite => {
                let already_pending = pending_incoming.lock().await.contains_key(&call_id);
                if already_pending {
                    debug!(call_id = %call_id, "INVITE retransmission for pending call, ignoring");
                    continue;
                }

                let caller = tx
                    .original
                    .from_header()
                    .ok()
                    .and_then(|h| h.uri().ok())
                    .map(|uri| uri.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let callee = tx
                    .original
                    .to_header()
                    .ok()
                    .and_then(|h| h.uri().ok())
                    .map(|uri| uri.to_string());
                let sdp_offer = String::from_utf8_lossy(&tx.original.body).to_string();

                info!(call_id = %call_id, caller = %caller, "incoming INVITE");

                let dialog = match dialog_layer.get_or_create_server_invite(
                    &tx,
                    state_sender.clone(),
                    None,
                    Some(contact.clone()),
                ) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(call_id = %call_id, error = ?e, "failed to create server dialog, replying 481");
                        tx.reply(rsip::StatusCode::CallTransactionDoesNotExist).await?;
                        continue;
                    }
                };

                if let Err(e) = dialog.ringing(None, None) {
                    warn!(call_id = %call_id, error = ?e, "failed to send 180 Ringing");
                    tx.reply(rsip::StatusCode::ServerInternalError).await?;
                    continue;
                }

                {
                    let mut pending = pending_incoming.lock().await;
                    pending.insert(
                        call_id.clone(),
                        PendingCall {
                            call_id: call_id.clone(),
                            caller: caller.clone(),
                            callee: callee.clone(),
                            dialog: rsipstack::dialog::dialog::Dialog::ServerInvite(dialog),
                            sdp_offer,
                        },
                    );
                }

                let envelope = Envelope::new(MessageType::IncomingCall).with_payload(json!({
                    "callId": call_id,
                    "caller": caller,
                    "callee": callee,
                }));
                registry.broadcast_to_all_clients(envelope);
            }
            rsip::Method::Ack => {
                let mut dialog = match dialog_layer.get_or_create_server_invite(
                    &tx,
                    state_sender.clone(),
                    None,
                    Some(contact.clone()),
                ) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(call_id = %call_id, error = ?e, "failed to match ACK to dialog, replying 481");
                        tx.reply(rsip::StatusCode::CallTransactionDoesNotExist).await?;
                        continue;
                    }
                };
                tokio::spawn(async move {
                    dialog.handle(&mut tx).await?;
                    Ok::<_, Error>(())
                });
            }
            _ => {
                debug!(method = %method, call_id = %call_id, "replying 200 OK to out-of-dialog request");
                tx.reply(rsip::StatusCode::OK).await?;
            }
        }
    }
    Ok(())
}
