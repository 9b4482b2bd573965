//! Builds an outbound INVITE whose SDP offer/answer are produced by an Edge
//! through the remote-SDP bridge (§4.F `makeCall`, §4.G) instead of a local
//! `PeerConnection`.

use std::sync::Arc;

use rsipstack::dialog::dialog::DialogStateSender;
use rsipstack::dialog::dialog_layer::DialogLayer;
use rsipstack::dialog::invitation::InviteOption;
use rsipstack::Error;
use tracing::{debug, info, warn};

use crate::rsdb::RemoteSdpHandler;

/// Negotiate and send one outbound INVITE. Returns the resulting client
/// dialog on a final 200 OK; any other final response closes the RSDB
/// session and surfaces as an error.
pub async fn make_call(
    dialog_layer: Arc<DialogLayer>,
    mut invite_option: InviteOption,
    state_sender: DialogStateSender,
    rsdb_session: Arc<RemoteSdpHandler>,
) -> rsipstack::Result<rsipstack::dialog::dialog::Dialog> {
    let caller = invite_option.caller.to_string();
    let callee = invite_option.callee.to_string();
    let call_id = invite_option.call_id.clone().unwrap_or_default();

    debug!(call_id = %call_id, caller = %caller, callee = %callee, "preparing outbound call");

    let sdp_offer = rsdb_session
        .get_description(None)
        .await
        .map_err(|e| Error::Error(format!("failed to obtain SDP offer from Edge: {e}")))?;
    invite_option.offer = Some(sdp_offer.into_bytes());

    info!(call_id = %call_id, "sending INVITE");
    let (dialog, resp) = dialog_layer.do_invite(invite_option, state_sender).await?;
    let resp = resp.ok_or_else(|| Error::Error("no response from remote".to_string()))?;

    if resp.status_code != rsip::StatusCode::OK {
        warn!(call_id = %call_id, callee = %callee, status_code = ?resp.status_code, "call rejected by remote");
        rsdb_session.close().await;
        return Err(Error::Error(format!("call rejected: {}", resp.status_code)));
    }

    info!(call_id = %call_id, callee = %callee, "call answered (200 OK)");
    let sdp_answer = String::from_utf8_lossy(resp.body()).to_string();

    rsdb_session
        .set_description(&sdp_answer, None)
        .await
        .map_err(|e| Error::Error(format!("failed to apply SDP answer: {e}")))?;

    Ok(rsipstack::dialog::dialog::Dialog::ClientInvite(dialog))
}
