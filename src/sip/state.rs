//! Shared state records for the SIP manager (§4.F): dialogs in flight,
//! registration bookkeeping, and the SIP-flow inspector toggle.

use rsipstack::dialog::dialog::Dialog;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::rsdb::SessionId;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SipFlowConfig {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
}

/// A dialog with a bound RSDB session (§4.G), once negotiation has produced
/// one. Tracked so `endCall`/`sendDtmf` can find the dialog and session by
/// call id.
pub struct ActiveCall {
    pub call_id: String,
    pub dialog: Dialog,
    pub session_id: SessionId,
    pub cancel_token: CancellationToken,
}

/// An inbound INVITE that has been ACKed with 180 Ringing but not yet
/// accepted or rejected by an Edge (§4.F `requestAnswerCall`/`endCall`).
pub struct PendingCall {
    pub call_id: String,
    pub caller: String,
    pub callee: Option<String>,
    pub dialog: Dialog,
    pub sdp_offer: String,
}
