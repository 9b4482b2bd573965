//! Call bookkeeping shared between the SIP manager and the message handler
//! (§3 `CallRecord`, `CallState`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRecordState {
    Incoming,
    Connecting,
    Connected,
    Ended,
}

/// A snapshot of one call as carried in `STATE_UPDATE.activeCall` (§3). The
/// live call flow (`sip/dialog.rs`, `dispatch.rs`) tracks state as the plain
/// `CALL_UPDATE` strings from the closed set in §6 instead of this struct —
/// there's exactly one call-state authority (the dialog loop) and its output
/// is already monotonic by construction, so a second enforcing type here
/// would just be a parallel representation to keep in sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: String,
    pub state: CallRecordState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    None,
    Registering,
    Registered,
    Unregistered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationStatus {
    pub state: RegistrationState,
}

impl Default for RegistrationStatus {
    fn default() -> Self {
        RegistrationStatus {
            state: RegistrationState::None,
        }
    }
}

/// Aggregated view returned in `STATE_UPDATE` envelopes (§3, §8 scenario 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallState {
    pub has_active_call: bool,
    pub active_call: Option<CallRecord>,
    pub registration: RegistrationStatus,
}

impl Default for CallState {
    fn default() -> Self {
        CallState {
            has_active_call: false,
            active_call: None,
            registration: RegistrationStatus::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_call_state_matches_scenario_1() {
        let state = CallState::default();
        assert!(!state.has_active_call);
        assert!(state.active_call.is_none());
        assert_eq!(state.registration.state, RegistrationState::None);
    }
}
