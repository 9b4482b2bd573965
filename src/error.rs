use thiserror::Error;

/// Error taxonomy for the control plane. Every public async operation on the
/// Hub, an Edge client, or the remote-SDP bridge returns `Result<_, SipRelayError>`.
#[derive(Debug, Error)]
pub enum SipRelayError {
    /// A malformed or unauthenticated envelope arrived. Always dropped + logged
    /// at the point of arrival; never propagated to a requester.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A request's owning timer fired before a matching reply arrived.
    #[error("Request timed out: {action}")]
    Timeout { action: String, after_ms: u64 },

    /// An RSDB round trip to an Edge's peer worker (createOffer, setRemoteDescription,
    /// ...) didn't get a `SDP_RESPONSE` back before its own timer fired.
    #[error("timeout after {after_ms}ms: {operation}")]
    SdpTimeout { operation: String, after_ms: u64 },

    /// The Hub had no handler registered for `REQUEST.action`.
    #[error("Unknown request action: {action}")]
    UnknownAction { action: String },

    /// An operation was attempted out of phase (e.g. connect before initialize).
    #[error("bad state: expected {expected}, was {actual}")]
    BadState {
        expected: &'static str,
        actual: &'static str,
    },

    /// The SIP transport or registration reported failure.
    #[error("transport failure: {cause}")]
    TransportFailure { cause: String },

    /// The Edge could not service a peer-connection operation.
    #[error("media failure: {cause}")]
    MediaFailure { cause: String },

    /// A request was rejected because the channel it targeted has closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The underlying SIP transaction/dialog layer reported an error.
    #[error("sip stack error: {0}")]
    Sip(#[from] rsipstack::Error),

    /// The underlying WebRTC peer-connection layer reported an error.
    #[error("rtc error: {0}")]
    Rtc(String),
}

impl SipRelayError {
    pub fn timeout(action: impl Into<String>, after_ms: u64) -> Self {
        SipRelayError::Timeout {
            action: action.into(),
            after_ms,
        }
    }

    pub fn sdp_timeout(operation: impl Into<String>, after_ms: u64) -> Self {
        SipRelayError::SdpTimeout {
            operation: operation.into(),
            after_ms,
        }
    }

    pub fn bad_state(expected: &'static str, actual: &'static str) -> Self {
        SipRelayError::BadState { expected, actual }
    }
}

pub type Result<T> = std::result::Result<T, SipRelayError>;
