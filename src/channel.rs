//! Bidirectional duplex port between one Edge and the Hub (§4.B).
//!
//! `post` is non-blocking: failure is reported synchronously as `false` and
//! logged, never raised as an error. Delivery is FIFO per endpoint pair — the
//! in-process implementation inherits that for free from `tokio::sync::mpsc`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::envelope::Envelope;

/// A duplex port. `post` is the send half; the receive half is handed out
/// separately at construction as a plain `mpsc::UnboundedReceiver` rather than
/// a registered callback, since pulling from a channel is the idiomatic Rust
/// shape for "new message arrived" where the source system used `onMessage`.
pub trait Channel: Send + Sync {
    /// Attempt to deliver `envelope`. Returns `false` (and logs) on failure —
    /// including posting after `close()` — rather than raising an error.
    fn post(&self, envelope: Envelope) -> bool;

    /// Idempotent. After `close()`, every subsequent `post` returns `false`.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// In-process channel backed by an unbounded `mpsc` pair. Used both for the
/// Hub's view of an Edge and for an Edge's view of the Hub when both run as
/// tasks in the same process.
pub struct MpscChannel {
    sender: mpsc::UnboundedSender<Envelope>,
    closed: Arc<AtomicBool>,
    label: String,
}

impl MpscChannel {
    /// Create a connected pair: `(local, remote_receiver)`. `local.post(..)`
    /// delivers into `remote_receiver`.
    pub fn pair(label: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let channel = MpscChannel {
            sender,
            closed: Arc::new(AtomicBool::new(false)),
            label: label.into(),
        };
        (channel, receiver)
    }
}

impl Channel for MpscChannel {
    fn post(&self, envelope: Envelope) -> bool {
        if self.closed.load(Ordering::Acquire) {
            warn!(channel = %self.label, "post after close, dropping envelope");
            return false;
        }
        match self.sender.send(envelope) {
            Ok(()) => true,
            Err(e) => {
                warn!(channel = %self.label, error = ?e, "post failed, receiver gone");
                false
            }
        }
    }

    fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(channel = %self.label, "channel closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;

    #[tokio::test]
    async fn posts_deliver_in_fifo_order() {
        let (chan, mut rx) = MpscChannel::pair("test");
        for i in 0..5 {
            assert!(chan.post(
                Envelope::new(MessageType::Request).with_request_id(i.to_string())
            ));
        }
        drop(chan);
        let mut seen = Vec::new();
        while let Some(env) = rx.recv().await {
            seen.push(env.request_id.unwrap());
        }
        assert_eq!(seen, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn post_after_close_returns_false() {
        let (chan, _rx) = MpscChannel::pair("test");
        chan.close();
        assert!(!chan.post(Envelope::new(MessageType::ClientDisconnected)));
    }

    #[tokio::test]
    async fn post_after_receiver_dropped_returns_false() {
        let (chan, rx) = MpscChannel::pair("test");
        drop(rx);
        assert!(!chan.post(Envelope::new(MessageType::ClientDisconnected)));
    }
}
