pub mod call;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod edge_client;
pub mod envelope;
pub mod error;
pub mod hub;
pub mod logging;
pub mod peer_worker;
pub mod registry;
pub mod rsdb;
pub mod signal;
pub mod sip;
pub mod sip_manager;

pub use call::{CallRecord, CallRecordState, CallState};
pub use channel::{Channel, MpscChannel};
pub use config::SipConfig;
pub use edge_client::{EdgeClient, EdgeClientConfig, EdgeEvent};
pub use envelope::{Envelope, MessageType};
pub use error::{Result, SipRelayError};
pub use hub::Hub;
pub use peer_worker::PeerWorker;
pub use registry::ClientRegistry;
