//! Drives SPEC_FULL.md §8 scenario 4's transport bring-up (initializeSip ->
//! connect) against a real `SipManager`, no mock/stub transport needed: UDP
//! has no handshake, so `connect()` binding a local socket and pointing it at
//! an address nobody is listening on still succeeds, the same way it would
//! against a real reachable server. Registration genuinely needs a UAS on
//! the other end to answer the REGISTER, so it isn't exercised here.

use siprelay::config::SipConfig;
use siprelay::{EdgeClient, EdgeClientConfig, Hub};

fn loopback_config() -> SipConfig {
    SipConfig {
        uri: "sip:edge-under-test@127.0.0.1".to_string(),
        ws_servers: vec!["127.0.0.1:59999".to_string()],
        transport_only: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn sip_init_then_connect_succeeds_without_a_live_registrar() {
    let hub = Hub::new();
    let (channel, from_hub) = hub.accept("edge-1");
    let edge = EdgeClient::new("edge-1", channel, from_hub, EdgeClientConfig::default());
    edge.initialize().await.expect("admission should succeed");

    let initialized = edge.initialize_sip(loopback_config()).await.expect("initializeSip should not error");
    assert!(initialized, "initializeSip should report success for a well-formed config");

    let connected = edge.connect_sip().await.expect("connectSip should not error");
    assert!(connected, "connect() over UDP has no handshake and should succeed locally");
}

#[tokio::test]
async fn init_with_incomplete_config_reports_failure_not_an_error() {
    let hub = Hub::new();
    let (channel, from_hub) = hub.accept("edge-1");
    let edge = EdgeClient::new("edge-1", channel, from_hub, EdgeClientConfig::default());
    edge.initialize().await.expect("admission should succeed");

    let mut cfg = loopback_config();
    cfg.uri.clear();
    let initialized = edge.initialize_sip(cfg).await.expect("a rejected config still resolves, not errors");
    assert!(!initialized, "a config missing uri/wsServers should report success:false");
}
