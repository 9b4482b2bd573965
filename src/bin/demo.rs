//! Runnable loopback demo: one in-process [`siprelay::Hub`] with two
//! in-process Edges, exercising the admission, echo, and unknown-action
//! scenarios end to end (see `tests/scenarios.rs` for the same walkthrough
//! as assertions, plus `tests/sip_lifecycle.rs` for SIP init/connect against
//! a real `SipManager` with no live registrar). Registration and the SDP
//! bridge need a UAS/peer actually answering on the other end, which this
//! crate doesn't simulate, so this binary doesn't drive them either.

use serde_json::json;
use std::time::Duration;

use siprelay::{EdgeClient, EdgeClientConfig, EdgeEvent, Hub};

#[tokio::main]
async fn main() {
    siprelay::logging::initialize_logging("info", true, "logs");

    let hub = Hub::new();

    let (channel_a, from_hub_a) = hub.accept("edge-a");
    let edge_a = EdgeClient::new("edge-a", channel_a, from_hub_a, EdgeClientConfig::default());
    let mut events_a = edge_a.subscribe();

    println!("-- scenario 1: admission --");
    let state = edge_a.initialize().await.expect("edge-a initialize");
    println!("edge-a initial state: {state}");

    let (channel_b, from_hub_b) = hub.accept("edge-b");
    let edge_b = EdgeClient::new("edge-b", channel_b, from_hub_b, EdgeClientConfig::default());
    edge_b.initialize().await.expect("edge-b initialize");

    if let Ok(EdgeEvent::Message(envelope)) = tokio::time::timeout(Duration::from_millis(200), events_a.recv()).await {
        println!("edge-a observed: {:?}", envelope.r#type);
    }

    println!("-- scenario 2: echo --");
    let echo = edge_a
        .request("echo", Some(json!({ "message": "hi" })))
        .await
        .expect("echo request");
    println!("echo reply: {echo}");

    println!("-- scenario 3: unknown action --");
    match edge_a.request("frobnicate", None).await {
        Ok(v) => println!("unexpected success: {v}"),
        Err(e) => println!("expected failure: {e}"),
    }

    edge_a.close().await;
    edge_b.close().await;
}
