// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end round trip through a real MQTT broker.
//!
//! Needs a v5 broker; point `BRIDGE_TEST_BROKER` at it (for instance
//! `mqtt://127.0.0.1:1883` with a local mosquitto) and run
//!
//!     cargo test -p mqtt-can-bridge -- --ignored

use std::time::Duration;

use can_frame::{CanFrame, OptionalFields};
use mqtt_can_bridge::{BridgeConfig, CanMqttBridge, FrameFormat, LinkState};
use tokio::sync::mpsc;

fn broker() -> Option<String> {
    std::env::var("BRIDGE_TEST_BROKER").ok()
}

async fn wait_subscribed(bridge: &CanMqttBridge) {
    for _ in 0..100 {
        if bridge.link_state() == LinkState::Subscribed {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("bridge never reached the subscribed state");
}

#[tokio::test]
#[ignore = "requires an MQTT broker (set BRIDGE_TEST_BROKER)"]
async fn two_bridges_round_trip_without_self_delivery() {
    env_logger::builder().is_test(true).try_init().ok();
    let Some(broker) = broker() else {
        panic!("BRIDGE_TEST_BROKER is not set");
    };

    let mut config = BridgeConfig::new(broker, 7, FrameFormat::Json);
    config.optional_fields = OptionalFields::all();

    let handle = tokio::runtime::Handle::current();

    let (a_tx, mut a_rx) = mpsc::unbounded_channel();
    let a = CanMqttBridge::start(config.clone(), &handle, move |frame| {
        a_tx.send(frame).unwrap();
    })
    .unwrap();

    let (b_tx, mut b_rx) = mpsc::unbounded_channel();
    let b = CanMqttBridge::start(config, &handle, move |frame| {
        b_tx.send(frame).unwrap();
    })
    .unwrap();

    wait_subscribed(&a).await;
    wait_subscribed(&b).await;

    let sent = CanFrame::data(0x123, &[1, 2, 3]).unwrap();
    a.on_frame_received(sent.kind.clone());

    let got: CanFrame = tokio::time::timeout(Duration::from_secs(5), b_rx.recv())
        .await
        .expect("instance B never received the frame")
        .unwrap();

    assert_eq!(got.kind, sent.kind);
    assert_eq!(got.pub_id, Some(a.pub_id()));
    assert_eq!(got.pub_cnt, Some(0));
    assert!(got.timestamp_us.is_some());

    // Instance A must not see its own publication, whether the broker
    // honors no-local or the pubId safeguard has to catch it.
    assert!(
        tokio::time::timeout(Duration::from_secs(1), a_rx.recv())
            .await
            .is_err(),
        "instance A received its own publication"
    );
}
