// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CAN-over-MQTT transport between emulated machines.
//!
//! Frames handed to [`CanMqttBridge::on_frame_received`] are queued,
//! stamped with whatever bookkeeping the configured codec supports
//! (publisher id, publish counter, wall-clock timestamp), encoded and
//! published to `bus/can/{channel}/{cobId}` on the configured broker. The
//! bridge subscribes to `bus/can/{channel}/#` with the MQTT v5 *no-local*
//! option, so a broker that honors it never echoes the bridge's own
//! publications back; as a safeguard against brokers that do not, inbound
//! frames carrying the bridge's own publisher id are dropped anyway.
//!
//! The register-plane side of the emulator only ever touches the
//! non-blocking enqueue; everything network-shaped runs on two tokio
//! tasks (one publishing, one driving the MQTT event loop). Connection
//! loss is retried every five seconds, and each reconnect re-subscribes.
//! Dropping the bridge aborts both tasks: in-flight publishes are
//! abandoned and the queue is discarded.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use can_frame::{
    BinaryCodec, CanFrame, FrameCodec, FrameKind, JsonCodec, OptionalField, OptionalFields,
};
use rumqttc::v5::mqttbytes::v5::{Filter, Packet};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long to wait after a connection failure before trying again.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Wire format selection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Json,
    Binary,
}

impl FromStr for FrameFormat {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, BridgeError> {
        match s {
            "json" => Ok(FrameFormat::Json),
            "binary" => Ok(FrameFormat::Binary),
            other => Err(BridgeError::UnknownFormat(other.to_string())),
        }
    }
}

/// Construction-time configuration. Invalid combinations are fatal at
/// [`CanMqttBridge::start`].
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// `mqtt://host:port`.
    pub broker_uri: String,
    /// Appears in the topic; distinguishes independent buses sharing a
    /// broker.
    pub channel: u8,
    pub format: FrameFormat,
    /// Which optional fields the JSON codec carries. Any bit set here
    /// rejects the binary format.
    pub optional_fields: OptionalFields,
    /// Test harnesses may pin the otherwise-random publisher id.
    pub pub_id_override: Option<u32>,
}

impl BridgeConfig {
    pub fn new(broker_uri: impl Into<String>, channel: u8, format: FrameFormat) -> Self {
        Self {
            broker_uri: broker_uri.into(),
            channel,
            format,
            optional_fields: OptionalFields::empty(),
            pub_id_override: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("broker URI {0:?} is not of the form mqtt://host:port")]
    BadBrokerUri(String),
    #[error("unknown frame format {0:?}")]
    UnknownFormat(String),
    #[error("the binary format cannot carry optional fields")]
    BinaryWithOptionalFields,
}

/// Where the bridge's connection currently stands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
}

/// The bridge itself. One instance corresponds to one CAN controller's
/// attachment to the shared broker.
pub struct CanMqttBridge {
    tx: mpsc::UnboundedSender<FrameKind>,
    pub_id: u32,
    state: Arc<Mutex<LinkState>>,
    workers: Vec<JoinHandle<()>>,
}

impl CanMqttBridge {
    /// Validates the configuration, connects in the background and
    /// returns the bridge. `on_frame` is invoked from the event task for
    /// every frame received from other machines on the channel.
    pub fn start(
        config: BridgeConfig,
        runtime: &tokio::runtime::Handle,
        on_frame: impl Fn(CanFrame) + Send + Sync + 'static,
    ) -> Result<Self, BridgeError> {
        let (host, port) = parse_broker_uri(&config.broker_uri)?;
        let codec = build_codec(&config)?;
        let pub_id = config.pub_id_override.unwrap_or_else(rand::random);

        let mut options = MqttOptions::new(format!("can-bridge-{pub_id:08x}"), host, port);
        options.set_clean_start(true);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, eventloop) = AsyncClient::new(options, 64);

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(LinkState::Connecting));

        let workers = vec![
            runtime.spawn(publish_worker(
                rx,
                client.clone(),
                codec.clone(),
                config.channel,
                pub_id,
            )),
            runtime.spawn(event_worker(
                eventloop,
                client,
                codec,
                config.channel,
                pub_id,
                state.clone(),
                Arc::new(on_frame),
            )),
        ];

        Ok(Self {
            tx,
            pub_id,
            state,
            workers,
        })
    }

    /// Hands an outbound frame to the bridge. This is the emulator's hot
    /// path: it never blocks, and a failure (only possible once the
    /// workers are gone) is logged and swallowed.
    pub fn on_frame_received(&self, frame: FrameKind) {
        if self.tx.send(frame).is_err() {
            log::warn!("bridge: transmit queue is closed, dropping frame");
        }
    }

    /// The random per-instance publisher id.
    pub fn pub_id(&self) -> u32 {
        self.pub_id
    }

    pub fn link_state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }
}

impl Drop for CanMqttBridge {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

fn parse_broker_uri(uri: &str) -> Result<(String, u16), BridgeError> {
    let bad = || BridgeError::BadBrokerUri(uri.to_string());
    let rest = uri.strip_prefix("mqtt://").ok_or_else(bad)?;
    let (host, port) = rest.rsplit_once(':').ok_or_else(bad)?;
    if host.is_empty() {
        return Err(bad());
    }
    let port = port.parse::<u16>().map_err(|_| bad())?;
    Ok((host.to_string(), port))
}

fn build_codec(config: &BridgeConfig) -> Result<Arc<dyn FrameCodec>, BridgeError> {
    match config.format {
        FrameFormat::Json => Ok(Arc::new(JsonCodec::new(config.optional_fields))),
        FrameFormat::Binary => {
            if !config.optional_fields.is_empty() {
                return Err(BridgeError::BinaryWithOptionalFields);
            }
            Ok(Arc::new(BinaryCodec::new()))
        }
    }
}

/// Stamps an outbound frame with the optional fields the codec supports.
fn enrich(
    kind: FrameKind,
    codec: &dyn FrameCodec,
    pub_id: u32,
    pub_cnt: u32,
    now_us: u64,
) -> CanFrame {
    let mut frame = CanFrame::from(kind);
    if codec.supports_optional_field(OptionalField::PubId) {
        frame.pub_id = Some(pub_id);
    }
    if codec.supports_optional_field(OptionalField::PubCnt) {
        frame.pub_cnt = Some(pub_cnt);
    }
    if codec.supports_optional_field(OptionalField::TimeStamp) {
        frame.timestamp_us = Some(now_us);
    }
    frame
}

/// The per-identifier topic a frame publishes under. Error frames carry
/// no identifier; they use segment 0.
fn publish_topic(channel: u8, frame: &CanFrame) -> String {
    let id = frame.cob_id().map(|id| id.raw()).unwrap_or(0);
    format!("bus/can/{channel}/{id}")
}

fn subscribe_topic(channel: u8) -> String {
    format!("bus/can/{channel}/#")
}

/// Validates an inbound message. Returns the frame to deliver, or `None`
/// if it should be dropped (undecodable, topic mismatch, or our own
/// publication echoed by a broker without no-local support).
fn accept_inbound(
    codec: &dyn FrameCodec,
    channel: u8,
    own_pub_id: u32,
    topic: &str,
    payload: &[u8],
) -> Option<CanFrame> {
    let frame = match codec.decode(payload) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("bridge: undecodable frame on {topic:?}: {e}");
            return None;
        }
    };
    let expected = publish_topic(channel, &frame);
    if topic != expected {
        log::warn!(
            "bridge: frame arrived on {topic:?} but belongs on {expected:?}, dropping"
        );
        return None;
    }
    if frame.pub_id == Some(own_pub_id) {
        return None;
    }
    Some(frame)
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

async fn publish_worker(
    mut rx: mpsc::UnboundedReceiver<FrameKind>,
    client: AsyncClient,
    codec: Arc<dyn FrameCodec>,
    channel: u8,
    pub_id: u32,
) {
    // The counter is owned by this task; it advances only on successful
    // publishes.
    let mut pub_cnt: u32 = 0;
    while let Some(kind) = rx.recv().await {
        let frame = enrich(kind, &*codec, pub_id, pub_cnt, now_micros());
        let topic = publish_topic(channel, &frame);
        let wire = match codec.encode(&frame) {
            Ok(wire) => wire,
            Err(e) => {
                log::error!("bridge: cannot encode frame: {e}");
                continue;
            }
        };
        match client.publish(topic, QoS::AtMostOnce, false, wire).await {
            Ok(()) => pub_cnt = pub_cnt.wrapping_add(1),
            Err(e) => log::error!("bridge: publish failed: {e}"),
        }
    }
}

async fn event_worker(
    mut eventloop: EventLoop,
    client: AsyncClient,
    codec: Arc<dyn FrameCodec>,
    channel: u8,
    pub_id: u32,
    state: Arc<Mutex<LinkState>>,
    on_frame: Arc<dyn Fn(CanFrame) + Send + Sync>,
) {
    let set_state = |s: LinkState| *state.lock().unwrap() = s;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                set_state(LinkState::Connected);
                let mut filter = Filter::new(subscribe_topic(channel), QoS::AtMostOnce);
                filter.nolocal = true;
                match client.subscribe_many([filter]).await {
                    Ok(()) => set_state(LinkState::Subscribed),
                    Err(e) => log::error!("bridge: subscribe failed: {e}"),
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                if let Some(frame) =
                    accept_inbound(&*codec, channel, pub_id, &topic, &publish.payload)
                {
                    on_frame(frame);
                }
            }
            Ok(_) => {}
            Err(e) => {
                set_state(LinkState::Disconnected);
                log::warn!(
                    "bridge: connection lost: {e}; retrying in {}s",
                    RECONNECT_DELAY.as_secs()
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
                // The next poll reconnects and, through ConnAck,
                // re-subscribes.
                set_state(LinkState::Connecting);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_all() -> BridgeConfig {
        let mut config =
            BridgeConfig::new("mqtt://localhost:1883", 9, FrameFormat::Json);
        config.optional_fields = OptionalFields::all();
        config
    }

    #[test]
    fn broker_uri_parsing() {
        assert_eq!(
            parse_broker_uri("mqtt://broker.example:1883").unwrap(),
            ("broker.example".to_string(), 1883)
        );
        for bad in [
            "tcp://broker.example:1883",
            "mqtt://broker.example",
            "mqtt://:1883",
            "mqtt://broker.example:notaport",
        ] {
            assert_eq!(
                parse_broker_uri(bad).unwrap_err(),
                BridgeError::BadBrokerUri(bad.to_string())
            );
        }
    }

    #[test]
    fn format_from_str() {
        assert_eq!("json".parse::<FrameFormat>().unwrap(), FrameFormat::Json);
        assert_eq!(
            "binary".parse::<FrameFormat>().unwrap(),
            FrameFormat::Binary
        );
        assert_eq!(
            "cbor".parse::<FrameFormat>().unwrap_err(),
            BridgeError::UnknownFormat("cbor".to_string())
        );
    }

    #[test]
    fn binary_format_rejects_optional_fields() {
        let mut config = BridgeConfig::new("mqtt://h:1", 0, FrameFormat::Binary);
        config.optional_fields = OptionalFields::PUB_ID;
        assert_eq!(
            build_codec(&config).unwrap_err(),
            BridgeError::BinaryWithOptionalFields
        );
        config.optional_fields = OptionalFields::empty();
        assert!(build_codec(&config).is_ok());
    }

    #[test]
    fn enrich_respects_codec_support() {
        let kind = CanFrame::data(0x123, &[1]).unwrap().kind;

        let json = JsonCodec::new(OptionalFields::PUB_ID | OptionalFields::TIME_STAMP);
        let frame = enrich(kind.clone(), &json, 7, 3, 99);
        assert_eq!(frame.pub_id, Some(7));
        assert_eq!(frame.pub_cnt, None);
        assert_eq!(frame.timestamp_us, Some(99));

        let frame = enrich(kind, &BinaryCodec::new(), 7, 3, 99);
        assert!(!frame.has_optional_fields());
    }

    #[test]
    fn topics_per_identifier() {
        let data = CanFrame::data(0x123, &[]).unwrap();
        assert_eq!(publish_topic(5, &data), "bus/can/5/291");
        assert_eq!(publish_topic(5, &CanFrame::error()), "bus/can/5/0");
        assert_eq!(subscribe_topic(5), "bus/can/5/#");
    }

    #[test]
    fn inbound_filtering() {
        let codec = JsonCodec::new(OptionalFields::all());
        let mut frame = CanFrame::data(0x10, &[4, 5]).unwrap();
        frame.pub_id = Some(111);
        let wire = codec.encode(&frame).unwrap();

        // A well-formed foreign frame is delivered.
        let got = accept_inbound(&codec, 2, 999, "bus/can/2/16", &wire).unwrap();
        assert_eq!(got, frame);

        // Undecodable payloads, topic mismatches and our own echoes are
        // not.
        assert!(accept_inbound(&codec, 2, 999, "bus/can/2/16", b"junk").is_none());
        assert!(accept_inbound(&codec, 2, 999, "bus/can/2/17", &wire).is_none());
        assert!(accept_inbound(&codec, 2, 111, "bus/can/2/16", &wire).is_none());
    }

    #[test]
    fn pub_id_override_is_honored() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mut config = json_all();
        config.pub_id_override = Some(0x1234_5678);
        let bridge = CanMqttBridge::start(config, runtime.handle(), |_| {}).unwrap();
        assert_eq!(bridge.pub_id(), 0x1234_5678);
    }

    #[test]
    fn enqueue_is_nonblocking_without_a_broker() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        // Port 1 is about as unlikely to host a broker as it gets; the
        // bridge must still construct and accept frames.
        let config = BridgeConfig::new("mqtt://127.0.0.1:1", 3, FrameFormat::Binary);
        let bridge = CanMqttBridge::start(config, runtime.handle(), |_| {}).unwrap();
        for _ in 0..1000 {
            bridge.on_frame_received(CanFrame::remote(0x42).unwrap().kind);
        }
        assert!(matches!(
            bridge.link_state(),
            LinkState::Connecting | LinkState::Disconnected
        ));
    }
}
