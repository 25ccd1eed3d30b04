//! Broker bridge: the hub's single MQTT connection.
//!
//! Inbound publishes are parsed and routed by topic. Sensor payloads queue
//! on a single bounded lane; ACKs go to one of a fixed set of lanes picked
//! by device identity, so one device's ACKs apply in delivery order while
//! different devices proceed in parallel. A full lane holds up the poll
//! loop instead of growing without bound.

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::commands::Publish;
use crate::config::TopicConfig;
use crate::ingest::Ingestor;
use crate::mqtt::{parse_object, route, AckMsg, Route};
use crate::reconciler::Reconciler;
use crate::state::SharedState;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const LANE_CAPACITY: usize = 256;
pub const DEFAULT_ACK_LANES: usize = 8;

// ---------------------------------------------------------------------------
// Connection settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
}

impl MqttSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let credentials = match (get("MQTT_USER"), get("MQTT_PASS")) {
            (Some(u), Some(p)) if !u.is_empty() => Some((u, p)),
            _ => None,
        };
        Self {
            host: get("MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: get("MQTT_PORT").and_then(|s| s.parse().ok()).unwrap_or(1883),
            client_id: get("MQTT_CLIENT_ID").unwrap_or_else(|| "iot-hub".to_string()),
            credentials,
        }
    }

    pub fn options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(&self.client_id, &self.host, self.port);
        opts.set_keep_alive(Duration::from_secs(30));
        if let Some((user, pass)) = &self.credentials {
            opts.set_credentials(user, pass);
        }
        opts
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BrokerHandle {
    client: AsyncClient,
}

impl BrokerHandle {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl Publish for BrokerHandle {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        // Never waits on the event loop; a full request queue is an error.
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .with_context(|| format!("failed to queue publish on {topic}"))
    }
}

/// Topic subscription on the broker connection.
pub trait Subscribe {
    fn subscribe(&self, topic: &str) -> Result<()>;
}

impl Subscribe for AsyncClient {
    fn subscribe(&self, topic: &str) -> Result<()> {
        self.try_subscribe(topic, QoS::AtMostOnce)
            .with_context(|| format!("failed to queue subscribe on {topic}"))
    }
}

// ---------------------------------------------------------------------------
// Sensor lane
// ---------------------------------------------------------------------------

pub struct SensorLane {
    tx: mpsc::Sender<Map<String, Value>>,
}

impl SensorLane {
    /// Start the single consumer feeding the ingestor.
    pub fn spawn(ingestor: Ingestor) -> Self {
        let (tx, mut rx) = mpsc::channel::<Map<String, Value>>(LANE_CAPACITY);
        tokio::spawn(async move {
            while let Some(map) = rx.recv().await {
                ingestor.handle(map).await;
            }
            debug!("sensor lane closed");
        });
        Self { tx }
    }

    pub async fn submit(&self, map: Map<String, Value>) -> Result<()> {
        self.tx
            .send(map)
            .await
            .map_err(|_| anyhow::anyhow!("sensor lane is closed"))
    }
}

// ---------------------------------------------------------------------------
// Ordered ACK lanes
// ---------------------------------------------------------------------------

pub struct AckLanes {
    lanes: Vec<mpsc::Sender<AckMsg>>,
}

impl AckLanes {
    /// Start `count` single-consumer lanes feeding the reconciler.
    pub fn spawn(count: usize, reconciler: Arc<Reconciler>) -> Self {
        let lanes = (0..count.max(1))
            .map(|lane| {
                let (tx, mut rx) = mpsc::channel::<AckMsg>(LANE_CAPACITY);
                let reconciler = Arc::clone(&reconciler);
                tokio::spawn(async move {
                    while let Some(ack) = rx.recv().await {
                        reconciler.handle(ack).await;
                    }
                    debug!(lane, "ack lane closed");
                });
                tx
            })
            .collect();
        Self { lanes }
    }

    pub fn lane_for(&self, key: &str) -> usize {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        (h.finish() % self.lanes.len() as u64) as usize
    }

    pub async fn submit(&self, ack: AckMsg) -> Result<()> {
        let lane = self.lane_for(&ack.lane_key());
        self.lanes[lane]
            .send(ack)
            .await
            .map_err(|_| anyhow::anyhow!("ack lane {lane} is closed"))
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    topics: TopicConfig,
    sensors: SensorLane,
    lanes: AckLanes,
    shared: SharedState,
}

impl Dispatcher {
    pub fn new(topics: TopicConfig, sensors: SensorLane, lanes: AckLanes, shared: SharedState) -> Self {
        Self { topics, sensors, lanes, shared }
    }

    /// Route one delivered message. Malformed payloads stop here.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) {
        let Some(kind) = route(topic, &self.topics) else {
            debug!(topic, "message on unhandled topic ignored");
            return;
        };

        let map = match parse_object(payload) {
            Ok(map) => map,
            Err(reason) => return self.malformed(topic, reason).await,
        };

        match kind {
            Route::Sensor => {
                if let Err(e) = self.sensors.submit(map).await {
                    error!(topic, "sensor message dropped: {e:#}");
                }
            }
            Route::Ack => match AckMsg::from_map(&map) {
                Ok(ack) => {
                    if let Err(e) = self.lanes.submit(ack).await {
                        error!(topic, "ack dropped: {e:#}");
                    }
                }
                Err(reason) => self.malformed(topic, reason).await,
            },
        }
    }

    async fn malformed(&self, topic: &str, reason: String) {
        warn!(topic, %reason, "malformed message dropped");
        self.shared
            .write()
            .await
            .record_malformed(format!("{topic}: {reason}"));
    }

    fn subscribe_all(&self, client: &impl Subscribe) {
        for topic in [&self.topics.sensors, &self.topics.acks] {
            match client.subscribe(topic) {
                Ok(()) => info!(topic = %topic, "subscribed"),
                Err(e) => error!(topic = %topic, "subscribe failed: {e:#}"),
            }
        }
    }

    /// Apply one event-loop result. Every ConnAck re-subscribes both inbound
    /// topics; transport errors ask the caller to back off.
    async fn on_event<E: fmt::Display>(
        &self,
        client: &impl Subscribe,
        event: std::result::Result<Event, E>,
    ) -> Next {
        match event {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                self.dispatch(&p.topic, &p.payload).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                self.subscribe_all(client);
                let mut st = self.shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected by broker");
                let mut st = self.shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}; reconnecting in {}s", RECONNECT_DELAY.as_secs());
                let mut st = self.shared.write().await;
                if st.mqtt_connected {
                    st.record_system(format!("mqtt connection lost: {e}"));
                }
                st.mqtt_connected = false;
                return Next::Backoff;
            }
        }
        Next::Continue
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Continue,
    Backoff,
}

/// Drive the event loop until shutdown. The transport reconnects on the next
/// poll after an error.
pub async fn run(
    mut eventloop: EventLoop,
    client: AsyncClient,
    dispatcher: Dispatcher,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            ev = eventloop.poll() => ev,
        };

        if dispatcher.on_event(&client, event).await == Next::Backoff {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    if let Err(e) = client.try_disconnect() {
        debug!("mqtt disconnect on shutdown: {e}");
    }
    info!("broker bridge stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
