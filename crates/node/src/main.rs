mod devices;
mod sim;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use devices::{parse_command, DeviceBank};
use sim::{Climate, ClimateSim};

/// Sensor payload as the hub expects it.
#[derive(Debug, Serialize)]
struct SensorMsg {
    #[serde(flatten)]
    climate: Climate,
    measured_at: String,
}

#[derive(Debug, Clone, PartialEq)]
struct NodeConfig {
    host: String,
    port: u16,
    node_id: String,
    sample_every_s: u64,
    devices: Vec<String>,
    topic_sensors: String,
    topic_acks: String,
    topic_commands: String,
}

impl NodeConfig {
    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let devices = get("DEVICES")
            .unwrap_or_else(|| "fan,air-conditioner,light".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        Self {
            host: get("MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: get("MQTT_PORT").and_then(|s| s.parse().ok()).unwrap_or(1883),
            node_id: get("NODE_ID").unwrap_or_else(|| "room-1".to_string()),
            sample_every_s: get("SAMPLE_EVERY_S")
                .and_then(|s| s.parse().ok())
                .filter(|s| *s > 0)
                .unwrap_or(5),
            devices,
            topic_sensors: get("TOPIC_SENSORS").unwrap_or_else(|| "home/sensors".to_string()),
            topic_acks: get("TOPIC_ACKS").unwrap_or_else(|| "home/devices/ack".to_string()),
            topic_commands: get("TOPIC_COMMANDS").unwrap_or_else(|| "home/devices/set".to_string()),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = NodeConfig::from_lookup(|k| env::var(k).ok());

    let mut mqttoptions = MqttOptions::new(format!("iot-node-{}", cfg.node_id), &cfg.host, cfg.port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    let bank = Arc::new(Mutex::new(DeviceBank::new(cfg.devices.iter().cloned())));
    info!(node = %cfg.node_id, devices = cfg.devices.len(), "node starting");

    // Event loop: (re)subscribe on connect, answer commands with ACKs.
    {
        let client = client.clone();
        let bank = Arc::clone(&bank);
        let commands = cfg.topic_commands.clone();
        let acks = cfg.topic_acks.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("node connected to mqtt");
                        if let Err(e) = client.try_subscribe(commands.as_str(), QoS::AtMostOnce) {
                            warn!("subscribe {commands} failed: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) if p.topic == commands => {
                        let cmd = match parse_command(&p.payload) {
                            Ok(cmd) => cmd,
                            Err(e) => {
                                warn!("ignoring command: {e}");
                                continue;
                            }
                        };
                        let ack = match bank.lock() {
                            Ok(mut bank) => bank.apply(&cmd),
                            Err(e) => {
                                warn!("device state poisoned: {e}");
                                continue;
                            }
                        };
                        match serde_json::to_vec(&ack) {
                            Ok(payload) => match client.try_publish(acks.as_str(), QoS::AtMostOnce, false, payload) {
                                Ok(()) => info!(id = ?ack.id, name = ?ack.name, status = ?ack.status, "ack sent"),
                                Err(e) => warn!("ack publish failed: {e}"),
                            },
                            Err(e) => warn!("ack encode failed: {e}"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt error: {e}. retrying...");
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    info!(topic = %cfg.topic_sensors, every_s = cfg.sample_every_s, "publishing samples");
    let mut sim = ClimateSim::new(600.0);

    loop {
        let now = Utc::now();
        let light_on = bank.lock().map(|b| b.is_on("light")).unwrap_or(false);
        sim.set_light(light_on);

        let msg = SensorMsg {
            climate: sim.sample(now.timestamp_millis() as f64 / 1000.0),
            measured_at: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let payload = serde_json::to_vec(&msg).context("encode sample")?;

        match client.publish(&cfg.topic_sensors, QoS::AtMostOnce, false, payload).await {
            Ok(()) => debug!(?msg, "sample published"),
            Err(e) => warn!("publish error: {e}"),
        }

        sleep(Duration::from_secs(cfg.sample_every_s)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
