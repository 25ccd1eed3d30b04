//! Live-client fan-out backed by a tokio broadcast channel.
//!
//! Delivery is best-effort: events sent while nobody listens are dropped,
//! late subscribers only see what is sent after they subscribe, and a
//! subscriber that falls more than the channel capacity behind skips events.

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::{Device, DeviceStatus, Reading};

/// Default channel capacity for the live event bus.
pub const DEFAULT_CAPACITY: usize = 256;

/// Device projection pushed to live clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceView {
    pub id: i64,
    pub name: String,
    pub status: DeviceStatus,
    pub usage_seconds_today: i64,
    pub usage_date: NaiveDate,
}

impl From<&Device> for DeviceView {
    fn from(d: &Device) -> Self {
        Self {
            id: d.id,
            name: d.name.clone(),
            status: d.status,
            usage_seconds_today: d.usage_seconds_today,
            usage_date: d.usage_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum LiveEvent {
    #[serde(rename = "reading.created")]
    ReadingCreated(Reading),
    #[serde(rename = "device.updated")]
    DeviceUpdated(DeviceView),
}

impl LiveEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadingCreated(_) => "reading.created",
            Self::DeviceUpdated(_) => "device.updated",
        }
    }

    /// JSON of the payload alone, without the event envelope.
    pub fn data_json(&self) -> serde_json::Result<String> {
        match self {
            Self::ReadingCreated(r) => serde_json::to_string(r),
            Self::DeviceUpdated(d) => serde_json::to_string(d),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<LiveEvent>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Returns how many live clients the event was handed to.
    pub fn send(&self, event: LiveEvent) -> usize {
        // Err only means nobody is listening.
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
