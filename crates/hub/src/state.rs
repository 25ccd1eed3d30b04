use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::db::{Device, Reading};
use crate::stats::{DailyStats, StatsAccumulator};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<HubState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct HubState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub counters: Counters,
    pub today: Option<StatsAccumulator>,
    pub events: VecDeque<HubEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub readings_ingested: u64,
    pub acks_applied: u64,
    pub acks_unknown_device: u64,
    pub malformed_messages: u64,
    pub persistence_failures: u64,
    pub commands_published: u64,
}

#[derive(Clone, Serialize)]
pub struct HubEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Device,
    Command,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub counters: Counters,
    pub today: Option<DailyStats>,
    pub events: Vec<HubEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl HubState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            counters: Counters::default(),
            today: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Start the running day statistics from an aggregate over `rows`.
    pub fn seed_today(&mut self, date: NaiveDate, rows: &[Reading]) {
        let mut acc = StatsAccumulator::new(date);
        for r in rows {
            acc.push(r);
        }
        self.today = Some(acc);
    }

    /// Day the running statistics currently cover.
    pub fn today_date(&self) -> Option<NaiveDate> {
        self.today.as_ref().map(StatsAccumulator::date)
    }

    /// Record a persisted reading; `date` is its calendar day. Only readings
    /// of the day the running statistics cover are folded in.
    pub fn record_reading(&mut self, reading: &Reading, date: NaiveDate) {
        self.counters.readings_ingested += 1;
        if let Some(acc) = self.today.as_mut().filter(|acc| acc.date() == date) {
            acc.push(reading);
        }
        self.push_event(
            EventKind::Reading,
            format!(
                "reading #{} temp={} humid={} lux={}",
                reading.id,
                fmt_metric(reading.temperature),
                fmt_metric(reading.humidity),
                fmt_metric(reading.illuminance)
            ),
        );
    }

    /// Record an accepted device transition.
    pub fn record_transition(&mut self, device: &Device, accrued_secs: i64, action_by: &str) {
        self.counters.acks_applied += 1;
        self.push_event(
            EventKind::Device,
            format!(
                "{} -> {} by {action_by} (+{accrued_secs}s, {}s today)",
                device.name, device.status, device.usage_seconds_today
            ),
        );
    }

    pub fn record_unknown_ack(&mut self, detail: String) {
        self.counters.acks_unknown_device += 1;
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_malformed(&mut self, detail: String) {
        self.counters.malformed_messages += 1;
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_persistence_failure(&mut self, detail: String) {
        self.counters.persistence_failures += 1;
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_command(&mut self, detail: String) {
        self.counters.commands_published += 1;
        self.push_event(EventKind::Command, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            counters: self.counters.clone(),
            today: self.today.as_ref().map(StatsAccumulator::snapshot),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

fn fmt_metric(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_string(), |x| format!("{x:.1}"))
}
