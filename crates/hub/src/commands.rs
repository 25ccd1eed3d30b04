//! Command publisher: turns an operator's desired state into a command on
//! the broker. It never touches device state; that only changes when the
//! device's ACK reaches the reconciler.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::clock::Calendar;
use crate::db::{Db, DeviceIdentity, DeviceStatus};
use crate::mqtt::{status_fields, CommandMsg};
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Outbound port
// ---------------------------------------------------------------------------

/// Fire-and-forget publish. `Ok` means the transport accepted the message,
/// not that anyone received it.
pub trait Publish: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> impl Future<Output = anyhow::Result<()>> + Send;
}

impl<T: Publish> Publish for Arc<T> {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> impl Future<Output = anyhow::Result<()>> + Send {
        (**self).publish(topic, payload)
    }
}

// ---------------------------------------------------------------------------
// Pending attribution
// ---------------------------------------------------------------------------

const MAX_TTL_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Clone)]
struct PendingCommand {
    ticket: u64,
    status: DeviceStatus,
    action_by: String,
    issued_at: DateTime<Utc>,
}

/// A matching pending command, still held until [`PendingCommands::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub ticket: u64,
    pub action_by: String,
}

#[derive(Default)]
struct PendingTable {
    next_ticket: u64,
    by_device: HashMap<i64, PendingCommand>,
}

/// Attribution of published commands awaiting their ACK, one per device.
pub struct PendingCommands {
    ttl: Duration,
    inner: Mutex<PendingTable>,
}

impl PendingCommands {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::seconds(ttl_secs.min(MAX_TTL_SECS) as i64),
            inner: Mutex::new(PendingTable::default()),
        }
    }

    /// Replaces any earlier entry for the device. The returned ticket
    /// identifies this entry for [`release`](Self::release).
    pub async fn record(
        &self,
        device_id: i64,
        status: DeviceStatus,
        action_by: String,
        issued_at: DateTime<Utc>,
    ) -> u64 {
        let mut table = self.inner.lock().await;
        table.next_ticket += 1;
        let ticket = table.next_ticket;
        table.by_device.insert(
            device_id,
            PendingCommand { ticket, status, action_by, issued_at },
        );
        ticket
    }

    /// Look up an unexpired command for `device_id` with the same status.
    /// Expired entries are dropped; the match itself stays recorded.
    pub async fn claim(&self, device_id: i64, status: DeviceStatus, now: DateTime<Utc>) -> Option<Claim> {
        let mut table = self.inner.lock().await;
        let pending = table.by_device.get(&device_id)?;
        if now - pending.issued_at > self.ttl {
            table.by_device.remove(&device_id);
            return None;
        }
        (pending.status == status).then(|| Claim {
            ticket: pending.ticket,
            action_by: pending.action_by.clone(),
        })
    }

    /// Remove the device's entry if it is still the one `ticket` names.
    pub async fn release(&self, device_id: i64, ticket: u64) {
        let mut table = self.inner.lock().await;
        if table.by_device.get(&device_id).is_some_and(|p| p.ticket == ticket) {
            table.by_device.remove(&device_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("either id or name is required")]
    MissingIdentity,
    #[error("device not found")]
    NotFound,
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
    #[error("publish failed: {0}")]
    Publish(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub identity: DeviceIdentity,
    pub status: DeviceStatus,
    pub action_by: Option<String>,
}

impl CommandRequest {
    /// Parse a `{id?, name?, status, actionBy?}` request body.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self, String> {
        let (identity, status, action_by) = status_fields(map)?;
        Ok(Self { identity, status, action_by })
    }
}

/// What was handed to the broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandReceipt {
    pub topic: String,
    pub payload: String,
}

pub struct CommandPublisher<P> {
    db: Db,
    publisher: P,
    topic: String,
    pending: Arc<PendingCommands>,
    calendar: Calendar,
    shared: SharedState,
}

impl<P: Publish> CommandPublisher<P> {
    pub fn new(
        db: Db,
        publisher: P,
        topic: String,
        pending: Arc<PendingCommands>,
        calendar: Calendar,
        shared: SharedState,
    ) -> Self {
        Self { db, publisher, topic, pending, calendar, shared }
    }

    pub async fn request(&self, req: CommandRequest) -> Result<CommandReceipt, CommandError> {
        if req.identity.is_empty() {
            return Err(CommandError::MissingIdentity);
        }
        let device = self
            .db
            .resolve_device(&req.identity)
            .await?
            .ok_or(CommandError::NotFound)?;

        let action_by = req.action_by.filter(|s| !s.trim().is_empty());
        let msg = CommandMsg {
            id: device.id,
            name: Some(device.name.clone()),
            status: req.status,
            action_by: action_by.clone(),
        };
        let payload =
            serde_json::to_string(&msg).map_err(|e| CommandError::Publish(e.to_string()))?;

        // Recorded first so a fast ACK still finds it.
        let ticket = match &action_by {
            Some(by) => Some(
                self.pending
                    .record(device.id, req.status, by.clone(), self.calendar.now())
                    .await,
            ),
            None => None,
        };

        if let Err(e) = self.publisher.publish(&self.topic, payload.clone().into_bytes()).await {
            if let Some(ticket) = ticket {
                self.pending.release(device.id, ticket).await;
            }
            warn!(device_id = device.id, topic = %self.topic, "command publish failed: {e:#}");
            return Err(CommandError::Publish(format!("{e:#}")));
        }

        info!(
            device_id = device.id,
            device = %device.name,
            status = %req.status,
            topic = %self.topic,
            "command published"
        );
        self.shared
            .write()
            .await
            .record_command(format!("{} -> {} requested", device.name, req.status));

        Ok(CommandReceipt {
            topic: self.topic.clone(),
            payload,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
