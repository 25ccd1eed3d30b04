//! Device state reconciler: the only writer of device status and usage.
//!
//! Each ACK runs identity resolution, day rollover, usage accrual, commit,
//! audit and announce as one unit while holding that device's lock.
//!
//! ```text
//!        ACK ON (no accrual)          ACK OFF (accrue now - last change)
//!   OFF ─────────────────────▶ ON ───────────────────────────────────▶ OFF
//!    ▲ │                        │ ▲
//!    └─┘ ACK OFF (refresh)      └─┘ ACK ON (refresh)
//! ```

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::clock::Calendar;
use crate::commands::{Claim, PendingCommands};
use crate::db::{ActionEntry, Db, Device, DeviceStatus, StateCommit};
use crate::events::{Broadcaster, DeviceView, LiveEvent};
use crate::mqtt::AckMsg;
use crate::state::SharedState;

/// Attribution for transitions no tracked command asked for.
pub const SYSTEM_ATTRIBUTION: &str = "System";

// ---------------------------------------------------------------------------
// Pure transition logic
// ---------------------------------------------------------------------------

/// Usage fields after day rollover. A stale `usage_date` reads as zero
/// seconds for `today`.
pub fn rolled(device: &Device, today: NaiveDate) -> (i64, NaiveDate) {
    if device.usage_date == today {
        (device.usage_seconds_today, device.usage_date)
    } else {
        (0, today)
    }
}

/// Apply the rollover rule to a device read for display.
pub fn rolled_for_read(mut device: Device, today: NaiveDate) -> Device {
    let (secs, date) = rolled(&device, today);
    device.usage_seconds_today = secs;
    device.usage_date = date;
    device
}

/// Whole seconds of ON time to add for this transition. Only ON→OFF with a
/// known previous change accrues; clock skew never accrues negative time.
pub fn accrual(device: &Device, incoming: DeviceStatus, now: DateTime<Utc>) -> i64 {
    match (device.status, incoming, device.last_state_changed_at) {
        (DeviceStatus::On, DeviceStatus::Off, Some(since)) => (now - since).num_seconds().max(0),
        _ => 0,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub commit: StateCommit,
    pub accrued_secs: i64,
}

pub fn plan_transition(
    device: &Device,
    incoming: DeviceStatus,
    now: DateTime<Utc>,
    today: NaiveDate,
    action_by: String,
) -> Plan {
    let (base_secs, usage_date) = rolled(device, today);
    let accrued_secs = accrual(device, incoming, now);
    Plan {
        commit: StateCommit {
            device_id: device.id,
            status: incoming,
            usage_seconds_today: base_secs.saturating_add(accrued_secs),
            usage_date,
            changed_at: now,
            action_by,
        },
        accrued_secs,
    }
}

// ---------------------------------------------------------------------------
// Keyed lock table
// ---------------------------------------------------------------------------

/// One async mutex per device id.
#[derive(Default)]
pub struct DeviceLocks {
    inner: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl DeviceLocks {
    pub async fn lock(&self, device_id: i64) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().await;
            Arc::clone(map.entry(device_id).or_default())
        };
        slot.lock_owned().await
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied {
        device: Device,
        entry: ActionEntry,
        accrued_secs: i64,
    },
    UnknownDevice,
}

pub struct Reconciler {
    db: Db,
    bus: Broadcaster,
    calendar: Calendar,
    pending: Arc<PendingCommands>,
    shared: SharedState,
    locks: DeviceLocks,
}

impl Reconciler {
    pub fn new(
        db: Db,
        bus: Broadcaster,
        calendar: Calendar,
        pending: Arc<PendingCommands>,
        shared: SharedState,
    ) -> Self {
        Self {
            db,
            bus,
            calendar,
            pending,
            shared,
            locks: DeviceLocks::default(),
        }
    }

    /// Handle an ACK from the broker. Errors are logged and contained.
    pub async fn handle(&self, ack: AckMsg) {
        if let Err(e) = self.apply(ack.clone()).await {
            error!(identity = ?ack.identity, status = %ack.status, "reconcile failed: {e:#}");
        }
    }

    pub async fn apply(&self, ack: AckMsg) -> Result<Outcome> {
        // Step 1: identity.
        let Some(found) = self.db.resolve_device(&ack.identity).await? else {
            return Ok(self.discard_unknown(&ack).await);
        };

        let _guard = self.locks.lock(found.id).await;

        // Re-read under the lock; an earlier holder may have changed it.
        let Some(device) = self.db.device_by_id(found.id).await? else {
            return Ok(self.discard_unknown(&ack).await);
        };

        let now = self.calendar.now();
        let today = self.calendar.zone().date_of(now);
        let (action_by, claim) = self.attribution(&ack, device.id, now).await;

        // Steps 2-3: rollover then accrual.
        let plan = plan_transition(&device, ack.status, now, today, action_by);
        if plan.commit.usage_date != device.usage_date {
            debug!(device = %device.name, from = %device.usage_date, to = %today, "usage day rollover");
        }

        // Steps 4-5: commit + audit, atomically.
        let (device, entry) = match self.db.commit_transition(&plan.commit).await {
            Ok(v) => v,
            Err(e) => {
                self.shared
                    .write()
                    .await
                    .record_persistence_failure(format!("device {}: {e}", plan.commit.device_id));
                return Err(e);
            }
        };
        if let Some(claim) = claim {
            self.pending.release(device.id, claim.ticket).await;
        }

        info!(
            device_id = device.id,
            device = %device.name,
            status = %device.status,
            accrued_secs = plan.accrued_secs,
            usage_seconds_today = device.usage_seconds_today,
            action_by = %entry.action_by,
            "device state reconciled"
        );

        // Step 6: announce.
        self.bus.send(LiveEvent::DeviceUpdated(DeviceView::from(&device)));
        self.shared
            .write()
            .await
            .record_transition(&device, plan.accrued_secs, &entry.action_by);

        Ok(Outcome::Applied {
            device,
            entry,
            accrued_secs: plan.accrued_secs,
        })
    }

    /// Explicit ACK attribution, then a matching tracked command, then system.
    /// A tracked command is only consumed once the transition commits.
    async fn attribution(
        &self,
        ack: &AckMsg,
        device_id: i64,
        now: DateTime<Utc>,
    ) -> (String, Option<Claim>) {
        if let Some(by) = &ack.action_by {
            return (by.clone(), None);
        }
        match self.pending.claim(device_id, ack.status, now).await {
            Some(claim) => (claim.action_by.clone(), Some(claim)),
            None => (SYSTEM_ATTRIBUTION.to_string(), None),
        }
    }

    async fn discard_unknown(&self, ack: &AckMsg) -> Outcome {
        warn!(identity = ?ack.identity, status = %ack.status, "ack for unknown device discarded");
        self.shared
            .write()
            .await
            .record_unknown_ack(format!("ack for unknown device {:?}", ack.identity));
        Outcome::UnknownDevice
    }
}

// ===========================================================================
// Tests
// ===========================================================================
