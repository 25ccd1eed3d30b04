//! Operations the HTTP layer invokes on the core. Reads go straight to the
//! stores; the only write path offered is a command request.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::broadcast;

use crate::clock::Calendar;
use crate::commands::{CommandError, CommandPublisher, CommandReceipt, CommandRequest, Publish};
use crate::db::{ActionEntry, Db, Device, Reading};
use crate::events::{Broadcaster, LiveEvent};
use crate::reconciler::rolled_for_read;
use crate::state::{SharedState, StatusResponse};
use crate::stats::{self, DailyStats};

pub const DEFAULT_READINGS_LIMIT: i64 = 50;
pub const MAX_READINGS_LIMIT: i64 = 1000;
pub const DEFAULT_HISTORY_LIMIT: i64 = 100;

pub struct Hub<P> {
    db: Db,
    calendar: Calendar,
    bus: Broadcaster,
    shared: SharedState,
    commands: CommandPublisher<P>,
}

impl<P: Publish> Hub<P> {
    pub fn new(
        db: Db,
        calendar: Calendar,
        bus: Broadcaster,
        shared: SharedState,
        commands: CommandPublisher<P>,
    ) -> Self {
        Self { db, calendar, bus, shared, commands }
    }

    /// Devices by id; a stale usage day reads as zero for today.
    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let today = self.calendar.today();
        Ok(self
            .db
            .list_devices()
            .await?
            .into_iter()
            .map(|d| rolled_for_read(d, today))
            .collect())
    }

    pub async fn request_device_command(
        &self,
        req: CommandRequest,
    ) -> Result<CommandReceipt, CommandError> {
        self.commands.request(req).await
    }

    pub async fn latest_reading(&self) -> Result<Option<Reading>> {
        self.db.latest_reading().await
    }

    /// Newest first. `limit` is clamped to `1..=MAX_READINGS_LIMIT`.
    pub async fn readings(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Vec<Reading>> {
        let limit = limit
            .unwrap_or(DEFAULT_READINGS_LIMIT)
            .clamp(1, MAX_READINGS_LIMIT);
        self.db.readings(from, to, limit).await
    }

    pub async fn action_history(&self, limit: Option<i64>) -> Result<Vec<ActionEntry>> {
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_READINGS_LIMIT);
        self.db.action_history(limit).await
    }

    /// Hi/lo/avg over readings measured during `date` (today when `None`).
    pub async fn daily_stats(&self, date: Option<NaiveDate>) -> Result<DailyStats> {
        let date = date.unwrap_or_else(|| self.calendar.today());
        let (start, end) = self.calendar.day_bounds(date);
        let rows = self.db.readings_between(start, end).await?;
        Ok(stats::daily_stats(date, &rows))
    }

    /// Prime the running stats for today from what is already stored.
    pub async fn seed_today_stats(&self) -> Result<()> {
        let today = self.calendar.today();
        let (start, end) = self.calendar.day_bounds(today);
        let rows = self.db.readings_between(start, end).await?;
        self.shared.write().await.seed_today(today, &rows);
        Ok(())
    }

    pub async fn status(&self) -> StatusResponse {
        self.shared.read().await.to_status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.bus.subscribe()
    }

    pub fn live_clients(&self) -> usize {
        self.bus.subscriber_count()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::test_hub;
    use super::*;
    use crate::db::{DeviceStatus, NewReading, StateCommit};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn day(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    async fn insert(db: &Db, at: &str, temp: f64) {
        db.insert_reading(&NewReading {
            temperature: Some(temp),
            measured_at: ts(at),
            ..Default::default()
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn list_devices_projects_rollover() {
        let t = test_hub("2025-10-03T10:00:00Z").await;
        t.db.commit_transition(&StateCommit {
            device_id: 1,
            status: DeviceStatus::Off,
            usage_seconds_today: 900,
            usage_date: day("2025-10-03"),
            changed_at: ts("2025-10-03T10:00:00Z"),
            action_by: "System".into(),
        })
        .await
        .unwrap();

        assert_eq!(t.hub.list_devices().await.unwrap()[0].usage_seconds_today, 900);

        t.clock.set("2025-10-04T08:00:00Z");
        let devices = t.hub.list_devices().await.unwrap();
        assert_eq!(devices[0].usage_seconds_today, 0);
        assert_eq!(devices[0].usage_date, day("2025-10-04"));
        // The stored row is untouched until its next ACK.
        assert_eq!(t.db.device_by_id(1).await.unwrap().unwrap().usage_seconds_today, 900);
    }

    #[tokio::test]
    async fn readings_limit_is_clamped() {
        let t = test_hub("2025-10-03T10:00:00Z").await;
        for i in 0..3 {
            insert(&t.db, &format!("2025-10-03T0{i}:00:00Z"), i as f64).await;
        }

        assert_eq!(t.hub.readings(None, None, Some(0)).await.unwrap().len(), 1);
        assert_eq!(t.hub.readings(None, None, Some(-5)).await.unwrap().len(), 1);
        assert_eq!(t.hub.readings(None, None, None).await.unwrap().len(), 3);
        let newest = t.hub.readings(None, None, Some(1)).await.unwrap();
        assert_eq!(newest[0].temperature, Some(2.0));
    }

    #[tokio::test]
    async fn daily_stats_uses_calendar_day() {
        let t = test_hub("2025-10-03T10:00:00Z").await;
        insert(&t.db, "2025-10-02T23:59:59Z", 100.0).await;
        insert(&t.db, "2025-10-03T00:00:00Z", 20.0).await;
        insert(&t.db, "2025-10-03T12:00:00Z", 30.0).await;
        insert(&t.db, "2025-10-04T00:00:00Z", -5.0).await;

        let s = t.hub.daily_stats(None).await.unwrap();
        assert_eq!(s.date, day("2025-10-03"));
        assert_eq!(s.count, 2);
        let temp = s.temperature.unwrap();
        assert_eq!((temp.hi, temp.lo, temp.avg), (30.0, 20.0, 25.0));
        assert_eq!(s.humidity, None);

        let empty = t.hub.daily_stats(Some(day("2025-09-01"))).await.unwrap();
        assert_eq!(empty.count, 0);
        assert_eq!(empty.temperature, None);
    }

    #[tokio::test]
    async fn seeded_running_stats_match_query() {
        let t = test_hub("2025-10-03T10:00:00Z").await;
        insert(&t.db, "2025-10-03T01:00:00Z", 18.0).await;
        insert(&t.db, "2025-10-03T02:00:00Z", 22.0).await;

        t.hub.seed_today_stats().await.unwrap();
        assert_eq!(
            t.hub.status().await.today.unwrap(),
            t.hub.daily_stats(None).await.unwrap()
        );
    }
}
