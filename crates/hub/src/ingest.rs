//! Telemetry ingestion: sensor payload in, persisted reading out, then
//! announced to live clients.

use anyhow::Result;
use chrono::NaiveDate;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::clock::Calendar;
use crate::db::{Db, Reading};
use crate::events::{Broadcaster, LiveEvent};
use crate::mqtt::SensorMsg;
use crate::state::SharedState;

#[derive(Clone)]
pub struct Ingestor {
    db: Db,
    bus: Broadcaster,
    calendar: Calendar,
    shared: SharedState,
}

impl Ingestor {
    pub fn new(db: Db, bus: Broadcaster, calendar: Calendar, shared: SharedState) -> Self {
        Self { db, bus, calendar, shared }
    }

    /// Handle one sensor payload. Errors are logged and contained.
    pub async fn handle(&self, map: Map<String, Value>) {
        if let Err(e) = self.ingest(&map).await {
            error!("ingest failed: {e:#}");
            self.shared
                .write()
                .await
                .record_persistence_failure(format!("reading insert failed: {e}"));
        }
    }

    /// Returns `None` when the payload carries no recognizable metric.
    pub async fn ingest(&self, map: &Map<String, Value>) -> Result<Option<Reading>> {
        let zone = self.calendar.zone();
        let msg = SensorMsg::from_map(map, zone);
        if !msg.has_metrics() {
            warn!(keys = ?map.keys().collect::<Vec<_>>(), "sensor payload without metrics dropped");
            self.shared
                .write()
                .await
                .record_malformed("sensor payload without metrics".to_string());
            return Ok(None);
        }

        let now = self.calendar.now();
        self.roll_running_stats(zone.date_of(now)).await;

        let reading = self.db.insert_reading(&msg.into_new_reading(now)).await?;
        debug!(id = reading.id, measured_at = %reading.measured_at, "reading stored");

        self.bus.send(LiveEvent::ReadingCreated(reading.clone()));
        self.shared
            .write()
            .await
            .record_reading(&reading, zone.date_of(reading.measured_at));

        Ok(Some(reading))
    }

    /// Re-seed the running day statistics from the store when the calendar
    /// has moved past the day they cover.
    async fn roll_running_stats(&self, today: NaiveDate) {
        if self.shared.read().await.today_date() == Some(today) {
            return;
        }
        let (start, end) = self.calendar.day_bounds(today);
        match self.db.readings_between(start, end).await {
            Ok(rows) => {
                debug!(%today, rows = rows.len(), "running stats rolled over");
                self.shared.write().await.seed_today(today, &rows);
            }
            Err(e) => warn!(%today, "running stats not rolled over: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{test_calendar, ManualClock};
    use crate::db::test_db;
    use crate::state::HubState;
    use crate::stats::daily_stats;
    use serde_json::json;
    use std::sync::Arc;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    struct Harness {
        ing: Ingestor,
        bus: Broadcaster,
        shared: SharedState,
        db: Db,
        calendar: Calendar,
        clock: Arc<ManualClock>,
    }

    async fn harness() -> Harness {
        let db = test_db().await;
        let (calendar, clock) = test_calendar("2025-10-03T10:00:00Z");
        let bus = Broadcaster::default();
        let shared = HubState::shared();
        let ing = Ingestor::new(db.clone(), bus.clone(), calendar.clone(), shared.clone());
        Harness { ing, bus, shared, db, calendar, clock }
    }

    impl Harness {
        /// Running statistics must equal a fresh aggregate over today's rows.
        async fn assert_running_matches_query(&self) {
            let today = self.calendar.today();
            let (start, end) = self.calendar.day_bounds(today);
            let rows = self.db.readings_between(start, end).await.unwrap();
            let running = self.shared.read().await.to_status().today.unwrap();
            assert_eq!(running, daily_stats(today, &rows));
        }
    }

    #[tokio::test]
    async fn stores_and_announces_reading() {
        let h = harness().await;
        let mut rx = h.bus.subscribe();

        let r = h
            .ing
            .ingest(&obj(json!({"temp": 29.3, "humid": 57, "lux": 268.3})))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(r.temperature, Some(29.3));
        assert_eq!(r.humidity, Some(57.0));
        assert_eq!(r.illuminance, Some(268.3));
        assert_eq!(r.measured_at.to_rfc3339(), "2025-10-03T10:00:00+00:00");
        assert_eq!(rx.recv().await.unwrap(), LiveEvent::ReadingCreated(r.clone()));
        assert_eq!(h.db.latest_reading().await.unwrap(), Some(r));

        let st = h.shared.read().await;
        assert_eq!(st.counters.readings_ingested, 1);
        assert_eq!(st.to_status().today.unwrap().count, 1);
    }

    #[tokio::test]
    async fn explicit_measured_at_is_kept() {
        let h = harness().await;
        let r = h
            .ing
            .ingest(&obj(json!({"temperature": 20, "measured_at": "2025-10-02T23:00:00Z"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.measured_at.to_rfc3339(), "2025-10-02T23:00:00+00:00");
    }

    #[tokio::test]
    async fn unparsable_measured_at_falls_back_to_now() {
        let h = harness().await;
        let r = h
            .ing
            .ingest(&obj(json!({"temp": 1, "measured_at": "soon"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.measured_at.to_rfc3339(), "2025-10-03T10:00:00+00:00");
    }

    #[tokio::test]
    async fn payload_without_metrics_is_dropped() {
        let h = harness().await;
        let mut rx = h.bus.subscribe();

        assert_eq!(h.ing.ingest(&obj(json!({"hello": "world"}))).await.unwrap(), None);
        assert!(h.db.latest_reading().await.unwrap().is_none());
        assert!(rx.try_recv().is_err());
        assert_eq!(h.shared.read().await.counters.malformed_messages, 1);
    }

    #[tokio::test]
    async fn future_dated_reading_does_not_move_running_day() {
        let h = harness().await;
        h.ing.ingest(&obj(json!({"temp": 20}))).await.unwrap();
        h.ing
            .ingest(&obj(json!({"temp": 99, "measured_at": "2025-10-04T09:00:00Z"})))
            .await
            .unwrap();
        h.ing.ingest(&obj(json!({"temp": 30}))).await.unwrap();

        let running = h.shared.read().await.to_status().today.unwrap();
        assert_eq!(running.date, "2025-10-03".parse::<NaiveDate>().unwrap());
        assert_eq!(running.count, 2);
        h.assert_running_matches_query().await;
    }

    #[tokio::test]
    async fn running_day_rolls_with_the_calendar() {
        let h = harness().await;
        h.ing.ingest(&obj(json!({"temp": 20}))).await.unwrap();
        // Stored early by a skewed node; belongs to tomorrow's aggregate.
        h.ing
            .ingest(&obj(json!({"temp": 99, "measured_at": "2025-10-04T09:00:00Z"})))
            .await
            .unwrap();

        h.clock.set("2025-10-04T10:00:00Z");
        h.ing.ingest(&obj(json!({"temp": 12}))).await.unwrap();

        let running = h.shared.read().await.to_status().today.unwrap();
        assert_eq!(running.date, "2025-10-04".parse::<NaiveDate>().unwrap());
        assert_eq!(running.count, 2);
        h.assert_running_matches_query().await;
    }
}
