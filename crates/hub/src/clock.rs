//! Wall-clock access and the deployment's calendar day.
//!
//! Usage accounting is scoped to a calendar date in the deployment's
//! timezone, while every stored timestamp is UTC. `Calendar` bundles the
//! two so the reconciler and the stats queries agree on where a day starts.

use anyhow::{bail, Result};
use chrono::{DateTime, Days, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::sync::Arc;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Timezone that defines "today".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarZone {
    /// Host timezone.
    Local,
    Fixed(FixedOffset),
}

impl CalendarZone {
    /// Parse an optional `"+07:00"`-style offset; `None` means host local time.
    pub fn from_config(utc_offset: Option<&str>) -> Result<Self> {
        match utc_offset {
            None => Ok(Self::Local),
            Some(s) => match s.trim().parse::<FixedOffset>() {
                Ok(offset) => Ok(Self::Fixed(offset)),
                Err(e) => bail!("invalid utc_offset '{s}': {e}"),
            },
        }
    }

    pub fn date_of(&self, ts: DateTime<Utc>) -> NaiveDate {
        match self {
            Self::Local => ts.with_timezone(&Local).date_naive(),
            Self::Fixed(offset) => ts.with_timezone(offset).date_naive(),
        }
    }

    /// Interpret a wall-clock time in this zone. Ambiguous times (DST fold)
    /// resolve to the earlier instant; nonexistent ones (DST gap) are `None`.
    pub fn to_utc(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            Self::Local => Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|t| t.with_timezone(&Utc)),
            Self::Fixed(offset) => offset
                .from_local_datetime(&naive)
                .single()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

#[derive(Clone)]
pub struct Calendar {
    clock: Arc<dyn Clock>,
    zone: CalendarZone,
}

impl Calendar {
    pub fn new(clock: Arc<dyn Clock>, zone: CalendarZone) -> Self {
        Self { clock, zone }
    }

    pub fn system(zone: CalendarZone) -> Self {
        Self::new(Arc::new(SystemClock), zone)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn today(&self) -> NaiveDate {
        self.zone.date_of(self.now())
    }

    pub fn zone(&self) -> CalendarZone {
        self.zone
    }

    /// Half-open UTC interval `[start, end)` covering `date` in this zone.
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let next = date.checked_add_days(Days::new(1)).unwrap_or(date);
        (self.midnight(date), self.midnight(next))
    }

    fn midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        let naive = date.and_time(chrono::NaiveTime::MIN);
        // A DST gap swallowing midnight is rare; fall back to UTC midnight.
        self.zone.to_utc(naive).unwrap_or_else(|| naive.and_utc())
    }
}

// ---------------------------------------------------------------------------
// Test clock
// ---------------------------------------------------------------------------

#[cfg(test)]
pub struct ManualClock(std::sync::Mutex<DateTime<Utc>>);

#[cfg(test)]
impl ManualClock {
    pub fn at(rfc3339: &str) -> Arc<Self> {
        let t = DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc);
        Arc::new(Self(std::sync::Mutex::new(t)))
    }

    pub fn set(&self, rfc3339: &str) {
        *self.0.lock().unwrap() = DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc);
    }

    pub fn advance(&self, secs: i64) {
        *self.0.lock().unwrap() += chrono::Duration::seconds(secs);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

/// Calendar pinned to UTC and driven by a manual clock.
#[cfg(test)]
pub fn test_calendar(rfc3339: &str) -> (Calendar, Arc<ManualClock>) {
    let clock = ManualClock::at(rfc3339);
    let zone = CalendarZone::Fixed(FixedOffset::east_opt(0).unwrap());
    (Calendar::new(clock.clone(), zone), clock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_none_is_local() {
        assert_eq!(CalendarZone::from_config(None).unwrap(), CalendarZone::Local);
    }

    #[test]
    fn from_config_parses_offset() {
        let zone = CalendarZone::from_config(Some("+07:00")).unwrap();
        assert_eq!(
            zone,
            CalendarZone::Fixed(FixedOffset::east_opt(7 * 3600).unwrap())
        );
    }

    #[test]
    fn from_config_rejects_garbage() {
        assert!(CalendarZone::from_config(Some("seven")).is_err());
    }

    #[test]
    fn date_of_respects_offset() {
        let zone = CalendarZone::from_config(Some("+07:00")).unwrap();
        let ts = DateTime::parse_from_rfc3339("2025-10-03T18:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(zone.date_of(ts), NaiveDate::from_ymd_opt(2025, 10, 4).unwrap());
    }

    #[test]
    fn day_bounds_cover_one_day() {
        let clock = ManualClock::at("2025-10-03T00:00:00Z");
        let zone = CalendarZone::from_config(Some("+07:00")).unwrap();
        let cal = Calendar::new(clock, zone);
        let (start, end) = cal.day_bounds(NaiveDate::from_ymd_opt(2025, 10, 3).unwrap());
        assert_eq!(start.to_rfc3339(), "2025-10-02T17:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2025-10-03T17:00:00+00:00");
    }

    #[test]
    fn manual_clock_advances_today() {
        let (cal, clock) = test_calendar("2025-10-03T23:59:50Z");
        assert_eq!(cal.today(), NaiveDate::from_ymd_opt(2025, 10, 3).unwrap());
        clock.advance(20);
        assert_eq!(cal.today(), NaiveDate::from_ymd_opt(2025, 10, 4).unwrap());
    }
}
