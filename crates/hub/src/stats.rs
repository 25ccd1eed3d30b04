//! Per-metric daily hi/lo/avg.
//!
//! One fold serves both the one-shot query over a day's readings and the
//! running tracker updated as readings arrive, so the two cannot drift.

use chrono::NaiveDate;
use serde::Serialize;

use crate::db::Reading;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricStats {
    pub hi: f64,
    pub lo: f64,
    pub avg: f64,
}

#[derive(Debug, Clone, Default)]
struct MetricAccumulator {
    hi: Option<f64>,
    lo: Option<f64>,
    sum: f64,
    count: u64,
}

impl MetricAccumulator {
    fn push(&mut self, value: Option<f64>) {
        let Some(v) = value else { return };
        self.hi = Some(self.hi.map_or(v, |hi| hi.max(v)));
        self.lo = Some(self.lo.map_or(v, |lo| lo.min(v)));
        self.sum += v;
        self.count += 1;
    }

    fn stats(&self) -> Option<MetricStats> {
        match (self.hi, self.lo) {
            (Some(hi), Some(lo)) if self.count > 0 => Some(MetricStats {
                hi,
                lo,
                avg: self.sum / self.count as f64,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub count: u64,
    pub temperature: Option<MetricStats>,
    pub humidity: Option<MetricStats>,
    pub illuminance: Option<MetricStats>,
    pub precipitation: Option<MetricStats>,
}

#[derive(Debug, Clone)]
pub struct StatsAccumulator {
    date: NaiveDate,
    count: u64,
    temperature: MetricAccumulator,
    humidity: MetricAccumulator,
    illuminance: MetricAccumulator,
    precipitation: MetricAccumulator,
}

impl StatsAccumulator {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            count: 0,
            temperature: MetricAccumulator::default(),
            humidity: MetricAccumulator::default(),
            illuminance: MetricAccumulator::default(),
            precipitation: MetricAccumulator::default(),
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn push(&mut self, r: &Reading) {
        self.count += 1;
        self.temperature.push(r.temperature);
        self.humidity.push(r.humidity);
        self.illuminance.push(r.illuminance);
        self.precipitation.push(r.precipitation);
    }

    pub fn snapshot(&self) -> DailyStats {
        DailyStats {
            date: self.date,
            count: self.count,
            temperature: self.temperature.stats(),
            humidity: self.humidity.stats(),
            illuminance: self.illuminance.stats(),
            precipitation: self.precipitation.stats(),
        }
    }
}

/// One-shot aggregate over a day's readings.
pub fn daily_stats<'a>(date: NaiveDate, readings: impl IntoIterator<Item = &'a Reading>) -> DailyStats {
    let mut acc = StatsAccumulator::new(date);
    for r in readings {
        acc.push(r);
    }
    acc.snapshot()
}
