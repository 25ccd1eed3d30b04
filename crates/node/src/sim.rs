//! Room climate simulator for local development.
//!
//! Each metric follows a random walk with mean reversion toward a target
//! that moves with a day/night cycle. Illuminance jumps when the simulated
//! `light` device is on.

use serde::Serialize;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Per-metric walk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Walk {
    value: f64,
    min: f64,
    max: f64,
    sigma: f64,
    reversion: f64,
}

impl Walk {
    fn new(start: f64, min: f64, max: f64, sigma: f64, reversion: f64) -> Self {
        Self { value: start, min, max, sigma, reversion }
    }

    fn step(&mut self, target: f64) -> f64 {
        let pull = self.reversion * (target - self.value);
        self.value = (self.value + pull + gaussian(0.0, self.sigma)).clamp(self.min, self.max);
        self.value
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// One published sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Climate {
    pub temperature: f64,
    pub humidity: f64,
    pub lux: f64,
}

pub struct ClimateSim {
    temperature: Walk,
    humidity: Walk,
    lux: Walk,
    day_period_s: f64,
    light_on: bool,
}

/// Extra illuminance while the light is on.
const LIGHT_LUX: f64 = 400.0;

impl ClimateSim {
    /// `day_period_s` is the length of one simulated day. Use 600 for fast
    /// iteration or 86400 for real time.
    pub fn new(day_period_s: f64) -> Self {
        Self {
            temperature: Walk::new(27.0, 15.0, 40.0, 0.15, 0.05),
            humidity: Walk::new(60.0, 20.0, 95.0, 0.6, 0.05),
            lux: Walk::new(250.0, 0.0, 1000.0, 15.0, 0.2),
            day_period_s: day_period_s.max(1.0),
            light_on: false,
        }
    }

    pub fn set_light(&mut self, on: bool) {
        self.light_on = on;
    }

    /// Advance one tick. `now_s` is seconds since the epoch.
    pub fn sample(&mut self, now_s: f64) -> Climate {
        // 0 at midnight, 1 at midday.
        let phase = 2.0 * std::f64::consts::PI * now_s / self.day_period_s;
        let daylight = (0.5 - 0.5 * phase.cos()).clamp(0.0, 1.0);

        let temperature = self.temperature.step(22.0 + 10.0 * daylight);
        // Warmer air holds more water; relative humidity falls as it warms.
        let humidity = self.humidity.step(75.0 - 25.0 * daylight);
        let boost = if self.light_on { LIGHT_LUX } else { 0.0 };
        let lux = self.lux.step(600.0 * daylight + boost);

        Climate {
            temperature: round1(temperature),
            humidity: round1(humidity),
            lux: round1(lux),
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ===========================================================================
// Tests
// ===========================================================================
