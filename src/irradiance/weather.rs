//! # Synthetic weather
//!
//! Day-cycle irradiance generator for running the plant without a rendering
//! host. Each call advances the model by one step:
//!
//! - **Sunrise**: bounds ramp up from dark to full sun
//! - **Clear**: small random walk inside 800-950 W/m²
//! - **Variable**: passing clouds, larger steps inside 300-950 W/m²
//! - **Sunset**: bounds ramp back down
//! - **Night**: zero
//!
//! Step sizes scale with the configured deviation and occasionally jump by an
//! order of magnitude to mimic cloud edges.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{AdapterError, IrradianceSource};

const RAMP_STEPS: u32 = 60;
const CLEAR_STEPS: u32 = 600;
const VARIABLE_STEPS: u32 = 300;
const NIGHT_STEPS: u32 = 120;

/// Largest step deviation accepted at runtime
pub const MAX_DEVIATION: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeatherPhase {
    Sunrise,
    Clear,
    Variable,
    Sunset,
    Night,
}

impl WeatherPhase {
    /// Value exposed in the weather phase register
    pub fn register_code(&self) -> u16 {
        match self {
            WeatherPhase::Sunrise => 0,
            WeatherPhase::Clear => 1,
            WeatherPhase::Variable => 2,
            WeatherPhase::Sunset => 3,
            WeatherPhase::Night => 4,
        }
    }

    pub fn from_register_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(WeatherPhase::Sunrise),
            1 => Some(WeatherPhase::Clear),
            2 => Some(WeatherPhase::Variable),
            3 => Some(WeatherPhase::Sunset),
            4 => Some(WeatherPhase::Night),
            _ => None,
        }
    }

    fn duration_steps(&self) -> u32 {
        match self {
            WeatherPhase::Sunrise | WeatherPhase::Sunset => RAMP_STEPS,
            WeatherPhase::Clear => CLEAR_STEPS,
            WeatherPhase::Variable => VARIABLE_STEPS,
            WeatherPhase::Night => NIGHT_STEPS,
        }
    }

    fn next(&self) -> Self {
        match self {
            WeatherPhase::Sunrise => WeatherPhase::Clear,
            WeatherPhase::Clear => WeatherPhase::Variable,
            WeatherPhase::Variable => WeatherPhase::Sunset,
            WeatherPhase::Sunset => WeatherPhase::Night,
            WeatherPhase::Night => WeatherPhase::Sunrise,
        }
    }
}

#[derive(Debug)]
struct WeatherModel {
    rng: StdRng,
    irradiance: f64,
    phase: WeatherPhase,
    step_in_phase: u32,
    deviation: f64,
}

impl WeatherModel {
    fn gust(&mut self, calm: f64, gusty: f64) -> f64 {
        if self.rng.gen_range(0..=30) == 0 {
            gusty
        } else {
            calm
        }
    }

    /// (lower, upper) bounds for the current step
    fn bounds(&self) -> (f64, f64) {
        let i = self.step_in_phase as f64;
        match self.phase {
            WeatherPhase::Sunrise => ((75.0 * i).min(800.0), (200.0 + 80.0 * i).min(950.0)),
            WeatherPhase::Clear => (800.0, 950.0),
            WeatherPhase::Variable => (300.0, 950.0),
            WeatherPhase::Sunset => ((100.0 - 75.0 * i).max(0.0), (500.0 - 80.0 * i).max(0.0)),
            WeatherPhase::Night => (0.0, 0.0),
        }
    }

    fn step(&mut self) -> f64 {
        let delta = match self.phase {
            WeatherPhase::Sunrise => {
                let multiplier = self.gust(1.0, 10.0);
                self.rng.gen_range(-10..=75) as f64 * self.deviation * multiplier / 100.0
            }
            WeatherPhase::Clear => {
                let multiplier = self.gust(1.0, 10.0);
                self.rng.gen_range(-100..=100) as f64 * self.deviation * multiplier / 100.0
            }
            WeatherPhase::Variable => {
                let multiplier = self.gust(10.0, 40.0);
                self.rng.gen_range(-100..=100) as f64 * self.deviation * multiplier / 100.0
            }
            WeatherPhase::Sunset => {
                let multiplier = self.gust(1.0, 10.0);
                self.rng.gen_range(-75..=10) as f64 * self.deviation * multiplier / 100.0
            }
            WeatherPhase::Night => 0.0,
        };

        let (lower, upper) = self.bounds();
        self.irradiance = (self.irradiance + delta).clamp(lower, upper);

        self.step_in_phase += 1;
        if self.step_in_phase >= self.phase.duration_steps() {
            self.phase = self.phase.next();
            self.step_in_phase = 0;
        }

        self.irradiance
    }
}

/// Seeded synthetic irradiance source
pub struct SyntheticWeather {
    model: Mutex<WeatherModel>,
}

impl SyntheticWeather {
    /// Start at sunrise in darkness. `deviation` scales every random step.
    pub fn new(deviation: f64, seed: Option<u64>) -> Self {
        Self::starting_at(WeatherPhase::Sunrise, 0.0, deviation, seed)
    }

    pub fn starting_at(
        phase: WeatherPhase,
        irradiance: f64,
        deviation: f64,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            model: Mutex::new(WeatherModel {
                rng,
                irradiance: irradiance.max(0.0),
                phase,
                step_in_phase: 0,
                deviation: deviation.abs().min(MAX_DEVIATION),
            }),
        }
    }

    pub fn phase(&self) -> WeatherPhase {
        self.model.lock().phase
    }

    /// Jump to the start of `phase`. The current irradiance is kept and
    /// pulled into the new phase's band on the next step.
    pub fn set_phase(&self, phase: WeatherPhase) {
        let mut model = self.model.lock();
        model.phase = phase;
        model.step_in_phase = 0;
    }

    pub fn deviation(&self) -> f64 {
        self.model.lock().deviation
    }

    pub fn set_deviation(&self, deviation: f64) {
        self.model.lock().deviation = deviation.abs().min(MAX_DEVIATION);
    }
}

#[async_trait]
impl IrradianceSource for SyntheticWeather {
    async fn irradiance(&self) -> Result<f64, AdapterError> {
        Ok(self.model.lock().step())
    }

    fn describe(&self) -> String {
        format!("synthetic weather ({:?})", self.phase())
    }
}
