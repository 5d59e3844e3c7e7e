use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use validator::Validate;

use crate::store::{ParamValue, ParameterStore, StoreError};

/// Standard test condition irradiance in W/m².
pub const REFERENCE_IRRADIANCE_W_M2: f64 = 1000.0;

pub mod params {
    pub const PANEL_COUNT: &str = "panel_count";
    pub const RATED_CAPACITY_PER_PANEL_W: &str = "rated_capacity_per_panel_w";
    pub const DERATE: &str = "derate";
    pub const SIMULATE_WEATHER: &str = "simulate_weather";
    pub const TICK_INTERVAL_MS: &str = "tick_interval_ms";
    pub const FAULT_THRESHOLD: &str = "fault_threshold";
    pub const WEATHER_SEED: &str = "weather_seed";
}

/// Plant configuration rejected at the boundary
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("plant configuration out of bounds: {0}")]
    OutOfBounds(#[from] validator::ValidationErrors),
    #[error("{field} must be a finite number, got {value}")]
    NotFinite { field: &'static str, value: f64 },
}

/// Plant configuration snapshot.
///
/// The engine only ever holds a value that passed [`PlantConfig::check_bounds`];
/// nothing inside the power model clamps configuration values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PlantConfig {
    #[validate(range(min = 1))]
    pub panel_count: u32,
    #[validate(range(exclusive_min = 0.0))]
    pub rated_capacity_per_panel_w: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub derate: f64,
    pub simulate_weather: bool,
    #[validate(range(min = 1))]
    pub tick_interval_ms: u64,
    /// Consecutive irradiance failures before the plant enters Fault
    #[validate(range(min = 1))]
    pub fault_threshold: u32,
    /// Seed for the weather noise generator (None = entropy)
    pub weather_seed: Option<u64>,
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            panel_count: 10,
            rated_capacity_per_panel_w: 300.0,
            derate: 0.9,
            simulate_weather: false,
            tick_interval_ms: 1000,
            fault_threshold: 3,
            weather_seed: None,
        }
    }
}

impl PlantConfig {
    /// Reject values outside physically valid bounds
    pub fn check_bounds(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            (params::RATED_CAPACITY_PER_PANEL_W, self.rated_capacity_per_panel_w),
            (params::DERATE, self.derate),
        ] {
            if !value.is_finite() {
                return Err(ValidationError::NotFinite { field, value });
            }
        }
        self.validate()?;
        Ok(())
    }

    /// Derated nameplate output of the whole plant in watts
    pub fn rated_total_w(&self) -> f64 {
        self.panel_count as f64 * self.rated_capacity_per_panel_w * self.derate
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn interval_hours(&self) -> f64 {
        self.tick_interval_ms as f64 / 3_600_000.0
    }

    /// Load from the parameter store, falling back to defaults for missing
    /// or mistyped entries. Out-of-range stored values are an error.
    pub fn load(store: &dyn ParameterStore) -> Result<Self, ValidationError> {
        let defaults = Self::default();

        let config = Self {
            panel_count: read_param(store, params::PANEL_COUNT, defaults.panel_count, |v| {
                v.as_u64().and_then(|n| u32::try_from(n).ok())
            }),
            rated_capacity_per_panel_w: read_param(
                store,
                params::RATED_CAPACITY_PER_PANEL_W,
                defaults.rated_capacity_per_panel_w,
                ParamValue::as_f64,
            ),
            derate: read_param(store, params::DERATE, defaults.derate, ParamValue::as_f64),
            simulate_weather: read_param(
                store,
                params::SIMULATE_WEATHER,
                defaults.simulate_weather,
                ParamValue::as_bool,
            ),
            tick_interval_ms: read_param(
                store,
                params::TICK_INTERVAL_MS,
                defaults.tick_interval_ms,
                ParamValue::as_u64,
            ),
            fault_threshold: read_param(
                store,
                params::FAULT_THRESHOLD,
                defaults.fault_threshold,
                |v| v.as_u64().and_then(|n| u32::try_from(n).ok()),
            ),
            weather_seed: store
                .get(params::WEATHER_SEED)
                .and_then(|v| v.as_seed()),
        };

        config.check_bounds()?;
        Ok(config)
    }

    /// Write every field back to the parameter store as one change
    pub fn persist(&self, store: &dyn ParameterStore) -> Result<(), StoreError> {
        store.apply(&[
            (params::PANEL_COUNT, Some(ParamValue::Int(self.panel_count as i64))),
            (
                params::RATED_CAPACITY_PER_PANEL_W,
                Some(ParamValue::Float(self.rated_capacity_per_panel_w)),
            ),
            (params::DERATE, Some(ParamValue::Float(self.derate))),
            (
                params::SIMULATE_WEATHER,
                Some(ParamValue::Bool(self.simulate_weather)),
            ),
            (
                params::TICK_INTERVAL_MS,
                Some(ParamValue::Int(self.tick_interval_ms.min(i64::MAX as u64) as i64)),
            ),
            (
                params::FAULT_THRESHOLD,
                Some(ParamValue::Int(self.fault_threshold as i64)),
            ),
            (params::WEATHER_SEED, self.weather_seed.map(ParamValue::seed)),
        ])
    }
}

fn read_param<T>(
    store: &dyn ParameterStore,
    name: &str,
    default: T,
    convert: impl Fn(&ParamValue) -> Option<T>,
) -> T {
    match store.get(name) {
        None => default,
        Some(value) => convert(&value).unwrap_or_else(|| {
            warn!(param = name, value = ?value, "stored parameter has the wrong type, using default");
            default
        }),
    }
}

/// Plant operational status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlantStatus {
    Stopped,
    Running,
    Fault,
}

impl PlantStatus {
    /// Value exposed in the status register
    pub fn register_code(&self) -> u16 {
        match self {
            PlantStatus::Stopped => 0,
            PlantStatus::Running => 1,
            PlantStatus::Fault => 2,
        }
    }

    pub fn from_register_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(PlantStatus::Stopped),
            1 => Some(PlantStatus::Running),
            2 => Some(PlantStatus::Fault),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlantStatus::Stopped => write!(f, "stopped"),
            PlantStatus::Running => write!(f, "running"),
            PlantStatus::Fault => write!(f, "fault"),
        }
    }
}

/// Irradiance reading taken once per tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IrradianceSample {
    pub value_w_m2: f64,
    pub taken_at: DateTime<Utc>,
}

impl IrradianceSample {
    /// Returns None for negative or non-finite readings
    pub fn new(value_w_m2: f64, taken_at: DateTime<Utc>) -> Option<Self> {
        (value_w_m2.is_finite() && value_w_m2 >= 0.0).then_some(Self {
            value_w_m2,
            taken_at,
        })
    }
}

/// Authoritative plant snapshot published by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantState {
    /// Instantaneous output in W
    pub power_w: f64,
    /// Cumulative energy in Wh
    pub energy_wh: f64,
    pub status: PlantStatus,
    /// Irradiance used for the last successful update in W/m²
    pub irradiance_w_m2: f64,
    /// Plant clock time of the last successful update
    pub updated_at: DateTime<Utc>,
    /// Ticks attempted since engine start
    pub tick_count: u64,
    pub consecutive_failures: u32,
}

impl PlantState {
    pub fn initial(at: DateTime<Utc>) -> Self {
        Self {
            power_w: 0.0,
            energy_wh: 0.0,
            status: PlantStatus::Stopped,
            irradiance_w_m2: 0.0,
            updated_at: at,
            tick_count: 0,
            consecutive_failures: 0,
        }
    }
}
