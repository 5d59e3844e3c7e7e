//! # Register Map
//!
//! Translates engine state and configuration into the protocol-visible
//! holding register table, and routes register writes back into the engine's
//! reconfiguration entry point.
//!
//! Reads encode from a single snapshot taken at the start of the request, so
//! a multi-register read never mixes two ticks. Writes are all-or-nothing: the
//! whole request is decoded and validated before anything reaches the engine.
//!
//! The weather phase and deviation registers drive the synthetic weather
//! model. They read as zero and refuse writes when the plant runs on another
//! irradiance source.

pub mod codec;
pub mod schema;

pub use schema::{Access, Field, RegisterDef, RegisterTable, SchemaError, Width, SCHEMA, SCHEMA_VERSION};

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::{PlantConfig, PlantState, ValidationError};
use crate::engine::SimulationEngine;
use crate::irradiance::{SyntheticWeather, WeatherPhase, MAX_DEVIATION};

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("register {0} is not mapped")]
    Unmapped(u16),
    #[error("range starting at {start} with {count} registers runs past the address space")]
    OutOfRange { start: u16, count: usize },
    #[error("register {address} ({field}) is read-only")]
    ReadOnly { address: u16, field: Field },
    #[error("write to {0} does not cover all of its registers")]
    PartialField(Field),
    #[error("{0} needs the synthetic weather source")]
    NoWeatherModel(Field),
    #[error("raw value {raw} is not valid for {field}")]
    IllegalValue { field: Field, raw: u32 },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Decoded write to one field
#[derive(Debug, Clone, Copy, PartialEq)]
enum Update {
    PanelCount(u32),
    RatedCapacityPerPanelW(f64),
    Derate(f64),
    SimulateWeather(bool),
    TickIntervalMs(u64),
    FaultThreshold(u32),
    Run(bool),
    WeatherPhase(WeatherPhase),
    WeatherDeviation(f64),
}

impl Update {
    fn apply(self, config: &mut PlantConfig) {
        match self {
            Update::PanelCount(n) => config.panel_count = n,
            Update::RatedCapacityPerPanelW(w) => config.rated_capacity_per_panel_w = w,
            Update::Derate(d) => config.derate = d,
            Update::SimulateWeather(on) => config.simulate_weather = on,
            Update::TickIntervalMs(ms) => config.tick_interval_ms = ms,
            Update::FaultThreshold(n) => config.fault_threshold = n,
            Update::Run(_) | Update::WeatherPhase(_) | Update::WeatherDeviation(_) => {}
        }
    }

    fn touches_config(&self) -> bool {
        !matches!(
            self,
            Update::Run(_) | Update::WeatherPhase(_) | Update::WeatherDeviation(_)
        )
    }
}

pub struct RegisterMap {
    table: RegisterTable,
    engine: Arc<SimulationEngine>,
    weather: Option<Arc<SyntheticWeather>>,
}

impl RegisterMap {
    pub fn new(engine: Arc<SimulationEngine>) -> Result<Self, SchemaError> {
        Ok(Self {
            table: RegisterTable::standard()?,
            engine,
            weather: None,
        })
    }

    /// Route the weather registers to `weather`
    pub fn with_weather(mut self, weather: Arc<SyntheticWeather>) -> Self {
        self.weather = Some(weather);
        self
    }

    /// Encoded words for `count` registers starting at `start`. Fails if any
    /// address in the range is unmapped.
    pub fn read_registers(&self, start: u16, count: u16) -> Result<Vec<u16>, RegisterError> {
        let addresses = span(start, count as usize)?;

        let state = self.engine.snapshot();
        let config = self.engine.config();
        let running = !self.engine.is_halted();
        let weather = self
            .weather
            .as_deref()
            .map(|weather| (weather.phase(), weather.deviation()));

        let mut encoded: BTreeMap<Field, Vec<u16>> = BTreeMap::new();
        let mut words = Vec::with_capacity(count as usize);
        for address in addresses {
            let slot = self
                .table
                .slot(address)
                .ok_or(RegisterError::Unmapped(address))?;
            let field_words = encoded.entry(slot.def.field).or_insert_with(|| {
                let value = field_value(slot.def.field, &state, &config, running, weather);
                codec::encode(value, slot.def)
            });
            words.push(field_words[slot.word as usize]);
        }

        Ok(words)
    }

    /// Decode, validate and apply a contiguous write. On any error nothing
    /// is applied.
    pub fn write_registers(&self, start: u16, values: &[u16]) -> Result<(), RegisterError> {
        let addresses = span(start, values.len())?;

        let mut fields: BTreeMap<Field, (&RegisterDef, Vec<u16>)> = BTreeMap::new();
        for (address, &value) in addresses.zip(values) {
            let slot = self
                .table
                .slot(address)
                .ok_or(RegisterError::Unmapped(address))?;
            if slot.def.access == Access::ReadOnly {
                return Err(RegisterError::ReadOnly {
                    address,
                    field: slot.def.field,
                });
            }
            fields
                .entry(slot.def.field)
                .or_insert_with(|| (slot.def, Vec::with_capacity(2)))
                .1
                .push(value);
        }

        let updates = fields
            .into_values()
            .map(|(def, words)| decode_update(def, &words))
            .collect::<Result<Vec<_>, _>>()?;

        let weather = self.weather.as_deref();
        for update in &updates {
            let field = match update {
                Update::WeatherPhase(_) => Field::WeatherPhase,
                Update::WeatherDeviation(_) => Field::WeatherDeviation,
                _ => continue,
            };
            if weather.is_none() {
                return Err(RegisterError::NoWeatherModel(field));
            }
        }

        let config_updates: Vec<Update> = updates
            .iter()
            .copied()
            .filter(Update::touches_config)
            .collect();
        if !config_updates.is_empty() {
            self.engine.update_config(|config| {
                for update in config_updates {
                    update.apply(config);
                }
            })?;
        }

        for update in updates {
            match (update, weather) {
                (Update::WeatherPhase(phase), Some(weather)) => {
                    weather.set_phase(phase);
                    info!(?phase, "weather phase set");
                }
                (Update::WeatherDeviation(deviation), Some(weather)) => {
                    weather.set_deviation(deviation);
                    info!(deviation, "weather deviation set");
                }
                (Update::Run(true), _) => self.engine.start(),
                (Update::Run(false), _) => self.engine.stop(),
                _ => {}
            }
        }

        debug!(start, count = values.len(), "registers written");
        Ok(())
    }
}

fn span(start: u16, count: usize) -> Result<impl Iterator<Item = u16>, RegisterError> {
    let end = start as usize + count;
    if end > u16::MAX as usize + 1 {
        return Err(RegisterError::OutOfRange { start, count });
    }
    Ok((start as usize..end).map(|address| address as u16))
}

fn field_value(
    field: Field,
    state: &PlantState,
    config: &PlantConfig,
    running: bool,
    weather: Option<(WeatherPhase, f64)>,
) -> f64 {
    match field {
        Field::Status => state.status.register_code() as f64,
        Field::PowerW => state.power_w,
        Field::EnergyWh => state.energy_wh,
        Field::IrradianceWM2 => state.irradiance_w_m2,
        Field::ConsecutiveFailures => state.consecutive_failures as f64,
        Field::TickCount => state.tick_count as f64,
        Field::RatedTotalW => config.rated_total_w(),
        Field::PanelCount => config.panel_count as f64,
        Field::RatedCapacityPerPanelW => config.rated_capacity_per_panel_w,
        Field::Derate => config.derate,
        Field::SimulateWeather => flag(config.simulate_weather),
        Field::TickIntervalMs => config.tick_interval_ms as f64,
        Field::FaultThreshold => config.fault_threshold as f64,
        Field::RunCommand => flag(running),
        Field::WeatherPhase => weather.map_or(0.0, |(phase, _)| phase.register_code() as f64),
        Field::WeatherDeviation => weather.map_or(0.0, |(_, deviation)| deviation),
    }
}

fn flag(on: bool) -> f64 {
    if on {
        1.0
    } else {
        0.0
    }
}

fn decode_update(def: &RegisterDef, words: &[u16]) -> Result<Update, RegisterError> {
    let raw = codec::from_words(words, def.width).ok_or(RegisterError::PartialField(def.field))?;
    let value = codec::decode_raw(raw, def);

    let switch = |raw: u32| match raw {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(RegisterError::IllegalValue {
            field: def.field,
            raw,
        }),
    };

    let update = match def.field {
        Field::PanelCount => Update::PanelCount(raw),
        Field::RatedCapacityPerPanelW => Update::RatedCapacityPerPanelW(value),
        Field::Derate => Update::Derate(value),
        Field::SimulateWeather => Update::SimulateWeather(switch(raw)?),
        Field::TickIntervalMs => Update::TickIntervalMs(raw as u64),
        Field::FaultThreshold => Update::FaultThreshold(raw),
        Field::RunCommand => Update::Run(switch(raw)?),
        Field::WeatherPhase => Update::WeatherPhase(
            u16::try_from(raw)
                .ok()
                .and_then(WeatherPhase::from_register_code)
                .ok_or(RegisterError::IllegalValue {
                    field: def.field,
                    raw,
                })?,
        ),
        Field::WeatherDeviation if value <= MAX_DEVIATION => Update::WeatherDeviation(value),
        Field::WeatherDeviation => {
            return Err(RegisterError::IllegalValue {
                field: def.field,
                raw,
            })
        }
        field => {
            return Err(RegisterError::ReadOnly {
                address: def.address,
                field,
            })
        }
    };
    Ok(update)
}
