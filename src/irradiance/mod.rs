//! # Irradiance sources
//!
//! The engine pulls exactly one reading per tick through [`IrradianceSource`].
//! A source either returns a value in W/m² or an [`AdapterError`]; it never
//! substitutes a zero for a failed fetch, because a zero is a legitimate
//! night-time reading and must not mask an outage.
//!
//! - [`RemoteIrradianceSource`]: reads a property of a scene object from an
//!   Unreal Engine Remote Control HTTP endpoint
//! - [`SyntheticWeather`]: seeded day-cycle generator (sunrise, clear,
//!   variable cloud, sunset, night)
//! - [`FixedIrradiance`]: constant value, useful for commissioning tests

mod remote;
mod weather;

pub use remote::RemoteIrradianceSource;
pub use weather::{SyntheticWeather, WeatherPhase, MAX_DEVIATION};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{IrradianceConfig, SourceKind};

/// Transient failure to obtain a reading
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("irradiance request failed: {0}")]
    Request(String),
    #[error("irradiance source returned status {0}")]
    Status(u16),
    #[error("irradiance response has no usable '{0}' property")]
    MissingProperty(String),
    #[error("irradiance value {0} is not a valid reading")]
    InvalidValue(f64),
    #[error("irradiance request timed out after {0} ms")]
    Timeout(u64),
    #[error("irradiance source not configured: {0}")]
    NotConfigured(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IrradianceSource: Send + Sync {
    /// Current plane-of-array irradiance in W/m²
    async fn irradiance(&self) -> Result<f64, AdapterError>;

    /// Short label for logs
    fn describe(&self) -> String;
}

/// Constant irradiance
#[derive(Debug, Clone, Copy)]
pub struct FixedIrradiance(pub f64);

#[async_trait]
impl IrradianceSource for FixedIrradiance {
    async fn irradiance(&self) -> Result<f64, AdapterError> {
        Ok(self.0)
    }

    fn describe(&self) -> String {
        format!("fixed {} W/m²", self.0)
    }
}

/// Source built from the process config
pub struct ConfiguredSource {
    pub source: Arc<dyn IrradianceSource>,
    /// Handle on the weather model when the source is synthetic
    pub weather: Option<Arc<SyntheticWeather>>,
}

/// Build the configured source
pub fn from_config(
    cfg: &IrradianceConfig,
    seed: Option<u64>,
) -> Result<ConfiguredSource, AdapterError> {
    let configured = match cfg.source {
        SourceKind::Remote => ConfiguredSource {
            source: Arc::new(RemoteIrradianceSource::new(
                &cfg.host,
                cfg.port,
                &cfg.object_path,
                &cfg.property,
                std::time::Duration::from_millis(cfg.timeout_ms),
            )?),
            weather: None,
        },
        SourceKind::Synthetic => {
            let weather = Arc::new(SyntheticWeather::new(cfg.weather_deviation, seed));
            ConfiguredSource {
                source: weather.clone(),
                weather: Some(weather),
            }
        }
        SourceKind::Fixed => ConfiguredSource {
            source: Arc::new(FixedIrradiance(cfg.fixed_value_w_m2)),
            weather: None,
        },
    };
    Ok(configured)
}
