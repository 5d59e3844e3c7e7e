use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::cli::Cli;
use crate::server::ServerSettings;

/// Process configuration. Plant parameters live in the parameter store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub irradiance: IrradianceConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    /// Force weather noise on regardless of the stored plant parameter
    pub sim_weather: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub max_malformed_frames: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 502,
            unit_id: 1,
            max_malformed_frames: 8,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }

    pub fn settings(&self) -> ServerSettings {
        ServerSettings {
            unit_id: self.unit_id,
            max_malformed_frames: self.max_malformed_frames,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Remote,
    Synthetic,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrradianceConfig {
    pub source: SourceKind,
    pub host: String,
    pub port: u16,
    /// Scene object that carries the irradiance property
    pub object_path: String,
    pub property: String,
    pub timeout_ms: u64,
    pub fixed_value_w_m2: f64,
    /// Step scale for the synthetic weather model
    pub weather_deviation: f64,
}

impl Default for IrradianceConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Remote,
            host: "localhost".to_string(),
            port: 30010,
            object_path: String::new(),
            property: "Irradiance".to_string(),
            timeout_ms: 3000,
            fixed_value_w_m2: 1000.0,
            weather_deviation: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("plant.toml"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub json: bool,
}

impl Config {
    /// Defaults, then the TOML file, then `SOLARSIM__` env vars, then CLI flags
    pub fn load(cli: &Cli) -> Result<Self> {
        Ok(Self::figment(cli).extract()?)
    }

    fn figment(cli: &Cli) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed("SOLARSIM__").split("__"));

        if cli.sim {
            figment = figment.merge(Serialized::default("sim_weather", true));
        }
        if let Some(address) = &cli.address {
            figment = figment.merge(Serialized::default("irradiance.host", address));
        }
        if let Some(port) = cli.port {
            figment = figment.merge(Serialized::default("irradiance.port", port));
        }
        figment
    }
}
