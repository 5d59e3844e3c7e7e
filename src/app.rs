use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::domain::PlantConfig;
use crate::engine::SimulationEngine;
use crate::irradiance;
use crate::registers::{RegisterMap, SCHEMA_VERSION};
use crate::server::TelemetryServer;
use crate::store::TomlParameterStore;

pub const VENDOR_NAME: &str = "Vertech";
pub const PRODUCT_NAME: &str = "SolarSim";

/// Fully wired simulator: engine plus bound telemetry server
pub struct App {
    engine: Arc<SimulationEngine>,
    registers: Arc<RegisterMap>,
    server: TelemetryServer,
}

impl App {
    pub async fn build(cfg: &Config) -> Result<Self> {
        let store = Arc::new(
            TomlParameterStore::open(&cfg.store.path).context("failed to open parameter store")?,
        );

        let plant = PlantConfig::load(store.as_ref()).context("stored plant parameters are invalid")?;

        let configured = irradiance::from_config(&cfg.irradiance, plant.weather_seed)
            .context("failed to create irradiance source")?;
        let source_label = configured.source.describe();

        let engine = Arc::new(
            SimulationEngine::new(plant, configured.source)?
                .with_store(store)
                .with_forced_weather(cfg.sim_weather)
                .with_fetch_timeout(Duration::from_millis(cfg.irradiance.timeout_ms)),
        );
        let mut registers = RegisterMap::new(engine.clone())?;
        if let Some(weather) = configured.weather {
            registers = registers.with_weather(weather);
        }
        let registers = Arc::new(registers);

        let addr = cfg.server.socket_addr()?;
        let server = TelemetryServer::bind(addr, registers.clone(), cfg.server.settings())
            .await
            .with_context(|| format!("failed to bind telemetry endpoint {addr}"))?;

        let plant = engine.config();
        info!(
            vendor = VENDOR_NAME,
            product = PRODUCT_NAME,
            version = env!("CARGO_PKG_VERSION"),
            register_schema = SCHEMA_VERSION,
            listen = %server.local_addr()?,
            unit_id = cfg.server.unit_id,
            source = %source_label,
            panel_count = plant.panel_count,
            rated_total_w = plant.rated_total_w(),
            simulate_weather = engine.simulates_weather(),
            "solar plant simulator ready"
        );

        Ok(Self {
            engine,
            registers,
            server,
        })
    }

    pub fn engine(&self) -> &Arc<SimulationEngine> {
        &self.engine
    }

    pub fn registers(&self) -> &Arc<RegisterMap> {
        &self.registers
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.local_addr()?)
    }

    /// Run the simulation loop and the server until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        let simulation = tokio::spawn(self.engine.clone().run(shutdown.clone()));

        self.server.serve(shutdown).await;

        if let Err(e) = simulation.await {
            error!(error = %e, "simulation task panicked");
        }
    }
}
