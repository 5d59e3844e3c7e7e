use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Info,
    Debug,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
        }
    }
}

/// Solar plant simulator serving live telemetry over Modbus TCP
#[derive(Debug, Parser)]
#[command(name = "solar-plant-sim", version, about)]
pub struct Cli {
    /// Process config file (missing file = defaults)
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Logging mode
    #[arg(short, long, value_enum, ignore_case = true, default_value = "info")]
    pub log: LogLevel,

    /// Enable simulated weather noise
    #[arg(short, long)]
    pub sim: bool,

    /// Irradiance host address
    #[arg(short, long)]
    pub address: Option<String>,

    /// Irradiance host port
    #[arg(short, long)]
    pub port: Option<u16>,
}
