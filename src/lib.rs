pub mod app;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod irradiance;
pub mod registers;
pub mod server;
pub mod store;
pub mod telemetry;
