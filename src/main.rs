use anyhow::Result;
use clap::Parser;
use solar_plant_sim::{app::App, cli::Cli, config::Config, telemetry};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(&cli)?;

    telemetry::init_tracing(cli.log.into(), cfg.logging.json);

    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "config file not found, using defaults");
    }
    if cfg.server.port != 0 && cfg.server.port < 1024 {
        warn!(
            port = cfg.server.port,
            "binding a privileged port; run with elevated rights or set SOLARSIM__SERVER__PORT"
        );
    }

    let app = App::build(&cfg).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            telemetry::shutdown_signal().await;
            shutdown.cancel();
        }
    });

    app.run(shutdown).await;

    info!("shutdown complete");
    Ok(())
}
