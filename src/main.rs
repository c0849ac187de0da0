use clap::Parser;
use anyhow::Result;

use station_scan::{app::App, cli::Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(err) = cli.validate() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    cli.setup_logging();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("Failed to read configuration: {:#}", anyhow::Error::from(err));
            tracing::error!("Exiting...");
            std::process::exit(1);
        }
    };
    tracing::info!("Watching station files in: {}", config.watch_directory.display());

    if let Err(err) = App::new(config).run().await {
        tracing::error!("Application error: {:#}", err);
        std::process::exit(1);
    }

    Ok(())
}
