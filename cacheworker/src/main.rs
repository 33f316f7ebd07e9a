use anyhow::Context;
use cacheworker::cli::{Cli, Commands};
use cacheworker::config::load_config;
use cacheworker::coordinator::InMemoryCoordinator;
use cacheworker::dataserver::DataServerRegistry;
use cacheworker::worker::Worker;
use clap::Parser;
use log::info;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start { config } => {
            let path = config
                .to_str()
                .context("config path is not valid UTF-8")?;
            let cfg = load_config(path)?;
            // standalone mode keeps file and block metadata in process
            let coordinator = Arc::new(InMemoryCoordinator::new());
            let worker = Worker::start(&cfg, coordinator, &DataServerRegistry::default())
                .await
                .context("Failed to start worker")?;

            tokio::signal::ctrl_c().await?;
            info!("received ctrl-c, shutting down");
            worker.shutdown().await?;
        }
    }

    Ok(())
}
