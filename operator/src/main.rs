use anyhow::Result;
use clap::Parser;

mod args;
mod elastic;
mod indexer;
mod server;
mod store;
mod tasks;
mod util;

use args::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    snaprestore_common::init();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Controller(args) => tasks::run_controller(args).await,
        Commands::Server(args) => {
            snaprestore_common::metrics::maybe_spawn_metrics_server();
            server::run_server(args).await
        }
    }
}
