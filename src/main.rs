// vaultkeeper - main.rs
// Installs logging, parses the command line and hands off to the dispatcher.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vaultkeeper::cli::{dispatch, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vaultkeeper=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    dispatch(Cli::parse()).await
}
