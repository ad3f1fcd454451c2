#![warn(missing_docs)]

//! `cdav-transfer`: upload, download and hash files against the cloud backend.

use anyhow::Result;
use clap::Parser;
use clouddav_transfer::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(login = %cli.login, command = ?cli.command, "clouddav transfer CLI starting");
    cli.run().await
}
