// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `labrund`: the labrun host daemon.

use clap::Parser;
use labrun_daemon::{Config, Host, Listener};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "labrund", about = "Laboratory protocol host")]
struct Args {
    /// Bind host for the WebSocket listener.
    #[arg(long, default_value = Config::DEFAULT_HOST)]
    host: String,

    /// Bind port for the WebSocket listener.
    #[arg(long, default_value_t = Config::DEFAULT_PORT)]
    port: u16,

    /// Override the application data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "daemon failed");
            eprintln!("labrund: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::new(args.host.clone(), args.port, args.data_dir)?;
    let host = Host::new(&config).await?;
    let listener = Listener::bind(&format!("{}:{}", config.host, config.port), host).await?;
    listener.run().await;
    Ok(())
}
