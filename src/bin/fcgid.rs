use std::{error::Error, sync::mpsc};

use clap::Parser;
use fcgid::{AreaCheck, ListenAddress, Server, ServerConfig, config};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for web server connections at HOST:PORT or unix:/path
    #[arg(default_value = config::DEFAULT_ADDRESS)]
    address: ListenAddress,
    /// Serve several requests over one connection at the same time
    #[arg(long)]
    multiplex: bool,
    /// Connections served at the same time
    #[arg(long, default_value_t = config::DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,
    /// Requests handled at the same time when multiplexing
    #[arg(long, default_value_t = config::DEFAULT_MAX_REQUESTS)]
    max_requests: usize,
    /// Application status reported when a handler fails
    #[arg(long, default_value_t = config::DEFAULT_FAILURE_STATUS)]
    failure_status: u32,
    /// Application status reported for an aborted request
    #[arg(long, default_value_t = config::DEFAULT_ABORTED_STATUS)]
    aborted_status: u32,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ServerConfig::new(cli.address)
        .with_multiplex(cli.multiplex)
        .with_max_connections(cli.max_connections)
        .with_max_requests(cli.max_requests)
        .with_failure_status(cli.failure_status)
        .with_aborted_status(cli.aborted_status);

    let handle = Server::bind(config, AreaCheck::new())?.start()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    let _ = rx.recv();

    info!("interrupted, shutting down");
    handle.stop()?;
    Ok(())
}
