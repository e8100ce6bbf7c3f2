#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # koruza-control
//!
//! Serial command broker for the KORUZA free-space optical link controller.
//!
//! The link controller is a half-duplex serial device that accepts one
//! request at a time. Run with `-d` this binary is the broker daemon: it
//! owns the device, accepts local clients on a filesystem socket, serializes
//! their commands and frames each multi-line reply back to its requester.
//! Without `-d` it runs as an interactive controller client of that broker.

use std::path::PathBuf;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use koruza_control::broker::Broker;
use koruza_control::{client, config::Config, serial::SerialPort, server};

/// Serial command broker for the KORUZA optical link controller.
#[derive(Parser)]
#[command(name = "koruza-control", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    config: String,

    /// Run as the broker daemon. Without this flag the binary runs as an
    /// interactive controller client.
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    /// Log human-oriented output to standard error.
    #[arg(short = 'f', long = "foreground")]
    foreground: bool,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .with_ansi(cli.foreground)
        .init();

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            eprintln!("Config error: {err}");
        }
        std::process::exit(2);
    }

    if cli.daemon {
        run_broker(config).await;
    } else if let Err(e) = client::run(&config).await {
        eprintln!("{e}");
        std::process::exit(2);
    }
}

async fn run_broker(config: Config) {
    info!("koruza-control v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Serial device: {} at {} baud",
        config.broker.device, config.broker.baudrate
    );
    info!("Client socket: {}", config.broker.socket);

    let device = PathBuf::from(&config.broker.device);
    let port = match SerialPort::open(&device, config.broker.baudrate) {
        Ok(port) => port,
        Err(e) => {
            error!("Failed to open serial device: {e}");
            std::process::exit(2);
        }
    };

    let socket = PathBuf::from(&config.broker.socket);
    let listener = match server::bind(&socket) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind client socket: {e}");
            std::process::exit(2);
        }
    };

    let hook = config.broker.hooks.reset.as_ref().map(PathBuf::from);

    let (events_tx, events_rx) = mpsc::channel(64);
    let broker = Broker::new(port, device, hook, events_tx.clone());
    let broker_task = tokio::spawn(broker.run(events_rx));
    let listener_task = tokio::spawn(server::run(listener, events_tx));

    info!("Broker ready");

    shutdown_signal().await;

    info!("Shutting down...");
    listener_task.abort();
    broker_task.abort();
    if let Err(e) = std::fs::remove_file(&socket) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove socket {}: {e}", socket.display());
        }
    }
    info!("Goodbye");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to register SIGTERM");
    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}
