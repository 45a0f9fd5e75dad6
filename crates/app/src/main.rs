//! Huddle - multi-room TCP chat
//!
//! `huddle serve` runs the server, `huddle chat` is a terminal client.

use clap::Parser;
use huddle_net::{Client, Server};
use tokio::net::lookup_host;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod config;
mod console;

use cli::{Cli, Command};
use config::{AppConfig, LogConfig};

fn init_logging(log: &LogConfig) {
    // RUST_LOG wins over the config file
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn serve(config: AppConfig) -> huddle_net::Result<()> {
    let server = Server::start(config.server).await?;
    tracing::info!(addr = %server.addr(), "Listening");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
    }

    server.shutdown();
    server.wait().await;
    Ok(())
}

async fn chat(name: String, server: String) -> huddle_net::Result<()> {
    huddle_net::dispatcher::validate_name("user", &name)?;
    let addr = lookup_host(server.as_str()).await?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} did not resolve to any address", server),
        )
    })?;

    let client = Client::connect(addr).await?;
    console::run(client, &name).await
}

fn main() {
    let cli = Cli::parse();

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("huddle: {}", e);
            std::process::exit(2);
        }
    };

    init_logging(&config.log);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Serve { host, port } => {
            tracing::info!("Starting Huddle server");
            runtime.block_on(serve(config.with_overrides(host, port)))
        }
        Command::Chat { name, server } => runtime.block_on(chat(name, server)),
    };

    if let Err(e) = result {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
