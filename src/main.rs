//! Sandbox broker - per-caller browser sandboxes with live worker output.
//!
//! Usage:
//!   sandbox-broker serve [--port 8080] [--redis-url redis://...]

#[cfg(not(unix))]
compile_error!("This program only works on Unix: workers are managed as process groups.");

mod affinity;
mod broker;
mod config;
mod error;
mod http_server;
mod process_signal;
mod provisioner;
mod reaper;
mod registry;
mod state;
mod store;
mod stream;
mod supervisor;
#[cfg(test)]
mod testing;
mod viewer;

use broker::Broker;
use clap::{Parser, Subcommand};
use config::{BrokerConfig, ServeArgs};
use provisioner::DockerProvisioner;
use state::AppState;
use std::process::exit;
use std::sync::Arc;
use store::{KvStore, MemoryKv, RedisKv};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sandbox-broker")]
#[command(about = "Brokers sandboxed browser sessions and streams worker output")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Serve(serve) => {
            if let Err(e) = serve_broker(serve).await {
                error!("{}", e);
                exit(1);
            }
        }
    }
}

async fn serve_broker(args: ServeArgs) -> Result<(), String> {
    let config = BrokerConfig::from_args(&args).await;

    let kv: Arc<dyn KvStore> = match &args.redis_url {
        Some(url) => {
            info!("Using shared session store at {}", url);
            Arc::new(RedisKv::open(url).await.map_err(|e| format!("session store: {}", e))?)
        }
        None => {
            warn!("No REDIS_URL configured; sessions are local to this instance");
            Arc::new(MemoryKv::new())
        }
    };

    let provisioner = DockerProvisioner::connect(&config)
        .map_err(|e| format!("container backend: {}", e))?;

    let broker = Arc::new(Broker::new(config, kv, Arc::new(provisioner)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reaper = tokio::spawn(broker.reaper().run(shutdown_rx.clone()));

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for ctrl-c: {}", e);
            // Dropping the sender would read as a shutdown request.
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
        let _ = shutdown_tx.send(true);
    });

    let served = http_server::run_server(args.port, AppState::new(broker), shutdown_rx).await;
    if served.is_err() {
        reaper.abort();
    } else if let Err(e) = reaper.await {
        warn!("Reaper task failed: {}", e);
    }
    served.map_err(|e| format!("http server: {}", e))
}
