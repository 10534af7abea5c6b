//! MidDB CLI
//!
//! A hybrid record store serving structured and semantic queries over
//! HTTP.
//!
//! # Usage
//!
//! ```bash
//! # Start the server on the defaults (0.0.0.0:8080, ./data)
//! middb serve
//!
//! # Custom bind address and storage directory
//! middb serve --host 127.0.0.1 --port 9090 --data-dir /var/lib/middb
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use middb::server;
use middb::{Config, Database};

#[derive(Parser)]
#[command(name = "middb")]
#[command(about = "A hybrid record store: structured fields plus embeddings")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Server port
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Storage directory for snapshots and ANN indices
        #[arg(short, long, default_value = "data")]
        data_dir: PathBuf,

        /// Most write tasks applied per worker batch
        #[arg(long, default_value = "100")]
        batch_size: usize,

        /// Worker wake interval in seconds while the queue is idle
        #[arg(long, default_value = "5")]
        idle_wait_secs: u64,

        /// Capacity hint for a table's first ANN index
        #[arg(long, default_value = "20000")]
        ann_capacity: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            data_dir,
            batch_size,
            idle_wait_secs,
            ann_capacity,
        } => {
            let config = Config {
                data_dir,
                batch_size,
                idle_wait: Duration::from_secs(idle_wait_secs),
                ann_capacity_hint: ann_capacity,
            };
            let db = Arc::new(Database::open(config)?);

            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!("listening on {addr}");

            axum::serve(listener, server::router(db.clone()))
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            tracing::info!("draining write queue before exit");
            db.shutdown();
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
