use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shardfs::cluster;
use shardfs::config::Settings;
use shardfs::fs::{ChunkStore, Flusher};
use shardfs::ring::RingTable;
use shardfs::rpc::RpcServer;

#[derive(Parser)]
#[command(name = "shardfs")]
#[command(author, version, about = "Consistent-hash-sharded chunk file store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a default configuration file
    Init {
        #[arg(default_value = "shardfs.toml")]
        path: PathBuf,
    },
    /// Run the store server
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { path } => {
            Settings::write_default_config(&path)?;
            println!("Configuration file created at: {}", path.display());
            println!("Edit the file and run: shardfs run -c {}", path.display());
            Ok(())
        }
        Commands::Run { config } => run_server(config).await,
    }
}

async fn run_server(config: PathBuf) -> Result<()> {
    let settings = Settings::from_file(&config)?;
    let shutdown = CancellationToken::new();

    let ring = Arc::new(RingTable::new(
        settings.ring.digest,
        settings.node.hash_port,
        settings.advertised_address(),
    ));

    let (store, flush_rx) = ChunkStore::new(
        settings.storage.data_dir.clone(),
        settings.storage.metadata,
        settings.storage.backend_dir.clone(),
        ring.clone(),
    )?;

    let flush_handles =
        Flusher::new(store.clone(), settings.flush.workers).spawn(flush_rx, shutdown.clone());

    let (election_tx, election_rx) = mpsc::unbounded_channel();
    let membership = cluster::spawn_membership(ring.clone(), election_rx, shutdown.clone());

    let listener = TcpListener::bind(&settings.node.listen)
        .await
        .with_context(|| format!("binding rpc listener on {}", settings.node.listen))?;

    let server = RpcServer::new(
        ring.clone(),
        store,
        settings.forward_timeout(),
        election_tx,
    );
    let serve = tokio::spawn(server.serve(listener, shutdown.clone()));

    cluster::join(&ring, &settings.ring.seeds, settings.forward_timeout()).await;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");
    shutdown.cancel();

    serve.await.context("rpc server task")??;
    for handle in flush_handles {
        let _ = handle.await;
    }
    let _ = membership.await;
    info!("shutdown complete");
    Ok(())
}
