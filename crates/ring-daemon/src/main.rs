//! ring-daemon: one member of a self-organizing ring.
//!
//! Reads the shared directory file to pick an id, then either bootstraps the
//! ring as coordinator or registers with the existing coordinator.

use anyhow::{Result, anyhow};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use ring_core::NodeIdentity;
use ring_daemon::{Bootstrap, DirectoryFile, Node, NodeConfig, NodeEvent, RpcServer};

#[derive(Parser, Debug)]
#[command(name = "ring-daemon")]
#[command(about = "Ring member with coordinator election and replica sync")]
struct Args {
    /// Host to listen on and advertise to other nodes
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Node N listens on base_port + N
    #[arg(long, default_value_t = 8000)]
    base_port: u16,

    /// Shared membership directory file
    #[arg(long, default_value = "nodes-list.json")]
    directory_file: PathBuf,

    /// Scramble one replica slot 3s after every sync
    #[arg(long)]
    simulate_drift: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,ring_daemon=debug"
    } else {
        "info,ring_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting ring-daemon");
    info!("Directory file: {:?}", args.directory_file);

    let file = DirectoryFile::new(&args.directory_file);
    let mut record = file.load()?;
    let (id, bootstrap) = record.plan();
    let identity = NodeIdentity::conventional(id, &args.host, args.base_port)
        .ok_or_else(|| anyhow!("node {} has no port above base port {}", id, args.base_port))?;

    let listener = RpcServer::bind(&identity.address).await?;

    // A joiner is advertised once the coordinator has admitted it
    if bootstrap == Bootstrap::Coordinator {
        record.nodes.insert_identity(&identity);
        record.coordinator = Some(id);
        file.save(&record)?;
    }

    let mut config = NodeConfig::default();
    if args.simulate_drift {
        config.drift_after = Some(Duration::from_secs(3));
    }

    let node = Node::start(identity.clone(), listener, bootstrap, config);
    let mut events = node.subscribe();

    info!(node = %id, "Node running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(NodeEvent::Registered { coordinator }) => {
                    debug!(node = %id, "Registered with {}", coordinator);
                    if let Err(e) = file.insert_node(&identity) {
                        warn!(node = %id, "Failed to record node in {:?}: {}", file.path(), e);
                    }
                }
                Ok(NodeEvent::Promoted) => {
                    let recorded = file
                        .insert_node(&identity)
                        .and_then(|()| file.set_coordinator(id));
                    if let Err(e) = recorded {
                        warn!(node = %id, "Failed to record coordinator in {:?}: {}", file.path(), e);
                    }
                }
                Ok(event) => debug!(node = %id, "{:?}", event),
                Err(RecvError::Lagged(skipped)) => debug!(node = %id, "Skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            },

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    if let Err(e) = file.remove_node(id) {
        warn!(node = %id, "Failed to remove node from {:?}: {}", file.path(), e);
    }
    node.shutdown();
    info!("Shutting down");
    Ok(())
}
