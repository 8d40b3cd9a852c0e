//! devtree daemon: serves the authoritative device tree over WebSocket.
//!
//! Reads `devicetree.json` and the optional `sensor_bounds.json` from the
//! config directory, serves replicas, and writes the tree back periodically
//! and on Ctrl-C.

use std::path::{Path, PathBuf};

use clap::Parser;
use log::{error, info, warn};

use devtree_core::{BoundsTable, DiscoveredDevice, Tree};
use devtree_sync::{ServerConfig, SnapshotStore, SyncServer};

const SNAPSHOT_FILE: &str = "devicetree.json";
const BOUNDS_FILE: &str = "sensor_bounds.json";

/// Device tree replication server.
#[derive(Parser, Debug)]
#[command(name = "devtree-daemon", version, about)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:3000", env = "DEVTREE_BIND")]
    bind: String,

    /// Directory holding devicetree.json and sensor_bounds.json
    #[arg(short, long, default_value = "config", env = "DEVTREE_CONFIG_DIR")]
    config_dir: PathBuf,

    /// Seconds between snapshot writes
    #[arg(long, default_value_t = 60, env = "DEVTREE_SAVE_INTERVAL")]
    save_interval: u64,

    /// Frames a session may fall behind before it is resent the tree
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,

    /// JSON list of discovered devices to merge at startup
    #[arg(long)]
    discovered: Option<PathBuf>,
}

fn load_bounds(dir: &Path) -> BoundsTable {
    let path = dir.join(BOUNDS_FILE);
    if !path.exists() {
        return BoundsTable::default();
    }
    match BoundsTable::load(&path) {
        Ok(bounds) => {
            info!("Loaded sensor bounds from {}", path.display());
            bounds
        }
        Err(e) => {
            warn!("Ignoring {}: {e}", path.display());
            BoundsTable::default()
        }
    }
}

fn load_tree(store: &SnapshotStore, bounds: BoundsTable) -> Result<Tree, Box<dyn std::error::Error>> {
    match store.load()? {
        Some(snapshot) => Ok(Tree::from_snapshot(&snapshot, bounds)?),
        None => Ok(Tree::with_bounds(bounds)),
    }
}

fn merge_discovered(tree: &mut Tree, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let discovered: Vec<DiscoveredDevice> = serde_json::from_str(&text)?;
    for device in &discovered {
        if let Err(e) = tree.merge_discovered(device) {
            warn!("Skipping discovered device {}: {e}", device.ip);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = std::fs::create_dir_all(&cli.config_dir) {
        error!("Cannot create {}: {e}", cli.config_dir.display());
        std::process::exit(1);
    }

    let snapshot_path = cli.config_dir.join(SNAPSHOT_FILE);
    let bounds = load_bounds(&cli.config_dir);
    let mut tree = match load_tree(&SnapshotStore::new(&snapshot_path), bounds) {
        Ok(tree) => tree,
        Err(e) => {
            error!("Failed to load {}: {e}", snapshot_path.display());
            std::process::exit(1);
        }
    };

    if let Some(path) = &cli.discovered {
        if let Err(e) = merge_discovered(&mut tree, path) {
            error!("Failed to read discovered devices from {}: {e}", path.display());
        }
    }

    info!(
        "Serving {} devices and {} views",
        tree.device_count(),
        tree.view_count()
    );

    let config = ServerConfig {
        bind_addr: cli.bind,
        broadcast_capacity: cli.broadcast_capacity,
        save_interval_secs: cli.save_interval,
        snapshot_path: Some(snapshot_path),
    };
    let server = SyncServer::new(config, tree);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    if let Err(e) = server.save_snapshot().await {
        error!("Final snapshot failed: {e}");
    }
}
