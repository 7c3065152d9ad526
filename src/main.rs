//! KubePortal daemon - local port-forward multiplexer

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kubeportal::cache::ClusterCache;
use kubeportal::config::{self, ConfigStore};
use kubeportal::manager::ForwardManager;
use kubeportal::rpc::PortalService;

/// KubePortal - local daemon multiplexing developer port forwards
#[derive(Parser, Debug)]
#[command(name = "kubeportal", version, about, long_about = None)]
struct Cli {
    /// gRPC listen port (loopback only)
    #[arg(long, default_value_t = kubeportal::DEFAULT_GRPC_PORT)]
    port: u16,

    /// Override the config file path
    #[arg(long, env = "KUBEPORTAL_CONFIG")]
    config: Option<PathBuf>,

    /// Disable the config file watcher (no hot reload)
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_config_path()
            .map_err(|e| anyhow::anyhow!("Failed to resolve config path: {}", e))?,
    };
    tracing::info!(path = %config_path.display(), "Using config file");

    let shutdown = CancellationToken::new();
    let cache = Arc::new(ClusterCache::new());
    Arc::clone(&cache).spawn_sweeper(shutdown.clone());

    let manager = Arc::new(ForwardManager::new(
        ConfigStore::new(config_path),
        cache,
        shutdown.clone(),
    ));
    manager.initialize().await;

    let watcher = if cli.no_watch {
        tracing::info!("Config watcher disabled");
        None
    } else {
        Arc::clone(&manager)
            .spawn_config_watcher()
            .map_err(|e| anyhow::anyhow!("Failed to start config watcher: {}", e))?
    };

    // Ctrl-C cancels the same token the Shutdown RPC does
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    let addr = SocketAddr::from(([127, 0, 0, 1], cli.port));
    tracing::info!(%addr, "KubePortal daemon listening");

    PortalService::serve(Arc::clone(&manager), shutdown.clone(), addr)
        .await
        .map_err(|e| anyhow::anyhow!("RPC server failed: {}", e))?;

    // Server has drained; tear down forwarders before exit.
    manager.stop_all().await;
    if let Some(task) = watcher {
        task.abort();
    }

    tracing::info!("KubePortal daemon stopped");
    Ok(())
}
