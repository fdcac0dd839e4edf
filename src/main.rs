use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use kubestream_k8s::{Inventory, KubeConnector};
use kubestream_logs::KubeTailer;
use kubestream_server::{ServerConfig, SessionSupervisor, router, run_server};

/// Kubestream - stream Kubernetes logs to the browser over WebSockets
#[derive(Parser, Debug)]
#[command(name = "kubestream")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Directory of static front-end assets
    #[arg(long, value_name = "DIR")]
    assets: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// kubectl binary used for namespace/pod/context listings
    #[arg(long, value_name = "PATH")]
    kubectl: Option<PathBuf>,
}

impl Args {
    /// Load the config file (or defaults) and apply command line overrides
    fn resolve_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.server.listen = listen;
        }
        if let Some(assets) = &self.assets {
            config.server.assets = Some(assets.clone());
        }
        if let Some(level) = &self.log_level {
            config.server.log_level = level.clone();
        }
        if let Some(kubectl) = &self.kubectl {
            config.inventory.kubectl = kubectl.clone();
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let result = match args.resolve_config() {
        Ok(config) => {
            init_tracing(&config.server.log_level);
            run(config).await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config: ServerConfig) -> Result<()> {
    let shutdown = CancellationToken::new();

    let supervisor = Arc::new(
        SessionSupervisor::new(KubeTailer::new(), KubeConnector::new(), config.session)
            .with_shutdown(shutdown.clone()),
    );
    let inventory = Inventory::new(config.inventory.kubectl.clone());
    let app = router(
        Arc::clone(&supervisor),
        Arc::new(inventory),
        config.server.assets.as_deref(),
    );

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received interrupt");
            }
            shutdown.cancel();
        }
    });

    run_server(config.server.listen, app, shutdown)
        .await
        .with_context(|| format!("server on {} failed", config.server.listen))?;

    // Upgraded connections are not part of the graceful drain; give each open
    // session time for its error and close frames.
    let grace = config.session.write_wait * 3;
    if tokio::time::timeout(grace, supervisor.wait_closed()).await.is_err() {
        tracing::warn!(
            open = supervisor.open_sessions(),
            "sessions still open after {:?}",
            grace
        );
    }

    Ok(())
}
