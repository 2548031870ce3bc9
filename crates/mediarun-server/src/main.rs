//! MediaRun generation server.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mediarun_server::http::create_router;
use mediarun_server::{Components, Engine, ServerConfig};

/// MediaRun generation server.
#[derive(Parser, Debug)]
#[command(name = "mediarun-server", about = "MediaRun media generation server")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// HTTP server address (overrides the config file)
    #[arg(long)]
    bind_addr: Option<String>,

    /// Model pool memory budget (overrides the config file)
    #[arg(long)]
    budget: Option<u64>,

    /// Directory for generated outputs (overrides the config file)
    #[arg(long)]
    outputs_dir: Option<PathBuf>,

    /// Create an API key at startup and print it
    #[arg(long)]
    dev_key: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mediarun=info".parse()?))
        .with_target(true)
        .init();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_yaml(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind_addr) = args.bind_addr {
        config.bind_addr = bind_addr;
    }
    if let Some(budget) = args.budget {
        config.pool.budget = budget;
    }
    if let Some(outputs_dir) = args.outputs_dir {
        config.outputs_dir = outputs_dir;
    }

    let components = Components::simulated(&config)?;
    let engine = Arc::new(Engine::start(config, components)?);

    if args.dev_key {
        let (key, principal) = engine.create_principal("dev", None).await?;
        info!(
            principal = %principal.id,
            credits = principal.credit_balance,
            key = %key,
            "Development API key created"
        );
    }
    if engine.config().admin_secret.is_none() {
        warn!("No admin secret configured - admin endpoints are disabled");
    }

    let bind_addr = engine.config().bind_addr.clone();
    let listener = TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "HTTP server listening");

    let router = create_router(engine.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    info!("Draining queued tasks");
    engine.shutdown().await;
    info!("MediaRun server stopped");

    Ok(())
}
