//! locsync - GPS location batching agent.
//!
//! Run with: `cargo run -p locsync-service`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use locsync_service::{AppState, Config, Maintenance, ProviderKind, api};
use locsync_store::Store;

/// locsync - samples GPS fixes and uploads them in batches.
#[derive(Parser, Debug)]
#[command(name = "locsync")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long)]
    bind: Option<String>,

    /// Database path (overrides config).
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Location provider (overrides config).
    #[arg(short, long, value_enum)]
    provider: Option<ProviderKind>,

    /// Disable the periodic maintenance task.
    #[arg(long)]
    no_maintenance: bool,

    /// Write the effective configuration to this path and exit.
    #[arg(long, value_name = "PATH")]
    write_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("locsync=info".parse()?)
                .add_directive("locsync_core=info".parse()?)
                .add_directive("locsync_service=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_else(|e| {
            warn!("Ignoring unreadable default config: {}", e);
            Config::default()
        }),
    };

    // Override config with CLI args
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(db_path) = args.database {
        config.storage.path = db_path;
    }
    if let Some(provider) = args.provider {
        config.provider.kind = provider;
    }
    config.validate()?;

    if let Some(path) = &args.write_config {
        config.save(path)?;
        info!("Wrote configuration to {:?}", path);
        return Ok(());
    }

    // Open the database
    info!("Opening database at {:?}", config.storage.path);
    let store = Store::open(&config.storage.path)?;

    // Create application state
    let addr: SocketAddr = config.server.bind.parse()?;
    info!("Using {:?} location provider", config.provider.kind);
    let state = AppState::from_config(store, config)?;

    // Start periodic maintenance
    let cancel = CancellationToken::new();
    let maintenance = if args.no_maintenance {
        info!("Maintenance task disabled");
        None
    } else {
        Some(
            Maintenance::new(Arc::clone(&state))
                .start(cancel.clone())
                .await,
        )
    };

    // Build the router
    let app = Router::new()
        .merge(api::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(Arc::clone(&state));

    info!("Starting server on {}", addr);

    // Run the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop sampling before the runtime goes away
    cancel.cancel();
    if let Some(handle) = maintenance
        && let Err(e) = handle.await
    {
        warn!("Maintenance task ended abnormally: {}", e);
    }
    state.controller.stop().await?;
    info!("Shut down");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
