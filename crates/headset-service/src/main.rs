//! Headset Service - Audio gateway daemon and HTTP API.
//!
//! Run with: `cargo run -p headset-service`

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use clap::Parser;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use headset_service::{AppState, Config, Reactor, TcpConnector, api, ws};

/// Headset Service - Bluetooth headset audio gateway with a REST API.
#[derive(Parser, Debug)]
#[command(name = "headset-service")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long)]
    bind: Option<String>,

    /// Enable debug logging for the gateway.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("headset_service={level}").parse()?)
                .add_directive(format!("headset_core={level}").parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_default(),
    };

    // Override config with CLI args
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    config.validate()?;

    // The gateway is not Send; it lives on this thread's LocalSet.
    LocalSet::new().run_until(run_server(config)).await
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let connector = TcpConnector::from_config(&config);
    let (reactor, handle) = Reactor::new(&config, connector, shutdown.clone());
    let reactor = tokio::task::spawn_local(reactor.run());

    // Create application state
    let state = AppState::new(handle, config.clone());

    // Build the router
    let app = Router::new()
        .merge(api::router())
        .merge(ws::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    // Parse bind address
    let addr: SocketAddr = config.server.bind.parse()?;

    info!("Starting server on {}", addr);

    // Run the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::error!("Failed to listen for Ctrl-C: {e}");
                    }
                    info!("Shutting down");
                }
                () = server_shutdown.cancelled() => {}
            }
        })
        .await?;

    shutdown.cancel();
    reactor.await?;

    Ok(())
}
