use anyhow::Context;
use clap::Parser;
use signal_copier::{
    api::{build_router, AppState},
    config::AppConfig,
    container::Container,
    telemetry,
};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "signal-copier")]
#[command(about = "Signal copier backend", version, long_about = None)]
struct Cli {
    /// Override config file (defaults to $COPIER_CONFIG or config/copier.toml)
    #[arg(short, long, env = "COPIER_CONFIG")]
    config: Option<String>,

    /// Load and print the configuration, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("failed to load configuration")?;

    if cli.check {
        println!("{:#?}", config);
        return Ok(());
    }

    telemetry::init_tracing(&config.observability);

    tracing::info!("Starting {} v{}", config.service.name, config.service.version);
    tracing::info!("Service mode: {:?}", config.service.mode);

    let http_addr = config.server.http_addr();
    let health_route = config.server.health_route.clone();
    let container = Arc::new(Container::new(config));

    if let Err(e) = container.initialize().await {
        tracing::error!("Initialization failed: {}", e);
        if let Err(close_err) = container.close().await {
            tracing::error!("Cleanup after failed initialization: {}", close_err);
        }
        return Err(e).context("failed to initialize container");
    }

    let app = build_router(AppState::new(container.clone()), &health_route);
    let http_listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("failed to bind {}", http_addr))?;

    tracing::info!("🚀 HTTP server listening on http://{}", http_addr);
    tracing::info!("   Health check: http://{}{}", http_addr, health_route);
    tracing::info!("   Metrics: http://{}/metrics", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let shutdown = container.shutdown_token();
    let http_handle = tokio::spawn(async move {
        let server = axum::serve(http_listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = server.await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    let stopped = container.shutdown_token();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => tracing::info!("Shutdown signal received"),
                Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
            }
        }
        _ = stopped.cancelled() => {}
    }

    tracing::info!("Shutting down gracefully...");
    let closed = container.close().await;

    if let Err(e) = http_handle.await {
        tracing::warn!("HTTP server task ended abnormally: {}", e);
    }

    closed.context("errors during shutdown")?;
    tracing::info!("Shutdown complete");
    Ok(())
}
