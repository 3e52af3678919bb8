//! Server entrypoint: load config, wire up collaborators, serve the router,
//! shut down gracefully on SIGTERM/ctrl-c within a bounded grace period.

use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use casf_gateway::config::{GatewayConfig, LogFormat};
use casf_gateway::handlers;
use casf_gateway::state::AppState;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env()?;
    init_tracing(&config);

    tracing::info!(port = config.port, "starting casf-gateway");
    let state = AppState::build(config.clone()).await?;

    let app = Router::new()
        .route("/v1/verify", post(handlers::verify))
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining in-flight requests");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(config.shutdown_grace, server).await {
        Ok(join_result) => join_result??,
        Err(_) => tracing::warn!(
            grace_seconds = config.shutdown_grace.as_secs(),
            "grace period elapsed with requests still in flight, exiting anyway"
        ),
    }

    Ok(())
}

fn init_tracing(config: &GatewayConfig) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

/// Resolves on SIGTERM or ctrl-c, nothing more. The caller is responsible for
/// telling the server to stop accepting new connections and for bounding how
/// long it waits on in-flight requests — see the `shutdown_grace` handling in
/// `main`, which forces an exit rather than hanging forever if draining never
/// finishes.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
