pub mod gateway;
pub mod instance;
pub mod runtime;
pub mod scheduler;
pub mod settings;
pub mod state;

use anyhow::Result;
use axum::routing::get;
use axum::{Json, Router};
use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use scheduler::{Scheduler, Task};
use state::AppState;

/// How long in-flight HTTP requests get to drain after shutdown starts.
/// SSE streams have no read cap of their own, so the bound lives here.
const HTTP_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Run the control-plane process: the container monitor on its cron, the
/// MCP gateway on its own port, and the operational API listener.
pub async fn run_server(settings: settings::Settings) -> Result<()> {
    let state = AppState::new(&settings).await?;

    let scheduler = Arc::new(Scheduler::new());
    let monitor = state.monitor.clone();
    scheduler
        .add_task(Task {
            id: "container-monitor".to_string(),
            name: "container monitor".to_string(),
            cron_expression: settings.monitor.cron.clone(),
            kind: "reconcile".to_string(),
            func: Arc::new(move |_token| {
                let monitor = monitor.clone();
                async move {
                    monitor.run_sweep().await?;
                    Ok(())
                }
                .boxed()
            }),
        })?;
    scheduler.start();
    info!(cron = settings.monitor.cron, "container monitor scheduled");

    let api = Router::new()
        .route("/health", get(health_check))
        .route("/version", get(version_info))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let gateway = gateway::router(state.gateway.clone()).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let api_addr = format!("{}:{}", settings.server.host, settings.server.port);
    let gateway_addr = format!("{}:{}", settings.server.host, settings.gateway.port);

    let api_listener = tokio::net::TcpListener::bind(&api_addr).await?;
    let gateway_listener = tokio::net::TcpListener::bind(&gateway_addr).await?;
    info!("API listening on http://{}", api_addr);
    info!(
        "MCP gateway listening on http://{}/{}",
        gateway_addr,
        settings.gateway.prefix.trim_matches('/')
    );

    let shutdown = CancellationToken::new();
    let api_shutdown = shutdown.clone();
    let gateway_shutdown = shutdown.clone();
    let api_server = axum::serve(api_listener, api)
        .with_graceful_shutdown(async move { api_shutdown.cancelled().await });
    let gateway_server = axum::serve(gateway_listener, gateway)
        .with_graceful_shutdown(async move { gateway_shutdown.cancelled().await });

    let servers = tokio::spawn(async move {
        let (api_result, gateway_result) = tokio::join!(api_server, gateway_server);
        api_result.and(gateway_result)
    });

    shutdown_signal().await;

    // The scheduler goes down first: no new ticks are dispatched and
    // in-flight tick workers see the cancellation before the listeners
    // stop accepting.
    scheduler.stop().await;

    shutdown.cancel();
    match tokio::time::timeout(HTTP_SHUTDOWN_GRACE, servers).await {
        Ok(Ok(Ok(()))) => info!("HTTP servers shutdown complete"),
        Ok(Ok(Err(err))) => return Err(err.into()),
        Ok(Err(err)) => warn!(error = %err, "HTTP server task join failed"),
        Err(_) => warn!(
            "HTTP servers did not drain within {}s, exiting",
            HTTP_SHUTDOWN_GRACE.as_secs()
        ),
    }

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn version_info() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
