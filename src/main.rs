#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! tunld server binary: two listeners (public HTTP + control channel),
//! periodic sweeps, and orderly shutdown on SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Json, Router};
use clap::Parser;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use tunld::{channel, ingress, routes, Config, GatewayState};

/// Reverse HTTP tunneling gateway.
#[derive(Parser)]
#[command(name = "tunld", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(message) = run(cli.config.as_deref()).await {
        // Startup failures may precede tracing initialization.
        eprintln!("tunld: {message}");
        std::process::exit(1);
    }
}

async fn run(config_path: Option<&str>) -> Result<(), String> {
    let config = Config::load(config_path)?;

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("tunld v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Public surface on {}:{} for domain {}",
        config.server.bind_host, config.server.http_port, config.server.public_domain
    );
    info!(
        "Control channel on {}:{}",
        config.server.bind_host, config.server.control_port
    );

    let state = GatewayState::new(config);

    // Keep one subscriber on the event bus alive for the process lifetime so
    // tunnel/traffic emission always has a listener; the dashboard surface
    // attaches here.
    let mut events_rx = state.events.subscribe();
    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => debug!(target: "tunld::events", %event, "event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event bus lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Periodic sweep: drop captured exchanges past the retention window.
    let inspector = state.inspector.clone();
    let mut sweep_shutdown = state.shutdown.subscribe();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => { inspector.sweep_expired(); }
                _ = sweep_shutdown.recv() => break,
            }
        }
    });

    // Public surface: control-surface routes with host-based tunnel
    // dispatch layered in front.
    let mut api = Router::new()
        .route("/health", get(routes::health::health))
        .route("/api/tunnels", get(routes::tunnels::list_tunnels))
        .route("/api/tunnels/{id}", get(routes::tunnels::get_tunnel))
        .route("/api/stats", get(routes::tunnels::stats))
        .route("/api/traffic", get(routes::traffic::list_traffic))
        .route(
            "/api/traffic/tunnel/{tunnel_id}",
            get(routes::traffic::tunnel_traffic),
        )
        .route("/api/traffic/{request_id}", get(routes::traffic::get_exchange))
        .route(
            "/api/traffic/{request_id}/curl",
            get(routes::traffic::get_curl),
        )
        .fallback(ingress::banner);

    if let Some(origin) = &state.config.server.dashboard_origin {
        let origin = origin
            .parse::<HeaderValue>()
            .map_err(|e| format!("invalid dashboard origin '{origin}': {e}"))?;
        api = api.layer(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET])
                .allow_headers(Any),
        );
    }

    let public_app = api
        .layer(middleware::from_fn_with_state(
            state.clone(),
            ingress::dispatch,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state.clone());

    let control_app = Router::new()
        .route("/connect", get(channel::connect_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let public_addr = format!(
        "{}:{}",
        state.config.server.bind_host, state.config.server.http_port
    );
    let public_listener = TcpListener::bind(&public_addr)
        .await
        .map_err(|e| format!("failed to bind public listener on {public_addr}: {e}"))?;

    let control_addr = format!(
        "{}:{}",
        state.config.server.bind_host, state.config.server.control_port
    );
    let control_listener = TcpListener::bind(&control_addr)
        .await
        .map_err(|e| format!("failed to bind control listener on {control_addr}: {e}"))?;

    info!("Server ready");

    // Signal handling: one broadcast fans out to both listeners, every
    // channel session, and the sweep task.
    let shutdown_tx = state.shutdown.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
        let _ = shutdown_tx.send(());
    });

    let mut public_shutdown = state.shutdown.subscribe();
    let public_server = axum::serve(
        public_listener,
        public_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = public_shutdown.recv().await;
    });

    let mut control_shutdown = state.shutdown.subscribe();
    let control_server = axum::serve(
        control_listener,
        control_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = control_shutdown.recv().await;
    });

    tokio::try_join!(
        async { public_server.await },
        async { control_server.await }
    )
    .map_err(|e| format!("server error: {e}"))?;

    // Channel sessions close their own tunnels on the shutdown signal; this
    // catches any that never belonged to a session.
    info!("Shutting down...");
    sweep_task.abort();
    state.registry.close_all("Server shutdown");
    info!("Goodbye");
    Ok(())
}

/// Convert a handler panic into a 500 without tearing the process down.
fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("panic");
    error!(detail, "Request handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "Internal server error", "code": "GENERIC_ERROR"})),
    )
        .into_response()
}
