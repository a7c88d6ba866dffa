mod api;
mod error;
mod state;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::GovernorLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ttyagent_core::GatewayConfig;

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));
    let config_found = config_path.exists();
    let config = GatewayConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let default_filter = if config.debug {
        "ttyagent_web=debug,ttyagent_core=debug,tower_http=debug"
    } else {
        "ttyagent_web=info,ttyagent_core=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config_found {
        tracing::info!("loaded config from {}", config_path.display());
    } else {
        tracing::info!(
            "config file {} not found; using defaults",
            config_path.display()
        );
    }
    if config.ws_allowed_origins.is_empty() {
        tracing::warn!("wsAllowedOrigins is empty; accepting WebSocket upgrades from any origin");
    }

    let state = AppState::new(config);

    // CORS for the ticket endpoint: any origin may POST with content-type.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(600));

    // Per-IP rate limit on ticket issuance only (the WebSocket itself is
    // guarded by the single-use ticket).
    let rpm = state.config.ticket_requests_per_minute.max(1);
    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(u64::from((60 / rpm).max(1)))
            .burst_size(rpm)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("valid rate limit config"),
    );

    let ticket_route = Router::new()
        .route("/ws-ticket", post(api::create_ws_ticket))
        // The handler enforces its own limit so that the two 413 cases
        // (envelope vs kubeconfig) get distinct messages.
        .layer(DefaultBodyLimit::disable())
        .layer(GovernorLayer::new(governor_config));

    let app = Router::new()
        .route("/", get(api::health))
        .merge(ticket_route)
        .route("/exec", get(ws::gateway::exec_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let tls = state.config.tls.clone();
    if let (Some(cert), Some(key)) = (&tls.cert_path, &tls.key_path) {
        use axum_server::tls_rustls::RustlsConfig;
        let rustls_config = RustlsConfig::from_pem_file(cert, key)
            .await
            .context("loading TLS certificate")?;
        tracing::info!("sealos-tty-agent listening on https://{addr}");
        axum_server::bind_rustls(addr, rustls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        tracing::info!("sealos-tty-agent listening on http://{addr}");
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
    }

    Ok(())
}
