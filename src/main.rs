//! # rev-voice-relay server
//!
//! Entry point of the relay. Startup happens in a fixed order:
//! 1. Load `.env` and initialize structured logging
//! 2. Load and validate configuration (a missing Gemini API key is fatal,
//!    the process exits non-zero before binding)
//! 3. Build the upstream adapter and the shared [`AppState`]
//! 4. Start the HTTP/WebSocket server and wait for it or for a shutdown signal
//!
//! ## Routes:
//! - `GET /ws`, `GET /`: WebSocket relay
//! - `GET /health`, `GET /api/v1/health`: liveness and configuration status
//! - `GET /api/v1/metrics`: request and relay counters
//! - `GET /api/v1/config`: effective configuration, API key redacted

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use rev_voice_relay::config::AppConfig;
use rev_voice_relay::state::AppState;
use rev_voice_relay::upstream::{AiAdapter, GeminiAdapter};
use rev_voice_relay::{handlers, health, middleware, websocket};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load().context("failed to load configuration")?;
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    info!("Starting rev-voice-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.gemini.model,
        max_sessions = config.session.max_concurrent_sessions,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let adapter: Arc<dyn AiAdapter> = Arc::new(
        GeminiAdapter::new(config.gemini.clone())
            .map_err(|e| anyhow::anyhow!("failed to build Gemini client: {}", e))?,
    );
    let app_state = web::Data::new(AppState::new(config.clone(), adapter));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws", web::get().to(websocket::relay_websocket))
            .route("/", web::get().to(websocket::relay_websocket))
    })
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rev_voice_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
