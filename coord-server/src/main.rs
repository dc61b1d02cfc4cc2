mod admin_data;
mod config;
mod connection;
mod http_api;
mod remote;
mod replay;
mod room;
mod server_state;
mod session;
mod trust;
mod ws_push;

use crate::config::Config;
use crate::server_state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes tracing, loads the configuration, spawns the periodic
/// sweeps and the HTTP service, then runs the game TCP accept loop. The
/// game listener binds dual-stack on the configured port.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let config = Config::load()?;
    let state = AppState::new(config)?;

    // Expired-credential sweep, once a minute.
    let sweep_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            sweep_state.trust.sweep();
        }
    });

    // Replay retention, once a day.
    let retention_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
        loop {
            interval.tick().await;
            replay::sweep_expired(&retention_state.config.record_dir()).await;
        }
    });

    tokio::spawn(ws_push::heartbeat_loop(Arc::clone(&state)));

    if state.config.http_service {
        let app = http_api::router(Arc::clone(&state));
        let listener =
            tokio::net::TcpListener::bind(format!("[::]:{}", state.config.http_port)).await?;
        tracing::info!(port = state.config.http_port, "http service listening");
        tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(err) = axum::serve(listener, service).await {
                tracing::error!(?err, "http service failed");
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(format!("[::]:{}", state.config.game_port)).await?;
    tracing::info!(
        port = state.config.game_port,
        server = %state.config.server_name,
        "game server listening"
    );
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(?err, "accept failed");
                continue;
            }
        };
        if state.trust.is_blacklisted(addr.ip()) {
            tracing::debug!(%addr, "dropped connection from blacklisted address");
            continue;
        }
        tokio::spawn(session::accept(Arc::clone(&state), stream, addr));
    }
}
