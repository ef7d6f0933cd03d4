//! ChStream Gateway Service
//!
//! Accepts SQL over `GET /query`, runs it on ClickHouse and streams execution
//! progress followed by the final result as Server-Sent Events, so a browser
//! `EventSource` can render progress while a long query runs.

mod connection;
mod emitter;
mod engine;
mod event;
mod executor;
mod http_api;
mod telemetry;
mod types;

use crate::engine::{ClickHouseHttpEngine, HttpEngineSettings};
use crate::http_api::{router, AppState};
use chstream_common::{EngineDefaults, StreamSettings};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "chstream-gateway")]
#[command(about = "ChStream Gateway - ClickHouse query progress over Server-Sent Events")]
struct Args {
    /// HTTP listen port
    #[arg(long, env = "HTTP_PORT", default_value = "9090")]
    http_port: u16,

    /// Engine host used when a request has no `url` parameter
    #[arg(long, env = "CH_HOST", default_value = "localhost")]
    ch_host: String,

    /// Engine HTTP port used when a request has no `url` parameter
    #[arg(long, env = "CH_PORT", default_value = "8123")]
    ch_port: u16,

    /// Compression used when a request has no `compression` parameter
    #[arg(long, env = "CH_COMPRESSION", default_value = "true", action = clap::ArgAction::Set)]
    ch_compression: bool,

    /// Database used when a request has no `database` parameter
    #[arg(long, env = "CH_DATABASE", default_value = "default")]
    ch_database: String,

    /// Engine user
    #[arg(long, env = "CH_USER")]
    ch_user: Option<String>,

    /// Engine password
    #[arg(long, env = "CH_PASSWORD", hide_env_values = true)]
    ch_password: Option<String>,

    /// Engine connect timeout in seconds
    #[arg(long, env = "CH_CONNECT_TIMEOUT_SECS", default_value = "10")]
    ch_connect_timeout_secs: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    telemetry::init(&args.log_level)?;

    let defaults = EngineDefaults {
        host: args.ch_host.clone(),
        port: args.ch_port,
        compression: args.ch_compression,
        database: args.ch_database.clone(),
    };
    let stream = StreamSettings::from_env();

    info!("Starting ChStream Gateway");
    info!("  HTTP port: {}", args.http_port);
    info!(
        "  Default engine: {}:{} (compression={}, database={})",
        defaults.host, defaults.port, defaults.compression, defaults.database
    );
    info!("  Event buffer: {}", stream.event_buffer);

    let engine = ClickHouseHttpEngine::new(HttpEngineSettings {
        user: args.ch_user,
        password: args.ch_password,
        connect_timeout: Duration::from_secs(args.ch_connect_timeout_secs),
    });

    let app = router(AppState {
        engine: Arc::new(engine),
        defaults: Arc::new(defaults),
        stream,
    });

    let http_addr: SocketAddr = format!("0.0.0.0:{}", args.http_port).parse()?;
    let listener = tokio::net::TcpListener::bind(&http_addr).await?;
    info!("HTTP server listening on {}", http_addr);
    info!("  /query - Stream query progress and result (text/event-stream)");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down ChStream Gateway");
        })
        .await?;

    Ok(())
}
