use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod cli;
mod config;
mod db;
mod feed;
mod handlers;
mod metrics;
#[cfg(test)]
mod test_helpers;

use chirp_conduit::Conduit;

use crate::config::{ChirpConfig, FileConfig, ServerConfig, load_config};
use crate::db::Database;
use crate::feed::Feed;
use crate::metrics::ServerMetrics;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "chirp")]
#[command(about = "Real-time fan-out chat broadcaster")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.chirp)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file to use instead of <data-dir>/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broadcast server in the foreground
    Serve(ServeArgs),

    /// Print stored messages
    History(HistoryArgs),
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Directory of static files to serve (overrides config)
    #[arg(long)]
    public_dir: Option<PathBuf>,

    /// Keep history in memory only
    #[arg(long)]
    no_store: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
pub(crate) struct HistoryArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Only show the newest N messages
    #[arg(short = 'n', long)]
    pub limit: Option<i64>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub conduit: Arc<Conduit>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    /// Message store, absent when history is memory-only
    pub db: Option<Arc<Database>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = ChirpConfig::new(cli.data_dir.clone())?;
    let file_config: FileConfig = load_config(&dirs.data_dir, cli.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;

    match cli.command {
        None => run_server(ServeArgs::default(), file_config, dirs).await,
        Some(Commands::Serve(args)) => run_server(args, file_config, dirs).await,
        Some(Commands::History(args)) => {
            let server_config = ServerConfig::from_file(&file_config, &dirs)?;
            cli::history_command(server_config.feed_db.as_deref(), args).await
        }
    }
}

/// Build the router: WebSocket, health endpoints, then static files for everything else.
pub(crate) fn build_app(state: AppState, public_dir: Option<PathBuf>) -> Router {
    let app = Router::new()
        .route("/ws", get(handlers::websocket_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .with_state(state);

    match public_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app,
    }
}

/// End the conduit, wait for the feed to store what was queued, then close the store.
///
/// `end` is a no-op after Ctrl+C; after a serve error it is what lets the feed drain.
pub(crate) async fn finish(conduit: &Conduit, feed_task: JoinHandle<()>, db: Option<Arc<Database>>) {
    conduit.end(None).await;

    if let Err(e) = feed_task.await {
        warn!("Feed task ended abnormally: {}", e);
    }
    if let Some(db) = db {
        db.pool.close().await;
    }
}

async fn run_server(args: ServeArgs, mut file_config: FileConfig, dirs: ChirpConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "chirp=debug,chirp_conduit=debug,tower_http=debug,info"
    } else {
        "chirp=info,chirp_conduit=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Chirp broadcaster");

    // CLI flags win over config.toml / env
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }
    if let Some(dir) = args.public_dir {
        file_config.server.public_dir = Some(dir);
    }
    if args.no_store {
        file_config.feed.enabled = false;
    }
    let server_config = ServerConfig::from_file(&file_config, &dirs)?;

    let db = match &server_config.feed_db {
        Some(path) => Some(Arc::new(Database::open(path).await?)),
        None => {
            info!("Message store disabled, history is kept in memory only");
            None
        }
    };

    let conduit = Arc::new(Conduit::new(server_config.conduit.clone()));
    let metrics = Arc::new(ServerMetrics::new());

    let feed = Feed::new(conduit.clone(), db.clone(), metrics.clone());
    feed.restore().await?;
    let reader = conduit
        .take_reader()
        .await
        .context("Conduit reader already taken")?;
    let feed_task = tokio::spawn(feed.run(reader));

    let app_state = AppState {
        conduit: conduit.clone(),
        metrics,
        db: db.clone(),
    };
    let app = build_app(app_state, server_config.public_dir.clone());

    if let Some(dir) = &server_config.public_dir {
        info!("Serving static files from {}", dir.display());
    }

    let listener = tokio::net::TcpListener::bind(server_config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", server_config.bind_addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Chirp listening on http://{}", actual_addr);
    info!("  GET /ws      - WebSocket broadcast channel");
    info!("  GET /health  - Server health");
    info!("  GET /metrics - Server metrics");

    // Ctrl+C ends the conduit; the listener follows the conduit's close signal
    let ctrl_c_conduit = conduit.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received shutdown signal, closing conduit...");
        ctrl_c_conduit.end(None).await;
    });

    let closed = conduit.closed_token();
    let server_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { closed.cancelled().await })
    .await
    .context("Server error");

    finish(&conduit, feed_task, db).await;

    info!("Shutdown complete");
    server_result
}
