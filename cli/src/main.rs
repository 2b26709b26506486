//! relay — aggregating MCP proxy for a fleet of upstream MCP servers.
//!
//! Two subcommands:
//! - `relay serve`: Streamable HTTP MCP endpoint plus the `/api`
//!   observability routes
//! - `relay stdio`: STDIO transport for Claude Desktop and other
//!   STDIO-based MCP clients

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use axum::http::Request;
use axum::response::IntoResponse;
use axum::Router;
use clap::{Parser, Subcommand};
use mcp_relay::{observability_router, RelayConfig, RelayMcpServer, RelayRegistry};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use rmcp::ServiceExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt as TowerServiceExt;
use tracing_subscriber::EnvFilter;

/// relay — aggregating MCP proxy for a fleet of upstream MCP servers.
#[derive(Parser)]
#[command(
    name = "relay",
    version,
    about = "relay — aggregating MCP proxy for a fleet of upstream MCP servers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve MCP over streamable HTTP with the observability API mounted at /api
    Serve {
        /// Path to config.json [default: ./config.json or ~/.config/mcp-relay/config.json]
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// HTTP port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
    /// Bridge the aggregated surface over STDIO
    Stdio {
        /// Path to config.json [default: ./config.json or ~/.config/mcp-relay/config.json]
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity; logs go to stderr so stdio framing
    // stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    // Ctrl-C cancels the root token for graceful shutdown (exit code 0).
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down relay...");
        cancel_for_signal.cancel();
    });

    match cli.command {
        Commands::Serve { config, port, host } => {
            let config = resolve_config(config)?;
            run_serve(config, host, port, cancel).await?;
        }
        Commands::Stdio { config } => {
            let config = resolve_config(config)?;
            run_stdio(config, cancel).await?;
        }
    }

    Ok(())
}

/// Serve MCP over streamable HTTP, with the observability API beside it.
async fn run_serve(
    config_path: PathBuf,
    host: String,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let registry = build_registry(&config_path).await?;
    let server = RelayMcpServer::new(registry.clone());

    let session_manager = Arc::new(LocalSessionManager::default());
    let http_config = StreamableHttpServerConfig::default();
    let server_for_factory = server.clone();
    let mcp_service = StreamableHttpService::new(
        move || Ok(server_for_factory.clone()),
        session_manager,
        http_config,
    );

    let app = Router::new()
        .nest("/api", observability_router(registry.clone()))
        .fallback(move |req: Request<axum::body::Body>| {
            let svc = mcp_service.clone();
            async move { svc.oneshot(req).await.unwrap().into_response() }
        });

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;

    tracing::info!(host = %host, port = %port, "relay HTTP server listening");
    tracing::info!("Connect your MCP client to http://{}:{}/mcp", host, port);

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| anyhow::anyhow!("relay HTTP server error: {}", e))?;

    registry.shutdown().await;
    tracing::info!("relay HTTP server stopped");
    Ok(())
}

/// Bridge the aggregated surface over stdin/stdout.
async fn run_stdio(config_path: PathBuf, cancel: CancellationToken) -> Result<()> {
    let registry = build_registry(&config_path).await?;
    let server = RelayMcpServer::new(registry.clone());

    let transport = (tokio::io::stdin(), tokio::io::stdout());
    let running = server
        .serve_with_ct(transport, cancel.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize relay stdio transport: {:?}", e))?;

    tracing::info!("relay stdio transport initialized, waiting for messages");

    tokio::select! {
        result = running.waiting() => {
            match result {
                Ok(reason) => {
                    tracing::info!(?reason, "relay stdio transport completed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "relay stdio transport error");
                    return Err(anyhow::anyhow!("relay stdio transport error: {}", e));
                }
            }
        }
        _ = cancel.cancelled() => {
            tracing::info!("relay stdio transport cancelled");
        }
    }

    registry.shutdown().await;
    Ok(())
}

/// Load config.json and build the registry; any failure here is fatal and
/// exits with code 1 before a single upstream is spawned.
async fn build_registry(config_path: &PathBuf) -> Result<Arc<RelayRegistry>> {
    let content = tokio::fs::read_to_string(config_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", config_path, e))?;
    let config = RelayConfig::from_json(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file {:?}: {}", config_path, e))?;
    RelayRegistry::from_config(config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to build relay registry: {}", e))
}

/// Resolve config path: explicit flag → ./config.json → ~/.config/mcp-relay/config.json.
fn resolve_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let local = Path::new("config.json");
    if local.exists() {
        return Ok(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("mcp-relay").join("config.json");
        if xdg.exists() {
            return Ok(xdg);
        }
    }

    Err(anyhow::anyhow!(
        "No config.json found. Searched ./config.json and ~/.config/mcp-relay/config.json. \
         Use --config to specify a path."
    ))
}
