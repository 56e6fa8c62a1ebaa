use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::info;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use agent_relay::config::{RelayConfig, load_file_config};
use agent_relay::{AppState, handlers};

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
#[command(name = "agent-relay")]
#[command(about = "Live event relay for agent sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground
    Serve(ServeArgs),

    /// Print the resolved configuration as TOML
    Config(ConfigArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Path to relay.toml
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct ConfigArgs {
    /// Path to relay.toml
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_server(args).await,
        Commands::Config(args) => {
            let fc = load_file_config(&args.config)?;
            let rendered = toml::to_string_pretty(&fc).context("Failed to render config")?;
            print!("{}", rendered);
            Ok(())
        }
    }
}

async fn run_server(args: ServeArgs) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "agent_relay=debug,tower_http=debug,info"
    } else {
        "agent_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut file_config = load_file_config(&args.config)?;
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }
    let config = RelayConfig::from_file(&file_config);

    info!(
        max_entries = config.buffer.max_entries,
        max_bytes = config.buffer.max_bytes,
        "Starting agent relay"
    );

    let addr = format!("{}:{}", config.host, config.port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", config.host, config.port))?;
    let state = AppState::new(config);

    let app = handlers::routes()
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Agent relay listening on http://{}", actual_addr);
    info!("  GET  /api/users/:user/events  - SSE event stream");
    info!("  GET  /api/users/:user/ws      - WebSocket event stream");
    info!("  POST /api/sessions/:id        - Register a session");

    let shutdown_signal = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}
