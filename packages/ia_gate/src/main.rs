use anyhow::{Context, Result};
use axum::{
    Router, middleware,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use power_control::{
    Prober, ShellPowerOff, SshShell, TcpProber, UdpWakeSignaler, WakeSignaler,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod auth;
mod backend;
mod config;
mod diagnostics;
mod error;
mod handlers;
mod lifecycle;
mod metrics;
mod proxy;
mod state_store;

#[cfg(test)]
mod test_helpers;

use crate::auth::AuthState;
use crate::backend::OllamaClient;
use crate::config::{FileConfig, GateConfig, GatePaths};
use crate::diagnostics::Diagnostics;
use crate::lifecycle::{Collaborators, Coordinator};
use crate::metrics::ServerMetrics;
use crate::proxy::InferenceProxy;
use crate::state_store::StateStore;

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
#[command(name = "ia-gate")]
#[command(about = "Power-aware gateway for a remote inference machine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.ia_gate)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway (default)
    Serve(ServeArgs),

    /// Send one wake packet to the configured machine and exit
    Wake(WakeArgs),
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct WakeArgs {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub proxy: Arc<InferenceProxy>,
    /// Optional `/debug` collaborator
    pub diagnostics: Arc<Diagnostics>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    pub auth: AuthState,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let debug = match &cli.command {
        Some(Commands::Serve(args)) => args.debug,
        Some(Commands::Wake(args)) => args.debug,
        None => false,
    };
    init_tracing(debug);

    let paths = GatePaths::new(cli.data_dir.clone())?;

    match cli.command {
        None => run_server(ServeArgs::default(), paths).await,
        Some(Commands::Serve(args)) => run_server(args, paths).await,
        Some(Commands::Wake(args)) => wake_command(args, paths).await,
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "ia_gate=debug,power_control=debug,tower_http=debug,info"
    } else {
        "ia_gate=info,power_control=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

fn load_gate_config(paths: &GatePaths) -> Result<(FileConfig, GateConfig)> {
    let file_config: FileConfig = config::load_config(&paths.data_dir)
        .extract()
        .with_context(|| {
            format!(
                "Failed to load configuration (config file: {:?})",
                paths.config_toml_path()
            )
        })?;
    let gate_config = GateConfig::from_file(&file_config)?;
    Ok((file_config, gate_config))
}

fn build_state(config: &GateConfig, paths: &GatePaths) -> AppState {
    let metrics = Arc::new(ServerMetrics::new());
    let prober: Arc<dyn Prober> = Arc::new(TcpProber);
    let backend = Arc::new(OllamaClient::new(
        config.target.service_base_url(),
        config.timeouts.service_check,
        config.timeouts.list_models,
    ));
    let store = Arc::new(StateStore::new(paths.state_file()).with_template(paths.template_file()));
    info!("State file: {}", store.path().display());

    let coordinator = Coordinator::new(
        store,
        Collaborators {
            prober: prober.clone(),
            service: backend.clone(),
            waker: Arc::new(UdpWakeSignaler),
            power: Arc::new(ShellPowerOff::new(SshShell::new())),
        },
        config.target.clone(),
        config.credentials.clone(),
        config.timeouts.probe,
        metrics.clone(),
    );

    let proxy = InferenceProxy::new(
        backend,
        prober.clone(),
        config.target.clone(),
        config.timeouts.clone(),
        metrics.clone(),
    );

    let diagnostics = Diagnostics::new(
        &config.target,
        &config.credentials,
        config.api_keys.len(),
        &config.timeouts,
        prober,
    );

    AppState {
        coordinator: Arc::new(coordinator),
        proxy: Arc::new(proxy),
        diagnostics: Arc::new(diagnostics),
        metrics,
        auth: AuthState::new(config.api_keys.clone()),
    }
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root_handler))
        .route("/status", get(handlers::status_handler))
        .route("/init", post(handlers::init_handler))
        .route("/test", get(handlers::test_handler))
        .route("/arrancar", post(handlers::wake_handler))
        .route("/apagar", post(handlers::conditional_shutdown_handler))
        .route(
            "/permanent_on_enable",
            post(handlers::permanent_on_enable_handler),
        )
        .route(
            "/permanent_on_disable",
            post(handlers::permanent_on_disable_handler),
        )
        .route("/shutdown", post(handlers::forced_shutdown_handler))
        .route("/lista_modelos", get(handlers::list_models_handler))
        .route("/ollama/{op}", post(handlers::ollama_handler))
        .route("/debug", get(handlers::debug_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(middleware::from_fn_with_state(
            state.auth.clone(),
            auth::auth_middleware,
        ))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn run_server(args: ServeArgs, paths: GatePaths) -> Result<()> {
    info!("Starting ia-gate - inference machine power gateway");

    let (file_config, config) = load_gate_config(&paths)?;
    if config.api_keys.is_empty() {
        warn!("No API keys configured; every protected route will answer 401");
    }
    info!(
        "Managing {} ({}), service port {}",
        config.target.host, config.target.mac, config.target.service_port
    );

    let app = build_router(build_state(&config, &paths));

    let host = args.host.unwrap_or(file_config.server.host);
    let port = args.port.unwrap_or(file_config.server.port);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("ia-gate listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  POST   /arrancar            - Wake the machine (acquire lease)");
    info!("  POST   /apagar              - Release lease, power off when unused");
    info!("  POST   /shutdown            - Force power-off");
    info!("  GET    /status              - Stored lifecycle state");
    info!("  POST   /ollama/{{op}}         - Proxy generate/chat/pull/delete/show");

    // Create shutdown signal handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}

async fn wake_command(_args: WakeArgs, paths: GatePaths) -> Result<()> {
    let (_, config) = load_gate_config(&paths)?;
    let outcome = UdpWakeSignaler
        .wake(
            &config.target.mac,
            &config.target.broadcast,
            config.target.wake_port,
        )
        .await
        .context("Failed to send wake packet")?;

    println!(
        "Sent {} byte wake packet for {} to {}",
        outcome.bytes_sent, outcome.hardware_address, outcome.destination
    );
    Ok(())
}
