//! MCP bridge
//!
#![doc = "HTTP bridge multiplexing chat sessions onto stdio MCP servers."]
#![doc = "Main entry point for the bridge binary."]

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcp_bridge::cli::{Cli, Commands};
use mcp_bridge::config::{ServerCatalog, Settings};
use mcp_bridge::dispatch::Dispatcher;
use mcp_bridge::http::AppContext;
use mcp_bridge::session::SessionRegistry;
use mcp_bridge::workspace::WorkspaceManager;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_tracing(cli.log_level.as_deref());

    #[cfg(feature = "prometheus")]
    init_metrics();

    // Resolve settings from the environment; CLI flags win where given.
    let mut settings = Settings::from_env()?;
    if let Some(config) = &cli.config {
        settings.config_file = config.clone();
    }
    if let Some(jobs_dir) = &cli.jobs_dir {
        settings.jobs_dir = jobs_dir.clone();
    }

    let mut catalog = ServerCatalog::load(&settings.config_file)?;
    catalog.apply_master_switch(settings.stateful_enabled);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Check => {
            println!(
                "catalog {} OK: {} server(s)",
                settings.config_file.display(),
                catalog.mcp_servers.len()
            );
            for (name, spec) in &catalog.mcp_servers {
                println!(
                    "  {:<24} {:<10} {} {}",
                    name,
                    format!("{:?}", spec.mode).to_lowercase(),
                    spec.command,
                    spec.args.join(" ")
                );
            }
            Ok(())
        }
        Commands::Serve => serve(cli.listen, settings, catalog).await,
    }
}

async fn serve(listen: String, settings: Settings, catalog: ServerCatalog) -> Result<()> {
    let registry = SessionRegistry::new(&settings);
    let workspaces = WorkspaceManager::new(&settings.jobs_dir)?;

    // Garbage collection runs for the lifetime of the server.
    let gc_token = CancellationToken::new();
    let gc_handle = tokio::spawn(mcp_bridge::gc::run_loop(
        registry.clone(),
        workspaces.clone(),
        settings.cleanup_interval,
        settings.file_expiry,
        gc_token.clone(),
    ));

    let cleanup_registry = registry.clone();
    let dispatcher = Dispatcher::new(settings.clone(), catalog, registry, workspaces);
    let ctx = AppContext::new(dispatcher);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(
        listen = %listen,
        jobs_dir = %settings.jobs_dir.display(),
        base_url = %settings.base_url,
        "bridge listening"
    );

    mcp_bridge::http::serve(ctx, listener, shutdown_signal()).await?;

    // Stop the GC, then close every stateful subprocess. Workspaces stay
    // on disk; an external sweep (or the next start's GC) collects them.
    tracing::info!("shutting down");
    gc_token.cancel();
    let _ = gc_handle.await;
    cleanup_registry.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {e}");
    }
}

/// Initialize tracing subscriber with environment filter.
///
/// Precedence: `--log-level` flag, then `LOG_LEVEL`, then `RUST_LOG`, then
/// the built-in default.
fn init_tracing(cli_level: Option<&str>) {
    let env_filter = if let Some(level) = cli_level {
        EnvFilter::new(level)
    } else if let Ok(level) = std::env::var("LOG_LEVEL") {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcp_bridge=info"))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(feature = "prometheus")]
fn init_metrics() {
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().install() {
        tracing::warn!("failed to install Prometheus exporter: {e}");
    }
}
