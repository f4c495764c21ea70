use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use ollama_cluster::config::{self, Config, ConfigCell};
use ollama_cluster::dispatcher::Dispatcher;
use ollama_cluster::http::{self, AppState};
use ollama_cluster::{control_loop, logging, supervisor::Supervisor};

/// Supervises a pool of local ollama worker processes and routes requests
/// across them.
#[derive(Debug, Parser)]
#[command(name = "clusterd", version, about)]
struct Cli {
    /// Path to the cluster configuration file.
    #[arg(long, default_value = "clusterconfig.json")]
    config: PathBuf,

    /// Override the bind address from the configuration file.
    #[arg(long)]
    bind: Option<String>,

    /// Increase log verbosity. Repeatable.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Override the log format (full, compact, pretty, json).
    #[arg(long)]
    log_format: Option<String>,

    /// Print a default configuration to stdout and exit.
    #[arg(long)]
    print_default: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_default {
        println!("{}", serde_json::to_string_pretty(&Config::default())?);
        return Ok(());
    }

    let mut loaded = config::load_or_init(&cli.config)?;
    if let Some(bind) = &cli.bind {
        loaded.bind_addr = bind.clone();
    }
    if let Some(format) = &cli.log_format {
        loaded.logging.format = format.clone();
    }
    if cli.verbose > 0 && loaded.logging.filter.is_none() {
        loaded.logging.filter = Some(verbosity_filter(cli.verbose));
    }

    logging::init(&loaded.logging);
    tracing::info!(config = %cli.config.display(), "starting clusterd");

    let config_cell = ConfigCell::new(loaded.clone());
    config::spawn_watcher(config_cell.clone());

    let supervisor = Supervisor::new();
    supervisor.initial_fill(&loaded).await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let control_loop_supervisor = Arc::clone(&supervisor);
    let control_loop_config = config_cell.clone();
    let control_loop_handle = tokio::spawn(async move {
        control_loop::run(control_loop_supervisor, control_loop_config, shutdown_rx).await;
    });

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&supervisor)));
    let state = AppState {
        supervisor: Arc::clone(&supervisor),
        dispatcher,
        config: config_cell,
    };
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&loaded.bind_addr).await?;
    tracing::info!(addr = %loaded.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = control_loop_handle.await;
    for worker in supervisor.enumerate() {
        worker.kill().await;
    }
    tracing::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("ctrl-c received, shutting down");
}

fn verbosity_filter(level: u8) -> String {
    match level {
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}
